//! Answer-key validation and mark tallying.
//!
//! This module holds the pure evaluation arithmetic: validating that
//! an uploaded answer key is well-formed, marking detected answers
//! against an approved key, assigning grades, and comparing automated
//! totals with manually entered ones. Nothing here touches the chain
//! or the store; the lifecycle commands feed it and record what it
//! returns.

use std::collections::BTreeMap;

use crate::types::{KeyEntry, QuestionResult};

/// Tolerance within which automated and manual totals count as equal.
pub const MARKS_TOLERANCE: f64 = 0.01;

/// Sentinel answer for an unfilled bubble row.
pub const BLANK_ANSWER: &str = "X";

/// Validates answer-key structure.
///
/// Question ids must form a contiguous `Q1..Qn` set and every entry
/// must carry a positive mark value. Returns the full list of problems
/// found rather than stopping at the first.
pub fn validate_key_format(answers: &BTreeMap<String, KeyEntry>) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if answers.is_empty() {
        return Err(vec!["answer key cannot be empty".to_string()]);
    }

    let mut numbers = Vec::with_capacity(answers.len());
    for (key, entry) in answers {
        match parse_question_number(key) {
            Some(n) => numbers.push(n),
            None => errors.push(format!(
                "invalid question id '{key}', expected 'Q1', 'Q2', ..."
            )),
        }

        if entry.answer.trim().is_empty() {
            errors.push(format!("question {key}: answer is empty"));
        }

        if !(entry.marks > 0.0) {
            errors.push(format!("question {key}: marks must be positive"));
        }
    }

    numbers.sort_unstable();
    numbers.dedup();
    if numbers.len() == answers.len() && !numbers.is_empty() {
        let contiguous = numbers[0] == 1
            && numbers
                .windows(2)
                .all(|pair| pair[1] == pair[0] + 1);
        if !contiguous {
            errors.push(format!(
                "question ids must run Q1..Q{} without gaps",
                answers.len()
            ));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Parses `"Q17"` into `17`.
pub fn parse_question_number(key: &str) -> Option<u32> {
    let digits = key.strip_prefix('Q')?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Grade boundaries used across the system.
pub fn assign_grade(percentage: f64) -> &'static str {
    if percentage >= 90.0 {
        "A+"
    } else if percentage >= 80.0 {
        "A"
    } else if percentage >= 70.0 {
        "B+"
    } else if percentage >= 60.0 {
        "B"
    } else if percentage >= 50.0 {
        "C"
    } else if percentage >= 40.0 {
        "D"
    } else {
        "F"
    }
}

/// Totals of one marking pass.
#[derive(Clone, Debug)]
pub struct MarkedSheet {
    pub total_marks: f64,
    pub max_marks: f64,
    pub correct: u32,
    pub incorrect: u32,
    pub unanswered: u32,
    pub percentage: f64,
    pub grade: &'static str,
    pub question_results: Vec<QuestionResult>,
}

/// Marks detected answers against the key.
///
/// A question is credited iff the detected answer equals the key
/// answer case-insensitively; a blank (`"X"`) or absent detection
/// scores zero and counts as unanswered. Detected answers may be keyed
/// either `"Q7"` or bare `"7"`.
pub fn mark_sheet(
    detected: &BTreeMap<String, String>,
    key: &BTreeMap<String, KeyEntry>,
    confidence: &BTreeMap<String, f64>,
) -> MarkedSheet {
    let mut total_marks = 0.0;
    let mut max_marks = 0.0;
    let mut correct = 0;
    let mut incorrect = 0;
    let mut unanswered = 0;
    let mut question_results = Vec::with_capacity(key.len());

    for (question, entry) in key {
        max_marks += entry.marks;

        let bare = question.strip_prefix('Q').unwrap_or(question);
        let student_answer = detected
            .get(question)
            .or_else(|| detected.get(bare))
            .map(String::as_str)
            .unwrap_or(BLANK_ANSWER);

        let is_blank = student_answer.eq_ignore_ascii_case(BLANK_ANSWER)
            || student_answer.trim().is_empty();
        let is_correct = !is_blank && student_answer.eq_ignore_ascii_case(&entry.answer);

        let marks_earned = if is_correct {
            correct += 1;
            total_marks += entry.marks;
            entry.marks
        } else {
            if is_blank {
                unanswered += 1;
            } else {
                incorrect += 1;
            }
            0.0
        };

        let conf = confidence
            .get(question)
            .or_else(|| confidence.get(bare))
            .copied()
            .unwrap_or(1.0);

        question_results.push(QuestionResult {
            question: question.clone(),
            correct_answer: entry.answer.clone(),
            student_answer: if is_blank {
                BLANK_ANSWER.to_string()
            } else {
                student_answer.to_string()
            },
            is_correct,
            marks_earned,
            marks_possible: entry.marks,
            confidence: conf,
        });
    }

    let percentage = if max_marks > 0.0 {
        total_marks / max_marks * 100.0
    } else {
        0.0
    };

    MarkedSheet {
        total_marks,
        max_marks,
        correct,
        incorrect,
        unanswered,
        percentage,
        grade: assign_grade(percentage),
        question_results,
    }
}

/// Compares automated and manual totals within [`MARKS_TOLERANCE`].
///
/// Returns `(marks_match, discrepancy)`.
pub fn tally_marks(automated: f64, manual: f64) -> (bool, f64) {
    let discrepancy = (automated - manual).abs();
    (discrepancy <= MARKS_TOLERANCE, discrepancy)
}

/// One suspected cause of a marks discrepancy.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DiscrepancyCause {
    pub cause: String,
    pub questions: Vec<String>,
}

/// Explains why automated and manual totals may disagree.
///
/// Low-confidence (< 0.7) and ambiguous (< 0.5) detections are the
/// usual suspects; when neither appears the discrepancy needs manual
/// investigation.
pub fn analyze_discrepancy(question_results: &[QuestionResult]) -> Vec<DiscrepancyCause> {
    let mut causes = Vec::new();

    let low: Vec<String> = question_results
        .iter()
        .filter(|q| q.confidence < 0.7)
        .map(|q| q.question.clone())
        .collect();
    if !low.is_empty() {
        causes.push(DiscrepancyCause {
            cause: "low confidence detections".to_string(),
            questions: low,
        });
    }

    let ambiguous: Vec<String> = question_results
        .iter()
        .filter(|q| q.confidence < 0.5)
        .map(|q| q.question.clone())
        .collect();
    if !ambiguous.is_empty() {
        causes.push(DiscrepancyCause {
            cause: "ambiguous bubble detections".to_string(),
            questions: ambiguous,
        });
    }

    if causes.is_empty() {
        causes.push(DiscrepancyCause {
            cause: "unknown, requires manual investigation".to_string(),
            questions: Vec::new(),
        });
    }

    causes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(entries: &[(&str, &str, f64)]) -> BTreeMap<String, KeyEntry> {
        entries
            .iter()
            .map(|(q, a, m)| {
                (
                    q.to_string(),
                    KeyEntry {
                        answer: a.to_string(),
                        marks: *m,
                    },
                )
            })
            .collect()
    }

    fn detected(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(q, a)| (q.to_string(), a.to_string()))
            .collect()
    }

    #[test]
    fn valid_key_passes() {
        let k = key(&[("Q1", "A", 2.0), ("Q2", "B", 2.0), ("Q3", "C", 1.0)]);
        assert!(validate_key_format(&k).is_ok());
    }

    #[test]
    fn empty_key_is_rejected() {
        let k = BTreeMap::new();
        assert!(validate_key_format(&k).is_err());
    }

    #[test]
    fn gapped_key_is_rejected() {
        let k = key(&[("Q1", "A", 2.0), ("Q3", "B", 2.0)]);
        let errors = validate_key_format(&k).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("without gaps")));
    }

    #[test]
    fn non_positive_marks_are_rejected() {
        let k = key(&[("Q1", "A", 0.0)]);
        let errors = validate_key_format(&k).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("positive")));
    }

    #[test]
    fn malformed_question_ids_are_rejected() {
        let k = key(&[("1", "A", 1.0), ("Qx", "B", 1.0)]);
        let errors = validate_key_format(&k).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn marking_credits_exact_and_case_insensitive_matches() {
        let k = key(&[("Q1", "A", 20.0), ("Q2", "b", 20.0), ("Q3", "C", 20.0)]);
        let d = detected(&[("Q1", "A"), ("Q2", "B"), ("Q3", "D")]);

        let marked = mark_sheet(&d, &k, &BTreeMap::new());
        assert_eq!(marked.total_marks, 40.0);
        assert_eq!(marked.correct, 2);
        assert_eq!(marked.incorrect, 1);
        assert_eq!(marked.unanswered, 0);
    }

    #[test]
    fn blank_answers_score_zero_as_unanswered() {
        let k = key(&[("Q1", "A", 10.0), ("Q2", "B", 10.0)]);
        let d = detected(&[("Q1", "X")]);

        let marked = mark_sheet(&d, &k, &BTreeMap::new());
        assert_eq!(marked.total_marks, 0.0);
        assert_eq!(marked.unanswered, 2);
        assert_eq!(marked.incorrect, 0);
    }

    #[test]
    fn bare_numeric_detection_keys_are_accepted() {
        let k = key(&[("Q1", "A", 5.0)]);
        let d = detected(&[("1", "A")]);

        let marked = mark_sheet(&d, &k, &BTreeMap::new());
        assert_eq!(marked.correct, 1);
    }

    #[test]
    fn percentage_and_grade_follow_totals() {
        let k = key(&[
            ("Q1", "A", 25.0),
            ("Q2", "B", 25.0),
            ("Q3", "C", 25.0),
            ("Q4", "D", 25.0),
        ]);
        let d = detected(&[("Q1", "A"), ("Q2", "B"), ("Q3", "C")]);

        let marked = mark_sheet(&d, &k, &BTreeMap::new());
        assert_eq!(marked.percentage, 75.0);
        assert_eq!(marked.grade, "B+");
    }

    #[test]
    fn grade_boundaries() {
        assert_eq!(assign_grade(95.0), "A+");
        assert_eq!(assign_grade(90.0), "A+");
        assert_eq!(assign_grade(89.9), "A");
        assert_eq!(assign_grade(68.0), "B");
        assert_eq!(assign_grade(40.0), "D");
        assert_eq!(assign_grade(39.9), "F");
    }

    #[test]
    fn tally_within_tolerance_matches() {
        let (matched, d) = tally_marks(80.0, 80.005);
        assert!(matched);
        assert!(d < MARKS_TOLERANCE);
    }

    #[test]
    fn tally_outside_tolerance_reports_discrepancy() {
        let (matched, d) = tally_marks(80.0, 78.0);
        assert!(!matched);
        assert_eq!(d, 2.0);
    }

    #[test]
    fn discrepancy_analysis_surfaces_low_confidence() {
        let k = key(&[("Q1", "A", 10.0), ("Q2", "B", 10.0)]);
        let d = detected(&[("Q1", "A"), ("Q2", "B")]);
        let mut conf = BTreeMap::new();
        conf.insert("Q1".to_string(), 0.95);
        conf.insert("Q2".to_string(), 0.4);

        let marked = mark_sheet(&d, &k, &conf);
        let causes = analyze_discrepancy(&marked.question_results);
        assert!(causes.iter().any(|c| c.cause.contains("low confidence")));
        assert!(causes.iter().any(|c| c.cause.contains("ambiguous")));
    }

    #[test]
    fn discrepancy_analysis_falls_back_to_unknown() {
        let k = key(&[("Q1", "A", 10.0)]);
        let d = detected(&[("Q1", "A")]);

        let marked = mark_sheet(&d, &k, &BTreeMap::new());
        let causes = analyze_discrepancy(&marked.question_results);
        assert_eq!(causes.len(), 1);
        assert!(causes[0].cause.contains("manual investigation"));
    }
}
