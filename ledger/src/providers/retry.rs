//! Retry/backoff decorator with mock fallback.
//!
//! Wraps any [`AiProvider`] with the policy from §retry of the node
//! configuration: throttling errors are retried with exponential
//! backoff (base 1 s, factor 2, 3 attempts by default); any other
//! error ends the attempt sequence immediately. When the sequence
//! ends without a real answer, the wrapper does not surface the error
//! to the lifecycle. It returns a structurally valid mock response
//! with `confidence ≤ 0.7` and review flags, so the state machine
//! routes the sheet to a human instead of silently accepting or
//! dropping the AI failure.

use std::thread;

use serde_json::json;

use super::{AiError, AiProvider, AiResponse};
use crate::config::RetryPolicy;

/// Confidence assigned to mock fallback responses. Below the 0.7
/// review threshold on purpose.
pub const MOCK_CONFIDENCE: f64 = 0.5;

/// The six provider methods, used to shape mock fallbacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Method {
    SolveQuestion,
    VerifyAnswer,
    EvaluateObjection,
    DetectBubbles,
    DetectDamage,
    ReconstructSheet,
}

impl Method {
    fn name(&self) -> &'static str {
        match self {
            Method::SolveQuestion => "solve_question",
            Method::VerifyAnswer => "verify_answer",
            Method::EvaluateObjection => "evaluate_objection",
            Method::DetectBubbles => "detect_bubbles",
            Method::DetectDamage => "detect_damage",
            Method::ReconstructSheet => "reconstruct_sheet",
        }
    }
}

/// Structurally valid stand-in response for a failed method call.
fn mock_response(method: Method) -> AiResponse {
    let output = match method {
        Method::SolveQuestion => json!({ "answer": null, "reasoning": "unavailable" }),
        Method::VerifyAnswer => json!({ "match_status": "uncertain" }),
        Method::EvaluateObjection => json!({ "verdict": "needs_review" }),
        Method::DetectBubbles => json!({ "answers": {}, "detected_count": 0 }),
        Method::DetectDamage => json!({
            "has_damage": true,
            "overall_quality_score": MOCK_CONFIDENCE,
            "is_recoverable": true,
            "total_count": 0,
            "severe_count": 0,
            "damage_types": [],
        }),
        Method::ReconstructSheet => json!({
            "reconstructed_image_base64": null,
            "reconstruction_quality": MOCK_CONFIDENCE,
        }),
    };

    AiResponse {
        output,
        confidence: MOCK_CONFIDENCE,
        flags: vec!["mock_fallback".to_string(), "requires_human_review".to_string()],
    }
}

/// Decorator adding retry, backoff, and mock fallback to a provider.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<P: AiProvider> RetryingProvider<P> {
    fn call<F>(&self, method: Method, mut op: F) -> Result<AiResponse, AiError>
    where
        F: FnMut(&P) -> Result<AiResponse, AiError>,
    {
        let mut last_error = None;

        for attempt in 0..self.policy.max_attempts {
            match op(&self.inner) {
                Ok(response) => return Ok(response),
                Err(AiError::Throttled(msg)) => {
                    tracing::warn!(
                        method = method.name(),
                        attempt,
                        "AI call throttled, backing off"
                    );
                    last_error = Some(AiError::Throttled(msg));
                    if attempt + 1 < self.policy.max_attempts {
                        thread::sleep(self.policy.delay_for(attempt));
                    }
                }
                Err(other) => {
                    // Non-throttling errors are not retried.
                    last_error = Some(other);
                    break;
                }
            }
        }

        let error = last_error.expect("loop ran at least once");
        tracing::warn!(
            method = method.name(),
            error = %error,
            "AI call failed, returning mock fallback for human review"
        );
        Ok(mock_response(method))
    }
}

impl<P: AiProvider> AiProvider for RetryingProvider<P> {
    fn solve_question(&self, question_text: &str, subject: &str) -> Result<AiResponse, AiError> {
        self.call(Method::SolveQuestion, |p| {
            p.solve_question(question_text, subject)
        })
    }

    fn verify_answer(
        &self,
        question_text: &str,
        proposed_answer: &str,
        official_answer: &str,
    ) -> Result<AiResponse, AiError> {
        self.call(Method::VerifyAnswer, |p| {
            p.verify_answer(question_text, proposed_answer, official_answer)
        })
    }

    fn evaluate_objection(
        &self,
        question_text: &str,
        objection: &str,
        official_answer: &str,
    ) -> Result<AiResponse, AiError> {
        self.call(Method::EvaluateObjection, |p| {
            p.evaluate_objection(question_text, objection, official_answer)
        })
    }

    fn detect_bubbles(&self, image: &[u8]) -> Result<AiResponse, AiError> {
        self.call(Method::DetectBubbles, |p| p.detect_bubbles(image))
    }

    fn detect_damage(&self, image: &[u8]) -> Result<AiResponse, AiError> {
        self.call(Method::DetectDamage, |p| p.detect_damage(image))
    }

    fn reconstruct_sheet(&self, image: &[u8]) -> Result<AiResponse, AiError> {
        self.call(Method::ReconstructSheet, |p| p.reconstruct_sheet(image))
    }
}
