//! HTTP-based AI provider client.
//!
//! Talks to the external vision service over HTTP. The service is
//! assumed to expose one JSON endpoint per method:
//!
//! ```json
//! POST /detect_bubbles
//! { "image_base64": "..." }
//!
//! Response:
//! {
//!   "output": { "answers": { "1": "A", "2": "C" } },
//!   "confidence": 0.95,
//!   "flags": []
//! }
//! ```
//!
//! HTTP 429 maps to [`AiError::Throttled`] so the retry decorator can
//! back off; other non-success statuses are service errors.

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;

use super::{AiError, AiProvider, AiResponse};
use crate::config::AiClientConfig;

/// Blocking HTTP client for the AI vision service.
///
/// Thread-safe and shareable across lifecycle commands. Callers in an
/// async context should invoke it from a blocking section.
pub struct HttpAiProvider {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    question_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proposed_answer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    objection: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    official_answer: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ImageRequest {
    image_base64: String,
}

impl HttpAiProvider {
    /// Builds a client from the node configuration.
    pub fn new(cfg: &AiClientConfig) -> Result<Self, AiError> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| AiError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: cfg.base_url.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        // Avoid accidental double slashes.
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<AiResponse, AiError> {
        let url = self.endpoint(path);

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| AiError::Transport(format!("HTTP POST {url} failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AiError::Throttled(format!("{url} returned 429")));
        }
        if !status.is_success() {
            return Err(AiError::Service(format!(
                "AI service returned HTTP status {status}"
            )));
        }

        let body: Value = resp
            .json()
            .map_err(|e| AiError::Protocol(format!("failed to parse JSON response: {e}")))?;
        parse_response(body)
    }

    fn post_image(&self, path: &str, image: &[u8]) -> Result<AiResponse, AiError> {
        let req = ImageRequest {
            image_base64: base64::encode(image),
        };
        self.post(path, &req)
    }
}

/// Extracts the uniform `{output, confidence, flags}` envelope.
fn parse_response(body: Value) -> Result<AiResponse, AiError> {
    let output = body
        .get("output")
        .cloned()
        .ok_or_else(|| AiError::Protocol("response missing 'output'".to_string()))?;
    let confidence = body
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| AiError::Protocol("response missing numeric 'confidence'".to_string()))?;
    let flags = body
        .get("flags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(AiResponse {
        output,
        confidence,
        flags,
    })
}

impl AiProvider for HttpAiProvider {
    fn solve_question(&self, question_text: &str, subject: &str) -> Result<AiResponse, AiError> {
        self.post(
            "/solve_question",
            &TextRequest {
                question_text,
                subject: Some(subject),
                proposed_answer: None,
                objection: None,
                official_answer: None,
            },
        )
    }

    fn verify_answer(
        &self,
        question_text: &str,
        proposed_answer: &str,
        official_answer: &str,
    ) -> Result<AiResponse, AiError> {
        self.post(
            "/verify_answer",
            &TextRequest {
                question_text,
                subject: None,
                proposed_answer: Some(proposed_answer),
                objection: None,
                official_answer: Some(official_answer),
            },
        )
    }

    fn evaluate_objection(
        &self,
        question_text: &str,
        objection: &str,
        official_answer: &str,
    ) -> Result<AiResponse, AiError> {
        self.post(
            "/evaluate_objection",
            &TextRequest {
                question_text,
                subject: None,
                proposed_answer: None,
                objection: Some(objection),
                official_answer: Some(official_answer),
            },
        )
    }

    fn detect_bubbles(&self, image: &[u8]) -> Result<AiResponse, AiError> {
        self.post_image("/detect_bubbles", image)
    }

    fn detect_damage(&self, image: &[u8]) -> Result<AiResponse, AiError> {
        self.post_image("/detect_damage", image)
    }

    fn reconstruct_sheet(&self, image: &[u8]) -> Result<AiResponse, AiError> {
        self.post_image("/reconstruct_sheet", image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_response_extracts_envelope() {
        let body = json!({
            "output": {"answers": {"1": "A"}},
            "confidence": 0.93,
            "flags": ["low_light"]
        });

        let resp = parse_response(body).expect("parses");
        assert_eq!(resp.confidence, 0.93);
        assert_eq!(resp.flags, vec!["low_light".to_string()]);
        assert_eq!(resp.output["answers"]["1"], "A");
    }

    #[test]
    fn parse_response_defaults_missing_flags() {
        let body = json!({"output": {}, "confidence": 0.8});
        let resp = parse_response(body).expect("parses");
        assert!(resp.flags.is_empty());
    }

    #[test]
    fn parse_response_rejects_missing_fields() {
        assert!(parse_response(json!({"confidence": 0.8})).is_err());
        assert!(parse_response(json!({"output": {}})).is_err());
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let provider = HttpAiProvider {
            base_url: "http://127.0.0.1:8090/".to_string(),
            client: Client::new(),
        };
        assert_eq!(
            provider.endpoint("/detect_bubbles"),
            "http://127.0.0.1:8090/detect_bubbles"
        );
    }
}
