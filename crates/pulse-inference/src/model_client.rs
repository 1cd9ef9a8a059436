//! HTTP client for the learned-model service
//!
//! One logical endpoint: `POST {base}/predict` with `{text, model?}`,
//! answering `{label, confidence, model_used}`. No retries here; retry and
//! fallback policy live in the failsafe dispatcher.

use async_trait::async_trait;
use pulse_common::{Error, Result, SentimentLabel, SentimentVerdict, VerdictSource};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Model names the platform accepts; anything else is a validation error
pub const SUPPORTED_MODELS: &[&str] = &["distilbert", "twitter-roberta", "bert-base"];

pub fn is_supported_model(name: &str) -> bool {
    SUPPORTED_MODELS.contains(&name)
}

/// Remote inference boundary used by the failsafe dispatcher
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run one prediction against the model service within `deadline`
    async fn infer(
        &self,
        text: &str,
        model: Option<&str>,
        deadline: Duration,
    ) -> Result<SentimentVerdict>;
}

#[derive(Serialize)]
struct PredictBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct PredictReply {
    label: String,
    confidence: f64,
    model_used: String,
}

/// reqwest-backed model client
pub struct HttpModelClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpModelClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("cannot build model http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn infer(
        &self,
        text: &str,
        model: Option<&str>,
        deadline: Duration,
    ) -> Result<SentimentVerdict> {
        if let Some(name) = model {
            if !is_supported_model(name) {
                return Err(Error::Validation(format!("unknown model {:?}", name)));
            }
        }

        let started = Instant::now();
        let url = format!("{}/predict", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(&PredictBody { text, model })
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Service {
                status: status.as_u16(),
                message: format!("model service answered {}", status),
            });
        }

        let reply: PredictReply = response
            .json()
            .await
            .map_err(|e| Error::Decode(format!("malformed model reply: {}", e)))?;

        let label = SentimentLabel::parse(&reply.label)
            .ok_or_else(|| Error::Decode(format!("unknown label {:?}", reply.label)))?;
        if !(0.0..=1.0).contains(&reply.confidence) {
            return Err(Error::Decode(format!(
                "confidence {} outside [0, 1]",
                reply.confidence
            )));
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(model = %reply.model_used, latency_ms, "model service prediction");

        Ok(SentimentVerdict {
            label,
            confidence: reply.confidence,
            compound: derive_compound(label, reply.confidence),
            model: reply.model_used,
            source: VerdictSource::Model,
            latency_ms,
        })
    }
}

/// The model path does not expose a raw probability vector; compound is
/// derived from the label and confidence alone.
fn derive_compound(label: SentimentLabel, confidence: f64) -> f64 {
    match label {
        SentimentLabel::Positive => confidence,
        SentimentLabel::Negative => -confidence,
        SentimentLabel::Neutral => 0.0,
    }
}

fn classify_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("model request timed out: {}", e))
    } else if e.is_decode() {
        Error::Decode(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpModelClient {
        HttpModelClient::new(&server.uri()).unwrap()
    }

    #[tokio::test]
    async fn success_maps_onto_a_model_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(body_partial_json(serde_json::json!({"text": "UCLA is amazing for AI research!"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "label": "positive",
                "confidence": 0.94,
                "model_used": "distilbert"
            })))
            .mount(&server)
            .await;

        let v = client(&server)
            .infer("UCLA is amazing for AI research!", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(v.label, SentimentLabel::Positive);
        assert_eq!(v.confidence, 0.94);
        assert_eq!(v.compound, 0.94);
        assert_eq!(v.model, "distilbert");
        assert_eq!(v.source, VerdictSource::Model);
    }

    #[tokio::test]
    async fn negative_label_gets_negative_compound() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "label": "negative",
                "confidence": 0.8,
                "model_used": "twitter-roberta"
            })))
            .mount(&server)
            .await;

        let v = client(&server)
            .infer("awful", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(v.compound, -0.8);
    }

    #[tokio::test]
    async fn non_2xx_is_a_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server)
            .infer("text", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Service { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server)
            .infer("text", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn deadline_expiry_is_a_timeout_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(250))
                    .set_body_json(serde_json::json!({
                        "label": "neutral",
                        "confidence": 0.5,
                        "model_used": "distilbert"
                    })),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .infer("text", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn unknown_model_name_is_rejected_before_any_call() {
        let server = MockServer::start().await;
        let err = client(&server)
            .infer("text", Some("gpt-17"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let c = HttpModelClient::new("http://127.0.0.1:1").unwrap();
        let err = c.infer("text", None, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn supported_models_are_enumerated() {
        assert!(is_supported_model("distilbert"));
        assert!(is_supported_model("twitter-roberta"));
        assert!(!is_supported_model("lexicon-2"));
    }
}
