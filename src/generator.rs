//! External generation service client.
//!
//! The engine only depends on the [`Generator`] contract: hand over a window
//! of samples, get back base64-encoded audio or a [`GenerateError`].
//! [`HttpGenerator`] implements it against the ML service's JSON API:
//!
//!   POST {generator_url}/predict   {"signal": [f32; 1280]}
//!   200 OK                          {"audio_base64": "<base64>"}
//!
//! Every failure (connect, timeout, non-2xx, malformed body) is returned as
//! an error value; nothing here panics on bad service output.

use std::future::Future;
use std::time::Duration;

use base64::Engine as _;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::{RelayError, Result};

/// Upper bound on a single generation call.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error("generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("cannot reach generation service: {0}")]
    Connect(String),
    #[error("generation service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed generation response: {0}")]
    Malformed(String),
    #[error("generation request failed: {0}")]
    Request(String),
}

impl GenerateError {
    /// Reason shown to the client in an `error` reply.
    pub fn user_message(&self) -> String {
        match self {
            GenerateError::Timeout(_) => "Music generation timed out - please try again".into(),
            GenerateError::Connect(_) => "Music generation service temporarily unavailable".into(),
            GenerateError::Status { status, .. } => {
                format!("Music generation failed - service returned HTTP {status}")
            }
            GenerateError::Malformed(_) => "Music generation failed - invalid service response".into(),
            GenerateError::Request(_) => "Music generation failed - service error".into(),
        }
    }
}

/// Call contract for the external generation service.
pub trait Generator: Send + Sync + 'static {
    /// Generate audio from `samples`.  Implementations should give up after
    /// `timeout`; the caller enforces the same bound independently.
    fn predict(
        &self,
        samples: Vec<f32>,
        timeout: Duration,
    ) -> impl Future<Output = std::result::Result<String, GenerateError>> + Send;
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    signal: &'a [f32],
}

#[derive(Deserialize)]
struct PredictResponse {
    audio_base64: Option<String>,
}

/// HTTP/JSON client for the ML service.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    http:        Client,
    predict_url: Url,
}

impl HttpGenerator {
    /// `base_url` may be given with or without the trailing `/predict`.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(GENERATION_TIMEOUT)
            .build()
            .map_err(RelayError::Http)?;
        Ok(HttpGenerator { http, predict_url: predict_endpoint(base_url)? })
    }

    pub fn predict_url(&self) -> &Url { &self.predict_url }
}

impl Generator for HttpGenerator {
    async fn predict(
        &self,
        samples: Vec<f32>,
        timeout: Duration,
    ) -> std::result::Result<String, GenerateError> {
        let resp = self
            .http
            .post(self.predict_url.clone())
            .timeout(timeout)
            .json(&PredictRequest { signal: &samples })
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = resp.status();
        debug!("predict {} → {status}", self.predict_url);
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerateError::Status { status: status.as_u16(), body });
        }
        let body = resp.text().await.map_err(|e| classify(e, timeout))?;
        parse_audio(&body)
    }
}

fn predict_endpoint(base_url: &str) -> Result<Url> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/predict").unwrap_or(trimmed);
    let url = Url::parse(&format!("{trimmed}/predict"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RelayError::Config(format!("generator_url: unsupported scheme {other}"))),
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> GenerateError {
    if e.is_timeout() {
        GenerateError::Timeout(timeout)
    } else if e.is_connect() {
        GenerateError::Connect(e.to_string())
    } else {
        GenerateError::Request(e.to_string())
    }
}

/// Pull `audio_base64` out of a service reply, insisting it is present,
/// non-empty and valid base64.
fn parse_audio(body: &str) -> std::result::Result<String, GenerateError> {
    if body.trim().is_empty() {
        return Err(GenerateError::Malformed("empty response body".into()));
    }
    let parsed: PredictResponse = serde_json::from_str(body)
        .map_err(|e| GenerateError::Malformed(e.to_string()))?;
    let audio = match parsed.audio_base64 {
        Some(a) if !a.trim().is_empty() => a,
        Some(_) => return Err(GenerateError::Malformed("empty audio_base64 field".into())),
        None    => return Err(GenerateError::Malformed("missing audio_base64 field".into())),
    };
    base64::engine::general_purpose::STANDARD
        .decode(audio.trim())
        .map_err(|e| GenerateError::Malformed(format!("audio_base64: {e}")))?;
    Ok(audio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn endpoint_accepts_base_or_full_url() {
        for base in ["http://ml:8000", "http://ml:8000/", "http://ml:8000/predict"] {
            assert_eq!(predict_endpoint(base).unwrap().as_str(), "http://ml:8000/predict");
        }
        assert!(predict_endpoint("ftp://ml").is_err());
        assert!(predict_endpoint("not a url").is_err());
    }

    #[test]
    fn audio_field_is_validated() {
        assert_eq!(parse_audio(r#"{"audio_base64":"UklGRg=="}"#).unwrap(), "UklGRg==");
        for bad in ["", "   ", "{}", r#"{"audio_base64":null}"#, r#"{"audio_base64":" "}"#,
                    r#"{"audio_base64":"@@not base64@@"}"#, "<html>oops</html>"] {
            assert!(
                matches!(parse_audio(bad), Err(GenerateError::Malformed(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn user_messages_distinguish_timeouts() {
        let msg = GenerateError::Timeout(GENERATION_TIMEOUT).user_message();
        assert!(msg.contains("timed out"), "{msg}");
        let msg = GenerateError::Status { status: 503, body: String::new() }.user_message();
        assert!(msg.contains("503"), "{msg}");
    }

    #[tokio::test]
    async fn posts_signal_and_returns_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(body_json(json!({ "signal": [0.5, -1.25, 2.0] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "audio_base64": "UklGRg==" })))
            .expect(1)
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(&server.uri()).unwrap();
        let audio = gen.predict(vec![0.5, -1.25, 2.0], GENERATION_TIMEOUT).await.unwrap();
        assert_eq!(audio, "UklGRg==");
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(&server.uri()).unwrap();
        let err = gen.predict(vec![1.0], GENERATION_TIMEOUT).await.unwrap_err();
        assert_eq!(err, GenerateError::Status { status: 500, body: "model crashed".into() });
    }

    #[tokio::test]
    async fn missing_field_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "ok" })))
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(&server.uri()).unwrap();
        let err = gen.predict(vec![1.0], GENERATION_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, GenerateError::Malformed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "audio_base64": "UklGRg==" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(&server.uri()).unwrap();
        let err = gen.predict(vec![1.0], Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, GenerateError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn unreachable_service_is_connect_error() {
        // Bind then drop a listener to get a port with nothing behind it.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let gen = HttpGenerator::new(&format!("http://127.0.0.1:{port}")).unwrap();
        let err = gen.predict(vec![1.0], GENERATION_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, GenerateError::Connect(_)), "{err:?}");
    }
}
