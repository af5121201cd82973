//! Wire messages exchanged with clients as JSON text frames.
//!
//! Inbound:  `{"timestamp": 1700000000000, "signalData": [0.1, -0.4, ...]}`
//! Outbound: `{"audioBase64": "..." | null, "status": "success" | "error" | "buffering", "message": "..."}`

use serde::{Deserialize, Serialize};

use crate::coordinator::Outcome;
use crate::error::Result;

/// One batch of samples from a client.  Missing fields deserialize as
/// `None` so the engine, not the decoder, reports them as invalid input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPacket {
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub signal_data: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
    Buffering,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub audio_base64: Option<String>,
    pub status:       ReplyStatus,
    pub message:      String,
}

impl From<&Outcome> for Reply {
    fn from(outcome: &Outcome) -> Self {
        let (audio_base64, status) = match outcome {
            Outcome::Success { audio } => (Some(audio.clone()), ReplyStatus::Success),
            Outcome::Error { .. }      => (None, ReplyStatus::Error),
            Outcome::Buffering { .. }  => (None, ReplyStatus::Buffering),
        };
        Reply { audio_base64, status, message: outcome.message().to_string() }
    }
}

pub fn decode_packet(text: &str) -> Result<DataPacket> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_reply(reply: &Reply) -> Result<String> {
    Ok(serde_json::to_string(reply)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn decodes_client_packet() {
        let p = decode_packet(r#"{"timestamp": 1700000000000, "signalData": [0.5, -2, 3.25]}"#).unwrap();
        assert_eq!(p.timestamp, Some(1_700_000_000_000));
        assert_eq!(p.signal_data, Some(vec![0.5, -2.0, 3.25]));
    }

    #[test]
    fn missing_signal_is_not_a_decode_error() {
        let p = decode_packet(r#"{"timestamp": 1}"#).unwrap();
        assert_eq!(p.signal_data, None);
        assert!(decode_packet("not json").is_err());
        assert!(decode_packet(r#"{"signalData": "abc"}"#).is_err());
    }

    #[test]
    fn reply_shapes_match_outcomes() {
        let encode = |o: Outcome| -> Value {
            serde_json::from_str(&encode_reply(&Reply::from(&o)).unwrap()).unwrap()
        };
        assert_eq!(
            encode(Outcome::success("UklGRg==")),
            json!({"audioBase64": "UklGRg==", "status": "success", "message": "Music generated successfully"})
        );
        assert_eq!(
            encode(Outcome::buffering()),
            json!({"audioBase64": null, "status": "buffering", "message": "Data received and buffered"})
        );
        assert_eq!(
            encode(Outcome::error("Session not found")),
            json!({"audioBase64": null, "status": "error", "message": "Session not found"})
        );
    }
}
