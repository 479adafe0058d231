//! WebSocket wire envelope and the message payload fields the gateway
//! actually reads. Everything else rides through as opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl WsEnvelope {
    /// WebRTC signaling frames are relayed unchanged except for the type
    /// prefix; anything unknown is rebroadcast untouched.
    pub fn apply_signal_prefix(&mut self) {
        if matches!(
            self.kind.as_str(),
            "webrtc_offer" | "webrtc_answer" | "webrtc_ice"
        ) {
            self.kind = format!("signal_{}", self.kind);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub client_msg_id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub emojis: Vec<String>,
}

pub fn parse_message_payload(payload: &Value) -> Result<MessagePayload, &'static str> {
    let mut parsed: MessagePayload =
        serde_json::from_value(payload.clone()).map_err(|_| "invalid message payload")?;
    parsed.client_msg_id = parsed.client_msg_id.trim().to_string();
    if parsed.body.trim().is_empty() {
        return Err("body required");
    }
    Ok(parsed)
}

pub fn build_message_meta(
    file_id: Option<&str>,
    file_ids: &[String],
    emojis: &[String],
) -> String {
    let mut meta = json!({ "emojis": emojis });
    if let Some(file_id) = file_id {
        meta["file_id"] = json!(file_id);
    }
    if !file_ids.is_empty() {
        meta["file_ids"] = json!(file_ids);
    }
    meta.to_string()
}

pub fn error_frame(message: &str) -> String {
    json!({"type": "error", "error": message}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_requires_a_body() {
        let err = parse_message_payload(&json!({"client_msg_id": "abc"})).unwrap_err();
        assert_eq!(err, "body required");

        let parsed =
            parse_message_payload(&json!({"client_msg_id": " abc ", "body": "hi"})).unwrap();
        assert_eq!(parsed.client_msg_id, "abc");
        assert_eq!(parsed.body, "hi");
    }

    #[test]
    fn signal_types_get_prefixed_and_others_pass_through() {
        let mut env = WsEnvelope {
            kind: "webrtc_offer".into(),
            ..Default::default()
        };
        env.apply_signal_prefix();
        assert_eq!(env.kind, "signal_webrtc_offer");

        let mut env = WsEnvelope {
            kind: "typing".into(),
            ..Default::default()
        };
        env.apply_signal_prefix();
        assert_eq!(env.kind, "typing");
    }

    #[test]
    fn meta_includes_only_present_fields() {
        let meta = build_message_meta(None, &[], &[]);
        assert_eq!(meta, r#"{"emojis":[]}"#);

        let meta: Value = serde_json::from_str(&build_message_meta(
            Some("f1"),
            &["f1".into(), "f2".into()],
            &["+1".into()],
        ))
        .unwrap();
        assert_eq!(meta["file_id"], "f1");
        assert_eq!(meta["file_ids"], json!(["f1", "f2"]));
        assert_eq!(meta["emojis"], json!(["+1"]));
    }

    #[test]
    fn envelope_round_trips_with_type_field() {
        let raw = r#"{"type":"message","room_id":"r1","user_id":"u1","payload":{"body":"hi"}}"#;
        let env: WsEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.kind, "message");
        let out = serde_json::to_value(&env).unwrap();
        assert_eq!(out["type"], "message");
        assert!(out.get("target_id").is_none());
    }
}
