//! Signaling envelopes exchanged between two identities.

use super::error::CallError;
use crate::client::{EmitOutcome, RealtimeClient};
use crate::error::TransportError;
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// Hangup reasons carried in `payload.reason`.
pub mod reason {
    pub const BUSY: &str = "busy";
    pub const DECLINED: &str = "declined";
    pub const ENDED: &str = "ended";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Offer,
    Answer,
    Ice,
    Hangup,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Ice => "ice",
            Self::Hangup => "hangup",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id: 16 random bytes as upper-case hex.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// `{type, callId, from, to, payload?}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub call_id: CallId,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SignalEnvelope {
    pub fn new(
        signal_type: SignalType,
        call_id: CallId,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            signal_type,
            call_id,
            from: from.into(),
            to: to.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn hangup(
        call_id: CallId,
        from: impl Into<String>,
        to: impl Into<String>,
        reason: &str,
    ) -> Self {
        Self::new(SignalType::Hangup, call_id, from, to).with_payload(json!({ "reason": reason }))
    }

    /// Parses and validates an inbound envelope.
    pub fn from_value(value: &Value) -> Result<Self, CallError> {
        let envelope: Self = serde_json::from_value(value.clone())
            .map_err(|e| CallError::InvalidSignal(e.to_string()))?;
        if envelope.call_id.is_empty() {
            return Err(CallError::InvalidSignal("empty callId".into()));
        }
        if envelope.from.is_empty() || envelope.to.is_empty() {
            return Err(CallError::InvalidSignal(format!(
                "missing sender or recipient for call {}",
                envelope.call_id
            )));
        }
        Ok(envelope)
    }

    pub fn hangup_reason(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("reason"))
            .and_then(Value::as_str)
    }

    pub(crate) fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Options for starting a call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Whether this is a video call.
    pub video: bool,
    /// Display name shown on the callee's ringing screen.
    pub caller_name: Option<String>,
    pub caller_photo: Option<String>,
}

impl CallOptions {
    pub fn audio() -> Self {
        Self::default()
    }

    pub fn video() -> Self {
        Self {
            video: true,
            ..Default::default()
        }
    }

    pub fn with_caller(mut self, name: impl Into<String>, photo: Option<String>) -> Self {
        self.caller_name = Some(name.into());
        self.caller_photo = photo;
        self
    }

    pub(crate) fn offer_payload(&self) -> Value {
        json!({
            "media": if self.video { "video" } else { "audio" },
            "callerName": self.caller_name,
            "callerPhoto": self.caller_photo,
        })
    }
}

/// Outbound side of call signaling.
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send_signal(&self, envelope: &SignalEnvelope) -> Result<EmitOutcome, TransportError>;
}

#[async_trait]
impl SignalSender for RealtimeClient {
    async fn send_signal(&self, envelope: &SignalEnvelope) -> Result<EmitOutcome, TransportError> {
        let payload = serde_json::to_value(envelope)?;
        self.emit(&self.config().signal_event, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let envelope = SignalEnvelope::new(SignalType::Offer, "C1".into(), "U2", "U1")
            .with_payload(json!({"sdp": "v=0"}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"type": "offer", "callId": "C1", "from": "U2", "to": "U1", "payload": {"sdp": "v=0"}})
        );
    }

    #[test]
    fn test_payload_omitted_when_absent() {
        let envelope = SignalEnvelope::new(SignalType::Answer, "C1".into(), "U1", "U2");
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_from_value_validates() {
        let ok = SignalEnvelope::from_value(
            &json!({"type": "hangup", "callId": "C1", "from": "U2", "to": "U1", "payload": {"reason": "busy"}}),
        )
        .unwrap();
        assert_eq!(ok.signal_type, SignalType::Hangup);
        assert_eq!(ok.hangup_reason(), Some(reason::BUSY));

        for bad in [
            json!({"type": "dial", "callId": "C1", "from": "U2", "to": "U1"}),
            json!({"type": "offer", "callId": "", "from": "U2", "to": "U1"}),
            json!({"type": "offer", "callId": "C1", "from": "", "to": "U1"}),
            json!({"type": "offer", "callId": "C1", "from": "U2"}),
            json!("offer"),
        ] {
            assert!(
                matches!(SignalEnvelope::from_value(&bad), Err(CallError::InvalidSignal(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn test_generated_call_ids() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(
            a.as_str()
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        );
    }

    #[test]
    fn test_offer_payload() {
        let payload = CallOptions::video()
            .with_caller("Rex", None)
            .offer_payload();
        assert_eq!(payload["media"], "video");
        assert_eq!(payload["callerName"], "Rex");
        assert!(payload["callerPhoto"].is_null());
    }
}
