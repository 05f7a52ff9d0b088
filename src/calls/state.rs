//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::signaling::{CallId, SignalEnvelope, reason};

/// Current state of the call owned by one local identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    /// No call. The only state that accepts a new call.
    #[default]
    Idle,
    /// Outgoing call: offer sent, waiting for an answer.
    OutgoingRinging,
    /// Incoming call: ringing locally.
    IncomingRinging,
    /// Call answered.
    Active,
    /// Local hangup in progress.
    Ending,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::OutgoingRinging | Self::IncomingRinging)
    }

    /// Ringing, active or ending.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::OutgoingRinging | Self::IncomingRinging | Self::Active | Self::Ending
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    StartOutgoing(CallInfo),
    OfferReceived(CallInfo),
    RemoteAnswered,
    LocalAccepted,
    LocalDeclined,
    LocalEnding,
    Hungup,
    RemoteHangup { reason: String },
    Failed { error: String },
    Acknowledged,
}

/// Who the call is with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub call_id: CallId,
    pub remote_user_id: String,
    pub remote_name: String,
    pub remote_photo: Option<String>,
    pub is_caller: bool,
    pub video: bool,
}

impl CallInfo {
    pub fn new_outgoing(
        call_id: CallId,
        remote_user_id: impl Into<String>,
        remote_name: impl Into<String>,
        remote_photo: Option<String>,
        video: bool,
    ) -> Self {
        Self {
            call_id,
            remote_user_id: remote_user_id.into(),
            remote_name: remote_name.into(),
            remote_photo,
            is_caller: true,
            video,
        }
    }

    /// Caller details from an inbound offer. The display name falls back to
    /// the caller's user id.
    pub fn from_offer(offer: &SignalEnvelope) -> Self {
        Self {
            call_id: offer.call_id.clone(),
            remote_user_id: offer.from.clone(),
            remote_name: offer
                .payload_str("callerName")
                .unwrap_or(&offer.from)
                .to_string(),
            remote_photo: offer.payload_str("callerPhoto").map(str::to_string),
            is_caller: false,
            video: offer.payload_str("media") == Some("video"),
        }
    }
}

/// The live call of one local identity.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub state: CallState,
    pub info: Option<CallInfo>,
    /// Set when the call becomes `Active`.
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds spent `Active`, once ended.
    pub duration_secs: Option<i64>,
    pub end_reason: Option<String>,
    pub last_error: Option<String>,
    /// Bumped by every accepted transition.
    #[serde(skip)]
    pub revision: u64,
}

impl CallSession {
    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        match (self.state, transition) {
            (CallState::Idle, CallTransition::StartOutgoing(info)) => {
                self.begin(CallState::OutgoingRinging, info);
            }
            (CallState::Idle, CallTransition::OfferReceived(info)) => {
                self.begin(CallState::IncomingRinging, info);
            }
            (CallState::OutgoingRinging, CallTransition::RemoteAnswered)
            | (CallState::IncomingRinging, CallTransition::LocalAccepted) => {
                self.state = CallState::Active;
                self.started_at = Some(now);
            }
            (CallState::IncomingRinging, CallTransition::LocalDeclined) => {
                self.finish(reason::DECLINED, now);
            }
            (
                CallState::OutgoingRinging | CallState::IncomingRinging | CallState::Active,
                CallTransition::LocalEnding,
            ) => {
                self.state = CallState::Ending;
            }
            (CallState::Ending, CallTransition::Hungup) => {
                self.finish(reason::ENDED, now);
            }
            (
                CallState::OutgoingRinging
                | CallState::IncomingRinging
                | CallState::Active
                | CallState::Ending,
                CallTransition::RemoteHangup { reason },
            ) => {
                self.finish(&reason, now);
            }
            (
                CallState::OutgoingRinging
                | CallState::IncomingRinging
                | CallState::Active
                | CallState::Ending,
                CallTransition::Failed { error },
            ) => {
                self.state = CallState::Failed;
                self.ended_at = Some(now);
                self.last_error = Some(error);
            }
            (CallState::Ended | CallState::Failed, CallTransition::Acknowledged) => {
                *self = Self {
                    revision: self.revision,
                    ..Self::default()
                };
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        }
        self.revision += 1;
        Ok(())
    }

    fn begin(&mut self, state: CallState, info: CallInfo) {
        *self = Self {
            state,
            info: Some(info),
            revision: self.revision,
            ..Self::default()
        };
    }

    fn finish(&mut self, reason: &str, now: DateTime<Utc>) {
        self.state = CallState::Ended;
        self.ended_at = Some(now);
        self.end_reason = Some(reason.to_string());
        self.duration_secs = self
            .started_at
            .map(|started| now.signed_duration_since(started).num_seconds());
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.info.as_ref().map(|info| &info.call_id)
    }

    /// Whether `call_id` is the call currently ringing, active or ending.
    pub fn tracks_live_call(&self, call_id: &CallId) -> bool {
        self.state.is_live() && self.call_id() == Some(call_id)
    }

    /// Seconds the call has been (or was) active.
    pub fn duration_secs(&self) -> Option<i64> {
        self.duration_secs.or_else(|| {
            (self.state == CallState::Active)
                .then_some(self.started_at)
                .flatten()
                .map(|started| Utc::now().signed_duration_since(started).num_seconds())
        })
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
