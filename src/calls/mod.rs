//! Call signaling for one-to-one voice and video calls.
//!
//! # Architecture
//!
//! - [`SignalEnvelope`]: the addressed `offer`/`answer`/`ice`/`hangup` message
//! - [`CallSession`] & [`CallState`]: the per-identity call state machine
//! - [`CallManager`]: drives one identity's call through intents and inbound signals
//! - [`CallRegistry`]: hands out the single manager of each local identity
//! - [`CallRouter`]: filters transport events down to the addressed identity
//!
//! Envelopes travel as the payload of one realtime event (`call_signal` by
//! default). Media negotiation data rides in `payload` untouched.

mod error;
mod manager;
mod registry;
mod router;
mod signaling;
mod state;

pub use error::CallError;
pub use manager::{CallManager, CallObserver, ObserverId, OfferDisposition};
pub use registry::CallRegistry;
pub use router::{CallRouter, IncomingHandler, RouteOutcome, RouterSubscription};
pub use signaling::{CallId, CallOptions, SignalEnvelope, SignalSender, SignalType, reason};
pub use state::{CallInfo, CallSession, CallState, CallTransition, InvalidTransition};
