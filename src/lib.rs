//! Realtime transport and call signaling core.
//!
//! [`RealtimeClient`] keeps the single logical connection to the realtime
//! backend, buffers events while offline and dispatches inbound events to
//! local subscribers. On top of it, [`calls::CallRouter`] routes signaling
//! envelopes to the per-identity [`calls::CallManager`], and
//! [`screen::CallScreen`] binds UI screens to that manager.

pub mod calls;
pub mod client;
pub mod config;
pub mod error;
pub mod features;
pub mod framing;
pub mod queue;
pub mod reconnect;
pub mod screen;
pub mod transport;
pub mod types;

pub use calls::{CallManager, CallRegistry, CallRouter, CallState};
pub use client::{ConnectionState, EmitOutcome, RealtimeClient};
pub use config::ClientConfig;
pub use error::TransportError;
pub use screen::CallScreen;
