mod chat;

pub use chat::{ChatEvents, OutgoingMessage};
