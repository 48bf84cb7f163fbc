//! Homeserver-facing abstractions: the port the bot acts through, the events it
//! reacts to, and the outbound throttle.

pub mod notice;
pub mod port;
pub mod throttled;
pub mod types;
