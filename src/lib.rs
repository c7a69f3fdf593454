//! sshtrap - high-interaction SSH man-in-the-middle honeypot
//!
//! Clients complete a real SSH session against the proxy, which opens its
//! own session to a configured upstream victim and relays both ways,
//! recording interactive activity as asciicast v2 files. The binary lives
//! in `main.rs`; this library carries the engine so the integration tests
//! can drive it in-process.

pub mod config;
pub mod keys;
pub mod probe;
pub mod recorder;
pub mod ssh;
pub mod tag;
