//! Platform-independent core of the two-party call stack.
//!
//! Nothing in this crate performs I/O or spawns tasks. The runtime crate feeds
//! events into the state machines defined here and executes the effects they
//! return.

pub mod backoff;
pub mod media;
pub mod quality;
pub mod ring;
pub mod session;
pub mod signal;
pub mod state;
pub mod types;
