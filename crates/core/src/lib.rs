#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models for the relay execution agent.

pub mod api;
pub mod interactive;
pub mod model;
pub mod task;

mod util;

pub use util::{new_ulid, now_ms, EpochMs};
