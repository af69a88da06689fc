#![forbid(unsafe_code)]

//! Local execution agent: detects work items addressed to this destination,
//! claims them with a conditional write, and runs them as local processes.

pub mod agent;
pub mod automation;
pub mod backoff;
pub mod claim;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod gateway;
pub mod heartbeat;
pub mod http;
pub mod process;
pub mod reporter;
pub mod runner;
pub mod schedule;

pub use agent::{connect_gateway, Agent};
pub use config::AgentConfig;
