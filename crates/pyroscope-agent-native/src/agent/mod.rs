//! Agent Module
//!
//! This module provides the [`Agent`], which owns the lifecycle of the native sampler
//! and the tag store it reads from:
//!
//! - [`handle`]: the agent state machine (`initialize`, `reconfigure`, `stop`, fork
//!   handling) and its error type
//! - [`sampler`]: the [`Sampler`] trait the native sampling/transport collaborator
//!   implements
//! - [`global`]: the single process-wide agent used by the C ABI
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pyroscope_agent_native::agent::{Agent, NoopSampler};
//! use pyroscope_agent_native::config::{get_config, RawConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Agent::new(Arc::new(NoopSampler));
//!
//! let config = get_config(&RawConfig {
//!     application_name: Some("checkout".to_string()),
//!     ..RawConfig::default()
//! });
//! agent.initialize(config)?;
//!
//! // ... run the workload, tagging with agent.tags() ...
//!
//! agent.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod global;
pub mod handle;
pub mod sampler;

pub use handle::{Agent, AgentError, AgentState};
pub use sampler::{NoopSampler, Sampler};
