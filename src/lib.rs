//! agentd: a local AI coding-agent runtime.
//!
//! An LLM issues structured tool calls; this crate executes them against the
//! filesystem, shell, background tasks, and PTY-backed terminals, gated by a
//! capability generation and a permission callback, with every invocation
//! recorded in a masked, day-partitioned audit trail.

pub mod agent;
pub mod audit;
pub mod config;
pub mod exec;
pub mod llm;
pub mod process;
pub mod runtime;
pub mod tools;
pub mod util;
