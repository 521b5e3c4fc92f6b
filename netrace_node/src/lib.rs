//! `netrace_node`
//!
//! One participant's process:
//! - Session start/join through the orchestrator
//! - Fixed timestep tick split into `begin_tick` / `simulate_tick`
//! - Local physics instances kept in step with the replicated registry
//! - Console for tuning and network stats
//!
//! Every node simulates every vehicle from the same replicated input.

pub mod input;
pub mod node;

pub use node::RaceNode;
