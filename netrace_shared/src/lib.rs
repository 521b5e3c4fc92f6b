//! `netrace_shared`
//!
//! Shared libraries used by every race node.
//!
//! Design goals:
//! - Exactly one node mutates the vehicle registry at any time.
//! - Deterministic per-tick vehicle dynamics, re-simulated on every node.
//! - Traits at the collaborator seams (fabric, physics, input device).
//! - No `unsafe`.

pub mod config;
pub mod console;
pub mod error;
pub mod fabric;
pub mod input;
pub mod lifecycle;
pub mod math;
pub mod net;
pub mod physics;
pub mod records;
pub mod session;
pub mod spawn;
pub mod vehicle;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::fabric::{Fabric, LoopbackFabric, LoopbackHub};
    pub use crate::input::{InputFrame, InputSource, RawInput};
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::records::VehicleRecord;
    pub use crate::session::{SessionDiagnostics, SessionOrchestrator};
}
