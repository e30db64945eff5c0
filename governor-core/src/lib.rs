//! # governor-core
//!
//! Engine of the Governor: a supervisory state manager for positioners
//! sharing a motion envelope.
//!
//! This crate provides:
//! - Configuration parsing and validation
//! - Device drivers over a narrow IO seam (plus simulated IO)
//! - The target store with cross-machine synchronization
//! - Compiled machines: states, staged transitions, reachability
//! - The transition executor and per-machine controller
//! - The supervisor enforcing the single-active invariant

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod executor;
pub mod machine;
pub mod sim;
pub mod supervisor;
pub mod targets;

pub use config::{DeviceKind, MachineConfig, SyncMap};
pub use controller::{Command, Controller};
pub use device::{Device, DeviceIo};
pub use error::{CoreError, DeviceFailure, MoveFault};
pub use machine::{Machine, Status};
pub use supervisor::Supervisor;
pub use targets::{TargetStore, TargetUpdate};
