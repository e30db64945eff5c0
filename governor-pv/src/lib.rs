//! # governor-pv
//!
//! PV binding layer for the Governor.
//!
//! This crate provides:
//! - Channel naming and write decoding for the `{Gov...}` namespace
//! - The `PvBus` seam to the hosting PV server, plus the in-process
//!   `MemoryBus`
//! - The binding that builds the channel table, routes client writes,
//!   and eagerly republishes status

pub mod binding;
pub mod bus;
pub mod channel;
pub mod error;
pub mod value;

pub use binding::PvBinding;
pub use bus::{MemoryBus, PvBus, PvWrite};
pub use channel::{parse_write, WriteAddr};
pub use error::PvError;
pub use value::PvValue;
