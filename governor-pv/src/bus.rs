//! The bus seam.
//!
//! The Governor publishes onto whatever PV server hosts its channels; the
//! engine only needs the narrow [`PvBus`] surface. [`MemoryBus`] is the
//! in-process implementation used by the binary and the end-to-end tests:
//! a value table, a monitor fan-out, and a client write intake.

use crate::value::PvValue;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Narrow interface to the hosting PV server.
pub trait PvBus: Send + Sync {
    /// Registers a channel with its initial value.
    fn create(&self, name: &str, value: PvValue);

    /// Updates a channel, fanning out to monitors eagerly.
    fn post(&self, name: &str, value: PvValue);

    /// Current value of a channel.
    fn read(&self, name: &str) -> Option<PvValue>;
}

/// A client write arriving from the bus.
pub type PvWrite = (String, PvValue);

/// In-process PV bus.
pub struct MemoryBus {
    table: DashMap<String, PvValue>,
    monitors: broadcast::Sender<PvWrite>,
    writes: mpsc::Sender<PvWrite>,
}

impl MemoryBus {
    /// Creates the bus and hands back the write intake consumed by the
    /// binding's router.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<PvWrite>) {
        let (monitors, _) = broadcast::channel(1024);
        let (writes, intake) = mpsc::channel(64);
        (
            Arc::new(Self {
                table: DashMap::new(),
                monitors,
                writes,
            }),
            intake,
        )
    }

    /// Client-side put: enqueues the write for routing.
    pub async fn write(&self, name: &str, value: PvValue) {
        if self
            .writes
            .send((name.to_string(), value))
            .await
            .is_err()
        {
            tracing::warn!(channel = %name, "bus write dropped, router gone");
        }
    }

    /// Client-side monitor subscription.
    pub fn monitor(&self) -> broadcast::Receiver<PvWrite> {
        self.monitors.subscribe()
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.table.len()
    }
}

impl PvBus for MemoryBus {
    fn create(&self, name: &str, value: PvValue) {
        self.table.insert(name.to_string(), value);
    }

    fn post(&self, name: &str, value: PvValue) {
        self.table.insert(name.to_string(), value.clone());
        let _ = self.monitors.send((name.to_string(), value));
    }

    fn read(&self, name: &str) -> Option<PvValue> {
        self.table.get(name).map(|v| v.clone())
    }
}
