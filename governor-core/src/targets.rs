//! Target store and cross-machine synchronization.
//!
//! One process-global store holds every `(machine, device, target)`
//! setpoint cell. All writes pass through a single serializing writer;
//! cells listed in the sync map fan out to every other loaded machine
//! inside the same critical section, so peers never re-fan and
//! simultaneous writers cannot interleave.

use crate::config::{MachineConfig, SyncMap};
use crate::error::CoreError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;

/// A setpoint cell change, as seen by the PV layer.
#[derive(Debug, Clone)]
pub struct TargetUpdate {
    pub machine: String,
    pub device: String,
    pub target: String,
    pub value: f64,
}

type CellKey = (String, String, String);

/// Process-global store of target setpoints.
pub struct TargetStore {
    cells: DashMap<CellKey, f64>,
    sync: HashMap<String, HashSet<String>>,
    machines: Vec<String>,
    write_serial: Mutex<()>,
    updates: broadcast::Sender<TargetUpdate>,
}

impl TargetStore {
    /// Builds the store from the loaded configurations, seeding every
    /// cell from the declared positions (valves get the implicit pair).
    pub fn new(configs: &[MachineConfig], sync: SyncMap) -> Self {
        let cells = DashMap::new();
        for config in configs {
            for (dev_key, device) in &config.devices {
                for (target, value) in device.effective_positions() {
                    cells.insert(
                        (config.name.clone(), dev_key.clone(), target.clone()),
                        value,
                    );
                }
            }
        }

        let sync = sync
            .into_iter()
            .map(|(device, targets)| (device, targets.into_iter().collect()))
            .collect();

        let (updates, _) = broadcast::channel(256);
        Self {
            cells,
            sync,
            machines: configs.iter().map(|c| c.name.clone()).collect(),
            write_serial: Mutex::new(()),
            updates,
        }
    }

    /// Current setpoint of a cell.
    pub fn get(&self, machine: &str, device: &str, target: &str) -> Option<f64> {
        self.cells
            .get(&(machine.to_string(), device.to_string(), target.to_string()))
            .map(|cell| *cell)
    }

    /// Writes a setpoint, fanning out to peer machines when the cell is
    /// in the sync map.
    pub fn set(
        &self,
        machine: &str,
        device: &str,
        target: &str,
        value: f64,
    ) -> Result<(), CoreError> {
        let _serial = self.write_serial.lock();

        let key = (machine.to_string(), device.to_string(), target.to_string());
        if !self.cells.contains_key(&key) {
            return Err(CoreError::TargetNotFound {
                device: device.to_string(),
                target: target.to_string(),
            });
        }

        tracing::info!(machine, device, target, value, "setpoint updated");
        self.cells.insert(key, value);
        let _ = self.updates.send(TargetUpdate {
            machine: machine.to_string(),
            device: device.to_string(),
            target: target.to_string(),
            value,
        });

        if self.is_synced(device, target) {
            for peer in self.machines.iter().filter(|name| *name != machine) {
                let peer_key = (peer.clone(), device.to_string(), target.to_string());
                // A peer may legitimately lack the cell only if the sync
                // file skipped validation; ignore it then.
                if self.cells.contains_key(&peer_key) {
                    self.cells.insert(peer_key, value);
                    let _ = self.updates.send(TargetUpdate {
                        machine: peer.clone(),
                        device: device.to_string(),
                        target: target.to_string(),
                        value,
                    });
                }
            }
        }

        Ok(())
    }

    fn is_synced(&self, device: &str, target: &str) -> bool {
        self.sync
            .get(device)
            .map(|targets| targets.contains(target))
            .unwrap_or(false)
    }

    /// Sorted `(target, setpoint)` list for one device on one machine.
    pub fn positions_for(&self, machine: &str, device: &str) -> Vec<(String, f64)> {
        let mut positions: Vec<(String, f64)> = self
            .cells
            .iter()
            .filter(|cell| {
                let (m, d, _) = cell.key();
                m == machine && d == device
            })
            .map(|cell| (cell.key().2.clone(), *cell.value()))
            .collect();
        positions.sort_by(|a, b| a.0.cmp(&b.0));
        positions
    }

    /// Subscribes to cell changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TargetUpdate> {
        self.updates.subscribe()
    }
}
