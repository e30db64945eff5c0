//! Compiled state machines.
//!
//! A `Machine` is the validated, indexed form of one configuration file:
//! immutable topology (devices, states, staged transitions) plus the
//! runtime cells the controller and executor drive (current state, status,
//! message, abort flag).

use crate::config::{DeviceConfig, MachineConfig};
use crate::device::{Device, DeviceIo};
use crate::error::CoreError;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Machine status word. The PV alphabet is fixed: Idle, Busy, Disabled,
/// FAULT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Busy,
    Disabled,
    Fault,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "Idle",
            Status::Busy => "Busy",
            Status::Disabled => "Disabled",
            Status::Fault => "FAULT",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state's binding for one device. The live window lives in the
/// machine's window table so it can be adjusted at runtime.
#[derive(Debug, Clone)]
pub struct Binding {
    pub target: String,
    pub update_after: bool,
}

/// One named state.
#[derive(Debug, Clone)]
pub struct StateDef {
    pub name: String,
    pub bindings: HashMap<String, Binding>,
}

/// Device conditions gathered by the held-state check.
#[derive(Debug, Clone, Default)]
pub struct FaultReport {
    pub disconnected: Vec<String>,
    pub not_homed: Vec<String>,
    pub out_of_window: Vec<String>,
}

impl FaultReport {
    pub fn is_clear(&self) -> bool {
        self.disconnected.is_empty() && self.not_homed.is_empty() && self.out_of_window.is_empty()
    }

    /// Status message fragment enumerating the offending devices.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        for (label, devices) in [
            ("disconn", &self.disconnected),
            ("!homed", &self.not_homed),
            ("window", &self.out_of_window),
        ] {
            if !devices.is_empty() {
                parts.push(format!("{}({})", label, devices.join(",")));
            }
        }
        parts.join(" ")
    }
}

/// One compiled state machine.
pub struct Machine {
    name: String,
    devices: HashMap<String, Arc<Device>>,
    states: HashMap<String, StateDef>,
    /// `from -> to -> stages`, each stage the device keys moved in
    /// parallel.
    transitions: HashMap<String, HashMap<String, Vec<Vec<String>>>>,
    init_state: String,

    /// Live `(state, device) -> (low, high)` windows, adjustable via PVs.
    windows: DashMap<(String, String), (f64, f64)>,

    current: RwLock<String>,
    next: RwLock<String>,
    status: RwLock<Status>,
    message: RwLock<String>,
    abort: Arc<AtomicBool>,
    updates: broadcast::Sender<()>,
}

impl Machine {
    /// Validates the configuration and compiles it, wiring each device to
    /// the IO returned by `io_for`.
    pub fn compile<F>(config: &MachineConfig, io_for: F) -> Result<Self, CoreError>
    where
        F: Fn(&str, &DeviceConfig) -> Arc<dyn DeviceIo>,
    {
        config.validate()?;

        let devices = config
            .devices
            .iter()
            .map(|(key, device)| {
                let io = io_for(key, device);
                (key.clone(), Arc::new(Device::new(key, device, io)))
            })
            .collect();

        let windows = DashMap::new();
        let states = config
            .states
            .iter()
            .map(|(key, state)| {
                let bindings = state
                    .targets
                    .iter()
                    .map(|(dev_key, binding)| {
                        windows.insert((key.clone(), dev_key.clone()), binding.limits);
                        (
                            dev_key.clone(),
                            Binding {
                                target: binding.target.clone(),
                                update_after: binding.update_after,
                            },
                        )
                    })
                    .collect();
                (
                    key.clone(),
                    StateDef {
                        name: state.name.clone(),
                        bindings,
                    },
                )
            })
            .collect();

        let transitions = config
            .transitions
            .iter()
            .map(|(from, destinations)| {
                let staged = destinations
                    .iter()
                    .map(|(to, stages)| {
                        (to.clone(), stages.iter().map(|s| s.0.clone()).collect())
                    })
                    .collect();
                (from.clone(), staged)
            })
            .collect();

        let (updates, _) = broadcast::channel(64);
        let machine = Self {
            name: config.name.clone(),
            devices,
            states,
            transitions,
            init_state: config.init_state.clone(),
            windows,
            current: RwLock::new(config.init_state.clone()),
            next: RwLock::new(config.init_state.clone()),
            status: RwLock::new(Status::Idle),
            message: RwLock::new(format!("state {}", config.init_state)),
            abort: Arc::new(AtomicBool::new(false)),
            updates,
        };
        tracing::info!(machine = %machine.name, "compiled");
        Ok(machine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_state(&self) -> &str {
        &self.init_state
    }

    pub fn devices(&self) -> &HashMap<String, Arc<Device>> {
        &self.devices
    }

    pub fn device(&self, key: &str) -> Result<&Arc<Device>, CoreError> {
        self.devices.get(key).ok_or_else(|| CoreError::DeviceNotFound {
            device: key.to_string(),
        })
    }

    pub fn state(&self, key: &str) -> Result<&StateDef, CoreError> {
        self.states.get(key).ok_or_else(|| CoreError::StateNotFound {
            state: key.to_string(),
        })
    }

    /// Sorted state keys.
    pub fn state_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.states.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Sorted device keys.
    pub fn device_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.devices.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Every declared `(from, to)` edge, sorted.
    pub fn transition_edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .transitions
            .iter()
            .flat_map(|(from, destinations)| {
                destinations
                    .keys()
                    .map(move |to| (from.clone(), to.clone()))
            })
            .collect();
        edges.sort();
        edges
    }

    /// The stage list of a declared edge. Transitions to the initial
    /// state are implicit and carry no stages.
    pub fn stages(&self, from: &str, to: &str) -> Option<Vec<Vec<String>>> {
        if to == self.init_state {
            return Some(Vec::new());
        }
        self.transitions
            .get(from)
            .and_then(|destinations| destinations.get(to))
            .cloned()
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn set_status(&self, status: Status) {
        *self.status.write() = status;
    }

    pub fn enabled(&self) -> bool {
        self.status() != Status::Disabled
    }

    pub fn current_state(&self) -> String {
        self.current.read().clone()
    }

    pub fn next_state(&self) -> String {
        self.next.read().clone()
    }

    pub fn set_current(&self, state: &str) {
        *self.current.write() = state.to_string();
        *self.next.write() = state.to_string();
    }

    pub fn set_next(&self, state: &str) {
        *self.next.write() = state.to_string();
    }

    pub fn message(&self) -> String {
        self.message.read().clone()
    }

    pub fn set_message(&self, message: impl Into<String>) {
        *self.message.write() = message.into();
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::Release);
    }

    /// The live window of a state's device binding.
    pub fn window(&self, state: &str, device: &str) -> Option<(f64, f64)> {
        self.windows
            .get(&(state.to_string(), device.to_string()))
            .map(|w| *w)
    }

    /// Adjusts one end of a binding's window, keeping `low <= 0 <= high`.
    pub fn set_window(
        &self,
        state: &str,
        device: &str,
        low: Option<f64>,
        high: Option<f64>,
    ) -> Result<(), CoreError> {
        let key = (state.to_string(), device.to_string());
        let Some(mut window) = self.windows.get_mut(&key) else {
            return Err(CoreError::WindowNotFound {
                state: state.to_string(),
                device: device.to_string(),
            });
        };
        let new = (low.unwrap_or(window.0), high.unwrap_or(window.1));
        if !(new.0 <= 0.0 && 0.0 <= new.1) {
            return Err(CoreError::InvalidWindow {
                low: new.0,
                high: new.1,
            });
        }
        *window = new;
        Ok(())
    }

    /// States reachable right now: none while Busy or Disabled, only the
    /// initial state from FAULT, otherwise the initial state plus every
    /// declared edge out of the current state.
    pub fn reachable_states(&self) -> Vec<String> {
        match self.status() {
            Status::Busy | Status::Disabled => Vec::new(),
            Status::Fault => vec![self.init_state.clone()],
            Status::Idle => {
                let current = self.current_state();
                let mut reachable = vec![self.init_state.clone()];
                if let Some(destinations) = self.transitions.get(&current) {
                    reachable.extend(destinations.keys().cloned());
                }
                reachable.sort();
                reachable.dedup();
                reachable
            }
        }
    }

    /// Whether the edge is lit as the in-progress transition.
    pub fn transition_active(&self, from: &str, to: &str) -> bool {
        self.current_state() == from && self.next_state() == to && from != to
    }

    /// Whether the edge could be commanded right now.
    pub fn transition_reachable(&self, from: &str, to: &str) -> bool {
        self.status() == Status::Idle
            && self.current_state() == from
            && self.reachable_states().iter().any(|s| s == to)
    }

    /// Scans device health and the current state's hold windows.
    pub fn fault_check(&self, store: &crate::targets::TargetStore) -> FaultReport {
        let mut report = FaultReport::default();

        for key in self.device_keys() {
            let device = &self.devices[&key];
            if !device.connected() {
                report.disconnected.push(key.clone());
            } else if !device.homed() {
                report.not_homed.push(key.clone());
            }
        }

        let current = self.current_state();
        if let Some(state) = self.states.get(&current) {
            let mut bound: Vec<&String> = state.bindings.keys().collect();
            bound.sort();
            for dev_key in bound {
                let binding = &state.bindings[dev_key];
                let device = &self.devices[dev_key];
                if !device.connected() {
                    continue; // already reported
                }
                let Some(setpoint) =
                    store.get(&self.name, dev_key, &binding.target)
                else {
                    continue;
                };
                let (low, high) = self
                    .window(&current, dev_key)
                    .unwrap_or((0.0, 0.0));
                if !device.within(setpoint, low, high) {
                    report.out_of_window.push(dev_key.clone());
                }
            }
        }

        report
    }

    /// Notifies the PV layer that derived channels need a republish.
    pub fn notify(&self) {
        let _ = self.updates.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.updates.subscribe()
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("init_state", &self.init_state)
            .field("current", &self.current_state())
            .field("status", &self.status())
            .finish()
    }
}
