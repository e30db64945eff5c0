//! Governor supervisor.
//!
//! Owns the loaded machines and enforces the control-plane invariants: at
//! most one machine is enabled at a time, switching is refused while any
//! machine is busy, and Kill drains into an orderly shutdown.

use crate::config::{DeviceConfig, MachineConfig, SyncMap};
use crate::controller::{Command, Controller};
use crate::device::DeviceIo;
use crate::error::CoreError;
use crate::machine::{Machine, Status};
use crate::targets::TargetStore;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// The process-wide supervisor.
pub struct Supervisor {
    controllers: Vec<Controller>,
    names: Vec<String>,
    store: Arc<TargetStore>,
    /// The global Active/Inactive selector.
    active: AtomicBool,
    /// Index of the selected machine.
    selected: RwLock<usize>,
    shutdown: broadcast::Sender<()>,
}

impl Supervisor {
    /// Compiles every configuration and spawns its controller. The first
    /// machine starts enabled, the rest Disabled.
    pub fn new<F>(
        configs: &[MachineConfig],
        sync: SyncMap,
        io_for: F,
    ) -> Result<Arc<Self>, CoreError>
    where
        F: Fn(&str, &str, &DeviceConfig) -> Arc<dyn DeviceIo>,
    {
        for config in configs {
            config.validate()?;
        }
        crate::config::validate_sync(&sync, configs)?;

        let store = Arc::new(TargetStore::new(configs, sync));
        let (shutdown, _) = broadcast::channel(4);

        let mut controllers = Vec::new();
        let mut names = Vec::new();
        for (index, config) in configs.iter().enumerate() {
            let machine_name = config.name.clone();
            let machine = Arc::new(Machine::compile(config, |key, device| {
                io_for(&machine_name, key, device)
            })?);
            let controller = Controller::spawn(machine, store.clone(), shutdown.clone());
            if index != 0 {
                controller.set_enabled(false)?;
            }
            names.push(config.name.clone());
            controllers.push(controller);
        }

        tracing::info!(machines = ?names, "supervisor started");
        Ok(Arc::new(Self {
            controllers,
            names,
            store,
            active: AtomicBool::new(true),
            selected: RwLock::new(0),
            shutdown,
        }))
    }

    pub fn machine_names(&self) -> &[String] {
        &self.names
    }

    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    pub fn controller(&self, machine: &str) -> Result<&Controller, CoreError> {
        self.names
            .iter()
            .position(|name| name == machine)
            .map(|index| &self.controllers[index])
            .ok_or_else(|| CoreError::MachineNotFound {
                machine: machine.to_string(),
            })
    }

    pub fn store(&self) -> &Arc<TargetStore> {
        &self.store
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn selected(&self) -> usize {
        *self.selected.read()
    }

    /// Flips the global Active selector. Deactivating disables every
    /// machine; reactivating re-enables the selected one.
    pub fn set_active(&self, active: bool) -> Result<(), CoreError> {
        if self.is_active() == active {
            return Ok(());
        }
        if self.any_busy() {
            return Err(CoreError::CommandRejected {
                reason: "a machine is busy".to_string(),
            });
        }

        if active {
            self.controllers[self.selected()].set_enabled(true)?;
        } else {
            for controller in &self.controllers {
                controller.set_enabled(false)?;
            }
        }
        self.active.store(active, Ordering::Release);
        tracing::info!(active, "global activity changed");
        Ok(())
    }

    /// Switches the selected machine. Refused while any machine is busy
    /// or while globally inactive.
    pub fn select(&self, index: usize) -> Result<(), CoreError> {
        if index >= self.controllers.len() {
            return Err(CoreError::MachineNotFound {
                machine: format!("#{}", index),
            });
        }
        if !self.is_active() {
            return Err(CoreError::CommandRejected {
                reason: "governor is inactive".to_string(),
            });
        }
        let current = self.selected();
        if index == current {
            return Ok(());
        }
        if self.any_busy() {
            return Err(CoreError::CommandRejected {
                reason: "a machine is busy".to_string(),
            });
        }

        self.controllers[current].set_enabled(false)?;
        self.controllers[index].set_enabled(true)?;
        *self.selected.write() = index;
        tracing::info!(from = %self.names[current], to = %self.names[index], "selection changed");
        Ok(())
    }

    fn any_busy(&self) -> bool {
        self.controllers
            .iter()
            .any(|c| c.machine().status() == Status::Busy)
    }

    /// Forwards an abort to the selected machine.
    pub async fn abort_active(&self) {
        self.controllers[self.selected()].send(Command::Abort).await;
    }

    /// Orderly shutdown: abort everything and release every task waiting
    /// on the shutdown channel. The abort flags are raised directly so
    /// in-flight executors bail out even as their intakes stop.
    pub async fn kill(&self) {
        tracing::info!("kill requested, shutting down");
        for controller in &self.controllers {
            controller.machine().request_abort();
        }
        let _ = self.shutdown.send(());
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }
}
