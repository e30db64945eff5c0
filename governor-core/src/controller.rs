//! State machine controller.
//!
//! One controller per machine: a serializing command intake (`Go` and
//! `Abort` apply in arrival order), a single executor slot, and the
//! held-state monitor that drops the machine into FAULT when a bound
//! device drifts, disconnects, or loses its homing.

use crate::error::CoreError;
use crate::executor;
use crate::machine::{Machine, Status};
use crate::targets::TargetStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Cadence of the held-state monitor.
const MONITOR_PERIOD: Duration = Duration::from_millis(500);

/// Commands accepted by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a transition to the named state.
    Go(String),
    /// Abort the in-flight transition.
    Abort,
}

/// Handle to one machine's controller tasks.
pub struct Controller {
    machine: Arc<Machine>,
    commands: mpsc::Sender<Command>,
}

impl Controller {
    /// Spawns the intake and monitor tasks for a machine.
    pub fn spawn(
        machine: Arc<Machine>,
        store: Arc<TargetStore>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(16);

        tokio::spawn(intake(
            machine.clone(),
            store.clone(),
            rx,
            shutdown.subscribe(),
        ));
        tokio::spawn(monitor(machine.clone(), store, shutdown.subscribe()));

        Self { machine, commands }
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Queues a command; ordering follows arrival order.
    pub async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            tracing::warn!(machine = %self.machine.name(), "controller intake closed");
        }
    }

    /// Enables or disables the machine. Rejected while Busy. Selection
    /// resets the machine to its initial state; the monitor recomputes
    /// the held predicate on the next tick.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), CoreError> {
        let machine = &self.machine;
        if machine.enabled() == enabled {
            return Ok(());
        }
        if machine.status() == Status::Busy {
            return Err(CoreError::CommandRejected {
                reason: format!("machine '{}' is busy", machine.name()),
            });
        }

        if enabled {
            machine.set_status(Status::Idle);
            machine.set_message(format!("state {}", machine.init_state()));
        } else {
            machine.set_status(Status::Disabled);
            machine.set_message("disabled");
        }
        machine.set_current(machine.init_state());
        machine.notify();
        tracing::info!(machine = %machine.name(), enabled, "selection changed");
        Ok(())
    }
}

/// Serializing command intake. Transitions run in a spawned slot so the
/// intake stays responsive to Abort while Busy.
async fn intake(
    machine: Arc<Machine>,
    store: Arc<TargetStore>,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = shutdown.recv() => break,
        };

        match command {
            Command::Abort => {
                if machine.status() == Status::Busy {
                    tracing::info!(machine = %machine.name(), "abort requested");
                    machine.request_abort();
                } else {
                    tracing::info!(machine = %machine.name(), "abort ignored, no transition in progress");
                }
            }
            Command::Go(dest) => {
                if let Err(reason) = accept_go(&machine, &dest) {
                    tracing::warn!(machine = %machine.name(), %dest, %reason, "go rejected");
                    machine.set_message(reason);
                    machine.notify();
                    continue;
                }
                // Single executor slot: Busy is set synchronously inside
                // run() before the next command is polled, but guard here
                // too so a queued Go observed late cannot double-start.
                machine.set_status(Status::Busy);
                tokio::spawn(executor::run(machine.clone(), store.clone(), dest));
            }
        }
    }
    tracing::debug!(machine = %machine.name(), "intake stopped");
}

fn accept_go(machine: &Machine, dest: &str) -> Result<(), String> {
    match machine.status() {
        Status::Busy => return Err("busy, command ignored".to_string()),
        Status::Disabled => return Err("disabled, command ignored".to_string()),
        Status::Idle | Status::Fault => {}
    }
    if !machine.reachable_states().iter().any(|s| s == dest) {
        return Err(format!(
            "cannot transition from {} to {}",
            machine.current_state(),
            dest
        ));
    }
    Ok(())
}

/// Held-state monitor: while enabled and not Busy, a disconnect, a lost
/// homing, or a bound device outside its window forces FAULT at the
/// initial state; once everything clears, FAULT recovers to Idle.
async fn monitor(
    machine: Arc<Machine>,
    store: Arc<TargetStore>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(MONITOR_PERIOD);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => break,
        }

        match machine.status() {
            Status::Busy | Status::Disabled => continue,
            Status::Idle => {
                let report = machine.fault_check(&store);
                if !report.is_clear() {
                    tracing::error!(machine = %machine.name(), fault = %report.describe(),
                        "held-state check failed");
                    machine.set_status(Status::Fault);
                    machine.set_message(report.describe());
                    machine.set_current(machine.init_state());
                    machine.notify();
                }
            }
            Status::Fault => {
                let report = machine.fault_check(&store);
                if report.is_clear() {
                    tracing::info!(machine = %machine.name(), "fault cleared");
                    machine.set_status(Status::Idle);
                    machine.set_message(format!("state {}", machine.current_state()));
                    machine.notify();
                } else {
                    machine.set_message(report.describe());
                }
            }
        }
    }
    tracing::debug!(machine = %machine.name(), "monitor stopped");
}
