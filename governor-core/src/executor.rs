//! Transition executor.
//!
//! Drives one transition: stages run strictly in sequence, devices inside
//! a stage truly in parallel. Any device failure abandons the remaining
//! stages, stops whatever is still in flight, and drops the machine back
//! to its initial state.

use crate::error::{DeviceFailure, MoveFault};
use crate::machine::{Machine, Status};
use crate::targets::TargetStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Runs a validated transition to `dest`. The caller (the controller) has
/// already checked reachability and holds the single executor slot.
pub async fn run(machine: Arc<Machine>, store: Arc<TargetStore>, dest: String) {
    let origin = machine.current_state();
    tracing::info!(machine = %machine.name(), %origin, %dest, "transition started");

    machine.clear_abort();
    machine.set_status(Status::Busy);
    machine.set_next(&dest);
    machine.set_message(format!("transition {} to {}", origin, dest));
    machine.notify();

    let stages = machine.stages(&origin, &dest).unwrap_or_default();

    match drive_stages(&machine, &store, &dest, &stages).await {
        Ok(()) => {
            apply_update_after(&machine, &store, &dest);
            machine.set_current(&dest);
            machine.set_status(Status::Idle);
            machine.set_message(format!("state {}", dest));
            tracing::info!(machine = %machine.name(), %dest, "transition complete");
        }
        Err(failures) => {
            let aborted = failures.iter().all(|f| f.fault == MoveFault::Aborted);
            machine.set_current(machine.init_state());
            if aborted {
                machine.set_status(Status::Idle);
                machine.set_message(format!("transition {} to {} aborted", origin, dest));
                tracing::warn!(machine = %machine.name(), %origin, %dest, "transition aborted");
            } else {
                let detail = failures
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                machine.set_status(Status::Fault);
                machine.set_message(detail.clone());
                tracing::error!(machine = %machine.name(), %origin, %dest, %detail, "transition failed");
            }
        }
    }

    machine.clear_abort();
    machine.notify();
}

async fn drive_stages(
    machine: &Arc<Machine>,
    store: &TargetStore,
    dest: &str,
    stages: &[Vec<String>],
) -> Result<(), Vec<DeviceFailure>> {
    for stage in stages {
        if machine.abort_requested() {
            return Err(vec![DeviceFailure {
                device: String::new(),
                fault: MoveFault::Aborted,
            }]);
        }
        drive_stage(machine, store, dest, stage).await?;
    }
    Ok(())
}

async fn drive_stage(
    machine: &Arc<Machine>,
    store: &TargetStore,
    dest: &str,
    stage: &[String],
) -> Result<(), Vec<DeviceFailure>> {
    // Resolve every move up front; the configuration guarantees the
    // bindings and cells exist.
    let mut moves = Vec::new();
    let mut failures = Vec::new();
    for key in stage {
        let Ok(state) = machine.state(dest) else { continue };
        let Some(binding) = state.bindings.get(key) else { continue };
        let Ok(device) = machine.device(key) else { continue };
        let Some(setpoint) = store.get(machine.name(), key, &binding.target) else {
            failures.push(DeviceFailure {
                device: key.clone(),
                fault: MoveFault::MissedTarget,
            });
            continue;
        };
        moves.push((device.clone(), setpoint));
    }

    let mut started = Vec::new();
    for (device, setpoint) in &moves {
        match device.start_move(*setpoint) {
            Ok(()) => started.push((device.clone(), *setpoint)),
            Err(fault) => failures.push(DeviceFailure {
                device: device.key().to_string(),
                fault,
            }),
        }
    }

    if !failures.is_empty() {
        for (device, _) in &started {
            device.stop();
        }
        return Err(failures);
    }

    // Stage barrier: every device settles before the next stage starts.
    let abort = machine.abort_flag();
    let mut set = JoinSet::new();
    for (device, setpoint) in started {
        let abort = abort.clone();
        set.spawn(async move {
            let result = device.settle(setpoint, &abort).await;
            (device, result)
        });
    }

    let mut completed = HashSet::new();
    while let Some(joined) = set.join_next().await {
        let Ok((device, result)) = joined else { continue };
        match result {
            Ok(()) => {
                completed.insert(device.key().to_string());
            }
            Err(fault) => {
                failures.push(DeviceFailure {
                    device: device.key().to_string(),
                    fault,
                });
                // Bail the stage peers out promptly; the real failure
                // still decides the outcome.
                if fault != MoveFault::Aborted {
                    abort.store(true, std::sync::atomic::Ordering::Release);
                }
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }

    for (device, _) in &moves {
        if !completed.contains(device.key()) {
            device.stop();
        }
    }
    Err(failures)
}

/// Writes the current readback of every destination binding flagged
/// `updateAfter` back into its target cell, fanning out through sync.
fn apply_update_after(machine: &Machine, store: &TargetStore, dest: &str) {
    let Ok(state) = machine.state(dest) else { return };
    let mut bound: Vec<(&String, &crate::machine::Binding)> = state.bindings.iter().collect();
    bound.sort_by_key(|(key, _)| key.clone());

    for (dev_key, binding) in bound {
        if !binding.update_after {
            continue;
        }
        let Ok(device) = machine.device(dev_key) else { continue };
        let readback = device.readback();
        if let Err(err) = store.set(machine.name(), dev_key, &binding.target, readback) {
            tracing::warn!(machine = %machine.name(), device = %dev_key, %err,
                "updateAfter write failed");
        }
    }
}
