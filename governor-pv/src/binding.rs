//! PV binding.
//!
//! Translates the supervisor's object graph into the published channel
//! table, routes client writes back into commands and cells, and eagerly
//! republishes derived channels whenever a machine or a target cell
//! changes.

use crate::bus::{PvBus, PvWrite};
use crate::channel::{self, LimitEnd, WriteAddr};
use crate::value::PvValue;
use governor_core::{Command, Status, Supervisor, TargetUpdate};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// The live binding between a supervisor and its bus.
pub struct PvBinding {
    prefix: String,
    supervisor: Arc<Supervisor>,
    bus: Arc<dyn PvBus>,
}

impl PvBinding {
    /// Creates every channel, publishes the initial picture, and spawns
    /// the router and publisher tasks. Tasks exit on supervisor shutdown.
    pub fn start(
        supervisor: Arc<Supervisor>,
        bus: Arc<dyn PvBus>,
        writes: mpsc::Receiver<PvWrite>,
        prefix: impl Into<String>,
    ) -> Arc<Self> {
        let binding = Arc::new(Self {
            prefix: prefix.into(),
            supervisor,
            bus,
        });

        binding.create_channels();
        for index in 0..binding.supervisor.controllers().len() {
            binding.publish_machine(index);

            let updates = binding.supervisor.controllers()[index].machine().subscribe();
            tokio::spawn(machine_publisher(
                binding.clone(),
                index,
                updates,
                binding.supervisor.subscribe_shutdown(),
            ));
        }

        tokio::spawn(router(
            binding.clone(),
            writes,
            binding.supervisor.subscribe_shutdown(),
        ));
        tokio::spawn(target_publisher(
            binding.clone(),
            binding.supervisor.store().subscribe(),
            binding.supervisor.subscribe_shutdown(),
        ));

        tracing::info!(prefix = %binding.prefix, "PV binding started");
        binding
    }

    fn create_channels(&self) {
        let p = &self.prefix;
        let gov = channel::gov(p);
        self.bus.create(
            &format!("{}Active-Sel", gov),
            PvValue::from(self.supervisor.is_active()),
        );
        self.bus.create(
            &format!("{}Config-Sel", gov),
            PvValue::Int(self.supervisor.selected() as i64),
        );
        self.bus.create(&format!("{}Cmd:Abort-Cmd", gov), PvValue::Int(0));
        self.bus.create(&format!("{}Cmd:Kill-Cmd", gov), PvValue::Int(0));

        for controller in self.supervisor.controllers() {
            let machine = controller.machine();
            let name = machine.name();
            let scope = channel::machine(p, name);

            self.bus.create(&format!("{}Cmd:Go-Cmd", scope), PvValue::Str(String::new()));
            self.bus.create(&format!("{}Cmd:Abort-Cmd", scope), PvValue::Int(0));
            self.bus.create(
                &format!("{}Sts:Status-Sts", scope),
                PvValue::Str(machine.status().as_str().to_string()),
            );
            self.bus.create(
                &format!("{}Sts:Msg-Sts", scope),
                PvValue::Str(machine.message()),
            );
            self.bus.create(
                &format!("{}Sts:State-I", scope),
                PvValue::Str(machine.current_state()),
            );
            self.bus.create(
                &format!("{}Sts:Reach-I", scope),
                PvValue::StrList(machine.reachable_states()),
            );
            self.bus.create(&format!("{}Sts:Busy-Sts", scope), PvValue::Int(0));
            self.bus.create(
                &format!("{}Sts:States-I", scope),
                PvValue::StrList(machine.state_keys()),
            );
            self.bus.create(
                &format!("{}Sts:Devs-I", scope),
                PvValue::StrList(machine.device_keys()),
            );

            for dev_key in machine.device_keys() {
                let scope = channel::device(p, name, &dev_key);
                let positions = self.supervisor.store().positions_for(name, &dev_key);
                self.bus.create(
                    &format!("{}Sts:Tgts-I", scope),
                    PvValue::StrList(positions.iter().map(|(t, _)| t.clone()).collect()),
                );
                for (target, value) in positions {
                    self.bus
                        .create(&format!("{}Pos:{}-Pos", scope, target), PvValue::Float(value));
                }
            }

            for state_key in machine.state_keys() {
                let scope = channel::state(p, name, &state_key);
                self.bus.create(&format!("{}Sts:Reach-Sts", scope), PvValue::Int(0));
                self.bus.create(&format!("{}Sts:Active-Sts", scope), PvValue::Int(0));

                if let Ok(state) = machine.state(&state_key) {
                    let mut bound: Vec<&String> = state.bindings.keys().collect();
                    bound.sort();
                    for dev_key in bound {
                        let (low, high) =
                            machine.window(&state_key, dev_key).unwrap_or((0.0, 0.0));
                        self.bus.create(
                            &format!("{}LLim:{}-Pos", scope, dev_key),
                            PvValue::Float(low),
                        );
                        self.bus.create(
                            &format!("{}HLim:{}-Pos", scope, dev_key),
                            PvValue::Float(high),
                        );
                    }
                }
            }

            for (from, to) in machine.transition_edges() {
                let scope = channel::transition(p, name, &from, &to);
                self.bus.create(&format!("{}Sts:Active-Sts", scope), PvValue::Int(0));
                self.bus.create(&format!("{}Sts:Reach-Sts", scope), PvValue::Int(0));
            }
        }
    }

    /// Republishes every derived channel of one machine.
    fn publish_machine(&self, index: usize) {
        let controller = &self.supervisor.controllers()[index];
        let machine = controller.machine();
        let p = &self.prefix;
        let name = machine.name();
        let scope = channel::machine(p, name);

        let current = machine.current_state();
        let reachable = machine.reachable_states();

        self.bus.post(
            &format!("{}Sts:Status-Sts", scope),
            PvValue::Str(machine.status().as_str().to_string()),
        );
        self.bus.post(
            &format!("{}Sts:Msg-Sts", scope),
            PvValue::Str(machine.message()),
        );
        self.bus
            .post(&format!("{}Sts:State-I", scope), PvValue::Str(current.clone()));
        self.bus.post(
            &format!("{}Sts:Reach-I", scope),
            PvValue::StrList(reachable.clone()),
        );
        self.bus.post(
            &format!("{}Sts:Busy-Sts", scope),
            PvValue::from(machine.status() == Status::Busy),
        );

        for state_key in machine.state_keys() {
            let scope = channel::state(p, name, &state_key);
            self.bus.post(
                &format!("{}Sts:Active-Sts", scope),
                PvValue::from(state_key == current),
            );
            self.bus.post(
                &format!("{}Sts:Reach-Sts", scope),
                PvValue::from(reachable.iter().any(|s| *s == state_key)),
            );

            if let Ok(state) = machine.state(&state_key) {
                for dev_key in state.bindings.keys() {
                    if let Some((low, high)) = machine.window(&state_key, dev_key) {
                        self.bus
                            .post(&format!("{}LLim:{}-Pos", scope, dev_key), PvValue::Float(low));
                        self.bus
                            .post(&format!("{}HLim:{}-Pos", scope, dev_key), PvValue::Float(high));
                    }
                }
            }
        }

        for (from, to) in machine.transition_edges() {
            let scope = channel::transition(p, name, &from, &to);
            self.bus.post(
                &format!("{}Sts:Active-Sts", scope),
                PvValue::from(machine.transition_active(&from, &to)),
            );
            self.bus.post(
                &format!("{}Sts:Reach-Sts", scope),
                PvValue::from(machine.transition_reachable(&from, &to)),
            );
        }
    }

    /// Routes one decoded client write.
    async fn route(&self, name: String, value: PvValue) {
        let addr = match channel::parse_write(&self.prefix, &name) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(%err, "write rejected");
                return;
            }
        };
        tracing::debug!(channel = %name, %value, "write");

        match addr {
            WriteAddr::ActiveSel => {
                let Some(v) = value.as_int() else {
                    return self.bad_value(&name, "integer");
                };
                match self.supervisor.set_active(v != 0) {
                    Ok(()) => self.bus.post(&name, PvValue::Int((v != 0) as i64)),
                    Err(err) => tracing::warn!(%err, "activity change rejected"),
                }
            }
            WriteAddr::ConfigSel => {
                let Some(v) = value.as_int() else {
                    return self.bad_value(&name, "integer");
                };
                if let Err(err) = self.supervisor.select(v as usize) {
                    tracing::warn!(%err, "selection rejected");
                }
                self.bus
                    .post(&name, PvValue::Int(self.supervisor.selected() as i64));
            }
            WriteAddr::GlobalAbort => {
                self.supervisor.abort_active().await;
            }
            WriteAddr::Kill => {
                self.supervisor.kill().await;
            }
            WriteAddr::Go { machine } => {
                let Ok(controller) = self.supervisor.controller(&machine) else {
                    return self.unknown_machine(&machine);
                };
                let Some(state) = value.as_str() else {
                    return self.bad_value(&name, "state name");
                };
                controller.send(Command::Go(state.to_string())).await;
                self.bus.post(&name, value.clone());
            }
            WriteAddr::Abort { machine } => {
                let Ok(controller) = self.supervisor.controller(&machine) else {
                    return self.unknown_machine(&machine);
                };
                controller.send(Command::Abort).await;
            }
            WriteAddr::TargetPos {
                machine,
                device,
                target,
            } => {
                if !self.supervisor.is_active() {
                    tracing::warn!(%machine, "target write while inactive");
                    return;
                }
                let Some(v) = value.as_float() else {
                    return self.bad_value(&name, "number");
                };
                if let Err(err) = self.supervisor.store().set(&machine, &device, &target, v) {
                    tracing::warn!(%err, "target write rejected");
                }
            }
            WriteAddr::Window {
                machine,
                state,
                device,
                end,
            } => {
                if !self.supervisor.is_active() {
                    tracing::warn!(%machine, "window write while inactive");
                    return;
                }
                let Ok(controller) = self.supervisor.controller(&machine) else {
                    return self.unknown_machine(&machine);
                };
                let Some(v) = value.as_float() else {
                    return self.bad_value(&name, "number");
                };
                let (low, high) = match end {
                    LimitEnd::Low => (Some(v), None),
                    LimitEnd::High => (None, Some(v)),
                };
                match controller.machine().set_window(&state, &device, low, high) {
                    Ok(()) => {
                        self.bus.post(&name, PvValue::Float(v));
                        controller.machine().notify();
                    }
                    Err(err) => tracing::warn!(%err, "window write rejected"),
                }
            }
        }
    }

    fn bad_value(&self, name: &str, expected: &'static str) {
        let err = crate::error::PvError::BadValue {
            channel: name.to_string(),
            expected,
        };
        tracing::warn!(%err, "write rejected");
    }

    fn unknown_machine(&self, machine: &str) {
        tracing::warn!(%machine, "write for unknown machine");
    }
}

async fn router(
    binding: Arc<PvBinding>,
    mut writes: mpsc::Receiver<PvWrite>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            write = writes.recv() => match write {
                Some((name, value)) => binding.route(name, value).await,
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("PV router stopped");
}

async fn machine_publisher(
    binding: Arc<PvBinding>,
    index: usize,
    mut updates: broadcast::Receiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    binding.publish_machine(index);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!(index, "machine publisher stopped");
}

async fn target_publisher(
    binding: Arc<PvBinding>,
    mut updates: broadcast::Receiver<TargetUpdate>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    let scope = channel::device(&binding.prefix, &update.machine, &update.device);
                    binding.bus.post(
                        &format!("{}Pos:{}-Pos", scope, update.target),
                        PvValue::Float(update.value),
                    );
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("target publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use governor_core::{sim, MachineConfig, SyncMap};
    use std::time::Duration;

    const SAMPLE: &str = r#"
name: Human
devices:
  dc: {type: Device, name: Detector cover, pv: "SIM:DC", timeout: 5,
       positions: {In: 0.0, Out: 90.0}}
  li: {type: Motor, name: Light, pv: "XF:17-LI", tolerance: 0.05, timeout: 10,
       positions: {Down: -95.0, Up: 0.0}}
  bs: {type: Motor, name: Beam stop, pv: "XF:17-BS", tolerance: 0.01, timeout: 10,
       positions: {Down: -10.0, Up: 5.0}}
states:
  M:  {name: Maintenance}
  SE: {name: Sample Exchange,
       targets: {dc: {target: In, limits: [-1.0, 1.0]},
                 li: {target: Up, limits: [-98.0, 14.0], updateAfter: true},
                 bs: {target: Down, limits: [-1.0, 1.0]}}}
  SA: {name: Sample Alignment,
       targets: {dc: {target: Out, limits: [-1.0, 1.0]},
                 li: {target: Down, limits: [-2.0, 2.0]},
                 bs: {target: Up, limits: [-0.5, 0.5]}}}
init_state: M
transitions:
  M:
    SE: [dc, li, bs]
  SE:
    SA: [[dc, bs], li]
  SA:
    SE: [[dc, bs], li]
"#;

    struct Rig {
        supervisor: Arc<Supervisor>,
        bus: Arc<MemoryBus>,
        _binding: Arc<PvBinding>,
    }

    fn rig() -> Rig {
        let human = MachineConfig::from_yaml(SAMPLE).unwrap();
        let mut robot = human.clone();
        robot.name = "Robot".to_string();
        let configs = vec![human, robot];

        let sync = SyncMap::from([("li".to_string(), vec!["Up".to_string()])]);
        let supervisor =
            Supervisor::new(&configs, sync, |_, _, device| sim::default_io(device)).unwrap();

        let (bus, writes) = MemoryBus::new();
        let binding = PvBinding::start(supervisor.clone(), bus.clone(), writes, "");
        Rig {
            supervisor,
            bus,
            _binding: binding,
        }
    }

    async fn wait_for(bus: &MemoryBus, name: &str, expected: &PvValue) {
        for _ in 0..300 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if bus.read(name).as_ref() == Some(expected) {
                return;
            }
        }
        panic!(
            "channel {} never became {:?}, last {:?}",
            name,
            expected,
            bus.read(name)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_channel_table() {
        let rig = rig();
        assert_eq!(rig.bus.read("{Gov}Active-Sel"), Some(PvValue::Int(1)));
        assert_eq!(rig.bus.read("{Gov}Config-Sel"), Some(PvValue::Int(0)));
        assert_eq!(
            rig.bus.read("{Gov:Human}Sts:Status-Sts"),
            Some(PvValue::Str("Idle".into()))
        );
        assert_eq!(
            rig.bus.read("{Gov:Robot}Sts:Status-Sts"),
            Some(PvValue::Str("Disabled".into()))
        );
        assert_eq!(
            rig.bus.read("{Gov:Human}Sts:States-I"),
            Some(PvValue::StrList(vec![
                "M".into(),
                "SA".into(),
                "SE".into()
            ]))
        );
        assert_eq!(
            rig.bus.read("{Gov:Human-Dev:bs}Pos:Down-Pos"),
            Some(PvValue::Float(-10.0))
        );
        assert_eq!(
            rig.bus.read("{Gov:Human-St:SE}LLim:bs-Pos"),
            Some(PvValue::Float(-1.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_publishes_new_state() {
        let rig = rig();
        rig.bus
            .write("{Gov:Human}Cmd:Go-Cmd", PvValue::Str("SE".into()))
            .await;

        wait_for(&rig.bus, "{Gov:Human}Sts:State-I", &PvValue::Str("SE".into())).await;
        wait_for(
            &rig.bus,
            "{Gov:Human}Sts:Status-Sts",
            &PvValue::Str("Idle".into()),
        )
        .await;
        assert_eq!(
            rig.bus.read("{Gov:Human}Sts:Reach-I"),
            Some(PvValue::StrList(vec!["M".into(), "SA".into()]))
        );
        assert_eq!(
            rig.bus.read("{Gov:Human-St:SE}Sts:Active-Sts"),
            Some(PvValue::Int(1))
        );
        assert_eq!(
            rig.bus.read("{Gov:Human-Tr:SE-SA}Sts:Reach-Sts"),
            Some(PvValue::Int(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_published_during_transition() {
        let rig = rig();
        rig.bus
            .write("{Gov:Human}Cmd:Go-Cmd", PvValue::Str("SE".into()))
            .await;
        wait_for(
            &rig.bus,
            "{Gov:Human}Sts:Status-Sts",
            &PvValue::Str("Busy".into()),
        )
        .await;
        assert_eq!(
            rig.bus.read("{Gov:Human}Sts:Busy-Sts"),
            Some(PvValue::Int(1))
        );
        // No state is reachable while busy.
        assert_eq!(
            rig.bus.read("{Gov:Human}Sts:Reach-I"),
            Some(PvValue::StrList(vec![]))
        );
        wait_for(
            &rig.bus,
            "{Gov:Human}Sts:Status-Sts",
            &PvValue::Str("Idle".into()),
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_machine_rejects_go() {
        let rig = rig();
        rig.bus
            .write("{Gov:Robot}Cmd:Go-Cmd", PvValue::Str("SA".into()))
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(
            rig.bus.read("{Gov:Robot}Sts:Status-Sts"),
            Some(PvValue::Str("Disabled".into()))
        );
        // The current state is still published for disabled machines.
        assert_eq!(
            rig.bus.read("{Gov:Robot}Sts:State-I"),
            Some(PvValue::Str("M".into()))
        );
        assert_eq!(
            rig.supervisor
                .controller("Robot")
                .unwrap()
                .machine()
                .current_state(),
            "M"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_write_syncs_and_republishes() {
        let rig = rig();
        rig.bus
            .write("{Gov:Human-Dev:li}Pos:Up-Pos", PvValue::Float(7.0))
            .await;

        wait_for(
            &rig.bus,
            "{Gov:Human-Dev:li}Pos:Up-Pos",
            &PvValue::Float(7.0),
        )
        .await;
        // li:Up is in the sync map: the Robot cell and channel follow.
        wait_for(
            &rig.bus,
            "{Gov:Robot-Dev:li}Pos:Up-Pos",
            &PvValue::Float(7.0),
        )
        .await;
        assert_eq!(
            rig.supervisor.store().get("Robot", "li", "Up"),
            Some(7.0)
        );

        // Unsynced targets stay local.
        rig.bus
            .write("{Gov:Human-Dev:bs}Pos:Down-Pos", PvValue::Float(-12.0))
            .await;
        wait_for(
            &rig.bus,
            "{Gov:Human-Dev:bs}Pos:Down-Pos",
            &PvValue::Float(-12.0),
        )
        .await;
        assert_eq!(
            rig.bus.read("{Gov:Robot-Dev:bs}Pos:Down-Pos"),
            Some(PvValue::Float(-10.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_via_bus() {
        let rig = rig();
        rig.bus
            .write("{Gov:Human}Cmd:Go-Cmd", PvValue::Str("SE".into()))
            .await;
        wait_for(
            &rig.bus,
            "{Gov:Human}Sts:Status-Sts",
            &PvValue::Str("Busy".into()),
        )
        .await;

        rig.bus.write("{Gov}Cmd:Abort-Cmd", PvValue::Int(1)).await;
        wait_for(
            &rig.bus,
            "{Gov:Human}Sts:Status-Sts",
            &PvValue::Str("Idle".into()),
        )
        .await;
        assert_eq!(
            rig.bus.read("{Gov:Human}Sts:State-I"),
            Some(PvValue::Str("M".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_sel_switches_machine() {
        let rig = rig();
        rig.bus.write("{Gov}Config-Sel", PvValue::Int(1)).await;

        wait_for(
            &rig.bus,
            "{Gov:Robot}Sts:Status-Sts",
            &PvValue::Str("Idle".into()),
        )
        .await;
        assert_eq!(
            rig.bus.read("{Gov:Human}Sts:Status-Sts"),
            Some(PvValue::Str("Disabled".into()))
        );
        assert_eq!(rig.bus.read("{Gov}Config-Sel"), Some(PvValue::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_blocks_everything() {
        let rig = rig();
        rig.bus.write("{Gov}Active-Sel", PvValue::Int(0)).await;
        wait_for(
            &rig.bus,
            "{Gov:Human}Sts:Status-Sts",
            &PvValue::Str("Disabled".into()),
        )
        .await;

        // Target writes are refused while inactive.
        rig.bus
            .write("{Gov:Human-Dev:bs}Pos:Down-Pos", PvValue::Float(-12.0))
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            rig.supervisor.store().get("Human", "bs", "Down"),
            Some(-10.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_write() {
        let rig = rig();
        rig.bus
            .write("{Gov:Human-St:SE}LLim:bs-Pos", PvValue::Float(-2.5))
            .await;
        wait_for(
            &rig.bus,
            "{Gov:Human-St:SE}LLim:bs-Pos",
            &PvValue::Float(-2.5),
        )
        .await;

        // An inverted window is refused and the channel keeps its value.
        rig.bus
            .write("{Gov:Human-St:SE}LLim:bs-Pos", PvValue::Float(0.5))
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            rig.supervisor
                .controller("Human")
                .unwrap()
                .machine()
                .window("SE", "bs"),
            Some((-2.5, 1.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_shuts_down() {
        let rig = rig();
        let mut shutdown = rig.supervisor.subscribe_shutdown();
        rig.bus.write("{Gov}Cmd:Kill-Cmd", PvValue::Int(1)).await;
        tokio::time::timeout(Duration::from_secs(5), shutdown.recv())
            .await
            .expect("kill never signalled shutdown")
            .unwrap();
    }
}
