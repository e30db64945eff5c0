//! Machine configuration schema and validation.
//!
//! Machines are described in YAML:
//!
//! ```yaml
//! name: Human
//! devices:
//!   bs: {type: Motor, name: Beam stop, pv: "XF:17-BS", tolerance: 0.01,
//!        timeout: 10, positions: {Down: -10.0, Up: 5.0}}
//!   gv: {type: Valve, name: Gate valve, pv: "XF:17-GV", timeout: 5}
//! states:
//!   M:  {name: Maintenance}
//!   SE: {name: Sample Exchange,
//!        targets: {bs: {target: Down, limits: [-1.0, 1.0]}}}
//! init_state: M
//! transitions:
//!   M:
//!     SE: [gv, bs]
//! ```
//!
//! Validation collects every problem it finds so a `--check_config` run
//! reports the whole file at once.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// The implicit valve target names and their position codes.
pub const VALVE_OPEN: &str = "Open";
pub const VALVE_CLOSED: &str = "Closed";
pub const VALVE_OPEN_POS: f64 = 1.0;
pub const VALVE_CLOSED_POS: f64 = 0.0;

/// Device kinds. `Device` in YAML is the dummy kind: moves complete
/// immediately and no hardware is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Motor,
    Valve,
    #[serde(rename = "Device")]
    Dummy,
}

/// One device declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub kind: DeviceKind,

    /// Human-readable name.
    pub name: String,

    /// PV address (prefix or full record name) of the underlying hardware.
    #[serde(default)]
    pub pv: String,

    /// Readback tolerance; meaningful for motors only.
    #[serde(default)]
    pub tolerance: f64,

    /// Move timeout in seconds.
    pub timeout: f64,

    /// Named positions. Forbidden on valves, which carry the implicit
    /// pair {Open: 1, Closed: 0}.
    #[serde(default)]
    pub positions: HashMap<String, f64>,
}

impl DeviceConfig {
    /// The device's named positions, with the implicit valve pair filled in.
    pub fn effective_positions(&self) -> HashMap<String, f64> {
        match self.kind {
            DeviceKind::Valve => HashMap::from([
                (VALVE_OPEN.to_string(), VALVE_OPEN_POS),
                (VALVE_CLOSED.to_string(), VALVE_CLOSED_POS),
            ]),
            _ => self.positions.clone(),
        }
    }
}

/// A state's binding for one device: which target to hold, inside which
/// additive window around the target's setpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub target: String,

    /// `[low, high]` offsets with `low <= 0 <= high`.
    pub limits: (f64, f64),

    /// After a clean transition into the state, write the device's
    /// readback back into the named target's setpoint.
    #[serde(default, rename = "updateAfter")]
    pub update_after: bool,
}

/// One state declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Human-readable name.
    pub name: String,

    /// Per-device bindings. The initial state carries none.
    #[serde(default)]
    pub targets: HashMap<String, BindingConfig>,
}

/// One step of a transition sequence: the devices moved in parallel.
/// Deserializes from either a bare device key or a list of keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Stage(pub Vec<String>);

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};
        use std::fmt;

        struct StageVisitor;

        impl<'de> Visitor<'de> for StageVisitor {
            type Value = Stage;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a device key or list of device keys")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Stage(vec![v.to_string()]))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut keys = Vec::new();
                while let Some(key) = seq.next_element::<String>()? {
                    keys.push(key);
                }
                Ok(Stage(keys))
            }
        }

        deserializer.deserialize_any(StageVisitor)
    }
}

/// A whole machine configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    pub devices: HashMap<String, DeviceConfig>,
    pub states: HashMap<String, StateConfig>,
    pub init_state: String,
    #[serde(default)]
    pub transitions: HashMap<String, HashMap<String, Vec<Stage>>>,
}

impl MachineConfig {
    /// Parses a configuration from YAML text. Does not validate.
    pub fn from_yaml(text: &str) -> Result<Self, CoreError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Loads a configuration file. Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Checks every cross-reference and constraint, collecting all
    /// problems before failing.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut errors = Vec::new();

        self.check_devices(&mut errors);
        self.check_init_state(&mut errors);
        self.check_states(&mut errors);
        self.check_transitions(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ConfigInvalid { errors })
        }
    }

    fn check_devices(&self, errors: &mut Vec<String>) {
        for (key, device) in &self.devices {
            if device.timeout <= 0.0 {
                errors.push(format!("device '{}': timeout must be positive", key));
            }
            match device.kind {
                DeviceKind::Motor => {
                    if device.pv.is_empty() {
                        errors.push(format!("device '{}': motors require a pv", key));
                    }
                    if device.positions.is_empty() {
                        errors.push(format!("device '{}': motors require positions", key));
                    }
                    if device.tolerance < 0.0 {
                        errors.push(format!("device '{}': negative tolerance", key));
                    }
                }
                DeviceKind::Valve => {
                    if device.pv.is_empty() {
                        errors.push(format!("device '{}': valves require a pv", key));
                    }
                    if !device.positions.is_empty() {
                        errors.push(format!(
                            "device '{}': valves carry implicit positions Open/Closed",
                            key
                        ));
                    }
                }
                DeviceKind::Dummy => {}
            }
        }
    }

    fn check_init_state(&self, errors: &mut Vec<String>) {
        match self.states.get(&self.init_state) {
            None => errors.push(format!("invalid init state: '{}'", self.init_state)),
            Some(state) => {
                if !state.targets.is_empty() {
                    errors.push(format!(
                        "init state '{}' must not bind devices",
                        self.init_state
                    ));
                }
            }
        }
    }

    fn check_states(&self, errors: &mut Vec<String>) {
        for (state_key, state) in &self.states {
            for (dev_key, binding) in &state.targets {
                let Some(device) = self.devices.get(dev_key) else {
                    errors.push(format!(
                        "state '{}' mentions unknown device '{}'",
                        state_key, dev_key
                    ));
                    continue;
                };

                if !device.effective_positions().contains_key(&binding.target) {
                    errors.push(format!(
                        "state '{}' device '{}' invalid target: {}",
                        state_key, dev_key, binding.target
                    ));
                }

                let (low, high) = binding.limits;
                if !(low <= 0.0 && 0.0 <= high) {
                    errors.push(format!(
                        "state '{}' device '{}' limits [{}, {}] must satisfy low <= 0 <= high",
                        state_key, dev_key, low, high
                    ));
                }
            }
        }
    }

    fn check_transitions(&self, errors: &mut Vec<String>) {
        for (origin, destinations) in &self.transitions {
            if !self.states.contains_key(origin) {
                errors.push(format!("invalid transition origin '{}'", origin));
            }

            for (destination, stages) in destinations {
                if !self.states.contains_key(destination) {
                    errors.push(format!("invalid transition destination '{}'", destination));
                    continue;
                }
                if origin == destination {
                    errors.push(format!("transition from '{}' to itself", origin));
                }
                if destination == &self.init_state {
                    errors.push(format!(
                        "transition {}->{} targets the init state; the fault fallback is implicit",
                        origin, destination
                    ));
                }

                let mut seen = HashSet::new();
                for stage in stages {
                    if stage.0.is_empty() {
                        errors.push(format!("transition {}->{} has an empty stage", origin, destination));
                    }
                    for dev_key in &stage.0 {
                        if !self.devices.contains_key(dev_key) {
                            errors.push(format!(
                                "transition {}->{} contains invalid device '{}'",
                                origin, destination, dev_key
                            ));
                            continue;
                        }
                        if !seen.insert(dev_key.clone()) {
                            errors.push(format!(
                                "transition {}->{} moves device '{}' more than once",
                                origin, destination, dev_key
                            ));
                        }
                        let bound = self
                            .states
                            .get(destination)
                            .map(|s| s.targets.contains_key(dev_key))
                            .unwrap_or(false);
                        if !bound {
                            errors.push(format!(
                                "transition {}->{} moves device '{}' that is not part of the destination",
                                origin, destination, dev_key
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// Targets kept in sync across all loaded machines: `device -> [target, ...]`.
pub type SyncMap = HashMap<String, Vec<String>>;

/// Loads a sync file. Does not validate.
pub fn load_sync_map(path: impl AsRef<Path>) -> Result<SyncMap, CoreError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Checks that every sync entry exists on every loaded machine.
pub fn validate_sync(sync: &SyncMap, configs: &[MachineConfig]) -> Result<(), CoreError> {
    let mut errors = Vec::new();

    for (dev_key, targets) in sync {
        for config in configs {
            let Some(device) = config.devices.get(dev_key) else {
                errors.push(format!(
                    "sync device '{}' not present in configuration '{}'",
                    dev_key, config.name
                ));
                continue;
            };
            let positions = device.effective_positions();
            for target in targets {
                if !positions.contains_key(target) {
                    errors.push(format!(
                        "sync target '{}:{}' not present in configuration '{}'",
                        dev_key, target, config.name
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CoreError::ConfigInvalid { errors })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// The sample two-operator configuration shared across the crate's
    /// tests.
    pub(crate) const SAMPLE: &str = r#"
name: Human
devices:
  dc: {type: Device, name: Detector cover, pv: "SIM:DC", timeout: 5,
       positions: {In: 0.0, Out: 90.0}}
  li: {type: Motor, name: Light, pv: "XF:17-LI", tolerance: 0.05, timeout: 10,
       positions: {Down: -95.0, Up: 0.0}}
  bs: {type: Motor, name: Beam stop, pv: "XF:17-BS", tolerance: 0.01, timeout: 10,
       positions: {Down: -10.0, Up: 5.0}}
  gv: {type: Valve, name: Gate valve, pv: "XF:17-GV", timeout: 5}
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

    #[test]
    fn test_parse_sample() {
        let config = MachineConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.name, "Human");
        assert_eq!(config.devices.len(), 4);
        assert_eq!(config.init_state, "M");
        config.validate().unwrap();
    }

    #[test]
    fn test_stage_forms() {
        let config = MachineConfig::from_yaml(SAMPLE).unwrap();
        let stages = &config.transitions["M"]["SE"];
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0], Stage(vec!["dc".to_string()]));

        let stages = &config.transitions["SE"]["SA"];
        assert_eq!(stages[0], Stage(vec!["dc".to_string(), "bs".to_string()]));
        assert_eq!(stages[1], Stage(vec!["li".to_string()]));
    }

    #[test]
    fn test_valve_implicit_positions() {
        let config = MachineConfig::from_yaml(SAMPLE).unwrap();
        let positions = config.devices["gv"].effective_positions();
        assert_eq!(positions[VALVE_OPEN], VALVE_OPEN_POS);
        assert_eq!(positions[VALVE_CLOSED], VALVE_CLOSED_POS);
    }

    #[test]
    fn test_invalid_init_state() {
        let mut config = MachineConfig::from_yaml(SAMPLE).unwrap();
        config.init_state = "XX".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid init state"));
    }

    #[test]
    fn test_init_state_must_be_bare() {
        let mut config = MachineConfig::from_yaml(SAMPLE).unwrap();
        let binding = config.states["SE"].targets["bs"].clone();
        config
            .states
            .get_mut("M")
            .unwrap()
            .targets
            .insert("bs".to_string(), binding);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not bind devices"));
    }

    #[test]
    fn test_unknown_target() {
        let mut config = MachineConfig::from_yaml(SAMPLE).unwrap();
        config
            .states
            .get_mut("SE")
            .unwrap()
            .targets
            .get_mut("bs")
            .unwrap()
            .target = "Sideways".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid target: Sideways"));
    }

    #[test]
    fn test_window_must_straddle_zero() {
        let mut config = MachineConfig::from_yaml(SAMPLE).unwrap();
        config
            .states
            .get_mut("SE")
            .unwrap()
            .targets
            .get_mut("bs")
            .unwrap()
            .limits = (0.5, 1.0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("low <= 0 <= high"));
    }

    #[test]
    fn test_transition_into_init_rejected() {
        let mut config = MachineConfig::from_yaml(SAMPLE).unwrap();
        config
            .transitions
            .get_mut("SE")
            .unwrap()
            .insert("M".to_string(), vec![]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fault fallback is implicit"));
    }

    #[test]
    fn test_duplicate_device_across_stages() {
        let mut config = MachineConfig::from_yaml(SAMPLE).unwrap();
        config
            .transitions
            .get_mut("M")
            .unwrap()
            .get_mut("SE")
            .unwrap()
            .push(Stage(vec!["dc".to_string()]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_staged_device_must_be_bound() {
        let mut config = MachineConfig::from_yaml(SAMPLE).unwrap();
        config
            .transitions
            .get_mut("M")
            .unwrap()
            .get_mut("SE")
            .unwrap()
            .push(Stage(vec!["gv".to_string()]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not part of the destination"));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut config = MachineConfig::from_yaml(SAMPLE).unwrap();
        config.init_state = "XX".to_string();
        config
            .transitions
            .get_mut("M")
            .unwrap()
            .insert("YY".to_string(), vec![]);
        match config.validate() {
            Err(CoreError::ConfigInvalid { errors }) => assert!(errors.len() >= 2),
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = MachineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "Human");
    }

    #[test]
    fn test_sync_validation() {
        let config = MachineConfig::from_yaml(SAMPLE).unwrap();
        let sync: SyncMap = HashMap::from([("li".to_string(), vec!["Up".to_string()])]);
        validate_sync(&sync, std::slice::from_ref(&config)).unwrap();

        let bad: SyncMap = HashMap::from([("zz".to_string(), vec!["Up".to_string()])]);
        let err = validate_sync(&bad, std::slice::from_ref(&config)).unwrap_err();
        assert!(err.to_string().contains("sync device 'zz'"));

        let bad: SyncMap = HashMap::from([("li".to_string(), vec!["Sideways".to_string()])]);
        let err = validate_sync(&bad, std::slice::from_ref(&config)).unwrap_err();
        assert!(err.to_string().contains("li:Sideways"));
    }
}
