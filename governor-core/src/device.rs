//! Device drivers.
//!
//! Every positioner kind presents the same capability surface; dispatch is
//! by the configuration tag, and raw hardware access goes through the
//! narrow [`DeviceIo`] trait so the channel-access protocol itself stays
//! out of the engine.

use crate::config::{DeviceConfig, DeviceKind};
use crate::error::MoveFault;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Poll cadence while a motor settles.
pub const MOTOR_POLL: Duration = Duration::from_millis(100);

/// Poll cadence while a valve settles.
pub const VALVE_POLL: Duration = Duration::from_millis(250);

/// Raw hardware access for one positioner.
///
/// Implementations snapshot the last known channel values; none of these
/// calls may block.
pub trait DeviceIo: Send + Sync {
    /// All underlying channels are live.
    fn connected(&self) -> bool;

    /// Homing status from the motor controller; other kinds report true.
    fn homed(&self) -> bool {
        true
    }

    /// Current readback. Valves report their position status code.
    fn readback(&self) -> f64;

    /// In-motion flag from the controller (motor done-bit, valve status
    /// word).
    fn moving(&self) -> bool {
        false
    }

    /// Issue the raw move command.
    fn write_setpoint(&self, value: f64);

    /// Best-effort halt.
    fn stop(&self) {}

    /// Soft travel limits, if the controller reports any.
    fn soft_limits(&self) -> Option<(f64, f64)> {
        None
    }
}

/// One positioner with the uniform capability set of the engine.
pub struct Device {
    key: String,
    name: String,
    kind: DeviceKind,
    tolerance: f64,
    timeout: Duration,
    io: Arc<dyn DeviceIo>,
    /// Previous readback sample, as bits; drives the motor moving()
    /// derivation.
    last_sample: AtomicU64,
}

impl Device {
    pub fn new(key: impl Into<String>, config: &DeviceConfig, io: Arc<dyn DeviceIo>) -> Self {
        let tolerance = match config.kind {
            DeviceKind::Motor => config.tolerance,
            _ => 0.0,
        };
        let sample = io.readback();
        Self {
            key: key.into(),
            name: config.name.clone(),
            kind: config.kind,
            tolerance,
            timeout: Duration::from_secs_f64(config.timeout),
            io,
            last_sample: AtomicU64::new(sample.to_bits()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn connected(&self) -> bool {
        self.io.connected()
    }

    /// False only when a motor controller reports the axis unhomed.
    pub fn homed(&self) -> bool {
        match self.kind {
            DeviceKind::Motor => self.io.homed(),
            _ => true,
        }
    }

    pub fn readback(&self) -> f64 {
        self.io.readback()
    }

    /// Whether the device is in motion. Motors derive this from
    /// consecutive readback samples; valves from their status word.
    pub fn moving(&self) -> bool {
        match self.kind {
            DeviceKind::Motor => {
                let sample = self.io.readback();
                let previous = f64::from_bits(self.last_sample.swap(sample.to_bits(), Ordering::AcqRel));
                (sample - previous).abs() > f64::EPSILON
            }
            DeviceKind::Valve => self.io.moving(),
            DeviceKind::Dummy => false,
        }
    }

    /// Readback is at the setpoint: within tolerance for motors, equal for
    /// valves, always for dummies.
    pub fn at(&self, setpoint: f64) -> bool {
        match self.kind {
            DeviceKind::Motor => (self.readback() - setpoint).abs() <= self.tolerance,
            DeviceKind::Valve => self.readback() == setpoint,
            DeviceKind::Dummy => true,
        }
    }

    /// Readback is inside `[setpoint + low - tol, setpoint + high + tol]`.
    pub fn within(&self, setpoint: f64, low: f64, high: f64) -> bool {
        let readback = self.readback();
        readback >= setpoint + low - self.tolerance && readback <= setpoint + high + self.tolerance
    }

    /// Issues the underlying move command without waiting.
    pub fn start_move(&self, setpoint: f64) -> Result<(), MoveFault> {
        if !self.connected() {
            return Err(MoveFault::Disconnected);
        }
        if !self.homed() {
            return Err(MoveFault::NotHomed);
        }
        if let Some((low, high)) = self.io.soft_limits() {
            if setpoint < low || setpoint > high {
                tracing::warn!(device = %self.key, setpoint, low, high, "setpoint outside soft limits");
                return Err(MoveFault::MissedTarget);
            }
        }

        tracing::info!(device = %self.key, setpoint, "move issued");
        // Seed the sample history so the first moving() sample after the
        // command is meaningful.
        self.last_sample
            .store(self.io.readback().to_bits(), Ordering::Release);
        self.io.write_setpoint(setpoint);
        Ok(())
    }

    /// Best-effort halt.
    pub fn stop(&self) {
        tracing::info!(device = %self.key, "stop issued");
        self.io.stop();
    }

    /// Waits for a commanded move to finish.
    ///
    /// Motors run an idle timer that is reset whenever the readback makes
    /// progress between samples, so slow-but-progressing motion never
    /// times out; an axis that stops away from the target after moving is
    /// a missed target. Valves are bounded by a single overall timeout.
    pub async fn settle(&self, setpoint: f64, abort: &AtomicBool) -> Result<(), MoveFault> {
        match self.kind {
            DeviceKind::Dummy => Ok(()),
            DeviceKind::Valve => self.settle_valve(setpoint, abort).await,
            DeviceKind::Motor => self.settle_motor(setpoint, abort).await,
        }
    }

    async fn settle_motor(&self, setpoint: f64, abort: &AtomicBool) -> Result<(), MoveFault> {
        let mut idle_since = Instant::now();
        let mut seen_motion = false;

        loop {
            if abort.load(Ordering::Acquire) {
                return Err(MoveFault::Aborted);
            }
            if !self.connected() {
                return Err(MoveFault::Disconnected);
            }
            if !self.homed() {
                return Err(MoveFault::NotHomed);
            }

            sleep(MOTOR_POLL).await;

            if self.moving() {
                seen_motion = true;
                idle_since = Instant::now();
                continue;
            }
            if !self.io.moving() && self.at(setpoint) {
                return Ok(());
            }
            if seen_motion && !self.io.moving() {
                tracing::warn!(device = %self.key, setpoint, readback = self.readback(),
                    "motion finished away from target");
                return Err(MoveFault::MissedTarget);
            }
            if idle_since.elapsed() >= self.timeout {
                tracing::warn!(device = %self.key, "movement timed out");
                return Err(MoveFault::Timeout);
            }
        }
    }

    async fn settle_valve(&self, setpoint: f64, abort: &AtomicBool) -> Result<(), MoveFault> {
        let started = Instant::now();

        loop {
            if abort.load(Ordering::Acquire) {
                return Err(MoveFault::Aborted);
            }
            if !self.connected() {
                return Err(MoveFault::Disconnected);
            }
            if self.at(setpoint) {
                return Ok(());
            }
            if started.elapsed() >= self.timeout {
                tracing::warn!(device = %self.key, "movement timed out");
                return Err(MoveFault::Timeout);
            }

            sleep(VALVE_POLL).await;
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("tolerance", &self.tolerance)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VALVE_CLOSED_POS, VALVE_OPEN_POS};
    use crate::sim::{SimDummy, SimMotor, SimValve};
    use std::collections::HashMap;

    fn motor_config(tolerance: f64, timeout: f64) -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Motor,
            name: "Beam stop".to_string(),
            pv: "XF:17-BS".to_string(),
            tolerance,
            timeout,
            positions: HashMap::from([("Down".to_string(), -10.0), ("Up".to_string(), 5.0)]),
        }
    }

    fn valve_config(timeout: f64) -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Valve,
            name: "Gate valve".to_string(),
            pv: "XF:17-GV".to_string(),
            tolerance: 0.0,
            timeout,
            positions: HashMap::new(),
        }
    }

    fn dummy_config() -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Dummy,
            name: "Detector cover".to_string(),
            pv: String::new(),
            tolerance: 0.0,
            timeout: 5.0,
            positions: HashMap::from([("In".to_string(), 0.0), ("Out".to_string(), 90.0)]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_settles_at_target() {
        let io = Arc::new(SimMotor::new(0.0, 10.0));
        let device = Device::new("bs", &motor_config(0.01, 10.0), io.clone());
        let abort = AtomicBool::new(false);

        device.start_move(5.0).unwrap();
        device.settle(5.0, &abort).await.unwrap();
        assert!(device.at(5.0));
        assert!(!device.moving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_timeout_when_stuck() {
        let io = Arc::new(SimMotor::new(0.0, 10.0));
        io.set_stuck(true);
        let device = Device::new("bs", &motor_config(0.01, 1.0), io);
        let abort = AtomicBool::new(false);

        let started = Instant::now();
        device.start_move(5.0).unwrap();
        let err = device.settle(5.0, &abort).await.unwrap_err();
        assert_eq!(err, MoveFault::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_missed_target() {
        let io = Arc::new(SimMotor::new(0.0, 10.0));
        io.set_stall_at(Some(2.0));
        let device = Device::new("bs", &motor_config(0.01, 5.0), io);
        let abort = AtomicBool::new(false);

        device.start_move(5.0).unwrap();
        let err = device.settle(5.0, &abort).await.unwrap_err();
        assert_eq!(err, MoveFault::MissedTarget);
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_abort() {
        let io = Arc::new(SimMotor::new(0.0, 0.5));
        let device = Device::new("bs", &motor_config(0.01, 10.0), io);
        let abort = Arc::new(AtomicBool::new(false));

        device.start_move(5.0).unwrap();
        let flag = abort.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::Release);
        });
        let err = device.settle(5.0, &abort).await.unwrap_err();
        assert_eq!(err, MoveFault::Aborted);
    }

    #[test]
    fn test_motor_soft_limits() {
        let io = Arc::new(SimMotor::new(0.0, 10.0));
        io.set_soft_limits(Some((-20.0, 20.0)));
        let device = Device::new("bs", &motor_config(0.01, 10.0), io);

        assert_eq!(device.start_move(50.0), Err(MoveFault::MissedTarget));
        device.start_move(5.0).unwrap();
    }

    #[test]
    fn test_motor_disconnect_and_homed() {
        let io = Arc::new(SimMotor::new(0.0, 10.0));
        let device = Device::new("bs", &motor_config(0.01, 10.0), io.clone());

        io.set_connected(false);
        assert!(!device.connected());
        assert_eq!(device.start_move(5.0), Err(MoveFault::Disconnected));

        io.set_connected(true);
        io.set_homed(false);
        assert!(!device.homed());
        assert_eq!(device.start_move(5.0), Err(MoveFault::NotHomed));
    }

    #[test]
    fn test_within_window() {
        let io = Arc::new(SimMotor::new(0.0, 10.0));
        io.set_position(0.3);
        let device = Device::new("bs", &motor_config(0.05, 10.0), io);

        assert!(device.within(0.0, -0.5, 0.5));
        assert!(!device.within(0.0, -0.1, 0.1));
        // Tolerance widens the window.
        assert!(device.within(0.0, -0.3, 0.26));
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_settles() {
        let io = Arc::new(SimValve::new(Duration::from_millis(500)));
        let device = Device::new("gv", &valve_config(5.0), io);
        let abort = AtomicBool::new(false);

        device.start_move(VALVE_OPEN_POS).unwrap();
        assert!(device.moving());
        device.settle(VALVE_OPEN_POS, &abort).await.unwrap();
        assert!(device.at(VALVE_OPEN_POS));
        assert!(!device.at(VALVE_CLOSED_POS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_timeout() {
        let io = Arc::new(SimValve::new(Duration::from_secs(60)));
        let device = Device::new("gv", &valve_config(1.0), io);
        let abort = AtomicBool::new(false);

        device.start_move(VALVE_OPEN_POS).unwrap();
        let err = device.settle(VALVE_OPEN_POS, &abort).await.unwrap_err();
        assert_eq!(err, MoveFault::Timeout);
    }

    #[tokio::test]
    async fn test_dummy_is_instant() {
        let io = Arc::new(SimDummy::new(0.0));
        let device = Device::new("dc", &dummy_config(), io);
        let abort = AtomicBool::new(false);

        device.start_move(90.0).unwrap();
        device.settle(90.0, &abort).await.unwrap();
        assert_eq!(device.readback(), 90.0);
        assert!(device.at(12345.0)); // dummies are always at target
    }
}
