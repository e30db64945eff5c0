//! Simulated device IO.
//!
//! Constant-velocity motors, valves with a fixed travel time, and instant
//! dummies, with switches for injecting disconnects, unhomed axes, stalls,
//! and stuck motion. Used by the engine tests and by the binary when no
//! real channel-access backend is wired in.

use crate::config::{DeviceConfig, DeviceKind, VALVE_CLOSED_POS};
use crate::device::DeviceIo;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Valve status code reported while the valve travels.
pub const VALVE_MOVING_POS: f64 = 2.0;

struct MotorState {
    origin: f64,
    target: f64,
    started: Instant,
    in_motion: bool,
}

/// A motor that travels at constant velocity toward its setpoint.
pub struct SimMotor {
    state: Mutex<MotorState>,
    velocity: f64,
    connected: AtomicBool,
    homed: AtomicBool,
    /// Reports in-motion forever with a frozen readback.
    stuck: AtomicBool,
    /// Stops the axis at this position instead of the setpoint.
    stall_at: Mutex<Option<f64>>,
    soft_limits: Mutex<Option<(f64, f64)>>,
    last_command: Mutex<Option<Instant>>,
}

impl SimMotor {
    pub fn new(initial: f64, velocity: f64) -> Self {
        Self {
            state: Mutex::new(MotorState {
                origin: initial,
                target: initial,
                started: Instant::now(),
                in_motion: false,
            }),
            velocity,
            connected: AtomicBool::new(true),
            homed: AtomicBool::new(true),
            stuck: AtomicBool::new(false),
            stall_at: Mutex::new(None),
            soft_limits: Mutex::new(None),
            last_command: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn set_homed(&self, homed: bool) {
        self.homed.store(homed, Ordering::Release);
    }

    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::Release);
    }

    pub fn set_stall_at(&self, position: Option<f64>) {
        *self.stall_at.lock() = position;
    }

    pub fn set_soft_limits(&self, limits: Option<(f64, f64)>) {
        *self.soft_limits.lock() = limits;
    }

    /// Jumps the axis to a resting position.
    pub fn set_position(&self, position: f64) {
        let mut state = self.state.lock();
        state.origin = position;
        state.target = position;
        state.in_motion = false;
    }

    /// When the last move command was issued.
    pub fn last_command_at(&self) -> Option<Instant> {
        *self.last_command.lock()
    }

    /// Advances the kinematics and returns the current position.
    fn position(&self) -> f64 {
        let mut state = self.state.lock();
        if !state.in_motion {
            return state.origin;
        }
        if self.stuck.load(Ordering::Acquire) {
            return state.origin;
        }

        let mut target = state.target;
        if let Some(stall) = *self.stall_at.lock() {
            let (low, high) = if state.origin <= state.target {
                (state.origin, state.target)
            } else {
                (state.target, state.origin)
            };
            if stall >= low && stall <= high {
                target = stall;
            }
        }

        let span = (target - state.origin).abs();
        let traveled = self.velocity * state.started.elapsed().as_secs_f64();
        if traveled >= span {
            state.origin = target;
            state.target = target;
            state.in_motion = false;
            return target;
        }
        state.origin + traveled * (target - state.origin).signum()
    }
}

impl DeviceIo for SimMotor {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn homed(&self) -> bool {
        self.homed.load(Ordering::Acquire)
    }

    fn readback(&self) -> f64 {
        self.position()
    }

    fn moving(&self) -> bool {
        let _ = self.position();
        self.state.lock().in_motion
    }

    fn write_setpoint(&self, value: f64) {
        let position = self.position();
        let mut state = self.state.lock();
        state.origin = position;
        state.target = value;
        state.started = Instant::now();
        state.in_motion = true;
        *self.last_command.lock() = Some(Instant::now());
    }

    fn stop(&self) {
        let position = self.position();
        let mut state = self.state.lock();
        state.origin = position;
        state.target = position;
        state.in_motion = false;
    }

    fn soft_limits(&self) -> Option<(f64, f64)> {
        *self.soft_limits.lock()
    }
}

struct ValveState {
    position: f64,
    target: f64,
    started: Instant,
    traveling: bool,
}

/// A valve that reaches its commanded position after a fixed travel time.
pub struct SimValve {
    state: Mutex<ValveState>,
    travel: Duration,
    connected: AtomicBool,
}

impl SimValve {
    pub fn new(travel: Duration) -> Self {
        Self {
            state: Mutex::new(ValveState {
                position: VALVE_CLOSED_POS,
                target: VALVE_CLOSED_POS,
                started: Instant::now(),
                traveling: false,
            }),
            travel,
            connected: AtomicBool::new(true),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn advance(&self) {
        let mut state = self.state.lock();
        if state.traveling && state.started.elapsed() >= self.travel {
            state.position = state.target;
            state.traveling = false;
        }
    }
}

impl DeviceIo for SimValve {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn readback(&self) -> f64 {
        self.advance();
        let state = self.state.lock();
        if state.traveling {
            VALVE_MOVING_POS
        } else {
            state.position
        }
    }

    fn moving(&self) -> bool {
        self.advance();
        self.state.lock().traveling
    }

    fn write_setpoint(&self, value: f64) {
        let mut state = self.state.lock();
        if state.position == value && !state.traveling {
            return;
        }
        state.target = value;
        state.started = Instant::now();
        state.traveling = true;
    }
}

/// A dummy whose readback jumps to the setpoint instantly.
pub struct SimDummy {
    value: Mutex<f64>,
}

impl SimDummy {
    pub fn new(initial: f64) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }
}

impl DeviceIo for SimDummy {
    fn connected(&self) -> bool {
        true
    }

    fn readback(&self) -> f64 {
        *self.value.lock()
    }

    fn write_setpoint(&self, value: f64) {
        *self.value.lock() = value;
    }
}

/// Default simulated backend for a device declaration.
pub fn default_io(config: &DeviceConfig) -> Arc<dyn DeviceIo> {
    match config.kind {
        DeviceKind::Motor => Arc::new(SimMotor::new(0.0, 10.0)),
        DeviceKind::Valve => Arc::new(SimValve::new(Duration::from_millis(500))),
        DeviceKind::Dummy => Arc::new(SimDummy::new(0.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_motor_ramp() {
        let motor = SimMotor::new(0.0, 10.0);
        motor.write_setpoint(5.0);
        assert!(motor.moving());

        sleep(Duration::from_millis(250)).await;
        let mid = motor.readback();
        assert!(mid > 2.0 && mid < 3.0, "mid-ramp readback {}", mid);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(motor.readback(), 5.0);
        assert!(!motor.moving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_stop_freezes() {
        let motor = SimMotor::new(0.0, 10.0);
        motor.write_setpoint(10.0);
        sleep(Duration::from_millis(200)).await;
        motor.stop();
        let held = motor.readback();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(motor.readback(), held);
        assert!(!motor.moving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_travel() {
        let valve = SimValve::new(Duration::from_millis(500));
        assert_eq!(valve.readback(), VALVE_CLOSED_POS);

        valve.write_setpoint(1.0);
        assert_eq!(valve.readback(), VALVE_MOVING_POS);
        assert!(valve.moving());

        sleep(Duration::from_millis(600)).await;
        assert_eq!(valve.readback(), 1.0);
        assert!(!valve.moving());
    }
}
