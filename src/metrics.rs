use serde::{Deserialize, Serialize};
use std::{collections::HashMap, f64::consts::PI, time::SystemTime};
use tracing::debug;

use crate::{
    protocol::DEFAULT_STRIDE_LENGTH_CM,
    types::{RunnerProfile, SensorReading, SensorType},
};

/// Standard gravity in m/s²
pub const STANDARD_GRAVITY: f64 = 9.806_65;

/// Pace in seconds per kilometer from cadence (steps/min) and stride length (m)
///
/// Returns 0 when either input is not positive.
#[must_use]
pub fn pace_seconds_per_km(cadence_spm: f64, stride_length_m: f64) -> f64 {
    if cadence_spm <= 0.0 || stride_length_m <= 0.0 {
        return 0.0;
    }
    1000.0 / ((cadence_spm / 60.0) * stride_length_m)
}

/// Leg-spring stiffness estimate
///
/// Flight time is approximated from the vertical oscillation as
/// `2·sqrt(oscillation / g) − contact`. Returns 0 for physically invalid
/// samples (non-positive flight or contact time).
#[must_use]
pub fn leg_spring_stiffness(
    vertical_oscillation_cm: f64,
    ground_contact_ms: f64,
    weight_kg: f64,
) -> f64 {
    let oscillation_m = vertical_oscillation_cm / 100.0;
    let contact_s = ground_contact_ms / 1000.0;
    if oscillation_m < 0.0 || contact_s <= 0.0 {
        return 0.0;
    }

    let flight_s = 2.0 * (oscillation_m / STANDARD_GRAVITY).sqrt() - contact_s;
    if flight_s <= 0.0 {
        return 0.0;
    }

    let stiffness = weight_kg * PI / (contact_s * (flight_s + contact_s));
    if stiffness.is_finite() && stiffness > 0.0 {
        stiffness
    } else {
        0.0
    }
}

/// Training stress added by holding `power_watts` for `elapsed_seconds`
#[must_use]
pub fn training_stress_increment(power_watts: f64, ftp_watts: f64, elapsed_seconds: f64) -> f64 {
    if ftp_watts <= 0.0 || power_watts <= 0.0 || elapsed_seconds <= 0.0 {
        return 0.0;
    }
    let intensity_factor = power_watts / ftp_watts;
    intensity_factor * intensity_factor * (elapsed_seconds / 3600.0) * 100.0
}

/// Running efficiency as total power over form power
#[must_use]
pub fn efficiency(power_watts: f64, form_power_watts: f64) -> Option<f64> {
    (form_power_watts > 0.0).then(|| power_watts / form_power_watts)
}

/// Cumulative totals of one collection session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAccumulator {
    /// Steps counted since the session started
    pub steps: u64,
    /// Meters covered since the session started
    pub distance_m: f64,
    /// Training stress accumulated since the session started
    pub training_stress_score: f64,
    /// Time of the last reading applied
    pub last_update: SystemTime,
}

impl SessionAccumulator {
    fn new(now: SystemTime) -> Self {
        Self {
            steps: 0,
            distance_m: 0.0,
            training_stress_score: 0.0,
            last_update: now,
        }
    }
}

/// Latest inputs and totals for one device
#[derive(Debug, Clone)]
struct DeviceSession {
    accumulator: SessionAccumulator,
    started_at: SystemTime,
    // First step count of the session, then the latest one
    last_total_steps: Option<u32>,
    stride_length_cm: f64,
    cadence_spm: Option<f64>,
    power_watts: Option<f64>,
    last_power_at: Option<SystemTime>,
    form_power_watts: Option<f64>,
    vertical_oscillation_cm: Option<f64>,
    ground_contact_ms: Option<f64>,
}

impl DeviceSession {
    fn new(now: SystemTime) -> Self {
        Self {
            accumulator: SessionAccumulator::new(now),
            started_at: now,
            last_total_steps: None,
            stride_length_cm: DEFAULT_STRIDE_LENGTH_CM,
            cadence_spm: None,
            power_watts: None,
            last_power_at: None,
            form_power_watts: None,
            vertical_oscillation_cm: None,
            ground_contact_ms: None,
        }
    }

    fn apply(&mut self, reading: &SensorReading, runner: &RunnerProfile) {
        match reading.sensor {
            SensorType::StepCount => self.apply_steps(reading.value),
            SensorType::StrideLength => self.stride_length_cm = reading.value,
            SensorType::Cadence => self.cadence_spm = Some(reading.value),
            SensorType::Power => self.apply_power(reading.value, reading.received_at, runner),
            SensorType::FormPower => self.form_power_watts = Some(reading.value),
            SensorType::VerticalOscillation => self.vertical_oscillation_cm = Some(reading.value),
            SensorType::GroundContactTime => self.ground_contact_ms = Some(reading.value),
            SensorType::HeartRate | SensorType::Battery => {}
        }
        self.accumulator.last_update = reading.received_at;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn apply_steps(&mut self, value: f64) {
        let total = value.max(0.0) as u32;
        let Some(last) = self.last_total_steps.replace(total) else {
            debug!("Step counter baseline {}", total);
            return;
        };
        let delta = if total >= last {
            total - last
        } else {
            debug!("Step counter rolled over ({} -> {})", last, total);
            total
        };

        self.accumulator.steps += u64::from(delta);
        self.accumulator.distance_m += f64::from(delta) * self.stride_length_cm / 100.0;
    }

    fn apply_power(&mut self, watts: f64, at: SystemTime, runner: &RunnerProfile) {
        if let Some(previous) = self.last_power_at {
            let elapsed = at.duration_since(previous).unwrap_or_default();
            self.accumulator.training_stress_score +=
                training_stress_increment(watts, runner.ftp_watts, elapsed.as_secs_f64());
        }
        self.power_watts = Some(watts);
        self.last_power_at = Some(at);
    }

    fn snapshot(&self, device_id: &str, runner: &RunnerProfile) -> SessionMetrics {
        let pace = self
            .cadence_spm
            .map_or(0.0, |cadence| {
                pace_seconds_per_km(cadence, self.stride_length_cm / 100.0)
            });
        let stiffness = match (self.vertical_oscillation_cm, self.ground_contact_ms) {
            (Some(oscillation), Some(contact)) => {
                leg_spring_stiffness(oscillation, contact, runner.weight_kg)
            }
            _ => 0.0,
        };
        let efficiency = match (self.power_watts, self.form_power_watts) {
            (Some(power), Some(form_power)) => efficiency(power, form_power),
            _ => None,
        };

        SessionMetrics {
            device_id: device_id.to_string(),
            steps: self.accumulator.steps,
            distance_m: self.accumulator.distance_m,
            training_stress_score: self.accumulator.training_stress_score,
            pace_seconds_per_km: pace,
            leg_spring_stiffness: stiffness,
            efficiency,
            started_at: self.started_at,
            last_update: self.accumulator.last_update,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Device the session belongs to
    pub device_id: String,
    /// Steps counted
    pub steps: u64,
    /// Meters covered
    pub distance_m: f64,
    /// Accumulated training stress score
    pub training_stress_score: f64,
    /// Current pace in seconds per kilometer, 0 when unknown
    pub pace_seconds_per_km: f64,
    /// Current leg-spring stiffness, 0 when unknown or invalid
    pub leg_spring_stiffness: f64,
    /// Power over form power, when form power is known
    pub efficiency: Option<f64>,
    /// When collection started
    pub started_at: SystemTime,
    /// Time of the last reading applied
    pub last_update: SystemTime,
}

/// Per-device session accumulators
#[derive(Debug, Clone, Default)]
pub struct MetricsEngine {
    runner: RunnerProfile,
    sessions: HashMap<String, DeviceSession>,
}

impl MetricsEngine {
    /// Create an engine for a runner
    #[must_use]
    pub fn new(runner: RunnerProfile) -> Self {
        Self {
            runner,
            sessions: HashMap::new(),
        }
    }

    /// Runner profile in use
    #[must_use]
    pub const fn runner(&self) -> &RunnerProfile {
        &self.runner
    }

    /// Start collecting for a device, replacing any previous session
    pub fn start_session(&mut self, device_id: &str, now: SystemTime) {
        debug!("Starting metrics session for {}", device_id);
        self.sessions
            .insert(device_id.to_string(), DeviceSession::new(now));
    }

    /// Stop collecting for a device, returning the final totals
    pub fn end_session(&mut self, device_id: &str) -> Option<SessionMetrics> {
        let session = self.sessions.remove(device_id)?;
        debug!("Ended metrics session for {}", device_id);
        Some(session.snapshot(device_id, &self.runner))
    }

    /// Check whether a device is collecting
    #[must_use]
    pub fn has_session(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    /// Apply a reading, returning updated metrics when its device is collecting
    pub fn ingest(&mut self, reading: &SensorReading) -> Option<SessionMetrics> {
        let session = self.sessions.get_mut(&reading.device_id)?;
        session.apply(reading, &self.runner);
        Some(session.snapshot(&reading.device_id, &self.runner))
    }

    /// Current metrics of a device
    #[must_use]
    pub fn metrics(&self, device_id: &str) -> Option<SessionMetrics> {
        self.sessions
            .get(device_id)
            .map(|session| session.snapshot(device_id, &self.runner))
    }

    /// Current accumulator of a device
    #[must_use]
    pub fn accumulator(&self, device_id: &str) -> Option<&SessionAccumulator> {
        self.sessions.get(device_id).map(|s| &s.accumulator)
    }
}
