use crate::{
    error::{Result, SensorError},
    types::{SensorReading, SensorType},
};
use bytes::Buf;
use std::time::SystemTime;

/// Stride length assumed when a running-dynamics frame does not carry one
pub const DEFAULT_STRIDE_LENGTH_CM: f64 = 80.0;

/// Heart-rate flags bit selecting the 16-bit value format
const HR_FLAG_UINT16: u8 = 0x01;

/// Decoder selected for a subscribed characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Heart Rate Measurement
    HeartRate,
    /// Foot pod running dynamics
    RunningDynamics,
    /// Running power
    Power,
    /// Battery level
    Battery,
}

impl FrameKind {
    /// Human readable decoder name, used in errors and logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::HeartRate => "heart rate",
            Self::RunningDynamics => "running dynamics",
            Self::Power => "power",
            Self::Battery => "battery",
        }
    }

    /// Decode a raw buffer with this decoder
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::MalformedFrame`] if the buffer is too short for the layout.
    pub fn decode(self, data: &[u8]) -> Result<DecodedFrame> {
        match self {
            Self::HeartRate => decode_heart_rate(data).map(DecodedFrame::HeartRate),
            Self::RunningDynamics => {
                decode_running_dynamics(data).map(DecodedFrame::RunningDynamics)
            }
            Self::Power => decode_power(data).map(DecodedFrame::Power),
            Self::Battery => decode_battery(data).map(DecodedFrame::Battery),
        }
    }
}

/// Heart Rate Measurement frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateFrame {
    /// Beats per minute
    pub bpm: u16,
}

/// Foot pod running-dynamics frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningDynamicsFrame {
    /// Steps per minute
    pub cadence_spm: u16,
    /// Cumulative steps since the pod powered on
    pub total_steps: Option<u32>,
    /// Stride length in centimeters
    pub stride_length_cm: f64,
    /// Vertical oscillation in centimeters
    pub vertical_oscillation_cm: Option<f64>,
    /// Ground contact time in milliseconds
    pub ground_contact_ms: Option<u16>,
}

/// Running power frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerFrame {
    /// Watts
    pub power_watts: u16,
    /// Steps per minute
    pub cadence_spm: Option<u16>,
    /// Power spent on vertical and lateral motion, in watts
    pub form_power_watts: Option<u16>,
}

/// Result of decoding one buffer
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// Heart rate
    HeartRate(HeartRateFrame),
    /// Running dynamics
    RunningDynamics(RunningDynamicsFrame),
    /// Power
    Power(PowerFrame),
    /// Battery percentage
    Battery(u8),
}

impl DecodedFrame {
    /// Split the frame into readings stamped with device and receipt time
    ///
    /// Stride length is emitted before the step count so that distance
    /// integration uses the stride carried by the same frame.
    #[must_use]
    pub fn into_readings(self, device_id: &str, received_at: SystemTime) -> Vec<SensorReading> {
        let reading = |sensor, value| SensorReading::new(sensor, value, device_id, received_at);

        match self {
            Self::HeartRate(frame) => vec![reading(SensorType::HeartRate, f64::from(frame.bpm))],
            Self::RunningDynamics(frame) => {
                let mut readings = vec![
                    reading(SensorType::Cadence, f64::from(frame.cadence_spm)),
                    reading(SensorType::StrideLength, frame.stride_length_cm),
                ];
                if let Some(steps) = frame.total_steps {
                    readings.push(reading(SensorType::StepCount, f64::from(steps)));
                }
                if let Some(oscillation) = frame.vertical_oscillation_cm {
                    readings.push(reading(SensorType::VerticalOscillation, oscillation));
                }
                if let Some(contact) = frame.ground_contact_ms {
                    readings.push(reading(SensorType::GroundContactTime, f64::from(contact)));
                }
                readings
            }
            Self::Power(frame) => {
                let mut readings = vec![reading(SensorType::Power, f64::from(frame.power_watts))];
                if let Some(cadence) = frame.cadence_spm {
                    readings.push(reading(SensorType::Cadence, f64::from(cadence)));
                }
                if let Some(form_power) = frame.form_power_watts {
                    readings.push(reading(SensorType::FormPower, f64::from(form_power)));
                }
                readings
            }
            Self::Battery(level) => vec![reading(SensorType::Battery, f64::from(level))],
        }
    }
}

const fn malformed(frame: FrameKind, expected: usize, actual: usize) -> SensorError {
    SensorError::MalformedFrame {
        frame: frame.name(),
        expected,
        actual,
    }
}

/// Parse a Heart Rate Measurement
///
/// - Byte 0: flags, bit 0 selects the value format
/// - Byte 1: heart rate (u8) when bit 0 is clear
/// - Bytes 1-2: heart rate (u16 little-endian) when bit 0 is set
///
/// # Errors
///
/// Returns [`SensorError::MalformedFrame`] for buffers shorter than the selected format.
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateFrame> {
    if data.len() < 2 {
        return Err(malformed(FrameKind::HeartRate, 2, data.len()));
    }

    let mut buf = data;
    let flags = buf.get_u8();

    let bpm = if flags & HR_FLAG_UINT16 == 0 {
        u16::from(buf.get_u8())
    } else {
        if buf.remaining() < 2 {
            return Err(malformed(FrameKind::HeartRate, 3, data.len()));
        }
        buf.get_u16_le()
    };

    Ok(HeartRateFrame { bpm })
}

/// Parse a foot pod running-dynamics frame
///
/// - Bytes 0-1: cadence, steps per minute (u16 little-endian)
/// - Bytes 2-5: cumulative step count (u32 little-endian)
/// - Bytes 6-7: stride length in tenths of a centimeter (u16 little-endian)
/// - Bytes 8-9: vertical oscillation in millimeters (u16 little-endian)
/// - Bytes 10-11: ground contact time in milliseconds (u16 little-endian)
///
/// Trailing fields are optional; the stride length falls back to
/// [`DEFAULT_STRIDE_LENGTH_CM`] and is rounded to whole centimeters.
///
/// # Errors
///
/// Returns [`SensorError::MalformedFrame`] for buffers shorter than 4 bytes.
pub fn decode_running_dynamics(data: &[u8]) -> Result<RunningDynamicsFrame> {
    if data.len() < 4 {
        return Err(malformed(FrameKind::RunningDynamics, 4, data.len()));
    }

    let mut buf = data;
    let cadence_spm = buf.get_u16_le();

    let total_steps = if buf.remaining() >= 4 {
        Some(buf.get_u32_le())
    } else {
        None
    };

    let stride_length_cm = if total_steps.is_some() && buf.remaining() >= 2 {
        (f64::from(buf.get_u16_le()) / 10.0).round()
    } else {
        DEFAULT_STRIDE_LENGTH_CM
    };

    let vertical_oscillation_cm = if data.len() >= 10 {
        Some(f64::from(buf.get_u16_le()) / 10.0)
    } else {
        None
    };

    let ground_contact_ms = if data.len() >= 12 {
        Some(buf.get_u16_le())
    } else {
        None
    };

    Ok(RunningDynamicsFrame {
        cadence_spm,
        total_steps,
        stride_length_cm,
        vertical_oscillation_cm,
        ground_contact_ms,
    })
}

/// Parse a running power frame
///
/// - Bytes 0-1: power in watts (u16 little-endian)
/// - Bytes 2-3: cadence, steps per minute (u16 little-endian), optional
/// - Bytes 4-5: form power in watts (u16 little-endian), optional
///
/// # Errors
///
/// Returns [`SensorError::MalformedFrame`] for buffers shorter than 2 bytes.
pub fn decode_power(data: &[u8]) -> Result<PowerFrame> {
    if data.len() < 2 {
        return Err(malformed(FrameKind::Power, 2, data.len()));
    }

    let mut buf = data;
    let power_watts = buf.get_u16_le();
    let cadence_spm = (buf.remaining() >= 2).then(|| buf.get_u16_le());
    let form_power_watts = (buf.remaining() >= 2).then(|| buf.get_u16_le());

    Ok(PowerFrame {
        power_watts,
        cadence_spm,
        form_power_watts,
    })
}

/// Parse a Battery Level value (percentage, not range checked)
///
/// # Errors
///
/// Returns [`SensorError::MalformedFrame`] for an empty buffer.
pub fn decode_battery(data: &[u8]) -> Result<u8> {
    data.first()
        .copied()
        .ok_or_else(|| malformed(FrameKind::Battery, 1, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heart_rate_uint8() {
        let frame = decode_heart_rate(&[0x00, 0x4B]).unwrap();
        assert_eq!(frame.bpm, 75);
    }

    #[test]
    fn test_heart_rate_uint16_little_endian() {
        let frame = decode_heart_rate(&[0x01, 0x4B, 0x00]).unwrap();
        assert_eq!(frame.bpm, 75);

        let frame = decode_heart_rate(&[0x01, 0x2C, 0x01]).unwrap();
        assert_eq!(frame.bpm, 300);
    }

    #[test]
    fn test_heart_rate_ignores_trailing_fields() {
        // Sensor contact bits plus an RR interval after the value
        let frame = decode_heart_rate(&[0x16, 0x8C, 0x00, 0x04]).unwrap();
        assert_eq!(frame.bpm, 140);
    }

    #[test]
    fn test_heart_rate_truncated() {
        assert!(matches!(
            decode_heart_rate(&[0x00]),
            Err(SensorError::MalformedFrame { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            decode_heart_rate(&[0x01, 0x4B]),
            Err(SensorError::MalformedFrame { expected: 3, actual: 2, .. })
        ));
        assert!(decode_heart_rate(&[]).is_err());
    }

    #[test]
    fn test_running_dynamics_full_layout() {
        let frame =
            decode_running_dynamics(&[0xB4, 0x00, 0x10, 0x00, 0x00, 0x00, 0x50, 0x03]).unwrap();
        assert_eq!(frame.cadence_spm, 180);
        assert_eq!(frame.total_steps, Some(16));
        assert!((frame.stride_length_cm - 85.0).abs() < f64::EPSILON);
        assert_eq!(frame.vertical_oscillation_cm, None);
        assert_eq!(frame.ground_contact_ms, None);
    }

    #[test]
    fn test_running_dynamics_extended_fields() {
        let frame = decode_running_dynamics(&[
            0xAA, 0x00, // cadence 170
            0xE8, 0x03, 0x00, 0x00, // 1000 steps
            0x20, 0x03, // 800 -> 80 cm
            0x55, 0x00, // 85 mm -> 8.5 cm
            0xF5, 0x00, // 245 ms
        ])
        .unwrap();
        assert_eq!(frame.cadence_spm, 170);
        assert_eq!(frame.total_steps, Some(1000));
        assert!((frame.stride_length_cm - 80.0).abs() < f64::EPSILON);
        assert_eq!(frame.vertical_oscillation_cm, Some(8.5));
        assert_eq!(frame.ground_contact_ms, Some(245));
    }

    #[test]
    fn test_running_dynamics_default_stride() {
        let frame = decode_running_dynamics(&[0xB4, 0x00, 0x10, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(frame.total_steps, Some(16));
        assert!((frame.stride_length_cm - DEFAULT_STRIDE_LENGTH_CM).abs() < f64::EPSILON);

        let frame = decode_running_dynamics(&[0xB4, 0x00, 0x10, 0x00]).unwrap();
        assert_eq!(frame.cadence_spm, 180);
        assert_eq!(frame.total_steps, None);
        assert!((frame.stride_length_cm - DEFAULT_STRIDE_LENGTH_CM).abs() < f64::EPSILON);
    }

    #[test]
    fn test_running_dynamics_truncated() {
        let result = decode_running_dynamics(&[0xB4]);
        assert_eq!(
            result,
            Err(SensorError::MalformedFrame {
                frame: "running dynamics",
                expected: 4,
                actual: 1,
            })
        );
    }

    #[test]
    fn test_power_layouts() {
        let frame = decode_power(&[0x2C, 0x01]).unwrap();
        assert_eq!(frame.power_watts, 300);
        assert_eq!(frame.cadence_spm, None);

        let frame = decode_power(&[0x2C, 0x01, 0xB4, 0x00]).unwrap();
        assert_eq!(frame.cadence_spm, Some(180));
        assert_eq!(frame.form_power_watts, None);

        let frame = decode_power(&[0x2C, 0x01, 0xB4, 0x00, 0x50, 0x00]).unwrap();
        assert_eq!(frame.form_power_watts, Some(80));

        assert!(decode_power(&[0x2C]).is_err());
    }

    #[test]
    fn test_battery_is_not_range_checked() {
        assert_eq!(decode_battery(&[87]).unwrap(), 87);
        assert_eq!(decode_battery(&[250]).unwrap(), 250);
        assert!(decode_battery(&[]).is_err());
    }

    #[test]
    fn test_readings_order_and_stamping() {
        let at = SystemTime::UNIX_EPOCH;
        let readings = FrameKind::RunningDynamics
            .decode(&[0xB4, 0x00, 0x10, 0x00, 0x00, 0x00, 0x50, 0x03])
            .unwrap()
            .into_readings("pod-1", at);

        let kinds: Vec<SensorType> = readings.iter().map(|r| r.sensor).collect();
        assert_eq!(
            kinds,
            vec![SensorType::Cadence, SensorType::StrideLength, SensorType::StepCount]
        );
        assert!(readings.iter().all(|r| r.device_id == "pod-1" && r.received_at == at));
        assert!((readings[2].value - 16.0).abs() < f64::EPSILON);
    }
}
