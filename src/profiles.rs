use uuid::Uuid;

use crate::{protocol::FrameKind, types::DeviceType};

/// Expand a 16-bit Bluetooth SIG assigned number into a full UUID
#[must_use]
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

/// Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = bluetooth_uuid(0x180D);
/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = bluetooth_uuid(0x2A37);
/// Battery service (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid = bluetooth_uuid(0x180F);
/// Battery Level characteristic (0x2A19)
pub const BATTERY_LEVEL_UUID: Uuid = bluetooth_uuid(0x2A19);
/// Running Speed and Cadence service (0x1814)
pub const RUNNING_SPEED_CADENCE_SERVICE_UUID: Uuid = bluetooth_uuid(0x1814);
/// Cycling Speed and Cadence service (0x1816)
pub const CADENCE_SERVICE_UUID: Uuid = bluetooth_uuid(0x1816);
/// Cycling Power service (0x1818), also advertised by running power pods
pub const CYCLING_POWER_SERVICE_UUID: Uuid = bluetooth_uuid(0x1818);

/// Vendor running-power service carrying the compact power frame
pub const RUNNING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x6A4E_2800_667B_11E3_949A_0800_200C_9A66);
/// Running-power measurement characteristic
pub const RUNNING_POWER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x6A4E_2801_667B_11E3_949A_0800_200C_9A66);
/// Vendor running-dynamics service carrying the foot pod frame
pub const RUNNING_DYNAMICS_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x6A4E_3200_667B_11E3_949A_0800_200C_9A66);
/// Running-dynamics measurement characteristic
pub const RUNNING_DYNAMICS_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x6A4E_3201_667B_11E3_949A_0800_200C_9A66);

/// Service UUID to device type, in priority order
const SERVICE_PROFILES: &[(Uuid, DeviceType)] = &[
    (RUNNING_POWER_SERVICE_UUID, DeviceType::Power),
    (CYCLING_POWER_SERVICE_UUID, DeviceType::Power),
    (RUNNING_DYNAMICS_SERVICE_UUID, DeviceType::FootPod),
    (RUNNING_SPEED_CADENCE_SERVICE_UUID, DeviceType::FootPod),
    (HEART_RATE_SERVICE_UUID, DeviceType::HeartRate),
    (CADENCE_SERVICE_UUID, DeviceType::Cadence),
];

/// Lowercase name fragments to device type, in priority order
const NAME_PATTERNS: &[(&str, DeviceType)] = &[
    ("stryd", DeviceType::Power),
    ("power", DeviceType::Power),
    ("footpod", DeviceType::FootPod),
    ("foot pod", DeviceType::FootPod),
    ("rscs", DeviceType::FootPod),
    ("hrm", DeviceType::HeartRate),
    ("heart", DeviceType::HeartRate),
    ("polar h", DeviceType::HeartRate),
    ("tickr", DeviceType::HeartRate),
    ("cadence", DeviceType::Cadence),
];

/// Characteristic UUID to decoder
const DECODERS: &[(Uuid, FrameKind)] = &[
    (HEART_RATE_MEASUREMENT_UUID, FrameKind::HeartRate),
    (RUNNING_DYNAMICS_MEASUREMENT_UUID, FrameKind::RunningDynamics),
    (RUNNING_POWER_MEASUREMENT_UUID, FrameKind::Power),
    (BATTERY_LEVEL_UUID, FrameKind::Battery),
];

/// Classification and decoder lookup table
///
/// The built-in table covers the standard SIG services plus the vendor running
/// services. Name patterns can be extended by the host application with
/// [`ProfileTable::with_name_pattern`].
///
/// Only the heart-rate, vendor running power/dynamics and battery
/// characteristics have decoders. Devices classified by the standard Running
/// Speed and Cadence, Cycling Power or Cadence services connect but produce no
/// readings unless they also expose one of those.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    services: Vec<(Uuid, DeviceType)>,
    name_patterns: Vec<(String, DeviceType)>,
    decoders: Vec<(Uuid, FrameKind)>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self {
            services: SERVICE_PROFILES.to_vec(),
            name_patterns: NAME_PATTERNS
                .iter()
                .map(|(pattern, kind)| ((*pattern).to_string(), *kind))
                .collect(),
            decoders: DECODERS.to_vec(),
        }
    }
}

impl ProfileTable {
    /// Add a name pattern checked before the built-in ones
    #[must_use]
    pub fn with_name_pattern(mut self, pattern: &str, device_type: DeviceType) -> Self {
        self.name_patterns
            .insert(0, (pattern.to_lowercase(), device_type));
        self
    }

    /// Classify a device: service match, then name pattern, then `Unknown`
    pub fn classify<'a>(
        &self,
        services: impl IntoIterator<Item = &'a Uuid>,
        name: Option<&str>,
    ) -> DeviceType {
        let advertised: Vec<&Uuid> = services.into_iter().collect();
        if let Some(device_type) = self.classify_services(advertised.iter().copied()) {
            return device_type;
        }

        name.and_then(|name| self.classify_name(name))
            .unwrap_or(DeviceType::Unknown)
    }

    /// Exact service-identifier match, in table priority order
    pub fn classify_services<'a>(
        &self,
        services: impl IntoIterator<Item = &'a Uuid>,
    ) -> Option<DeviceType> {
        let advertised: Vec<&Uuid> = services.into_iter().collect();
        self.services
            .iter()
            .find(|(uuid, _)| advertised.contains(&uuid))
            .map(|(_, device_type)| *device_type)
    }

    /// Case-insensitive substring match against the name patterns
    #[must_use]
    pub fn classify_name(&self, name: &str) -> Option<DeviceType> {
        let name = name.to_lowercase();
        self.name_patterns
            .iter()
            .find(|(pattern, _)| name.contains(pattern.as_str()))
            .map(|(_, device_type)| *device_type)
    }

    /// Decoder for a subscribed characteristic
    #[must_use]
    pub fn decoder_for(&self, characteristic: Uuid) -> Option<FrameKind> {
        self.decoders
            .iter()
            .find(|(uuid, _)| *uuid == characteristic)
            .map(|(_, kind)| *kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuid_expansion() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_LEVEL_UUID.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_service_match_wins_over_name() {
        let table = ProfileTable::default();
        let services = [HEART_RATE_SERVICE_UUID];
        assert_eq!(
            table.classify(&services, Some("Stryd Footpod")),
            DeviceType::HeartRate
        );
    }

    #[test]
    fn test_service_priority_order() {
        let table = ProfileTable::default();
        let services = [HEART_RATE_SERVICE_UUID, RUNNING_POWER_SERVICE_UUID];
        assert_eq!(table.classify(&services, None), DeviceType::Power);
    }

    #[test]
    fn test_name_fallback_and_unknown() {
        let table = ProfileTable::default();
        assert_eq!(table.classify(&[], Some("TICKR X 4F2A")), DeviceType::HeartRate);
        assert_eq!(table.classify(&[], Some("STRYD")), DeviceType::Power);
        assert_eq!(table.classify(&[], Some("Speaker")), DeviceType::Unknown);
        assert_eq!(table.classify(&[], None), DeviceType::Unknown);

        let unrelated = [bluetooth_uuid(0x1812)];
        assert_eq!(table.classify(&unrelated, None), DeviceType::Unknown);
    }

    #[test]
    fn test_custom_name_pattern_takes_precedence() {
        let table = ProfileTable::default().with_name_pattern("Zepp", DeviceType::FootPod);
        assert_eq!(table.classify(&[], Some("zepp pod")), DeviceType::FootPod);
    }

    #[test]
    fn test_decoder_lookup() {
        let table = ProfileTable::default();
        assert_eq!(
            table.decoder_for(HEART_RATE_MEASUREMENT_UUID),
            Some(FrameKind::HeartRate)
        );
        assert_eq!(
            table.decoder_for(RUNNING_DYNAMICS_MEASUREMENT_UUID),
            Some(FrameKind::RunningDynamics)
        );
        assert_eq!(table.decoder_for(bluetooth_uuid(0x2A00)), None);
    }
}
