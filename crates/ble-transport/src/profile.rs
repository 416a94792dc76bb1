use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use uuid::{uuid, Uuid};

/// Shown for peripherals whose advertisement carries no local name.
pub const PLACEHOLDER_NAME: &str = "unknown";

/// The Ledger device families this transport can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceModel {
    NanoX,
    Stax,
    Flex,
    Apex,
}

impl DeviceModel {
    pub const ALL: [DeviceModel; 4] = [
        DeviceModel::NanoX,
        DeviceModel::Stax,
        DeviceModel::Flex,
        DeviceModel::Apex,
    ];

    pub fn product_name(&self) -> &'static str {
        match self {
            DeviceModel::NanoX => "Nano X",
            DeviceModel::Stax => "Stax",
            DeviceModel::Flex => "Flex",
            DeviceModel::Apex => "Apex",
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.product_name())
    }
}

/// GATT layout of one device family. All four families share the UUID
/// template `13d63400-2c97-{family}-{role}-4c6564676572`; only the family
/// field differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleSpec {
    pub model: DeviceModel,
    pub service_uuid: Uuid,
    pub notify_uuid: Uuid,
    /// Write-with-response characteristic.
    pub write_uuid: Uuid,
    /// Write-without-response characteristic.
    pub write_cmd_uuid: Uuid,
}

pub const BLE_SPECS: &[BleSpec] = &[
    BleSpec {
        model: DeviceModel::NanoX,
        service_uuid: uuid!("13d63400-2c97-0004-0000-4c6564676572"),
        notify_uuid: uuid!("13d63400-2c97-0004-0001-4c6564676572"),
        write_uuid: uuid!("13d63400-2c97-0004-0002-4c6564676572"),
        write_cmd_uuid: uuid!("13d63400-2c97-0004-0003-4c6564676572"),
    },
    BleSpec {
        model: DeviceModel::Stax,
        service_uuid: uuid!("13d63400-2c97-6004-0000-4c6564676572"),
        notify_uuid: uuid!("13d63400-2c97-6004-0001-4c6564676572"),
        write_uuid: uuid!("13d63400-2c97-6004-0002-4c6564676572"),
        write_cmd_uuid: uuid!("13d63400-2c97-6004-0003-4c6564676572"),
    },
    BleSpec {
        model: DeviceModel::Flex,
        service_uuid: uuid!("13d63400-2c97-3004-0000-4c6564676572"),
        notify_uuid: uuid!("13d63400-2c97-3004-0001-4c6564676572"),
        write_uuid: uuid!("13d63400-2c97-3004-0002-4c6564676572"),
        write_cmd_uuid: uuid!("13d63400-2c97-3004-0003-4c6564676572"),
    },
    BleSpec {
        model: DeviceModel::Apex,
        service_uuid: uuid!("13d63400-2c97-4004-0000-4c6564676572"),
        notify_uuid: uuid!("13d63400-2c97-4004-0001-4c6564676572"),
        write_uuid: uuid!("13d63400-2c97-4004-0002-4c6564676572"),
        write_cmd_uuid: uuid!("13d63400-2c97-4004-0003-4c6564676572"),
    },
];

impl BleSpec {
    /// Matches a service UUID observed in an advertisement to its family.
    pub fn for_service(service: Uuid) -> Option<&'static BleSpec> {
        BLE_SPECS.iter().find(|spec| spec.service_uuid == service)
    }

    pub fn for_model(model: DeviceModel) -> &'static BleSpec {
        BLE_SPECS
            .iter()
            .find(|spec| spec.model == model)
            .expect("every model has a spec entry")
    }

    /// The characteristic outbound frames go to. Write-without-response is
    /// preferred whenever the peripheral supports it.
    pub fn write_characteristic(&self, can_write_without_response: bool) -> Uuid {
        if can_write_without_response {
            self.write_cmd_uuid
        } else {
            self.write_uuid
        }
    }
}

/// Which families the scanner accepts. Defaults to all of them.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    models: Vec<DeviceModel>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            models: DeviceModel::ALL.to_vec(),
        }
    }
}

impl TransportConfig {
    /// Restricts scanning to `models`. An empty selection falls back to the
    /// default; the accepted set is never empty.
    pub fn new(models: impl IntoIterator<Item = DeviceModel>) -> Self {
        let mut selected: Vec<DeviceModel> = Vec::new();
        for model in models {
            if !selected.contains(&model) {
                selected.push(model);
            }
        }
        if selected.is_empty() {
            return Self::default();
        }
        Self { models: selected }
    }

    pub fn models(&self) -> &[DeviceModel] {
        &self.models
    }

    /// Advertisement filter: the union of the selected service UUIDs.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.models
            .iter()
            .map(|model| BleSpec::for_model(*model).service_uuid)
            .collect()
    }

    pub fn matches(&self, service: Uuid) -> Option<&'static BleSpec> {
        BleSpec::for_service(service).filter(|spec| self.models.contains(&spec.model))
    }
}

/// Stable identity of a peripheral. Equality and hashing use the UUID only;
/// the name is display metadata that may change between advertisements.
#[derive(Debug, Clone, Eq)]
pub struct PeripheralIdentifier {
    pub uuid: Uuid,
    pub name: String,
}

impl PeripheralIdentifier {
    pub fn new(uuid: Uuid, name: Option<String>) -> Self {
        Self {
            uuid,
            name: name.unwrap_or_else(|| PLACEHOLDER_NAME.to_owned()),
        }
    }
}

impl PartialEq for PeripheralIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Hash for PeripheralIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl fmt::Display for PeripheralIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// One entry of the running scan result list.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: PeripheralIdentifier,
    pub model: DeviceModel,
    pub rssi: Option<i16>,
    pub discovered_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    #[test]
    fn every_family_resolves_by_service_uuid() {
        for model in DeviceModel::ALL {
            let spec = BleSpec::for_model(model);
            assert_eq!(BleSpec::for_service(spec.service_uuid), Some(spec));
        }
        assert!(BleSpec::for_service(uuid!("13d63400-2c97-9999-0000-4c6564676572")).is_none());
    }

    #[test]
    fn write_characteristic_follows_capability() {
        let spec = BleSpec::for_model(DeviceModel::Stax);
        assert_eq!(spec.write_characteristic(true), spec.write_cmd_uuid);
        assert_eq!(spec.write_characteristic(false), spec.write_uuid);
    }

    #[test]
    fn config_defaults_to_all_families() {
        assert_eq!(TransportConfig::default().models().len(), 4);
        assert_eq!(TransportConfig::new([]).models().len(), 4);
        let nano_only = TransportConfig::new([DeviceModel::NanoX]);
        assert_eq!(nano_only.service_uuids().len(), 1);
        assert!(nano_only
            .matches(BleSpec::for_model(DeviceModel::Stax).service_uuid)
            .is_none());
    }

    fn hash_of(id: &PeripheralIdentifier) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn identifier_identity_ignores_name() {
        let uuid = uuid!("f47ac10b-58cc-4372-a567-0e02b2c3d479");
        let a = PeripheralIdentifier::new(uuid, Some("Nano X A1B2".into()));
        let b = PeripheralIdentifier::new(uuid, None);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(b.name, PLACEHOLDER_NAME);
    }
}
