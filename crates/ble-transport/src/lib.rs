//! BLE transport for Ledger-family hardware wallets: scanning, session
//! establishment, MTU negotiation and the single-in-flight APDU exchange
//! engine.

pub mod error;
pub mod exchange;
pub mod manager;
pub mod profile;
mod session;

pub use error::TransportError;
pub use exchange::LedgerDevice;
pub use manager::{BleManager, BluetoothState, DeviceScanner};
pub use profile::{
    BleSpec, DeviceModel, DiscoveredDevice, PeripheralIdentifier, TransportConfig, BLE_SPECS,
    PLACEHOLDER_NAME,
};

pub type BleResult<T> = Result<T, TransportError>;
