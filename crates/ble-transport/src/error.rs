use thiserror::Error;

/// Transport-level failure taxonomy. Stage-specific variants carry a
/// description pinpointing what failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("another exchange is already pending on the device")]
    PendingActionOnDevice,
    #[error("user refused the action on the device")]
    UserRefusedOnDevice,
    #[error("scan finished without discovering a device")]
    ScanTimedOut,
    #[error("bluetooth stack is not available")]
    BluetoothNotAvailable,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("no usable device session: {0}")]
    CurrentConnected(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("listen failed: {0}")]
    Listen(String),
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("pairing failed: {0}")]
    Pairing(String),
    #[error("lower level failure: {0}")]
    LowerLevel(String),
}

impl TransportError {
    /// Stable identifier for matching across process or language
    /// boundaries. The `BluetoothNotAvaliable` spelling is kept for wire
    /// compatibility with existing consumers.
    pub fn id(&self) -> &'static str {
        match self {
            Self::PendingActionOnDevice => "TransportRaceCondition",
            Self::UserRefusedOnDevice => "UserRefusedOnDevice",
            Self::ScanTimedOut => "ListenTimeout",
            Self::BluetoothNotAvailable => "BluetoothNotAvaliable",
            Self::Connect(_) => "ConnectionError",
            Self::CurrentConnected(_) => "CurrentConnectedError",
            Self::Write(_) => "WriteError",
            Self::Read(_) => "ReadError",
            Self::Listen(_) => "ListenError",
            Self::Scan(_) => "ScanError",
            Self::Pairing(_) => "PairError",
            Self::LowerLevel(_) => "LowerLevelError",
        }
    }
}
