use apdu_codec::{split_status, Apdu, StatusWord};
use async_trait::async_trait;
use ble_transport::{LedgerDevice, TransportError};
use thiserror::Error;
use tracing::debug;

/// Canonical name of the device dashboard (the "no app running" state).
pub const LAUNCHER_NAME: &str = "BOLOS";

const GET_APP_AND_VERSION: [u8; 4] = [0xB0, 0x01, 0x00, 0x00];
const QUIT_APP: [u8; 4] = [0xB0, 0xA7, 0x00, 0x00];

/// The app currently running on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("device returned status {0}")]
    Status(StatusWord),
    #[error("app info format not supported")]
    FormatNotSupported,
    #[error("could not parse response data")]
    CouldNotParseResponseData,
    #[error("app name exceeds 255 bytes")]
    AppNameTooLong,
}

pub type AppResult<T> = Result<T, AppError>;

/// APDU request/response seam. [`LedgerDevice`] is the production
/// implementation; tests script responses.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, apdu: &Apdu) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
impl Exchange for LedgerDevice {
    async fn exchange(&self, apdu: &Apdu) -> Result<Vec<u8>, TransportError> {
        LedgerDevice::exchange(self, apdu).await
    }
}

/// Queries the running app and its version (`B0 01 00 00`).
pub async fn get_app_and_version<E: Exchange + ?Sized>(device: &E) -> AppResult<AppInfo> {
    let response = device
        .exchange(&Apdu::new(GET_APP_AND_VERSION.to_vec()))
        .await?;
    let (body, code) =
        split_status(&response).ok_or(AppError::Status(StatusWord::NoStatus))?;
    match StatusWord::from_code(code) {
        StatusWord::Ok => parse_app_info(body),
        other => Err(AppError::Status(other)),
    }
}

/// Makes sure `name` is the running app, quitting whatever else runs and
/// opening it from the launcher if needed.
pub async fn open_app_if_needed<E: Exchange + ?Sized>(device: &E, name: &str) -> AppResult<()> {
    if name.len() > u8::MAX as usize {
        return Err(AppError::AppNameTooLong);
    }
    loop {
        let info = get_app_and_version(device).await?;
        if info.name == name {
            return Ok(());
        }
        if info.name != LAUNCHER_NAME {
            debug!(running = %info.name, requested = name, "quitting running app");
            let response = device.exchange(&Apdu::new(QUIT_APP.to_vec())).await?;
            expect_success(&response)?;
            continue;
        }
        debug!(app = name, "opening app from the launcher");
        let response = device.exchange(&open_app_apdu(name)).await?;
        expect_success(&response)?;
        return Ok(());
    }
}

/// `E0 D8 00 00 <len> <name>`.
fn open_app_apdu(name: &str) -> Apdu {
    let bytes = name.as_bytes();
    let mut data = Vec::with_capacity(5 + bytes.len());
    data.extend_from_slice(&[0xE0, 0xD8, 0x00, 0x00, bytes.len() as u8]);
    data.extend_from_slice(bytes);
    Apdu::new(data)
}

fn expect_success(response: &[u8]) -> AppResult<()> {
    match StatusWord::of_response(response) {
        StatusWord::Ok => Ok(()),
        StatusWord::UserRejected => Err(AppError::Transport(TransportError::UserRefusedOnDevice)),
        other => Err(AppError::Status(other)),
    }
}

/// Body layout: format byte, then length-prefixed name and version.
fn parse_app_info(body: &[u8]) -> AppResult<AppInfo> {
    let rest = body.split_first().ok_or(AppError::FormatNotSupported)?.1;
    let (name, rest) = take_length_prefixed(rest)?;
    let (version, _) = take_length_prefixed(rest)?;
    Ok(AppInfo {
        name: decode_utf8(name)?,
        version: decode_utf8(version)?,
    })
}

fn take_length_prefixed(bytes: &[u8]) -> AppResult<(&[u8], &[u8])> {
    let (&len, rest) = bytes.split_first().ok_or(AppError::FormatNotSupported)?;
    if rest.len() < len as usize {
        return Err(AppError::FormatNotSupported);
    }
    Ok(rest.split_at(len as usize))
}

fn decode_utf8(bytes: &[u8]) -> AppResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| AppError::CouldNotParseResponseData)
}
