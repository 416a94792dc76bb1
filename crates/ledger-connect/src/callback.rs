//! Callback forms of the public operations.
//!
//! The awaitable forms are primary; each wrapper spawns the awaitable on
//! the tokio runtime and routes its terminal value into the callback, so
//! both surfaces share one state machine.

use std::sync::Arc;
use std::time::Duration;

use apdu_codec::Apdu;
use ble_transport::{BleManager, BleResult, LedgerDevice};

use crate::app::{self, AppInfo, AppResult, Exchange};

pub fn create_with_callback(
    manager: Arc<BleManager>,
    scan_duration: Duration,
    on_result: impl FnOnce(BleResult<LedgerDevice>) + Send + 'static,
) {
    tokio::spawn(async move { on_result(manager.create(scan_duration).await) });
}

pub fn connect_by_name_with_callback(
    manager: Arc<BleManager>,
    name: String,
    scan_duration: Duration,
    on_result: impl FnOnce(BleResult<LedgerDevice>) + Send + 'static,
) {
    tokio::spawn(async move { on_result(manager.connect_by_name(&name, scan_duration).await) });
}

pub fn exchange_with_callback(
    device: LedgerDevice,
    apdu: Apdu,
    on_result: impl FnOnce(BleResult<Vec<u8>>) + Send + 'static,
) {
    tokio::spawn(async move { on_result(device.exchange(&apdu).await) });
}

pub fn send_with_callback(
    device: LedgerDevice,
    apdu: Apdu,
    on_result: impl FnOnce(BleResult<()>) + Send + 'static,
) {
    tokio::spawn(async move { on_result(device.send(&apdu).await) });
}

pub fn disconnect_with_callback(
    device: LedgerDevice,
    on_result: impl FnOnce(BleResult<()>) + Send + 'static,
) {
    tokio::spawn(async move { on_result(device.disconnect().await) });
}

pub fn get_app_and_version_with_callback<E: Exchange + 'static>(
    device: Arc<E>,
    on_result: impl FnOnce(AppResult<AppInfo>) + Send + 'static,
) {
    tokio::spawn(async move { on_result(app::get_app_and_version(device.as_ref()).await) });
}

pub fn open_app_if_needed_with_callback<E: Exchange + 'static>(
    device: Arc<E>,
    name: String,
    on_result: impl FnOnce(AppResult<()>) + Send + 'static,
) {
    tokio::spawn(async move { on_result(app::open_app_if_needed(device.as_ref(), &name).await) });
}
