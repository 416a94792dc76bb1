use std::collections::BTreeSet;

use apdu_codec::{Apdu, FRAME_TAG};
use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::debug;
use uuid::Uuid;

use crate::exchange::{FrameLink, LedgerDevice};
use crate::profile::{BleSpec, PeripheralIdentifier};
use crate::{BleResult, TransportError};

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const MTU_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const MTU_MIN: usize = 20;
pub(crate) const MTU_MAX: usize = 512;

/// GATT-backed [`FrameLink`]. Notifications are pumped from the btleplug
/// stream into a channel; the channel closing is the link dying.
pub(crate) struct GattLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
    write_type: WriteType,
    frames: mpsc::Receiver<Vec<u8>>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl FrameLink for GattLink {
    async fn write_frame(&mut self, frame: &[u8]) -> BleResult<()> {
        self.peripheral
            .write(&self.write_char, frame, self.write_type)
            .await
            .map_err(|err| TransportError::Write(err.to_string()))
    }

    async fn next_frame(&mut self) -> BleResult<Vec<u8>> {
        self.frames.recv().await.ok_or_else(|| {
            TransportError::LowerLevel("device disconnected while awaiting a response".to_owned())
        })
    }

    fn try_take_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.try_recv().ok()
    }

    async fn close(&mut self) -> BleResult<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            let _ = self.peripheral.unsubscribe(&self.notify_char).await;
            self.peripheral
                .disconnect()
                .await
                .map_err(|err| TransportError::LowerLevel(err.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for GattLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Runs the session bootstrap: connect, discover, subscribe, negotiate MTU.
pub(crate) async fn establish(
    peripheral: Peripheral,
    spec: &'static BleSpec,
    id: PeripheralIdentifier,
) -> BleResult<LedgerDevice> {
    if !connect_stage(peripheral.is_connected().await, "querying connection state")? {
        connect_stage(
            timeout(SETUP_TIMEOUT, peripheral.connect())
                .await
                .unwrap_or(Err(btleplug::Error::TimedOut(SETUP_TIMEOUT))),
            "requesting connection",
        )?;
    }
    connect_stage(
        timeout(SETUP_TIMEOUT, peripheral.discover_services())
            .await
            .unwrap_or(Err(btleplug::Error::TimedOut(SETUP_TIMEOUT))),
        "discovering services",
    )?;

    let characteristics = peripheral.characteristics();
    debug!(
        device = %id,
        model = %spec.model,
        characteristic_count = characteristics.len(),
        "BLE discovered characteristics"
    );

    let notify_char = find_characteristic(&characteristics, spec.service_uuid, spec.notify_uuid)
        .ok_or_else(|| missing_characteristic("notify", spec))?;
    let write_char = find_characteristic(&characteristics, spec.service_uuid, spec.write_uuid)
        .ok_or_else(|| missing_characteristic("write", spec))?;
    let write_cmd_char =
        find_characteristic(&characteristics, spec.service_uuid, spec.write_cmd_uuid)
            .ok_or_else(|| missing_characteristic("write-without-response", spec))?;

    let can_write_without_response = write_cmd_char
        .properties
        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE);
    let selected_uuid = spec.write_characteristic(can_write_without_response);
    let (selected_write, write_type) = if selected_uuid == write_cmd_char.uuid {
        (write_cmd_char, WriteType::WithoutResponse)
    } else {
        (write_char, WriteType::WithResponse)
    };
    debug!(
        device = %id,
        write_uuid = %selected_write.uuid,
        can_write_without_response,
        "BLE characteristics resolved"
    );

    peripheral
        .subscribe(&notify_char)
        .await
        .map_err(|err| TransportError::Listen(err.to_string()))?;

    let mut notifications = peripheral
        .notifications()
        .await
        .map_err(|err| TransportError::Listen(err.to_string()))?;
    let (frame_tx, frame_rx) = mpsc::channel(64);
    let notify_uuid = notify_char.uuid;
    let pump = tokio::spawn(async move {
        while let Some(event) = notifications.next().await {
            if event.uuid != notify_uuid {
                continue;
            }
            debug!(bytes = event.value.len(), "BLE notification received");
            if frame_tx.send(event.value).await.is_err() {
                break;
            }
        }
        debug!("BLE notification stream ended");
    });

    let mut link = GattLink {
        peripheral,
        write_char: selected_write,
        notify_char,
        write_type,
        frames: frame_rx,
        pump,
    };

    let mtu = match negotiate_mtu(&mut link).await {
        Ok(mtu) => mtu,
        Err(err) => {
            let _ = link.close().await;
            return Err(err);
        }
    };
    debug!(device = %id, mtu, "BLE session established");

    Ok(LedgerDevice::new(
        Box::new(link),
        id,
        spec.model,
        mtu,
        can_write_without_response,
    ))
}

/// Sends the MTU probe as a single unchunked frame and parses the answer.
/// The accepted value becomes the codec's chunk size for the whole session.
async fn negotiate_mtu(link: &mut GattLink) -> BleResult<usize> {
    for frame in Apdu::infer_mtu().frames(MTU_MIN) {
        link.write_frame(&frame)
            .await
            .map_err(|err| TransportError::Pairing(err.to_string()))?;
    }
    let frame = timeout(MTU_EXCHANGE_TIMEOUT, link.next_frame())
        .await
        .map_err(|_| TransportError::Pairing("timed out waiting for the mtu response".to_owned()))?
        .map_err(|err| TransportError::Pairing(err.to_string()))?;
    parse_mtu_response(&frame)
}

/// The device echoes the five probe bytes and appends the MTU as the sixth
/// byte. Some firmwares wrap that echo in a regular transport frame; strip
/// the frame header first when they do.
pub(crate) fn parse_mtu_response(frame: &[u8]) -> BleResult<usize> {
    let echo = if frame.first() == Some(&FRAME_TAG) {
        frame.get(5..).unwrap_or_default()
    } else {
        frame
    };
    if echo.len() < 6 {
        return Err(TransportError::Pairing("mtu response too short".to_owned()));
    }
    if echo[0] != 0x08 {
        return Err(TransportError::Pairing(format!(
            "unexpected mtu response tag 0x{:02x}",
            echo[0]
        )));
    }
    let mtu = echo[5] as usize;
    if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
        return Err(TransportError::Pairing(format!(
            "negotiated mtu {mtu} outside [{MTU_MIN}, {MTU_MAX}]"
        )));
    }
    Ok(mtu)
}

fn find_characteristic(
    characteristics: &BTreeSet<Characteristic>,
    service_uuid: Uuid,
    uuid: Uuid,
) -> Option<Characteristic> {
    characteristics
        .iter()
        .find(|c| c.service_uuid == service_uuid && c.uuid == uuid)
        .cloned()
}

fn missing_characteristic(kind: &str, spec: &BleSpec) -> TransportError {
    TransportError::Connect(format!(
        "resolving characteristics: {kind} characteristic missing for {}",
        spec.model
    ))
}

fn connect_stage<T>(result: Result<T, btleplug::Error>, stage: &str) -> BleResult<T> {
    result.map_err(|err| TransportError::Connect(format!("{stage}: {err}")))
}
