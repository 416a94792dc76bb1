use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::exchange::LedgerDevice;
use crate::profile::{BleSpec, DiscoveredDevice, PeripheralIdentifier, TransportConfig};
use crate::session;
use crate::{BleResult, TransportError};

/// Closed set of BLE-stack availability states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Resetting,
    Unknown,
}

impl BluetoothState {
    fn from_central(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => Self::PoweredOn,
            CentralState::PoweredOff => Self::PoweredOff,
            _ => Self::Unknown,
        }
    }

    /// Whether operations may proceed. `Unknown` is optimistic: several
    /// platforms never report a state until the first scan.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::PoweredOn | Self::Unknown)
    }
}

struct KnownPeripheral {
    peripheral: Peripheral,
    spec: &'static BleSpec,
}

/// Entry point of the transport: scanning, connecting, availability.
pub struct BleManager {
    adapter: Adapter,
    config: TransportConfig,
    known: Arc<StdMutex<HashMap<Uuid, KnownPeripheral>>>,
    state_rx: watch::Receiver<BluetoothState>,
    availability_task: JoinHandle<()>,
}

impl Drop for BleManager {
    fn drop(&mut self) {
        self.availability_task.abort();
    }
}

impl BleManager {
    pub async fn new(config: TransportConfig) -> BleResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_| TransportError::BluetoothNotAvailable)?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|_| TransportError::BluetoothNotAvailable)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TransportError::BluetoothNotAvailable)?;

        let initial = adapter
            .adapter_state()
            .await
            .map(BluetoothState::from_central)
            .unwrap_or(BluetoothState::Unknown);
        let (state_tx, state_rx) = watch::channel(initial);
        let events = adapter
            .events()
            .await
            .map_err(|err| TransportError::LowerLevel(err.to_string()))?;
        let availability_task = tokio::spawn(watch_availability(events, state_tx));

        Ok(Self {
            adapter,
            config,
            known: Arc::new(StdMutex::new(HashMap::new())),
            state_rx,
            availability_task,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Current availability snapshot.
    pub fn bluetooth_state(&self) -> BluetoothState {
        *self.state_rx.borrow()
    }

    /// Availability subscription; await `changed()` on the receiver.
    pub fn subscribe_availability(&self) -> watch::Receiver<BluetoothState> {
        self.state_rx.clone()
    }

    /// Starts scanning for the configured families. The scanner yields a
    /// deduplicated snapshot list every time the set changes and ends when
    /// `duration` elapses, when stopped, or when a connect is issued.
    pub async fn scan(&self, duration: Duration) -> BleResult<DeviceScanner> {
        self.ensure_available()?;
        // Subscribe before scanning so the first advertisement is not missed.
        let events = self
            .adapter
            .events()
            .await
            .map_err(|err| TransportError::Scan(err.to_string()))?;
        let filter = ScanFilter {
            services: self.config.service_uuids(),
            ..Default::default()
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|err| TransportError::Scan(err.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(run_scan(
            self.adapter.clone(),
            self.config.clone(),
            Arc::clone(&self.known),
            events,
            tx,
            Arc::clone(&stop),
            duration,
        ));
        Ok(DeviceScanner {
            rx,
            stop,
            _task: task,
        })
    }

    /// Connects to a peripheral found by a previous or ongoing scan.
    pub async fn connect(&self, id: &PeripheralIdentifier) -> BleResult<LedgerDevice> {
        self.ensure_available()?;
        // An in-progress scan ends once a connect is issued.
        let _ = self.adapter.stop_scan().await;

        let (peripheral, spec) = self.lookup(id).await?;
        let device = session::establish(peripheral.clone(), spec, id.clone()).await?;
        self.spawn_disconnect_watcher(device.clone(), peripheral.id())
            .await?;
        Ok(device)
    }

    /// Scans for a peripheral advertising exactly `name` and connects to
    /// the first one seen.
    pub async fn connect_by_name(
        &self,
        name: &str,
        scan_duration: Duration,
    ) -> BleResult<LedgerDevice> {
        let mut scanner = self.scan(scan_duration).await?;
        while let Some(snapshot) = scanner.next().await {
            let snapshot = snapshot?;
            if let Some(found) = snapshot.iter().find(|device| device.id.name == name) {
                let id = found.id.clone();
                scanner.stop();
                return self.connect(&id).await;
            }
        }
        Err(TransportError::ScanTimedOut)
    }

    /// Scans and connects to the first discovered peripheral.
    pub async fn create(&self, scan_duration: Duration) -> BleResult<LedgerDevice> {
        let mut scanner = self.scan(scan_duration).await?;
        while let Some(snapshot) = scanner.next().await {
            let snapshot = snapshot?;
            if let Some(found) = snapshot.first() {
                let id = found.id.clone();
                scanner.stop();
                return self.connect(&id).await;
            }
        }
        Err(TransportError::ScanTimedOut)
    }

    fn ensure_available(&self) -> BleResult<()> {
        if self.bluetooth_state().is_usable() {
            Ok(())
        } else {
            Err(TransportError::BluetoothNotAvailable)
        }
    }

    async fn lookup(
        &self,
        id: &PeripheralIdentifier,
    ) -> BleResult<(Peripheral, &'static BleSpec)> {
        if let Some(found) = {
            let known = self.known.lock().expect("peripheral registry poisoned");
            known
                .get(&id.uuid)
                .map(|entry| (entry.peripheral.clone(), entry.spec))
        } {
            return Ok(found);
        }

        // Not seen by our scanner; the platform may still know it.
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|err| TransportError::Connect(format!("listing peripherals: {err}")))?;
        for peripheral in peripherals {
            if stable_uuid(&peripheral.id()) != id.uuid {
                continue;
            }
            let properties = peripheral
                .properties()
                .await
                .map_err(|err| TransportError::Connect(format!("reading properties: {err}")))?;
            let spec = properties
                .as_ref()
                .and_then(|props| {
                    props
                        .services
                        .iter()
                        .find_map(|service| self.config.matches(*service))
                })
                .ok_or_else(|| {
                    TransportError::Connect(format!("{id} does not advertise a known family"))
                })?;
            return Ok((peripheral, spec));
        }
        Err(TransportError::Connect(format!(
            "unknown peripheral {id}; scan first"
        )))
    }

    async fn spawn_disconnect_watcher(
        &self,
        device: LedgerDevice,
        platform_id: PeripheralId,
    ) -> BleResult<()> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|err| TransportError::Listen(err.to_string()))?;
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDisconnected(id) if id == platform_id => {
                        device.handle_unexpected_disconnect();
                        break;
                    }
                    _ => {}
                }
                if !device.is_connected() {
                    break;
                }
            }
        });
        Ok(())
    }
}

async fn watch_availability(
    mut events: BoxStream<'static, CentralEvent>,
    state_tx: watch::Sender<BluetoothState>,
) {
    while let Some(event) = events.next().await {
        if let CentralEvent::StateUpdate(state) = event {
            let mapped = BluetoothState::from_central(state);
            debug!(state = ?mapped, "bluetooth availability changed");
            if state_tx.send(mapped).is_err() {
                break;
            }
        }
    }
}

/// Running scan. Dropping it ends the scan.
pub struct DeviceScanner {
    rx: mpsc::Receiver<BleResult<Vec<DiscoveredDevice>>>,
    stop: Arc<Notify>,
    _task: JoinHandle<()>,
}

impl DeviceScanner {
    /// Next snapshot of the discovered set, `None` once the scan ended.
    pub async fn next(&mut self) -> Option<BleResult<Vec<DiscoveredDevice>>> {
        self.rx.recv().await
    }

    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

impl Drop for DeviceScanner {
    fn drop(&mut self) {
        // The scan task observes the notification and stops the adapter
        // scan itself.
        self.stop.notify_one();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scan(
    adapter: Adapter,
    config: TransportConfig,
    known: Arc<StdMutex<HashMap<Uuid, KnownPeripheral>>>,
    mut events: BoxStream<'static, CentralEvent>,
    tx: mpsc::Sender<BleResult<Vec<DiscoveredDevice>>>,
    stop: Arc<Notify>,
    duration: Duration,
) {
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut found: Vec<DiscoveredDevice> = Vec::new();

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = &mut deadline => {
                if found.is_empty() {
                    let _ = tx.send(Err(TransportError::ScanTimedOut)).await;
                }
                break;
            }
            event = events.next() => {
                let id = match event {
                    Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => id,
                    Some(_) => continue,
                    None => {
                        let _ = tx
                            .send(Err(TransportError::Scan("adapter event stream ended".to_owned())))
                            .await;
                        break;
                    }
                };
                if let Some(snapshot) = refresh_discovery(&adapter, &config, &known, &mut found, &id).await {
                    if tx.send(Ok(snapshot)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    if let Err(err) = adapter.stop_scan().await {
        warn!(error = %err, "failed to stop scan");
    }
}

/// Folds one advertisement into the discovered set. Returns a snapshot when
/// the set changed (new device, RSSI refresh, name refresh).
async fn refresh_discovery(
    adapter: &Adapter,
    config: &TransportConfig,
    known: &Arc<StdMutex<HashMap<Uuid, KnownPeripheral>>>,
    found: &mut Vec<DiscoveredDevice>,
    id: &PeripheralId,
) -> Option<Vec<DiscoveredDevice>> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok().flatten()?;
    let spec = properties
        .services
        .iter()
        .find_map(|service| config.matches(*service))?;

    let identifier = PeripheralIdentifier::new(stable_uuid(id), properties.local_name.clone());
    known
        .lock()
        .expect("peripheral registry poisoned")
        .insert(identifier.uuid, KnownPeripheral { peripheral, spec });

    match found.iter_mut().find(|device| device.id == identifier) {
        Some(existing) => {
            let changed =
                existing.rssi != properties.rssi || existing.id.name != identifier.name;
            if !changed {
                return None;
            }
            existing.rssi = properties.rssi;
            existing.id.name = identifier.name;
        }
        None => {
            debug!(device = %identifier, model = %spec.model, "discovered peripheral");
            found.push(DiscoveredDevice {
                id: identifier,
                model: spec.model,
                rssi: properties.rssi,
                discovered_at: Instant::now(),
            });
        }
    }
    Some(found.clone())
}

/// Stable 128-bit identity for a platform peripheral id.
fn stable_uuid(id: &PeripheralId) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, id.to_string().as_bytes())
}
