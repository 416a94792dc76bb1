use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use apdu_codec::{Apdu, FrameReassembler};
use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::profile::{DeviceModel, PeripheralIdentifier};
use crate::{BleResult, TransportError};

/// Frame-level seam between the exchange engine and the BLE stack.
///
/// The production implementation is GATT-backed; tests drive the engine
/// over in-memory channels.
#[async_trait]
pub(crate) trait FrameLink: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> BleResult<()>;
    /// Resolves with the next notify frame, `LowerLevel` once the link dies.
    async fn next_frame(&mut self) -> BleResult<Vec<u8>>;
    /// A frame that already arrived, if any. Never blocks.
    fn try_take_frame(&mut self) -> Option<Vec<u8>>;
    async fn close(&mut self) -> BleResult<()>;
}

type DisconnectHook = Box<dyn FnOnce(PeripheralIdentifier) + Send>;

struct DeviceShared {
    id: PeripheralIdentifier,
    model: DeviceModel,
    mtu: usize,
    can_write_without_response: bool,
    /// Single-slot busy flag: holding this is being the in-flight exchange.
    io: AsyncMutex<Box<dyn FrameLink>>,
    connected: AtomicBool,
    disconnect_requested: AtomicBool,
    hooks: StdMutex<Vec<DisconnectHook>>,
}

/// Handle to a connected peripheral. Cloning shares the session.
#[derive(Clone)]
pub struct LedgerDevice {
    inner: Arc<DeviceShared>,
}

impl LedgerDevice {
    pub(crate) fn new(
        link: Box<dyn FrameLink>,
        id: PeripheralIdentifier,
        model: DeviceModel,
        mtu: usize,
        can_write_without_response: bool,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceShared {
                id,
                model,
                mtu,
                can_write_without_response,
                io: AsyncMutex::new(link),
                connected: AtomicBool::new(true),
                disconnect_requested: AtomicBool::new(false),
                hooks: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &PeripheralIdentifier {
        &self.inner.id
    }

    pub fn model(&self) -> DeviceModel {
        self.inner.model
    }

    /// MTU negotiated when the session was established. Frames of every
    /// exchange on this session are cut against this value.
    pub fn mtu(&self) -> usize {
        self.inner.mtu
    }

    pub fn can_write_without_response(&self) -> bool {
        self.inner.can_write_without_response
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Sends one APDU and reassembles the device's response, returned
    /// including its trailing two-byte status word.
    ///
    /// A single exchange may be in flight per session; a concurrent call
    /// fails with [`TransportError::PendingActionOnDevice`] without
    /// perturbing the pending one. Dropping the returned future releases
    /// the slot and abandons the response.
    pub async fn exchange(&self, apdu: &Apdu) -> BleResult<Vec<u8>> {
        let mut io = self.acquire()?;
        self.write_frames(&mut **io, apdu).await?;

        let mut reassembler = FrameReassembler::new();
        loop {
            let frame = io.next_frame().await?;
            debug!(bytes = frame.len(), "BLE notify frame received");
            let completed = reassembler
                .push(&frame)
                .map_err(|err| TransportError::Read(err.to_string()))?;
            if let Some(payload) = completed {
                if payload.len() < 2 {
                    return Err(TransportError::Read(
                        "response too short to carry a status word".to_owned(),
                    ));
                }
                return Ok(payload);
            }
        }
    }

    /// Writes one APDU without awaiting a response.
    pub async fn send(&self, apdu: &Apdu) -> BleResult<()> {
        let mut io = self.acquire()?;
        self.write_frames(&mut **io, apdu).await
    }

    /// Tears the session down. If an exchange is in flight the request is
    /// recorded and teardown happens once it resolves, success or error.
    pub async fn disconnect(&self) -> BleResult<()> {
        self.inner.disconnect_requested.store(true, Ordering::Release);
        let mut io = self.inner.io.lock().await;
        // Callbacks are for peripheral-initiated teardown only.
        self.inner.hooks.lock().expect("hook registry poisoned").clear();
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            io.close().await?;
        }
        Ok(())
    }

    /// Registers a callback for unexpected, peripheral-initiated
    /// disconnection. Each callback runs at most once; registrations are
    /// cleared after firing.
    pub fn on_disconnect(&self, hook: impl FnOnce(PeripheralIdentifier) + Send + 'static) {
        self.inner
            .hooks
            .lock()
            .expect("hook registry poisoned")
            .push(Box::new(hook));
    }

    /// Marks the session dead after the peripheral dropped the connection.
    pub(crate) fn handle_unexpected_disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!(device = %self.inner.id, "peripheral disconnected unexpectedly");
        let hooks: Vec<DisconnectHook> = std::mem::take(
            &mut *self.inner.hooks.lock().expect("hook registry poisoned"),
        );
        for hook in hooks {
            hook(self.inner.id.clone());
        }
    }

    fn acquire(&self) -> BleResult<tokio::sync::MutexGuard<'_, Box<dyn FrameLink>>> {
        let mut io = self
            .inner
            .io
            .try_lock()
            .map_err(|_| TransportError::PendingActionOnDevice)?;
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(TransportError::CurrentConnected(
                "device session is closed".to_owned(),
            ));
        }
        if self.inner.disconnect_requested.load(Ordering::Acquire) {
            return Err(TransportError::CurrentConnected(
                "disconnection already requested".to_owned(),
            ));
        }
        // Frames that arrived while no exchange was in flight belong to a
        // cancelled command; drop them so they cannot be attributed to this
        // exchange.
        while let Some(frame) = io.try_take_frame() {
            debug!(bytes = frame.len(), "discarding frame received outside an exchange");
        }
        Ok(io)
    }

    async fn write_frames(&self, io: &mut dyn FrameLink, apdu: &Apdu) -> BleResult<()> {
        for frame in apdu.frames(self.inner.mtu) {
            debug!(bytes = frame.len(), "BLE write frame");
            io.write_frame(&frame).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apdu_codec::chunk;
    use tokio::sync::mpsc;
    use uuid::uuid;

    struct MockLink {
        written: mpsc::Sender<Vec<u8>>,
        notifies: mpsc::Receiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameLink for MockLink {
        async fn write_frame(&mut self, frame: &[u8]) -> BleResult<()> {
            self.written
                .send(frame.to_vec())
                .await
                .map_err(|_| TransportError::Write("mock link closed".to_owned()))
        }

        async fn next_frame(&mut self) -> BleResult<Vec<u8>> {
            self.notifies.recv().await.ok_or_else(|| {
                TransportError::LowerLevel(
                    "device disconnected while awaiting a response".to_owned(),
                )
            })
        }

        fn try_take_frame(&mut self) -> Option<Vec<u8>> {
            self.notifies.try_recv().ok()
        }

        async fn close(&mut self) -> BleResult<()> {
            self.closed.store(true, Ordering::Release);
            self.notifies.close();
            Ok(())
        }
    }

    struct DeviceSide {
        written: mpsc::Receiver<Vec<u8>>,
        notifies: mpsc::Sender<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    fn mock_device(mtu: usize) -> (LedgerDevice, DeviceSide) {
        let (written_tx, written_rx) = mpsc::channel(32);
        let (notify_tx, notify_rx) = mpsc::channel(32);
        let closed = Arc::new(AtomicBool::new(false));
        let link = MockLink {
            written: written_tx,
            notifies: notify_rx,
            closed: Arc::clone(&closed),
        };
        let id = PeripheralIdentifier::new(
            uuid!("f47ac10b-58cc-4372-a567-0e02b2c3d479"),
            Some("Nano X 1234".to_owned()),
        );
        let device = LedgerDevice::new(Box::new(link), id, DeviceModel::NanoX, mtu, false);
        let side = DeviceSide {
            written: written_rx,
            notifies: notify_tx,
            closed,
        };
        (device, side)
    }

    #[tokio::test]
    async fn simple_exchange_round_trip() {
        let (device, mut side) = mock_device(153);
        let open_bitcoin = Apdu::from_hex("e0d8000007426974636f696e");

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&open_bitcoin).await }
        });

        let frame = side.written.recv().await.unwrap();
        assert_eq!(
            frame,
            vec![
                0x05, 0x00, 0x00, 0x00, 0x0C, 0xE0, 0xD8, 0x00, 0x00, 0x07, 0x42, 0x69, 0x74,
                0x63, 0x6F, 0x69, 0x6E,
            ]
        );
        side.notifies
            .send(vec![0x05, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00])
            .await
            .unwrap();

        let response = task.await.unwrap().unwrap();
        assert_eq!(response, vec![0x90, 0x00]);
    }

    #[tokio::test]
    async fn multi_frame_response_reassembles() {
        let (device, mut side) = mock_device(153);
        let payload: Vec<u8> = (0..500u16).map(|i| i as u8).collect();

        let task = tokio::spawn({
            let device = device.clone();
            let apdu = Apdu::new(vec![0xB0, 0x01, 0x00, 0x00]);
            async move { device.exchange(&apdu).await }
        });

        side.written.recv().await.unwrap();
        let frames = chunk(&payload, 153);
        assert_eq!(frames.len(), 4);
        for frame in frames {
            side.notifies.send(frame).await.unwrap();
        }

        assert_eq!(task.await.unwrap().unwrap(), payload);
    }

    #[tokio::test]
    async fn concurrent_exchange_is_rejected_without_perturbing_the_first() {
        let (device, mut side) = mock_device(153);

        let first = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00])).await }
        });
        // Once the command frame is out, the busy slot is held.
        side.written.recv().await.unwrap();

        let err = device
            .exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PendingActionOnDevice));
        assert_eq!(err.id(), "TransportRaceCondition");

        side.notifies
            .send(vec![0x05, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00])
            .await
            .unwrap();
        assert_eq!(first.await.unwrap().unwrap(), vec![0x90, 0x00]);
    }

    #[tokio::test]
    async fn disconnect_waits_for_the_pending_exchange() {
        let (device, mut side) = mock_device(153);

        let exchange = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00])).await }
        });
        side.written.recv().await.unwrap();

        let disconnect = tokio::spawn({
            let device = device.clone();
            async move { device.disconnect().await }
        });
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        // Still waiting on the exchange.
        assert!(!side.closed.load(Ordering::Acquire));

        side.notifies
            .send(vec![0x05, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00])
            .await
            .unwrap();
        assert_eq!(exchange.await.unwrap().unwrap(), vec![0x90, 0x00]);
        disconnect.await.unwrap().unwrap();
        assert!(side.closed.load(Ordering::Acquire));

        let err = device
            .exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::CurrentConnected(_)));
    }

    #[tokio::test]
    async fn link_death_during_exchange_is_a_lower_level_error() {
        let (device, mut side) = mock_device(153);

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00])).await }
        });
        side.written.recv().await.unwrap();
        drop(side.notifies);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::LowerLevel(_)));
    }

    #[tokio::test]
    async fn stale_frames_are_flushed_before_a_new_exchange() {
        let (device, mut side) = mock_device(153);
        // Response to a command whose exchange was cancelled.
        side.notifies
            .send(vec![0x05, 0x00, 0x00, 0x00, 0x02, 0x6A, 0x80])
            .await
            .unwrap();

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00])).await }
        });
        side.written.recv().await.unwrap();
        side.notifies
            .send(vec![0x05, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00])
            .await
            .unwrap();

        assert_eq!(task.await.unwrap().unwrap(), vec![0x90, 0x00]);
    }

    #[tokio::test]
    async fn cancellation_releases_the_busy_slot() {
        let (device, mut side) = mock_device(153);

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00])).await }
        });
        side.written.recv().await.unwrap();
        task.abort();
        assert!(task.await.is_err());

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&Apdu::new(vec![0xB0, 0xA7, 0x00, 0x00])).await }
        });
        side.written.recv().await.unwrap();
        side.notifies
            .send(vec![0x05, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00])
            .await
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap(), vec![0x90, 0x00]);
    }

    #[tokio::test]
    async fn framing_error_maps_to_read_error() {
        let (device, mut side) = mock_device(153);

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00])).await }
        });
        side.written.recv().await.unwrap();
        side.notifies
            .send(vec![0x06, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00])
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Read(_)));
    }

    #[tokio::test]
    async fn response_without_status_word_is_a_protocol_violation() {
        let (device, mut side) = mock_device(153);

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.exchange(&Apdu::new(vec![0xB0, 0x01, 0x00, 0x00])).await }
        });
        side.written.recv().await.unwrap();
        side.notifies
            .send(vec![0x05, 0x00, 0x00, 0x00, 0x01, 0x90])
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Read(_)));
    }

    #[tokio::test]
    async fn unexpected_disconnect_fires_hooks_once() {
        let (device, side) = mock_device(153);
        let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
        device.on_disconnect(move |id| {
            let _ = hook_tx.send(id);
        });

        device.handle_unexpected_disconnect();
        device.handle_unexpected_disconnect();

        let id = hook_rx.recv().await.unwrap();
        assert_eq!(id.name, "Nano X 1234");
        assert!(hook_rx.try_recv().is_err());
        assert!(!device.is_connected());
        drop(side);
    }

    #[tokio::test]
    async fn send_does_not_await_a_response() {
        let (device, mut side) = mock_device(153);
        device.send(&Apdu::new(vec![0xB0, 0xA7, 0x00, 0x00])).await.unwrap();
        let frame = side.written.recv().await.unwrap();
        assert_eq!(frame[0], 0x05);
    }
}
