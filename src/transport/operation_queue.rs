//! BLE Operation Queue (`spec.md` §4.1).
//!
//! Guarantees at-most-one in-flight GATT read or write per peripheral by
//! serializing every characteristic access behind a single `tokio::sync::Mutex`,
//! the same primitive the teacher crate uses to serialize acquisition state
//! (`model::storage::ModelHandle`). The queue never re-enters: the guard is
//! held for the full span of one operation, retries included.

use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Characteristic, Peripheral, WriteType};
use log::warn;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::core::constants::{
    COMMAND_RESPONSE_CHANNEL_CAPACITY, OPERATION_RETRY_COUNT, OPERATION_RETRY_DELAY_MS,
};
use crate::error::{CoreError, CoreResult};
use crate::model::types::ConnectionLogEvent;
use crate::transport::connection::ConnectionLogRepository;

/// Serializes reads and writes against the current peripheral.
///
/// Generic over the concrete `btleplug` peripheral type so it can be driven
/// by either the platform implementation or a `mockall` double in tests.
pub struct OperationQueue<P: Peripheral> {
    lock: Mutex<()>,
    peripheral: RwLock<Option<P>>,
    opcode_tx: broadcast::Sender<u8>,
    log_repo: Arc<dyn ConnectionLogRepository>,
}

impl<P: Peripheral> OperationQueue<P> {
    pub fn new(log_repo: Arc<dyn ConnectionLogRepository>) -> Self {
        let (opcode_tx, _) = broadcast::channel(COMMAND_RESPONSE_CHANNEL_CAPACITY);
        Self {
            lock: Mutex::new(()),
            peripheral: RwLock::new(None),
            opcode_tx,
            log_repo,
        }
    }

    /// Publishes the opcode (first byte) of a received RX notification.
    /// Called by whoever owns the notification stream — the connection
    /// manager's on-ready subscriptions feed REPS/VERSION/MODE notifications
    /// here so `await_response` can observe them regardless of which
    /// characteristic they arrived on.
    pub fn publish_received_opcode(&self, opcode: u8) {
        let _ = self.opcode_tx.send(opcode);
    }

    /// §4.2: waits up to `timeout_ms` for `expected_opcode` to appear on the
    /// received-opcode broadcast, for handshakes that need to confirm the
    /// device acted on a command rather than just that the write succeeded.
    pub async fn await_response(&self, expected_opcode: u8, timeout_ms: u64) -> CoreResult<()> {
        let mut rx = self.opcode_tx.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(opcode) if opcode == expected_opcode => return true,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        match tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(CoreError::ResponseTimeout { opcode: expected_opcode }),
        }
    }

    /// Installs (or clears) the peripheral this queue operates on. Called
    /// exclusively by the connection manager on state transitions.
    pub async fn set_peripheral(&self, peripheral: Option<P>) {
        *self.peripheral.write().await = peripheral;
    }

    /// True while an operation is in flight; diagnostics only.
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Clones out the currently installed peripheral, if any. Used by the
    /// connection manager to issue a link-level disconnect; operations
    /// against the device should go through `read`/`write` instead.
    pub async fn peripheral(&self) -> Option<P> {
        self.peripheral.read().await.clone()
    }

    async fn current(&self) -> CoreResult<P> {
        self.peripheral
            .read()
            .await
            .clone()
            .ok_or(CoreError::NotConnected)
    }

    /// Writes `bytes` to `characteristic`, retrying link errors up to
    /// `OPERATION_RETRY_COUNT` times with `OPERATION_RETRY_DELAY_MS` between
    /// attempts.
    pub async fn write(
        &self,
        characteristic: &Characteristic,
        bytes: &[u8],
        write_type: WriteType,
    ) -> CoreResult<()> {
        let _guard = self.lock.lock().await;
        let peripheral = self.current().await?;

        let mut attempt = 0;
        loop {
            match peripheral.write(characteristic, bytes, write_type).await {
                Ok(()) => {
                    self.log_repo.log(
                        ConnectionLogEvent::CommandSent,
                        format!(
                            "write {:#04x?} -> {} ({} bytes)",
                            bytes.first().copied().unwrap_or(0),
                            characteristic.uuid,
                            bytes.len()
                        ),
                    );
                    return Ok(());
                }
                Err(e) if attempt < OPERATION_RETRY_COUNT => {
                    attempt += 1;
                    warn!("write to {} failed ({e}), retry {attempt}", characteristic.uuid);
                    tokio::time::sleep(Duration::from_millis(OPERATION_RETRY_DELAY_MS)).await;
                }
                Err(e) => {
                    self.log_repo.log(
                        ConnectionLogEvent::Error,
                        format!("write to {} failed after retries: {e}", characteristic.uuid),
                    );
                    return Err(CoreError::WriteFailed {
                        cause: e.to_string(),
                    });
                }
            }
        }
    }

    /// Reads the current value of `characteristic`, with the same retry policy as `write`.
    pub async fn read(&self, characteristic: &Characteristic) -> CoreResult<Vec<u8>> {
        let _guard = self.lock.lock().await;
        let peripheral = self.current().await?;

        let mut attempt = 0;
        loop {
            match peripheral.read(characteristic).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < OPERATION_RETRY_COUNT => {
                    attempt += 1;
                    warn!("read from {} failed ({e}), retry {attempt}", characteristic.uuid);
                    tokio::time::sleep(Duration::from_millis(OPERATION_RETRY_DELAY_MS)).await;
                }
                Err(e) => {
                    self.log_repo.log(
                        ConnectionLogEvent::Error,
                        format!("read from {} failed after retries: {e}", characteristic.uuid),
                    );
                    return Err(CoreError::ReadFailed {
                        cause: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::NullLog;
    use btleplug::api::{
        BDAddr, CharacteristicProperties, Descriptor, PeripheralProperties, ValueNotification,
    };
    use btleplug::platform::PeripheralId;
    use futures::stream::Stream;
    use mockall::mock;
    use std::collections::BTreeSet;
    use std::pin::Pin;
    use uuid::Uuid;

    mock! {
        Peri {}

        impl Clone for Peri {
            fn clone(&self) -> Self;
        }

        impl std::fmt::Debug for Peri {
            fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
        }

        #[async_trait::async_trait]
        impl Peripheral for Peri {
            fn id(&self) -> PeripheralId;
            fn address(&self) -> BDAddr;
            async fn properties(&self) -> btleplug::Result<Option<PeripheralProperties>>;
            fn services(&self) -> BTreeSet<btleplug::api::Service>;
            fn characteristics(&self) -> BTreeSet<Characteristic>;
            async fn is_connected(&self) -> btleplug::Result<bool>;
            async fn connect(&self) -> btleplug::Result<()>;
            async fn disconnect(&self) -> btleplug::Result<()>;
            async fn discover_services(&self) -> btleplug::Result<()>;
            async fn write(&self, characteristic: &Characteristic, data: &[u8], write_type: WriteType) -> btleplug::Result<()>;
            async fn read(&self, characteristic: &Characteristic) -> btleplug::Result<Vec<u8>>;
            async fn subscribe(&self, characteristic: &Characteristic) -> btleplug::Result<()>;
            async fn unsubscribe(&self, characteristic: &Characteristic) -> btleplug::Result<()>;
            async fn notifications(&self) -> btleplug::Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>>;
            async fn write_descriptor(&self, descriptor: &Descriptor, data: &[u8]) -> btleplug::Result<()>;
            async fn read_descriptor(&self, descriptor: &Descriptor) -> btleplug::Result<Vec<u8>>;
        }
    }

    fn test_characteristic() -> Characteristic {
        Characteristic {
            uuid: Uuid::new_v4(),
            service_uuid: Uuid::nil(),
            descriptors: BTreeSet::new(),
            properties: CharacteristicProperties::default(),
        }
    }

    #[tokio::test]
    async fn read_without_peripheral_is_not_connected() {
        let queue = OperationQueue::<MockPeri>::new(Arc::new(NullLog));
        let err = queue.read(&test_characteristic()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected));
    }

    #[tokio::test]
    async fn write_succeeds_once_peripheral_installed() {
        let queue = OperationQueue::<MockPeri>::new(Arc::new(NullLog));
        let mut peri = MockPeri::default();
        peri.expect_write().returning(|_, _, _| Ok(()));
        queue.set_peripheral(Some(peri)).await;
        assert!(queue.write(&test_characteristic(), &[1, 2, 3], WriteType::WithResponse).await.is_ok());
    }

    #[tokio::test]
    async fn write_retries_then_fails() {
        let queue = OperationQueue::<MockPeri>::new(Arc::new(NullLog));
        let mut peri = MockPeri::default();
        peri.expect_write()
            .returning(|_, _, _| Err(btleplug::Error::NotConnected));
        queue.set_peripheral(Some(peri)).await;
        let err = queue
            .write(&test_characteristic(), &[0], WriteType::WithResponse)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WriteFailed { .. }));
    }

    #[tokio::test]
    async fn is_locked_reflects_in_flight_operation() {
        let queue = Arc::new(OperationQueue::<MockPeri>::new(Arc::new(NullLog)));
        assert!(!queue.is_locked());
    }

    #[tokio::test]
    async fn await_response_resolves_on_matching_opcode() {
        let queue = Arc::new(OperationQueue::<MockPeri>::new(Arc::new(NullLog)));
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.await_response(0x03, 1_000).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.publish_received_opcode(0x01);
        queue.publish_received_opcode(0x03);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn await_response_times_out_without_matching_opcode() {
        let queue = OperationQueue::<MockPeri>::new(Arc::new(NullLog));
        queue.publish_received_opcode(0x01);
        let err = queue.await_response(0x03, 20).await.unwrap_err();
        assert!(matches!(err, CoreError::ResponseTimeout { opcode: 0x03 }));
    }
}
