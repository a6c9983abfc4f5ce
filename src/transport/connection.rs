//! Connection Manager (`spec.md` §4.2).
//!
//! Sole owner of the peripheral handle; the operation queue, polling engine,
//! and command sequencer all reach the device only through the handles this
//! module hands out. Generalized from the teacher's `BluetoothComponent<A>`:
//! the device-filter, retry/timeout envelope, and on-ready sequence are new,
//! but the generic-over-adapter shape, the `DisplayName`/`AdapterDiscovery<A>`
//! seam, and the mockall test doubles are carried over directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Peripheral as _, PeripheralProperties, ScanFilter, WriteType};
use log::{debug, info, warn};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::constants::{
    CONNECTION_RETRY_COUNT, CONNECTION_RETRY_DELAY_MS, CONNECTION_TIMEOUT_MS, DESIRED_MTU,
    DEVICE_NAME_PREFIXES, DIAGNOSTIC_CHARACTERISTIC_UUID, FIRMWARE_REVISION_READ_TIMEOUT_MS,
    FIRMWARE_REVISION_UUID, HEURISTIC_CHARACTERISTIC_UUID, MODE_CHARACTERISTIC_UUID,
    MONITOR_CHARACTERISTIC_UUID, NUS_RX_UUID, NUS_SERVICE_UUID, NUS_TX_UUID,
    REPS_CHARACTERISTIC_UUID, RECONNECTION_CHANNEL_CAPACITY, SCAN_POLL_INTERVAL_MS,
    TRAINER_SERVICE_DATA_UUID, VERSION_CHARACTERISTIC_UUID,
};
use crate::error::{CoreError, CoreResult};
use crate::model::types::{
    now_ms, AdapterDescriptor, ConnectionLogEvent, ConnectionState, ReconnectionReason,
    ReconnectionRequest, ScannedDevice,
};
use crate::transport::operation_queue::OperationQueue;

/// Mirrors the teacher's `api::controller::DisplayName`.
#[async_trait]
pub trait DisplayName {
    async fn get_name(&self) -> Result<String>;
}

/// Mirrors the teacher's `api::controller::AdapterDiscovery<A>`.
#[async_trait]
pub trait AdapterDiscovery<A: Central + DisplayName> {
    async fn discover_adapters() -> Result<Vec<A>>;
}

/// Structured logging sink for connection-lifecycle events. Kept as a trait,
/// not a concrete broadcast sender, so an orchestrator can fan events out to
/// storage, telemetry, or both without this module knowing which.
pub trait ConnectionLogRepository: Send + Sync {
    fn log(&self, event: ConnectionLogEvent, message: String);
}

/// No-op `ConnectionLogRepository` for tests that don't assert on log output.
#[cfg(test)]
pub(crate) struct NullLog;

#[cfg(test)]
impl ConnectionLogRepository for NullLog {
    fn log(&self, _event: ConnectionLogEvent, _message: String) {}
}

/// GATT handles resolved during the on-ready sequence. `tx` is the only
/// characteristic every outbound command goes through.
#[derive(Debug, Clone)]
pub struct TrainerCharacteristics {
    pub tx: Characteristic,
    pub monitor: Characteristic,
    pub diagnostic: Characteristic,
    pub heuristic: Characteristic,
    pub reps: Characteristic,
    pub version: Characteristic,
    pub mode: Characteristic,
}

/// True iff an advertisement qualifies as this trainer, per §4.2's filter:
/// name prefix, NUS/0xfef3 service UUID, or non-empty 0xfef3 service data.
pub fn advertisement_qualifies(props: &PeripheralProperties) -> bool {
    let name_matches = props
        .local_name
        .as_deref()
        .map(|name| {
            let lower = name.to_ascii_lowercase();
            DEVICE_NAME_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
        })
        .unwrap_or(false);

    let service_matches = props
        .services
        .iter()
        .any(|uuid| *uuid == NUS_SERVICE_UUID || *uuid == TRAINER_SERVICE_DATA_UUID);

    let service_data_matches = props
        .service_data
        .get(&TRAINER_SERVICE_DATA_UUID)
        .is_some_and(|data| !data.is_empty());

    name_matches || service_matches || service_data_matches
}

fn find_characteristic(all: &std::collections::BTreeSet<Characteristic>, uuid: Uuid) -> CoreResult<Characteristic> {
    all.iter()
        .find(|c| c.uuid == uuid)
        .cloned()
        .ok_or(CoreError::CharacteristicMissing { uuid })
}

/// Owns the peripheral handle and runs the connection state machine.
///
/// Generic over the adapter type so it can be driven by either the platform
/// `btleplug::platform::Adapter` or a `mockall` double in tests, exactly as
/// the teacher's `BluetoothComponent<A>` is.
pub struct ConnectionManager<A: Central + DisplayName + AdapterDiscovery<A> + 'static>
where
    A::Peripheral: DisplayName,
{
    operation_queue: Arc<OperationQueue<A::Peripheral>>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_tx: broadcast::Sender<ReconnectionRequest>,
    log_repo: Arc<dyn ConnectionLogRepository>,

    adapter_descriptors: Vec<AdapterDescriptor>,
    adapters: HashMap<Uuid, A>,
    selected_adapter: Option<(AdapterDescriptor, A)>,

    scanned_devices: Arc<RwLock<HashMap<String, ScannedDevice>>>,
    scan_handle: Option<JoinHandle<()>>,

    characteristics: Option<TrainerCharacteristics>,
    current_device: Option<ScannedDevice>,
    was_ever_connected: bool,
    explicit_disconnect: bool,
}

impl<A: Central + DisplayName + AdapterDiscovery<A> + 'static> ConnectionManager<A>
where
    A::Peripheral: DisplayName,
{
    pub fn new(log_repo: Arc<dyn ConnectionLogRepository>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (reconnect_tx, _) = broadcast::channel(RECONNECTION_CHANNEL_CAPACITY);
        Self {
            operation_queue: Arc::new(OperationQueue::new(log_repo.clone())),
            state_tx,
            reconnect_tx,
            log_repo,
            adapter_descriptors: Vec::new(),
            adapters: HashMap::new(),
            selected_adapter: None,
            scanned_devices: Arc::new(RwLock::new(HashMap::new())),
            scan_handle: None,
            characteristics: None,
            current_device: None,
            was_ever_connected: false,
            explicit_disconnect: false,
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Shared with the orchestrator's notification listener so received
    /// notifications and rep frames can be logged through the same
    /// `ConnectionLogRepository` the connection state machine uses.
    pub fn log_repo(&self) -> Arc<dyn ConnectionLogRepository> {
        self.log_repo.clone()
    }

    pub fn subscribe_reconnection_requests(&self) -> broadcast::Receiver<ReconnectionRequest> {
        self.reconnect_tx.subscribe()
    }

    pub fn operation_queue(&self) -> Arc<OperationQueue<A::Peripheral>> {
        self.operation_queue.clone()
    }

    pub fn characteristics(&self) -> Option<&TrainerCharacteristics> {
        self.characteristics.as_ref()
    }

    pub fn adapters(&self) -> &[AdapterDescriptor] {
        &self.adapter_descriptors
    }

    pub async fn scanned_devices(&self) -> Vec<ScannedDevice> {
        self.scanned_devices.read().await.values().cloned().collect()
    }

    pub async fn discover_adapters(&mut self) -> Result<()> {
        for adapter in A::discover_adapters().await? {
            let name = adapter.get_name().await?;
            let descriptor = AdapterDescriptor::new(name);
            self.adapter_descriptors.push(descriptor.clone());
            self.adapters.insert(*descriptor.get_uuid(), adapter);
        }
        self.adapter_descriptors.sort_by(|a, b| a.get_uuid().cmp(b.get_uuid()));
        Ok(())
    }

    pub async fn select_adapter(&mut self, descriptor: AdapterDescriptor) -> Result<()> {
        let adapter = self
            .adapters
            .get(descriptor.get_uuid())
            .ok_or_else(|| anyhow!("adapter not found"))?
            .clone();
        self.selected_adapter = Some((descriptor, adapter));
        Ok(())
    }

    pub async fn start_scan(&mut self) -> Result<()> {
        let (_, adapter) = self.selected_adapter.as_ref().ok_or_else(|| anyhow!("no selected adapter"))?;
        adapter.start_scan(ScanFilter::default()).await?;
        self.state_tx.send_replace(ConnectionState::Scanning);
        self.log_repo.log(ConnectionLogEvent::ScanStart, "scan started".into());

        let adapter = adapter.clone();
        let devices = self.scanned_devices.clone();
        let log_repo = self.log_repo.clone();
        self.scan_handle = Some(tokio::spawn(async move {
            loop {
                if let Ok(peripherals) = adapter.peripherals().await {
                    for peripheral in peripherals {
                        let Ok(Some(props)) = peripheral.properties().await else { continue };
                        if !advertisement_qualifies(&props) {
                            continue;
                        }
                        let address = peripheral.address().to_string();
                        let device = ScannedDevice {
                            name: props.local_name.unwrap_or_else(|| "unknown".into()),
                            address: address.clone(),
                            rssi: props.rssi.map(|v| v as i8).unwrap_or(0),
                        };
                        let is_new = !devices.read().await.contains_key(&address);
                        devices.write().await.insert(address, device);
                        if is_new {
                            log_repo.log(ConnectionLogEvent::DeviceFound, "device found".into());
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(SCAN_POLL_INTERVAL_MS)).await;
            }
        }));
        Ok(())
    }

    pub async fn stop_scan(&mut self) -> Result<()> {
        if let Some((_, adapter)) = self.selected_adapter.as_ref() {
            adapter.stop_scan().await?;
        }
        if let Some(handle) = self.scan_handle.take() {
            handle.abort();
        }
        if matches!(*self.state_tx.borrow(), ConnectionState::Scanning) {
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
        Ok(())
    }

    pub async fn connect(&mut self, device: ScannedDevice) -> Result<()> {
        self.explicit_disconnect = false;
        self.state_tx.send_replace(ConnectionState::Connecting);
        let (_, adapter) = self.selected_adapter.as_ref().ok_or_else(|| anyhow!("no selected adapter"))?.clone();

        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = tokio::time::timeout(
                Duration::from_millis(CONNECTION_TIMEOUT_MS),
                Self::try_connect(&adapter, &device),
            )
            .await;

            match outcome {
                Ok(Ok(peripheral)) => {
                    self.finish_connect(peripheral, &device).await?;
                    return Ok(());
                }
                Ok(Err(_)) | Err(_) if attempts < CONNECTION_RETRY_COUNT => {
                    warn!("connect attempt {attempts} to {} failed, retrying", device.address);
                    tokio::time::sleep(Duration::from_millis(CONNECTION_RETRY_DELAY_MS)).await;
                }
                _ => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return Err(CoreError::ConnectFailed { after_attempts: attempts }.into());
                }
            }
        }
    }

    async fn try_connect(adapter: &A, device: &ScannedDevice) -> Result<A::Peripheral> {
        let peripherals = adapter.peripherals().await?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string() == device.address)
            .ok_or_else(|| anyhow!("peripheral not found"))?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok(peripheral)
    }

    /// Runs the six-step on-ready sequence and installs the peripheral.
    async fn finish_connect(&mut self, peripheral: A::Peripheral, device: &ScannedDevice) -> Result<()> {
        // Step 1 (request high connection priority) and step 2 (request MTU)
        // are platform no-ops under `btleplug`'s portable API; negotiated MTU
        // is not observable here, so only the services/characteristics steps
        // below do real work.
        debug!("requesting MTU {DESIRED_MTU} (platform-dependent; no-op on some backends)");
        self.log_repo.log(
            ConnectionLogEvent::MtuChanged,
            format!("requested MTU {DESIRED_MTU} (platform-dependent; no-op on some backends)"),
        );

        let all_characteristics = peripheral.characteristics();
        if find_characteristic(&all_characteristics, NUS_SERVICE_UUID).is_err() {
            debug!("NUS service UUID not advertised on characteristic list (expected for some firmwares)");
        }
        if all_characteristics.iter().any(|c| c.uuid == NUS_RX_UUID) {
            debug!("NUS RX present; core will not subscribe to it");
        }

        let tx = find_characteristic(&all_characteristics, NUS_TX_UUID)?;
        let monitor = find_characteristic(&all_characteristics, MONITOR_CHARACTERISTIC_UUID)?;
        let diagnostic = find_characteristic(&all_characteristics, DIAGNOSTIC_CHARACTERISTIC_UUID)?;
        let heuristic = find_characteristic(&all_characteristics, HEURISTIC_CHARACTERISTIC_UUID)?;
        let reps = find_characteristic(&all_characteristics, REPS_CHARACTERISTIC_UUID)?;
        let version = find_characteristic(&all_characteristics, VERSION_CHARACTERISTIC_UUID)?;
        let mode = find_characteristic(&all_characteristics, MODE_CHARACTERISTIC_UUID)?;

        if let Some(fw_char) = all_characteristics.iter().find(|c| c.uuid == FIRMWARE_REVISION_UUID) {
            let _ = tokio::time::timeout(
                Duration::from_millis(FIRMWARE_REVISION_READ_TIMEOUT_MS),
                peripheral.read(fw_char),
            )
            .await;
        }

        peripheral.subscribe(&reps).await?;
        peripheral.subscribe(&version).await?;
        peripheral.subscribe(&mode).await?;

        self.operation_queue.set_peripheral(Some(peripheral)).await;
        self.characteristics = Some(TrainerCharacteristics { tx, monitor, diagnostic, heuristic, reps, version, mode });
        self.current_device = Some(device.clone());
        self.was_ever_connected = true;

        self.state_tx.send_replace(ConnectionState::Connected {
            name: device.name.clone(),
            address: device.address.clone(),
            hardware_model: None,
        });
        self.log_repo.log(ConnectionLogEvent::ConnectSuccess, format!("connected to {}", device.address));
        info!("connected to {} ({})", device.name, device.address);
        Ok(())
    }

    /// Explicit disconnect: suppresses the `ReconnectionRequest` this drop
    /// would otherwise emit.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.explicit_disconnect = true;
        self.teardown(None).await
    }

    /// Called by the polling/notification layer when the link drops
    /// unexpectedly. Emits exactly one `ReconnectionRequest` when a prior
    /// connection had succeeded and the disconnect was not requested.
    pub async fn handle_unexpected_disconnect(&mut self) -> Result<()> {
        let reason = if !self.explicit_disconnect && self.was_ever_connected {
            Some(ReconnectionReason::UnexpectedDisconnect)
        } else {
            None
        };
        self.teardown(reason).await
    }

    async fn teardown(&mut self, reconnect_reason: Option<ReconnectionReason>) -> Result<()> {
        if let Some(peripheral) = self.operation_queue.peripheral().await {
            let _ = peripheral.disconnect().await;
        }
        self.operation_queue.set_peripheral(None).await;
        self.characteristics = None;
        let device = self.current_device.take();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.log_repo.log(ConnectionLogEvent::Disconnected, "disconnected".into());

        if let (Some(reason), Some(device)) = (reconnect_reason, device) {
            self.log_repo.log(ConnectionLogEvent::ReconnectRequested, reason.to_string());
            let _ = self.reconnect_tx.send(ReconnectionRequest {
                device_name: device.name,
                address: device.address,
                reason,
                timestamp_ms: now_ms(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::{BDAddr, CentralEvent, CentralState, Descriptor, Service, ValueNotification};
    use btleplug::platform::PeripheralId;
    use futures::stream::Stream;
    use mockall::mock;
    use std::collections::BTreeSet;
    use std::pin::Pin;

    mock! {
        Peripheral {}

        impl Clone for Peripheral {
            fn clone(&self) -> Self;
        }
        impl std::fmt::Debug for Peripheral {
            fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
        }
        #[async_trait]
        impl btleplug::api::Peripheral for Peripheral {
            fn id(&self) -> PeripheralId;
            fn address(&self) -> BDAddr;
            async fn properties(&self) -> btleplug::Result<Option<PeripheralProperties>>;
            fn services(&self) -> BTreeSet<Service>;
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
        #[async_trait]
        impl DisplayName for Peripheral {
            async fn get_name(&self) -> Result<String>;
        }
    }

    mock! {
        Adapter {}
        impl Clone for Adapter {
            fn clone(&self) -> Self;
        }
        impl std::fmt::Debug for Adapter {
            fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
        }
        #[async_trait]
        impl DisplayName for Adapter {
            async fn get_name(&self) -> Result<String>;
        }
        #[async_trait]
        impl AdapterDiscovery<MockAdapter> for Adapter {
            async fn discover_adapters() -> Result<Vec<MockAdapter>>;
        }
        #[async_trait]
        impl Central for Adapter {
            type Peripheral = MockPeripheral;
            async fn events(&self) -> btleplug::Result<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>>;
            async fn start_scan(&self, filter: ScanFilter) -> btleplug::Result<()>;
            async fn stop_scan(&self) -> btleplug::Result<()>;
            async fn peripherals(&self) -> btleplug::Result<Vec<MockPeripheral>>;
            async fn peripheral(&self, id: &PeripheralId) -> btleplug::Result<MockPeripheral>;
            async fn add_peripheral(&self, address: &PeripheralId) -> btleplug::Result<MockPeripheral>;
            async fn adapter_info(&self) -> btleplug::Result<String>;
            async fn adapter_state(&self) -> btleplug::Result<CentralState>;
        }
    }

    fn props_with_name(name: &str) -> PeripheralProperties {
        PeripheralProperties {
            address: BDAddr::default(),
            address_type: None,
            local_name: Some(name.to_string()),
            tx_power_level: None,
            rssi: Some(-50),
            manufacturer_data: HashMap::new(),
            service_data: HashMap::new(),
            services: Vec::new(),
        }
    }

    #[test]
    fn name_prefix_qualifies_case_insensitively() {
        assert!(advertisement_qualifies(&props_with_name("Vee_1234")));
        assert!(advertisement_qualifies(&props_with_name("VIT-5")));
        assert!(advertisement_qualifies(&props_with_name("vee_lowercase")));
        assert!(!advertisement_qualifies(&props_with_name("Unrelated Device")));
    }

    #[test]
    fn service_uuid_qualifies_without_name() {
        let mut props = props_with_name("anything");
        props.local_name = None;
        props.services = vec![NUS_SERVICE_UUID];
        assert!(advertisement_qualifies(&props));
    }

    #[test]
    fn nonempty_service_data_qualifies() {
        let mut props = props_with_name("anything");
        props.local_name = None;
        props.service_data.insert(TRAINER_SERVICE_DATA_UUID, vec![1, 2]);
        assert!(advertisement_qualifies(&props));
    }

    #[test]
    fn empty_service_data_does_not_qualify() {
        let mut props = props_with_name("anything");
        props.local_name = None;
        props.service_data.insert(TRAINER_SERVICE_DATA_UUID, vec![]);
        assert!(!advertisement_qualifies(&props));
    }

    #[tokio::test]
    async fn new_manager_starts_disconnected() {
        let manager = ConnectionManager::<MockAdapter>::new(Arc::new(NullLog));
        assert_eq!(*manager.watch_state().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn discover_adapters_populates_descriptors() {
        let mut manager = ConnectionManager::<MockAdapter>::new(Arc::new(NullLog));
        let ctx = MockAdapter::discover_adapters_context();
        ctx.expect().times(1).returning(|| {
            let mut adapter = MockAdapter::default();
            adapter.expect_get_name().returning(|| Ok("TestAdapter".to_string()));
            Ok(vec![adapter])
        });
        manager.discover_adapters().await.unwrap();
        assert_eq!(manager.adapters().len(), 1);
        assert_eq!(manager.adapters()[0].get_name(), "TestAdapter");
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_a_noop_teardown() {
        let mut manager = ConnectionManager::<MockAdapter>::new(Arc::new(NullLog));
        assert!(manager.disconnect().await.is_ok());
        assert_eq!(*manager.watch_state().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unexpected_disconnect_without_prior_success_emits_nothing() {
        let mut manager = ConnectionManager::<MockAdapter>::new(Arc::new(NullLog));
        let mut rx = manager.subscribe_reconnection_requests();
        manager.handle_unexpected_disconnect().await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
