//! BlueZ backend built on `bluer`.
//!
//! One [`BluezTransport`] wraps one adapter and serves both roles: the
//! central side drives remote GATT objects, the peripheral side serves a
//! local GATT application and an LE advertisement.

use std::{
   collections::{BTreeSet, HashMap},
   str::FromStr,
   sync::Arc,
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, Address, Device, DiscoveryFilter, DiscoveryTransport, Session,
   adv::{Advertisement, AdvertisementHandle, Type},
   gatt::{
      local::{
         Application, ApplicationHandle, Characteristic as LocalCharacteristic,
         CharacteristicControlEvent, CharacteristicNotify, CharacteristicNotifyMethod,
         Service as LocalService, characteristic_control,
      },
      CharacteristicWriter,
      remote::Characteristic as RemoteCharacteristic,
   },
};
use futures::{
   StreamExt,
   channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
   stream::BoxStream,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   select,
   sync::oneshot,
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use super::{
   AdvertisingProfile, CentralTransport, DiscoveredPeripheral, Payload, PeerId, PeripheralHandle,
   PeripheralTransport, ResolvedCharacteristics, SubscriberHandle, SubscriptionEvent,
};
use crate::{
   config::AdvertisingConfig,
   error::{
      AdvertiseError, ConnectError, NotifyError, ResolveError, Result, SubscribeError,
   },
   identity::ServiceIdentity,
};

/// Interval for link and subscriber health checks
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound on waiting for BlueZ to finish service discovery
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);

/// Forwards remote notifications into a channel until aborted.
struct NotifyForwarder {
   task: JoinHandle<()>,
   rx: Option<UnboundedReceiver<Payload>>,
}

/// Local GATT application; unregistered when dropped.
struct ServedApplication {
   service_uuid: Uuid,
   _handle: ApplicationHandle,
   control_task: JoinHandle<()>,
   health_task: JoinHandle<()>,
}

impl Drop for ServedApplication {
   fn drop(&mut self) {
      self.control_task.abort();
      self.health_task.abort();
   }
}

type WriterMap = Arc<Mutex<HashMap<PeerId, Arc<CharacteristicWriter>>>>;

/// BlueZ transport for a single adapter.
pub struct BluezTransport {
   _session: Session,
   adapter: Adapter,
   intervals: AdvertisingConfig,

   // Central side
   remote: Mutex<HashMap<(PeerId, Uuid), RemoteCharacteristic>>,
   forwarders: Mutex<HashMap<(PeerId, Uuid), NotifyForwarder>>,

   // Peripheral side
   application: Mutex<Option<ServedApplication>>,
   advertisement: Mutex<Option<AdvertisementHandle>>,
   advertised: Mutex<Option<ServiceIdentity>>,
   writers: WriterMap,
   sub_tx: UnboundedSender<SubscriptionEvent>,
   sub_rx: Mutex<Option<UnboundedReceiver<SubscriptionEvent>>>,
}

/// Returns whether a BlueZ daemon with at least one adapter is reachable.
pub async fn is_bluetooth_supported() -> bool {
   match Session::new().await {
      Ok(session) => session.default_adapter().await.is_ok(),
      Err(_) => false,
   }
}

impl BluezTransport {
   /// Opens a BlueZ session on `adapter_name` (or the default adapter) and
   /// powers the adapter on.
   pub async fn new(adapter_name: Option<&str>, intervals: AdvertisingConfig) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      let name = adapter.name().to_owned();

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {name}");
      }
      info!("Using adapter {name} ({})", adapter.address().await?);

      let (sub_tx, sub_rx) = mpsc::unbounded();
      Ok(Self {
         _session: session,
         adapter,
         intervals,
         remote: Mutex::new(HashMap::new()),
         forwarders: Mutex::new(HashMap::new()),
         application: Mutex::new(None),
         advertisement: Mutex::new(None),
         advertised: Mutex::new(None),
         writers: Arc::new(Mutex::new(HashMap::new())),
         sub_tx,
         sub_rx: Mutex::new(Some(sub_rx)),
      })
   }

   fn device(&self, id: &PeerId) -> std::result::Result<Device, String> {
      let address = Address::from_str(id.as_str()).map_err(|e| format!("{id}: {e}"))?;
      self.adapter.device(address).map_err(|e| e.to_string())
   }

   fn advertisement(
      &self,
      identity: &ServiceIdentity,
      profile: AdvertisingProfile,
   ) -> Advertisement {
      let (min, max) = match profile {
         AdvertisingProfile::Foreground => self.intervals.foreground_interval_ms,
         AdvertisingProfile::Background => self.intervals.background_interval_ms,
      };
      Advertisement {
         advertisement_type: Type::Peripheral,
         service_uuids: BTreeSet::from([identity.service_uuid()]),
         local_name: Some(identity.name().to_string()),
         discoverable: Some(true),
         min_interval: Some(Duration::from_millis(min)),
         max_interval: Some(Duration::from_millis(max)),
         ..Default::default()
      }
   }

   /// Registers the GATT application for `identity` unless already served.
   async fn serve(&self, identity: &ServiceIdentity) -> std::result::Result<(), AdvertiseError> {
      let served = self
         .application
         .lock()
         .as_ref()
         .map(|app| app.service_uuid);
      if served == Some(identity.service_uuid()) {
         return Ok(());
      }

      let characteristic = identity.sole_characteristic().ok_or_else(|| {
         AdvertiseError::Registration("exactly one characteristic must be exposed".into())
      })?;

      let (control, control_handle) = characteristic_control();
      let app = Application {
         services: vec![LocalService {
            uuid: identity.service_uuid(),
            primary: true,
            characteristics: vec![LocalCharacteristic {
               uuid: characteristic,
               notify: Some(CharacteristicNotify {
                  notify: true,
                  method: CharacteristicNotifyMethod::Io,
                  ..Default::default()
               }),
               control_handle,
               ..Default::default()
            }],
            ..Default::default()
         }],
         ..Default::default()
      };
      let handle = self
         .adapter
         .serve_gatt_application(app)
         .await
         .map_err(|e| AdvertiseError::Registration(e.to_string()))?;
      info!("Serving {identity} with characteristic {characteristic}");

      let control_task =
         tokio::spawn(run_control(control, self.writers.clone(), self.sub_tx.clone()));
      let health_task = tokio::spawn(run_health_check(
         self.adapter.clone(),
         self.writers.clone(),
         self.sub_tx.clone(),
      ));

      *self.application.lock() = Some(ServedApplication {
         service_uuid: identity.service_uuid(),
         _handle: handle,
         control_task,
         health_task,
      });
      Ok(())
   }

   fn forget_peer(&self, id: &PeerId) {
      self.remote.lock().retain(|(peer, _), _| peer != id);
      self.forwarders.lock().retain(|(peer, _), fwd| {
         if peer == id {
            fwd.task.abort();
            false
         } else {
            true
         }
      });
   }
}

/// Tracks centrals that enable notifications on the local characteristic.
async fn run_control(
   control: bluer::gatt::local::CharacteristicControl,
   writers: WriterMap,
   sub_tx: UnboundedSender<SubscriptionEvent>,
) {
   let mut control = Box::pin(control);
   while let Some(event) = control.next().await {
      match event {
         CharacteristicControlEvent::Notify(writer) => {
            let id = PeerId::new(writer.device_address().to_string());
            debug!("Central {id} enabled notifications (mtu {})", writer.mtu());
            writers.lock().insert(id.clone(), Arc::new(writer));
            let _ = sub_tx.unbounded_send(SubscriptionEvent::Subscribed(SubscriberHandle::new(id)));
         },
         _ => debug!("Ignoring request on notify-only characteristic"),
      }
   }
   debug!("Characteristic control stream ended");
}

/// Drops writers whose central went away or stopped notifications.
async fn run_health_check(
   adapter: Adapter,
   writers: WriterMap,
   sub_tx: UnboundedSender<SubscriptionEvent>,
) {
   let mut interval = time::interval(HEALTH_CHECK_INTERVAL);
   interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
   loop {
      interval.tick().await;
      let ids: Vec<PeerId> = writers.lock().keys().cloned().collect();
      for id in ids {
         let connected = match Address::from_str(id.as_str()) {
            Ok(addr) => match adapter.device(addr) {
               Ok(device) => device.is_connected().await.unwrap_or(false),
               Err(_) => false,
            },
            Err(_) => false,
         };
         if !connected {
            if writers.lock().remove(&id).is_some() {
               debug!("Central {id} disconnected");
               let central = SubscriberHandle::new(id);
               let _ = sub_tx.unbounded_send(SubscriptionEvent::Disconnected(central));
            }
            continue;
         }

         // StopNotify closes the notify socket without dropping the link.
         let stopped = writers
            .lock()
            .get(&id)
            .is_some_and(|writer| writer.is_closed().unwrap_or(true));
         if stopped && writers.lock().remove(&id).is_some() {
            debug!("Central {id} stopped notifications");
            let central = SubscriberHandle::new(id);
            let _ = sub_tx.unbounded_send(SubscriptionEvent::Unsubscribed(central));
         }
      }
   }
}

async fn wait_services_resolved(device: &Device) -> std::result::Result<(), ResolveError> {
   let resolved = time::timeout(SERVICES_RESOLVE_TIMEOUT, async {
      loop {
         match device.is_services_resolved().await {
            Ok(true) => return Ok(()),
            Ok(false) => time::sleep(SERVICES_RESOLVE_POLL).await,
            Err(e) => return Err(ResolveError::Transport(e.to_string())),
         }
      }
   })
   .await;
   resolved.unwrap_or_else(|_| Err(ResolveError::Transport("service discovery timed out".into())))
}

impl CentralTransport for BluezTransport {
   async fn scan(
      &self,
      service: Uuid,
   ) -> std::result::Result<BoxStream<'static, DiscoveredPeripheral>, ConnectError> {
      let filter = DiscoveryFilter {
         uuids: [service].into_iter().collect(),
         transport: DiscoveryTransport::Le,
         ..Default::default()
      };
      self
         .adapter
         .set_discovery_filter(filter)
         .await
         .map_err(|e| ConnectError::ScanFailed(e.to_string()))?;

      let adapter = self.adapter.clone();
      let (tx, rx) = mpsc::unbounded();
      let (ready_tx, ready_rx) = oneshot::channel();

      tokio::spawn(async move {
         let events = match adapter.discover_devices().await {
            Ok(events) => {
               let _ = ready_tx.send(Ok(()));
               events
            },
            Err(e) => {
               let _ = ready_tx.send(Err(ConnectError::ScanFailed(e.to_string())));
               return;
            },
         };
         debug!("Discovery started for {service}");
         let mut events = Box::pin(events);
         let mut interval = time::interval(HEALTH_CHECK_INTERVAL);
         interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
         loop {
            select! {
                event = events.next() => {
                    let addr = match event {
                        Some(AdapterEvent::DeviceAdded(addr)) => addr,
                        Some(_) => continue,
                        None => break,
                    };
                    let Ok(device) = adapter.device(addr) else {
                        continue;
                    };
                    let advertises = device
                        .uuids()
                        .await
                        .ok()
                        .flatten()
                        .is_some_and(|uuids| uuids.contains(&service));
                    if !advertises {
                        continue;
                    }
                    let mut found = DiscoveredPeripheral::new(PeerId::new(addr.to_string()));
                    found.name = device.name().await.ok().flatten().map(Into::into);
                    found.rssi = device.rssi().await.ok().flatten();
                    if tx.unbounded_send(found).is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if tx.is_closed() {
                        break;
                    }
                }
            }
         }
         debug!("Discovery for {service} stopped");
      });

      ready_rx
         .await
         .map_err(|_| ConnectError::ScanFailed("discovery task ended".into()))??;
      Ok(rx.boxed())
   }

   async fn connect(
      &self,
      peripheral: &DiscoveredPeripheral,
   ) -> std::result::Result<PeripheralHandle, ConnectError> {
      let device = self.device(&peripheral.id).map_err(ConnectError::Rejected)?;
      if !device.is_connected().await.unwrap_or(false) {
         device
            .connect()
            .await
            .map_err(|e| ConnectError::Rejected(e.to_string()))?;
      }
      Ok(PeripheralHandle::new(peripheral.id.clone()))
   }

   async fn discover(
      &self,
      handle: &PeripheralHandle,
      service: Uuid,
      characteristics: &[Uuid],
   ) -> std::result::Result<ResolvedCharacteristics, ResolveError> {
      let device = self.device(handle.id()).map_err(ResolveError::Transport)?;
      if !device.is_connected().await.unwrap_or(false) {
         return Err(ResolveError::NotConnected);
      }
      wait_services_resolved(&device).await?;

      let transport = |e: bluer::Error| ResolveError::Transport(e.to_string());
      let mut remote_service = None;
      for s in device.services().await.map_err(transport)? {
         if s.uuid().await.map_err(transport)? == service {
            remote_service = Some(s);
            break;
         }
      }
      let remote_service = remote_service.ok_or(ResolveError::ServiceNotFound(service))?;

      let mut available = HashMap::new();
      for c in remote_service.characteristics().await.map_err(transport)? {
         available.insert(c.uuid().await.map_err(transport)?, c);
      }

      let mut resolved = ResolvedCharacteristics::default();
      let mut cache = self.remote.lock();
      for uuid in characteristics {
         match available.remove(uuid) {
            Some(c) => {
               cache.insert((handle.id().clone(), *uuid), c);
               resolved.found.push(*uuid);
            },
            None => resolved.missing.push(*uuid),
         }
      }
      Ok(resolved)
   }

   async fn set_notify(
      &self,
      handle: &PeripheralHandle,
      characteristic: Uuid,
      enabled: bool,
   ) -> std::result::Result<(), SubscribeError> {
      let key = (handle.id().clone(), characteristic);

      if !enabled {
         if let Some(fwd) = self.forwarders.lock().remove(&key) {
            fwd.task.abort();
         }
         return Ok(());
      }

      let remote = self
         .remote
         .lock()
         .get(&key)
         .cloned()
         .ok_or(SubscribeError::NotResolved(characteristic))?;
      let flags = remote
         .flags()
         .await
         .map_err(|e| SubscribeError::Rejected(e.to_string()))?;
      if !flags.notify && !flags.indicate {
         return Err(SubscribeError::NotifyUnsupported(characteristic));
      }

      let (tx, rx) = mpsc::unbounded();
      let (ready_tx, ready_rx) = oneshot::channel();
      let task = tokio::spawn(async move {
         let notifications = match remote.notify().await {
            Ok(notifications) => {
               let _ = ready_tx.send(Ok(()));
               notifications
            },
            Err(e) => {
               let _ = ready_tx.send(Err(SubscribeError::Rejected(e.to_string())));
               return;
            },
         };
         let mut notifications = Box::pin(notifications);
         while let Some(value) = notifications.next().await {
            if tx.unbounded_send(Payload::from_vec(value)).is_err() {
               break;
            }
         }
      });
      ready_rx
         .await
         .map_err(|_| SubscribeError::Rejected("notify session ended".into()))??;

      if let Some(previous) = self.forwarders.lock().insert(
         key,
         NotifyForwarder {
            task,
            rx: Some(rx),
         },
      ) {
         previous.task.abort();
      }
      Ok(())
   }

   async fn value_updates(
      &self,
      handle: &PeripheralHandle,
      characteristic: Uuid,
   ) -> std::result::Result<BoxStream<'static, Payload>, SubscribeError> {
      self
         .forwarders
         .lock()
         .get_mut(&(handle.id().clone(), characteristic))
         .and_then(|fwd| fwd.rx.take())
         .map(StreamExt::boxed)
         .ok_or(SubscribeError::NotResolved(characteristic))
   }

   fn disconnect(&self, handle: &PeripheralHandle) {
      self.forget_peer(handle.id());
      match self.device(handle.id()) {
         Ok(device) => {
            let id = handle.id().clone();
            tokio::spawn(async move {
               if let Err(e) = device.disconnect().await {
                  debug!("Disconnect from {id} failed: {e}");
               }
            });
         },
         Err(e) => warn!("Cannot disconnect {handle}: {e}"),
      }
   }

   async fn link_lost(&self, handle: &PeripheralHandle) {
      let Ok(device) = self.device(handle.id()) else {
         return;
      };
      let mut interval = time::interval(HEALTH_CHECK_INTERVAL);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
         interval.tick().await;
         if !device.is_connected().await.unwrap_or(false) {
            return;
         }
      }
   }
}

impl PeripheralTransport for BluezTransport {
   async fn advertise(
      &self,
      identity: &ServiceIdentity,
      profile: AdvertisingProfile,
   ) -> std::result::Result<(), AdvertiseError> {
      if self.advertisement.lock().is_some() {
         return Err(AdvertiseError::AlreadyAdvertising);
      }
      let powered = self
         .adapter
         .is_powered()
         .await
         .map_err(|e| AdvertiseError::RadioUnavailable(e.to_string()))?;
      if !powered {
         return Err(AdvertiseError::RadioUnavailable(format!(
            "adapter {} is powered off",
            self.adapter.name()
         )));
      }

      self.serve(identity).await?;
      let handle = self
         .adapter
         .advertise(self.advertisement(identity, profile))
         .await
         .map_err(|e| AdvertiseError::Registration(e.to_string()))?;

      *self.advertisement.lock() = Some(handle);
      *self.advertised.lock() = Some(identity.clone());
      Ok(())
   }

   fn stop_advertise(&self) {
      // Dropping the handle unregisters the advertisement.
      if self.advertisement.lock().take().is_some() {
         debug!("Advertisement withdrawn");
      }
   }

   async fn set_advertising_profile(
      &self,
      profile: AdvertisingProfile,
   ) -> std::result::Result<(), AdvertiseError> {
      let Some(identity) = self.advertised.lock().clone() else {
         return Ok(());
      };
      if self.advertisement.lock().take().is_none() {
         return Ok(());
      }

      let handle = self
         .adapter
         .advertise(self.advertisement(&identity, profile))
         .await
         .map_err(|e| AdvertiseError::Registration(e.to_string()))?;
      *self.advertisement.lock() = Some(handle);
      Ok(())
   }

   async fn notify_subscriber(
      &self,
      central: &SubscriberHandle,
      payload: &[u8],
   ) -> std::result::Result<(), NotifyError> {
      let writer = self
         .writers
         .lock()
         .get(central.id())
         .cloned()
         .ok_or(NotifyError::NotSubscribed)?;

      // A payload goes out as a single notification.
      if payload.len() > writer.mtu() {
         return Err(NotifyError::PayloadTooLarge {
            len: payload.len(),
            mtu: writer.mtu(),
         });
      }

      if let Err(e) = writer.send(payload).await {
         // The central stopped listening.
         if self.writers.lock().remove(central.id()).is_some() {
            let _ = self
               .sub_tx
               .unbounded_send(SubscriptionEvent::Unsubscribed(central.clone()));
         }
         return Err(NotifyError::Transport(e.to_string()));
      }
      Ok(())
   }

   fn subscription_events(&self) -> BoxStream<'static, SubscriptionEvent> {
      match self.sub_rx.lock().take() {
         Some(rx) => rx.boxed(),
         None => futures::stream::empty().boxed(),
      }
   }
}

