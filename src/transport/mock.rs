//! Scripted in-memory transport for session tests.

use std::collections::{HashMap, HashSet};

use futures::{
   StreamExt,
   channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
   future,
   stream::{self, BoxStream},
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{
   AdvertisingProfile, CentralTransport, DiscoveredPeripheral, Payload, PeerId, PeripheralHandle,
   PeripheralTransport, ResolvedCharacteristics, SubscriberHandle, SubscriptionEvent,
};
use crate::{
   error::{AdvertiseError, ConnectError, NotifyError, ResolveError, SubscribeError},
   identity::ServiceIdentity,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
   Scan(Uuid),
   Connect(PeerId),
   Discover(Vec<Uuid>),
   SetNotify(Uuid, bool),
   Disconnect(PeerId),
   Advertise(AdvertisingProfile),
   StopAdvertise,
   SetProfile(AdvertisingProfile),
   Notify(PeerId, Vec<u8>),
}

#[derive(Debug, Clone)]
pub(crate) enum ScanBehavior {
   /// Yields the peripheral, then keeps scanning.
   Find(DiscoveredPeripheral),
   /// Never finds anything.
   Silent,
   /// Stream ends immediately.
   Ends,
   Fail(ConnectError),
}

#[derive(Debug, Clone)]
pub(crate) enum ConnectBehavior {
   Succeed,
   Fail(ConnectError),
   /// Succeeds once [`MockTransport::open_gate`] is called.
   Gated,
}

pub(crate) struct MockTransport {
   calls: Mutex<Vec<Call>>,
   scan: Mutex<ScanBehavior>,
   connect: Mutex<ConnectBehavior>,
   gate: Notify,
   link: Notify,
   resolve_error: Mutex<Option<ResolveError>>,
   missing: Mutex<HashSet<Uuid>>,
   reject_notify: Mutex<HashSet<Uuid>>,
   gated_enable: Mutex<HashSet<Uuid>>,
   enable_gate: Notify,
   hang_disable: Mutex<HashSet<Uuid>>,
   values: Mutex<HashMap<Uuid, UnboundedSender<Payload>>>,
   advertise_error: Mutex<Option<AdvertiseError>>,
   advertise_gated: Mutex<bool>,
   advertise_gate: Notify,
   profile_error: Mutex<Option<AdvertiseError>>,
   notify_failures: Mutex<HashSet<PeerId>>,
   mtus: Mutex<HashMap<PeerId, usize>>,
   sub_tx: UnboundedSender<SubscriptionEvent>,
   sub_rx: Mutex<Option<UnboundedReceiver<SubscriptionEvent>>>,
}

impl MockTransport {
   pub(crate) fn new() -> Self {
      let (sub_tx, sub_rx) = mpsc::unbounded();
      Self {
         calls: Mutex::new(Vec::new()),
         scan: Mutex::new(ScanBehavior::Find(peripheral("P"))),
         connect: Mutex::new(ConnectBehavior::Succeed),
         gate: Notify::new(),
         link: Notify::new(),
         resolve_error: Mutex::new(None),
         missing: Mutex::new(HashSet::new()),
         reject_notify: Mutex::new(HashSet::new()),
         gated_enable: Mutex::new(HashSet::new()),
         enable_gate: Notify::new(),
         hang_disable: Mutex::new(HashSet::new()),
         values: Mutex::new(HashMap::new()),
         advertise_error: Mutex::new(None),
         advertise_gated: Mutex::new(false),
         advertise_gate: Notify::new(),
         profile_error: Mutex::new(None),
         notify_failures: Mutex::new(HashSet::new()),
         mtus: Mutex::new(HashMap::new()),
         sub_tx,
         sub_rx: Mutex::new(Some(sub_rx)),
      }
   }

   pub(crate) fn calls(&self) -> Vec<Call> {
      self.calls.lock().clone()
   }

   pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
      self.calls.lock().iter().filter(|c| pred(c)).count()
   }

   pub(crate) fn set_scan(&self, behavior: ScanBehavior) {
      *self.scan.lock() = behavior;
   }

   pub(crate) fn set_connect(&self, behavior: ConnectBehavior) {
      *self.connect.lock() = behavior;
   }

   pub(crate) fn open_gate(&self) {
      self.gate.notify_one();
   }

   pub(crate) fn drop_link(&self) {
      self.link.notify_one();
   }

   pub(crate) fn fail_resolve(&self, error: ResolveError) {
      *self.resolve_error.lock() = Some(error);
   }

   pub(crate) fn hide_characteristic(&self, uuid: Uuid) {
      self.missing.lock().insert(uuid);
   }

   pub(crate) fn reject_notify(&self, uuid: Uuid) {
      self.reject_notify.lock().insert(uuid);
   }

   /// Holds enable requests for `uuid` until [`MockTransport::open_enable_gate`].
   pub(crate) fn gate_enable(&self, uuid: Uuid) {
      self.gated_enable.lock().insert(uuid);
   }

   pub(crate) fn open_enable_gate(&self) {
      self.gated_enable.lock().clear();
      self.enable_gate.notify_waiters();
   }

   pub(crate) fn hang_disable(&self, uuid: Uuid) {
      self.hang_disable.lock().insert(uuid);
   }

   /// Pushes a value notification; returns `false` if nobody listens.
   pub(crate) fn push_value(&self, characteristic: Uuid, bytes: &[u8]) -> bool {
      self
         .values
         .lock()
         .get(&characteristic)
         .is_some_and(|tx| tx.unbounded_send(Payload::from_slice(bytes)).is_ok())
   }

   pub(crate) fn fail_advertise(&self, error: AdvertiseError) {
      *self.advertise_error.lock() = Some(error);
   }

   /// Holds advertise requests until [`MockTransport::open_advertise_gate`].
   pub(crate) fn gate_advertise(&self) {
      *self.advertise_gated.lock() = true;
   }

   pub(crate) fn open_advertise_gate(&self) {
      *self.advertise_gated.lock() = false;
      self.advertise_gate.notify_waiters();
   }

   /// Fails the next profile update.
   pub(crate) fn fail_profile(&self, error: AdvertiseError) {
      *self.profile_error.lock() = Some(error);
   }

   pub(crate) fn fail_notify_for(&self, central: &SubscriberHandle) {
      self.notify_failures.lock().insert(central.id().clone());
   }

   pub(crate) fn set_mtu(&self, central: &SubscriberHandle, mtu: usize) {
      self.mtus.lock().insert(central.id().clone(), mtu);
   }

   pub(crate) fn push_subscription(&self, event: SubscriptionEvent) {
      let _ = self.sub_tx.unbounded_send(event);
   }

   fn record(&self, call: Call) {
      self.calls.lock().push(call);
   }
}

pub(crate) fn peripheral(id: &str) -> DiscoveredPeripheral {
   DiscoveredPeripheral::new(PeerId::new(id))
}

impl CentralTransport for MockTransport {
   async fn scan(
      &self,
      service: Uuid,
   ) -> Result<BoxStream<'static, DiscoveredPeripheral>, ConnectError> {
      self.record(Call::Scan(service));
      let behavior = self.scan.lock().clone();
      match behavior {
         ScanBehavior::Find(p) => Ok(stream::iter([p]).chain(stream::pending()).boxed()),
         ScanBehavior::Silent => Ok(stream::pending().boxed()),
         ScanBehavior::Ends => Ok(stream::empty().boxed()),
         ScanBehavior::Fail(e) => Err(e),
      }
   }

   async fn connect(
      &self,
      peripheral: &DiscoveredPeripheral,
   ) -> Result<PeripheralHandle, ConnectError> {
      self.record(Call::Connect(peripheral.id.clone()));
      let behavior = self.connect.lock().clone();
      match behavior {
         ConnectBehavior::Succeed => Ok(PeripheralHandle::new(peripheral.id.clone())),
         ConnectBehavior::Fail(e) => Err(e),
         ConnectBehavior::Gated => {
            self.gate.notified().await;
            Ok(PeripheralHandle::new(peripheral.id.clone()))
         },
      }
   }

   async fn discover(
      &self,
      _handle: &PeripheralHandle,
      _service: Uuid,
      characteristics: &[Uuid],
   ) -> Result<ResolvedCharacteristics, ResolveError> {
      self.record(Call::Discover(characteristics.to_vec()));
      if let Some(e) = self.resolve_error.lock().clone() {
         return Err(e);
      }
      let hidden = self.missing.lock().clone();
      let (missing, found): (Vec<Uuid>, Vec<Uuid>) = characteristics
         .iter()
         .copied()
         .partition(|c| hidden.contains(c));
      Ok(ResolvedCharacteristics { found, missing })
   }

   async fn set_notify(
      &self,
      _handle: &PeripheralHandle,
      characteristic: Uuid,
      enabled: bool,
   ) -> Result<(), SubscribeError> {
      self.record(Call::SetNotify(characteristic, enabled));
      let gated = enabled && self.gated_enable.lock().contains(&characteristic);
      if gated {
         self.enable_gate.notified().await;
      }
      if enabled && self.reject_notify.lock().contains(&characteristic) {
         return Err(SubscribeError::Rejected("mock rejection".into()));
      }
      let hang = !enabled && self.hang_disable.lock().contains(&characteristic);
      if hang {
         future::pending::<()>().await;
      }
      Ok(())
   }

   async fn value_updates(
      &self,
      _handle: &PeripheralHandle,
      characteristic: Uuid,
   ) -> Result<BoxStream<'static, Payload>, SubscribeError> {
      let (tx, rx) = mpsc::unbounded();
      self.values.lock().insert(characteristic, tx);
      Ok(rx.boxed())
   }

   fn disconnect(&self, handle: &PeripheralHandle) {
      self.record(Call::Disconnect(handle.id().clone()));
   }

   async fn link_lost(&self, _handle: &PeripheralHandle) {
      self.link.notified().await;
   }
}

impl PeripheralTransport for MockTransport {
   async fn advertise(
      &self,
      _identity: &ServiceIdentity,
      profile: AdvertisingProfile,
   ) -> Result<(), AdvertiseError> {
      self.record(Call::Advertise(profile));
      let gated = *self.advertise_gated.lock();
      if gated {
         self.advertise_gate.notified().await;
      }
      match self.advertise_error.lock().take() {
         Some(e) => Err(e),
         None => Ok(()),
      }
   }

   fn stop_advertise(&self) {
      self.record(Call::StopAdvertise);
   }

   async fn set_advertising_profile(
      &self,
      profile: AdvertisingProfile,
   ) -> Result<(), AdvertiseError> {
      self.record(Call::SetProfile(profile));
      match self.profile_error.lock().take() {
         Some(e) => Err(e),
         None => Ok(()),
      }
   }

   async fn notify_subscriber(
      &self,
      central: &SubscriberHandle,
      payload: &[u8],
   ) -> Result<(), NotifyError> {
      self.record(Call::Notify(central.id().clone(), payload.to_vec()));
      if self.notify_failures.lock().contains(central.id()) {
         return Err(NotifyError::Disconnected);
      }
      let mtu = self.mtus.lock().get(central.id()).copied();
      if let Some(mtu) = mtu.filter(|mtu| payload.len() > *mtu) {
         return Err(NotifyError::PayloadTooLarge {
            len: payload.len(),
            mtu,
         });
      }
      Ok(())
   }

   fn subscription_events(&self) -> BoxStream<'static, SubscriptionEvent> {
      match self.sub_rx.lock().take() {
         Some(rx) => rx.boxed(),
         None => stream::empty().boxed(),
      }
   }
}
