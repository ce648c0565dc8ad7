//! Transport capabilities consumed by the sessions.
//!
//! The sessions never talk to a Bluetooth stack directly. They drive one of
//! the traits below, which a platform backend (see [`bluez`]) implements.
//! Every method either returns a future that resolves once the stack has an
//! answer, or is fire-and-forget.

use std::{fmt, future::Future};

use futures::stream::BoxStream;
use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   error::{AdvertiseError, ConnectError, NotifyError, ResolveError, SubscribeError},
   identity::ServiceIdentity,
};

pub mod bluez;
#[cfg(test)]
pub(crate) mod mock;

/// Raw notification bytes, passed through untouched.
pub type Payload = SmallVec<[u8; 32]>;

/// Opaque identity of a remote device as reported by the stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(SmolStr);

impl PeerId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for PeerId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
   pub id: PeerId,
   pub name: Option<SmolStr>,
   pub rssi: Option<i16>,
}

impl DiscoveredPeripheral {
   pub fn new(id: PeerId) -> Self {
      Self {
         id,
         name: None,
         rssi: None,
      }
   }
}

/// A connected remote peripheral. Only valid until the link goes down.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
   id: PeerId,
}

impl PeripheralHandle {
   pub fn new(id: PeerId) -> Self {
      Self { id }
   }

   pub fn id(&self) -> &PeerId {
      &self.id
   }
}

impl fmt::Display for PeripheralHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      self.id.fmt(f)
   }
}

/// A remote central subscribed to the local characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberHandle {
   id: PeerId,
}

impl SubscriberHandle {
   pub fn new(id: PeerId) -> Self {
      Self { id }
   }

   pub fn id(&self) -> &PeerId {
      &self.id
   }
}

impl fmt::Display for SubscriberHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      self.id.fmt(f)
   }
}

/// Outcome of resolving the requested characteristics on a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCharacteristics {
   pub found: Vec<Uuid>,
   pub missing: Vec<Uuid>,
}

/// Advertising duty cycle hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum AdvertisingProfile {
   #[default]
   Foreground,
   Background,
}

/// Subscription changes pushed by the peripheral-side stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
   Subscribed(SubscriberHandle),
   Unsubscribed(SubscriberHandle),
   Disconnected(SubscriberHandle),
}

/// Stack primitives needed by [`crate::central::CentralSession`].
pub trait CentralTransport: Send + Sync + 'static {
   /// Starts scanning for peripherals advertising `service`.
   ///
   /// Dropping the returned stream stops the scan.
   fn scan(
      &self,
      service: Uuid,
   ) -> impl Future<Output = Result<BoxStream<'static, DiscoveredPeripheral>, ConnectError>> + Send;

   fn connect(
      &self,
      peripheral: &DiscoveredPeripheral,
   ) -> impl Future<Output = Result<PeripheralHandle, ConnectError>> + Send;

   /// Looks up `characteristics` within `service` on the connected peer.
   fn discover(
      &self,
      handle: &PeripheralHandle,
      service: Uuid,
      characteristics: &[Uuid],
   ) -> impl Future<Output = Result<ResolvedCharacteristics, ResolveError>> + Send;

   fn set_notify(
      &self,
      handle: &PeripheralHandle,
      characteristic: Uuid,
      enabled: bool,
   ) -> impl Future<Output = Result<(), SubscribeError>> + Send;

   /// Value notifications for a characteristic with notify enabled.
   fn value_updates(
      &self,
      handle: &PeripheralHandle,
      characteristic: Uuid,
   ) -> impl Future<Output = Result<BoxStream<'static, Payload>, SubscribeError>> + Send;

   fn disconnect(&self, handle: &PeripheralHandle);

   /// Resolves once the peer drops the link on its own.
   fn link_lost(&self, handle: &PeripheralHandle) -> impl Future<Output = ()> + Send;
}

/// Stack primitives needed by [`crate::peripheral::PeripheralSession`].
pub trait PeripheralTransport: Send + Sync + 'static {
   fn advertise(
      &self,
      identity: &ServiceIdentity,
      profile: AdvertisingProfile,
   ) -> impl Future<Output = Result<(), AdvertiseError>> + Send;

   fn stop_advertise(&self);

   /// Re-applies advertising parameters while advertising.
   fn set_advertising_profile(
      &self,
      profile: AdvertisingProfile,
   ) -> impl Future<Output = Result<(), AdvertiseError>> + Send;

   fn notify_subscriber(
      &self,
      central: &SubscriberHandle,
      payload: &[u8],
   ) -> impl Future<Output = Result<(), NotifyError>> + Send;

   /// Subscription changes; taken once by the session.
   fn subscription_events(&self) -> BoxStream<'static, SubscriptionEvent>;
}
