//! Central role session.
//!
//! A [`CentralSession`] owns one outbound connection: it scans for the
//! configured service, connects to the first match, subscribes to the
//! configured characteristics and forwards value notifications. All state
//! lives in an actor task; the handle only enqueues commands.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use crossbeam::atomic::AtomicCell;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};
use uuid::Uuid;

use crate::{
   config::Timeouts,
   error::{
      CharacteristicError, ConnectError, LinkError, ResolveError, Result, SubscribeError,
   },
   event::{CentralEvent, EventSender},
   identity::ServiceIdentity,
   transport::{
      CentralTransport, DiscoveredPeripheral, Payload, PeripheralHandle, ResolvedCharacteristics,
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Lifecycle of a central session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CentralState {
   Idle,
   Scanning,
   Connecting,
   Connected,
   Subscribing,
   Subscribed,
   Disconnecting,
}

/// Per-characteristic subscription progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SubscriptionStatus {
   Pending,
   Subscribed,
   Failed,
}

/// Identifies which connection attempt and which (un)subscribe pass a
/// transport result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
   epoch: u64,
   round: u64,
}

// === Commands ===

type Reply = oneshot::Sender<Result<()>>;

#[derive(Debug)]
enum CentralCommand {
   // User commands
   Connect(Reply),
   Subscribe(Reply),
   Unsubscribe(Reply),
   Disconnect(Reply),
   GetSubscriptions(oneshot::Sender<HashMap<Uuid, SubscriptionStatus>>),

   // Transport events
   Discovered {
      epoch: u64,
      peripheral: DiscoveredPeripheral,
   },
   ConnectSucceeded {
      epoch: u64,
      handle: PeripheralHandle,
   },
   ConnectFailed {
      epoch: u64,
      error: ConnectError,
   },
   LinkLost {
      epoch: u64,
   },
   Resolved {
      stamp: Stamp,
      result: std::result::Result<ResolvedCharacteristics, ResolveError>,
   },
   NotifyEnabled {
      stamp: Stamp,
      characteristic: Uuid,
      result: std::result::Result<(), SubscribeError>,
   },
   NotifyDisabled {
      stamp: Stamp,
      characteristic: Uuid,
      result: std::result::Result<(), SubscribeError>,
   },
   UnsubscribeTimedOut {
      stamp: Stamp,
   },
   Value {
      epoch: u64,
      characteristic: Uuid,
      payload: Payload,
   },
}

// === Session handle ===

/// Handle to a central session.
///
/// Operations return as soon as the session has accepted them and started
/// the transport request; outcomes are delivered as [`CentralEvent`]s.
/// Dropping the handle disconnects.
pub struct CentralSession {
   inbox: mpsc::Sender<CentralCommand>,
   state: Arc<AtomicCell<CentralState>>,
   identity: ServiceIdentity,
}

impl CentralSession {
   /// Spawns the session actor. Must be called within a tokio runtime.
   pub fn new<T: CentralTransport>(
      identity: ServiceIdentity,
      transport: Arc<T>,
      event_tx: EventSender,
      timeouts: Timeouts,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let state = Arc::new(AtomicCell::new(CentralState::Idle));
      let actor = CentralActor::new(
         identity.clone(),
         transport,
         event_tx,
         timeouts,
         state.clone(),
         command_rx,
      );
      tokio::spawn(actor.run());
      Self {
         inbox: command_tx,
         state,
         identity,
      }
   }

   /// Scans for the service and connects to the first match.
   pub async fn connect(&self) -> Result<()> {
      self.request(CentralCommand::Connect).await
   }

   /// Subscribes to every configured characteristic not yet subscribed.
   pub async fn subscribe(&self) -> Result<()> {
      self.request(CentralCommand::Subscribe).await
   }

   pub async fn unsubscribe(&self) -> Result<()> {
      self.request(CentralCommand::Unsubscribe).await
   }

   /// Cancels whatever is in flight and drops the link. No-op when idle.
   pub async fn disconnect(&self) -> Result<()> {
      self.request(CentralCommand::Disconnect).await
   }

   pub fn state(&self) -> CentralState {
      self.state.load()
   }

   pub fn identity(&self) -> &ServiceIdentity {
      &self.identity
   }

   /// Snapshot of the subscription status of each characteristic.
   pub async fn subscriptions(&self) -> HashMap<Uuid, SubscriptionStatus> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(CentralCommand::GetSubscriptions(tx))
         .await
         .is_err()
      {
         return HashMap::new();
      }
      rx.await.unwrap_or_default()
   }

   async fn request(&self, command: impl FnOnce(Reply) -> CentralCommand) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| LinkError::SessionShutdown)?;
      rx.await.map_err(|_| LinkError::SessionShutdown)?
   }
}

// === Session actor ===

struct CentralActor<T> {
   identity: ServiceIdentity,
   transport: Arc<T>,
   event_tx: EventSender,
   timeouts: Timeouts,
   shared_state: Arc<AtomicCell<CentralState>>,
   command_rx: mpsc::Receiver<CentralCommand>,
   loopback_rx: mpsc::Receiver<CentralCommand>,
   loopback_tx: mpsc::Sender<CentralCommand>,

   // State
   state: CentralState,
   epoch: u64,
   round: u64,
   peripheral: Option<PeripheralHandle>,
   subscriptions: HashMap<Uuid, SubscriptionStatus>,
   pending_unsubscribe: Option<HashSet<Uuid>>,
   /// A subscribe pass is waiting on resolution or notify acknowledgements.
   subscribe_pass: bool,

   // In-flight work
   link_task: Option<JoinHandle<()>>,
   watch_task: Option<JoinHandle<()>>,
   round_tasks: Vec<JoinHandle<()>>,
   notify_tasks: HashMap<Uuid, JoinHandle<()>>,
}

impl<T: CentralTransport> CentralActor<T> {
   fn new(
      identity: ServiceIdentity,
      transport: Arc<T>,
      event_tx: EventSender,
      timeouts: Timeouts,
      shared_state: Arc<AtomicCell<CentralState>>,
      command_rx: mpsc::Receiver<CentralCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         identity,
         transport,
         event_tx,
         timeouts,
         shared_state,
         command_rx,
         loopback_rx,
         loopback_tx,
         state: CentralState::Idle,
         epoch: 0,
         round: 0,
         peripheral: None,
         subscriptions: HashMap::new(),
         pending_unsubscribe: None,
         subscribe_pass: false,
         link_task: None,
         watch_task: None,
         round_tasks: Vec::new(),
         notify_tasks: HashMap::new(),
      }
   }

   async fn run(mut self) {
      info!("Central session for {} starting", self.identity);

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     debug!("Central session handle dropped");
                     break;
                 };
                 self.handle_command(cmd);
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd);
             }
         }
      }

      self.cleanup();
   }

   fn handle_command(&mut self, cmd: CentralCommand) {
      match cmd {
         CentralCommand::Connect(reply) => {
            let _ = reply.send(self.start_connect());
         },
         CentralCommand::Subscribe(reply) => {
            let _ = reply.send(self.start_subscribe());
         },
         CentralCommand::Unsubscribe(reply) => {
            let _ = reply.send(self.start_unsubscribe());
         },
         CentralCommand::Disconnect(reply) => {
            self.handle_disconnect();
            let _ = reply.send(Ok(()));
         },
         CentralCommand::GetSubscriptions(reply) => {
            let _ = reply.send(self.subscriptions.clone());
         },
         CentralCommand::Discovered { epoch, peripheral } => {
            self.handle_discovered(epoch, peripheral);
         },
         CentralCommand::ConnectSucceeded { epoch, handle } => {
            self.handle_connect_succeeded(epoch, handle);
         },
         CentralCommand::ConnectFailed { epoch, error } => {
            self.handle_connect_failed(epoch, error);
         },
         CentralCommand::LinkLost { epoch } => {
            self.handle_link_lost(epoch);
         },
         CentralCommand::Resolved { stamp, result } => {
            self.handle_resolved(stamp, result);
         },
         CentralCommand::NotifyEnabled {
            stamp,
            characteristic,
            result,
         } => {
            self.handle_notify_enabled(stamp, characteristic, result);
         },
         CentralCommand::NotifyDisabled {
            stamp,
            characteristic,
            result,
         } => {
            self.handle_notify_disabled(stamp, characteristic, result);
         },
         CentralCommand::UnsubscribeTimedOut { stamp } => {
            self.handle_unsubscribe_timeout(stamp);
         },
         CentralCommand::Value {
            epoch,
            characteristic,
            payload,
         } => {
            self.handle_value(epoch, characteristic, payload);
         },
      }
   }

   fn set_state(&mut self, state: CentralState) {
      if self.state != state {
         debug!("Central {}: {} -> {state}", self.identity.name(), self.state);
      }
      self.state = state;
      self.shared_state.store(state);
   }

   fn emit(&self, event: CentralEvent) {
      self.event_tx.emit(event.into());
   }

   const fn stamp(&self) -> Stamp {
      Stamp {
         epoch: self.epoch,
         round: self.round,
      }
   }

   fn is_current(&self, stamp: Stamp) -> bool {
      stamp == self.stamp()
   }

   fn abort_round_tasks(&mut self) {
      for handle in self.round_tasks.drain(..) {
         handle.abort();
      }
   }

   // === Connection ===

   fn start_connect(&mut self) -> Result<()> {
      if self.state != CentralState::Idle {
         return Err(LinkError::invalid_state("connect", self.state));
      }

      self.epoch += 1;
      self.set_state(CentralState::Scanning);
      info!("Scanning for {}", self.identity);

      let epoch = self.epoch;
      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      let service = self.identity.service_uuid();
      let scan_timeout = self.timeouts.scan;
      self.link_task = Some(tokio::spawn(async move {
         let cmd = match find_peripheral(&*transport, service, scan_timeout).await {
            Ok(peripheral) => CentralCommand::Discovered { epoch, peripheral },
            Err(error) => CentralCommand::ConnectFailed { epoch, error },
         };
         let _ = loopback.send(cmd).await;
      }));
      Ok(())
   }

   fn handle_discovered(&mut self, epoch: u64, peripheral: DiscoveredPeripheral) {
      if epoch != self.epoch || self.state != CentralState::Scanning {
         debug!("Ignoring stale discovery of {}", peripheral.id);
         return;
      }

      info!(
         "Found {} ({}), connecting",
         peripheral.id,
         peripheral.name.as_deref().unwrap_or("unnamed")
      );
      self.set_state(CentralState::Connecting);

      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      let connect_timeout = self.timeouts.connect;
      self.link_task = Some(tokio::spawn(async move {
         let cmd = match time::timeout(connect_timeout, transport.connect(&peripheral)).await {
            Ok(Ok(handle)) => CentralCommand::ConnectSucceeded { epoch, handle },
            Ok(Err(error)) => CentralCommand::ConnectFailed { epoch, error },
            Err(_) => CentralCommand::ConnectFailed {
               epoch,
               error: ConnectError::Timeout,
            },
         };
         let _ = loopback.send(cmd).await;
      }));
   }

   fn handle_connect_succeeded(&mut self, epoch: u64, handle: PeripheralHandle) {
      if epoch != self.epoch || self.state != CentralState::Connecting {
         warn!("Discarding late connection to {handle}");
         self.transport.disconnect(&handle);
         return;
      }

      self.link_task = None;
      self.subscriptions.clear();
      self.peripheral = Some(handle.clone());

      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      let watched = handle.clone();
      self.watch_task = Some(tokio::spawn(async move {
         transport.link_lost(&watched).await;
         let _ = loopback.send(CentralCommand::LinkLost { epoch }).await;
      }));

      self.set_state(CentralState::Connected);
      info!("Connected to {handle}");
      self.emit(CentralEvent::Connected(handle));
   }

   fn handle_connect_failed(&mut self, epoch: u64, error: ConnectError) {
      let attempting = matches!(self.state, CentralState::Scanning | CentralState::Connecting);
      if epoch != self.epoch || !attempting {
         debug!("Ignoring stale connect failure: {error}");
         return;
      }

      warn!("Failed to connect to {}: {error}", self.identity);
      self.link_task = None;
      self.set_state(CentralState::Idle);
      self.emit(CentralEvent::ConnectFailed(error));
   }

   fn handle_link_lost(&mut self, epoch: u64) {
      if epoch != self.epoch || self.peripheral.is_none() {
         return;
      }

      if let Some(handle) = &self.peripheral {
         warn!("Link to {handle} lost");
      }
      self.teardown();
      self.emit(CentralEvent::Disconnected);
   }

   fn handle_disconnect(&mut self) {
      if self.state == CentralState::Idle {
         debug!("Disconnect requested while idle");
         return;
      }

      info!("Disconnecting from {} (was {})", self.identity, self.state);
      self.teardown();
      self.emit(CentralEvent::Disconnected);
   }

   /// Cancels all in-flight work and releases the peripheral.
   fn teardown(&mut self) {
      self.epoch += 1;
      self.round += 1;

      if let Some(handle) = self.link_task.take() {
         handle.abort();
      }
      if let Some(handle) = self.watch_task.take() {
         handle.abort();
      }
      self.abort_round_tasks();
      for (_, handle) in self.notify_tasks.drain() {
         handle.abort();
      }

      self.set_state(CentralState::Disconnecting);
      if let Some(handle) = self.peripheral.take() {
         self.transport.disconnect(&handle);
      }
      self.subscriptions.clear();
      self.pending_unsubscribe = None;
      self.subscribe_pass = false;
      self.set_state(CentralState::Idle);
   }

   // === Subscription ===

   fn start_subscribe(&mut self) -> Result<()> {
      match self.state {
         CentralState::Connected => {},
         CentralState::Subscribed if self.pending_unsubscribe.is_none() => {
            if self.subscribe_pass {
               debug!("Retry already in progress for {}", self.identity);
               return Ok(());
            }
         },
         state => return Err(LinkError::invalid_state("subscribe", state)),
      }
      let Some(handle) = self.peripheral.clone() else {
         return Err(LinkError::invalid_state("subscribe", "no peripheral is attached"));
      };

      let targets: Vec<Uuid> = self
         .identity
         .characteristic_uuids()
         .iter()
         .copied()
         .filter(|c| self.subscriptions.get(c) != Some(&SubscriptionStatus::Subscribed))
         .collect();

      if targets.is_empty() {
         if self.state == CentralState::Connected {
            info!("No characteristics configured for {}, subscription is vacuous", self.identity);
            self.set_state(CentralState::Subscribed);
            self.emit(CentralEvent::Subscribed);
         }
         return Ok(());
      }

      self.round += 1;
      self.abort_round_tasks();
      for c in &targets {
         self.subscriptions.insert(*c, SubscriptionStatus::Pending);
      }
      self.subscribe_pass = true;
      // A retry keeps the session subscribed so live characteristics keep delivering.
      if self.state == CentralState::Connected {
         self.set_state(CentralState::Subscribing);
      }
      info!("Resolving {} characteristic(s) on {handle}", targets.len());

      let stamp = self.stamp();
      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      let service = self.identity.service_uuid();
      self.round_tasks.push(tokio::spawn(async move {
         let result = transport.discover(&handle, service, &targets).await;
         let _ = loopback
            .send(CentralCommand::Resolved { stamp, result })
            .await;
      }));
      Ok(())
   }

   fn handle_resolved(
      &mut self,
      stamp: Stamp,
      result: std::result::Result<ResolvedCharacteristics, ResolveError>,
   ) {
      if !self.is_current(stamp) || !self.subscribe_pass {
         debug!("Ignoring stale resolution result");
         return;
      }

      let pending = self.pending_characteristics();
      match result {
         Err(error) => {
            warn!("Service resolution failed on {}: {error}", self.identity);
            for c in pending {
               self.fail_characteristic(c, error.clone().into());
            }
         },
         Ok(resolved) => {
            for c in pending {
               if resolved.found.contains(&c) {
                  self.enable_notify(stamp, c);
               } else {
                  self.fail_characteristic(c, ResolveError::CharacteristicNotFound(c).into());
               }
            }
         },
      }

      self.finish_subscribe_if_settled();
   }

   fn enable_notify(&mut self, stamp: Stamp, characteristic: Uuid) {
      let Some(handle) = self.peripheral.clone() else {
         return;
      };
      debug!("Enabling notifications for {characteristic}");

      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      let task = tokio::spawn(async move {
         let updates = match transport.set_notify(&handle, characteristic, true).await {
            Ok(()) => transport.value_updates(&handle, characteristic).await,
            Err(e) => Err(e),
         };
         let mut updates = match updates {
            Ok(updates) => {
               let _ = loopback
                  .send(CentralCommand::NotifyEnabled {
                     stamp,
                     characteristic,
                     result: Ok(()),
                  })
                  .await;
               updates
            },
            Err(e) => {
               let _ = loopback
                  .send(CentralCommand::NotifyEnabled {
                     stamp,
                     characteristic,
                     result: Err(e),
                  })
                  .await;
               return;
            },
         };

         while let Some(payload) = updates.next().await {
            debug!("← {characteristic}: {}", hex::encode(&payload));
            let value = CentralCommand::Value {
               epoch: stamp.epoch,
               characteristic,
               payload,
            };
            if loopback.send(value).await.is_err() {
               break;
            }
         }
         debug!("Value stream for {characteristic} ended");
      });

      if let Some(previous) = self.notify_tasks.insert(characteristic, task) {
         previous.abort();
      }
   }

   fn handle_notify_enabled(
      &mut self,
      stamp: Stamp,
      characteristic: Uuid,
      result: std::result::Result<(), SubscribeError>,
   ) {
      if !self.is_current(stamp) || !self.subscribe_pass {
         debug!("Ignoring stale notify acknowledgement for {characteristic}");
         return;
      }

      match result {
         Ok(()) => {
            debug!("Subscribed to {characteristic}");
            self
               .subscriptions
               .insert(characteristic, SubscriptionStatus::Subscribed);
         },
         Err(e) => {
            self.notify_tasks.remove(&characteristic);
            self.fail_characteristic(characteristic, e.into());
         },
      }

      self.finish_subscribe_if_settled();
   }

   fn fail_characteristic(&mut self, characteristic: Uuid, error: CharacteristicError) {
      warn!("Request for characteristic {characteristic} failed: {error}");
      self
         .subscriptions
         .insert(characteristic, SubscriptionStatus::Failed);
      self.emit(CentralEvent::CharacteristicRequestFailed {
         characteristic,
         error,
      });
   }

   fn pending_characteristics(&self) -> Vec<Uuid> {
      self
         .identity
         .characteristic_uuids()
         .iter()
         .copied()
         .filter(|c| self.subscriptions.get(c) == Some(&SubscriptionStatus::Pending))
         .collect()
   }

   fn finish_subscribe_if_settled(&mut self) {
      if !self.subscribe_pass
         || self
            .subscriptions
            .values()
            .any(|s| *s == SubscriptionStatus::Pending)
      {
         return;
      }

      let subscribed = self
         .subscriptions
         .values()
         .filter(|s| **s == SubscriptionStatus::Subscribed)
         .count();
      self.subscribe_pass = false;
      if self.state == CentralState::Subscribed {
         info!(
            "Retry finished, {subscribed}/{} characteristic(s) subscribed on {}",
            self.identity.characteristic_uuids().len(),
            self.identity
         );
      } else if subscribed > 0 {
         info!(
            "Subscribed to {subscribed}/{} characteristic(s) on {}",
            self.identity.characteristic_uuids().len(),
            self.identity
         );
         self.set_state(CentralState::Subscribed);
         self.emit(CentralEvent::Subscribed);
      } else {
         warn!("No characteristic on {} could be subscribed", self.identity);
         self.set_state(CentralState::Connected);
      }
   }

   fn start_unsubscribe(&mut self) -> Result<()> {
      if self.state != CentralState::Subscribed {
         return Err(LinkError::invalid_state("unsubscribe", self.state));
      }
      if self.pending_unsubscribe.is_some() {
         return Ok(());
      }
      let Some(handle) = self.peripheral.clone() else {
         return Err(LinkError::invalid_state("unsubscribe", "no peripheral is attached"));
      };

      self.round += 1;
      self.abort_round_tasks();
      if self.subscribe_pass {
         self.subscribe_pass = false;
         for c in self.pending_characteristics() {
            if let Some(task) = self.notify_tasks.remove(&c) {
               task.abort();
            }
         }
      }

      let subscribed: Vec<Uuid> = self
         .identity
         .characteristic_uuids()
         .iter()
         .copied()
         .filter(|c| self.subscriptions.get(c) == Some(&SubscriptionStatus::Subscribed))
         .collect();
      for c in &subscribed {
         if let Some(task) = self.notify_tasks.remove(c) {
            task.abort();
         }
      }

      if subscribed.is_empty() {
         self.complete_unsubscribe();
         return Ok(());
      }

      info!("Unsubscribing from {} characteristic(s)", subscribed.len());
      self.pending_unsubscribe = Some(subscribed.iter().copied().collect());

      let stamp = self.stamp();
      for characteristic in subscribed {
         let transport = self.transport.clone();
         let loopback = self.loopback_tx.clone();
         let handle = handle.clone();
         self.round_tasks.push(tokio::spawn(async move {
            let result = transport.set_notify(&handle, characteristic, false).await;
            let _ = loopback
               .send(CentralCommand::NotifyDisabled {
                  stamp,
                  characteristic,
                  result,
               })
               .await;
         }));
      }

      let loopback = self.loopback_tx.clone();
      let limit = self.timeouts.unsubscribe;
      self.round_tasks.push(tokio::spawn(async move {
         time::sleep(limit).await;
         let _ = loopback
            .send(CentralCommand::UnsubscribeTimedOut { stamp })
            .await;
      }));
      Ok(())
   }

   fn handle_notify_disabled(
      &mut self,
      stamp: Stamp,
      characteristic: Uuid,
      result: std::result::Result<(), SubscribeError>,
   ) {
      if !self.is_current(stamp) {
         return;
      }
      let Some(pending) = self.pending_unsubscribe.as_mut() else {
         return;
      };

      pending.remove(&characteristic);
      let settled = pending.is_empty();
      if let Err(e) = result {
         warn!("Failed to disable notifications for {characteristic}: {e}");
         self.emit(CentralEvent::CharacteristicRequestFailed {
            characteristic,
            error: e.into(),
         });
      }
      if settled {
         self.complete_unsubscribe();
      }
   }

   fn handle_unsubscribe_timeout(&mut self, stamp: Stamp) {
      if !self.is_current(stamp) {
         return;
      }
      if let Some(pending) = &self.pending_unsubscribe {
         warn!(
            "{} characteristic(s) did not confirm unsubscribe within {:?}, assuming done",
            pending.len(),
            self.timeouts.unsubscribe
         );
         self.complete_unsubscribe();
      }
   }

   fn complete_unsubscribe(&mut self) {
      self.pending_unsubscribe = None;
      self.abort_round_tasks();
      for (_, handle) in self.notify_tasks.drain() {
         handle.abort();
      }
      self.subscriptions.clear();
      self.set_state(CentralState::Connected);
      info!("Unsubscribed from {}", self.identity);
      self.emit(CentralEvent::Unsubscribed);
   }

   fn handle_value(&mut self, epoch: u64, characteristic: Uuid, payload: Payload) {
      let deliverable = epoch == self.epoch
         && self.state == CentralState::Subscribed
         && self.pending_unsubscribe.is_none()
         && self.subscriptions.get(&characteristic) == Some(&SubscriptionStatus::Subscribed);
      if !deliverable {
         debug!("Dropping value for {characteristic} while {}", self.state);
         return;
      }
      self.emit(CentralEvent::ValueUpdate {
         characteristic,
         payload,
      });
   }

   fn cleanup(&mut self) {
      if self.state != CentralState::Idle {
         info!("Central session released while {}, disconnecting", self.state);
         self.teardown();
         self.emit(CentralEvent::Disconnected);
      }
   }
}

async fn find_peripheral<T: CentralTransport>(
   transport: &T,
   service: Uuid,
   scan_timeout: Option<Duration>,
) -> std::result::Result<DiscoveredPeripheral, ConnectError> {
   let mut scan = transport.scan(service).await?;
   let first = match scan_timeout {
      Some(limit) => time::timeout(limit, scan.next())
         .await
         .map_err(|_| ConnectError::ScanTimeout)?,
      None => scan.next().await,
   };
   first.ok_or(ConnectError::ScanEnded)
}
