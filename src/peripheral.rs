//! Peripheral role session.
//!
//! A [`PeripheralSession`] advertises one service exposing one notify
//! characteristic, tracks which centrals subscribed to it, and fans out
//! payloads to them.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use futures::{StreamExt, future};
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
};
use uuid::Uuid;

use crate::{
   error::{AdvertiseError, LinkError, NotifyError, Result},
   event::{EventSender, PeripheralEvent},
   identity::ServiceIdentity,
   subscribers::SubscriberSet,
   transport::{
      AdvertisingProfile, Payload, PeripheralTransport, SubscriberHandle, SubscriptionEvent,
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PeripheralState {
   Stopped,
   Advertising,
}

type Reply = oneshot::Sender<Result<()>>;

#[derive(Debug)]
enum PeripheralCommand {
   // User commands
   StartAdvertising(Reply),
   StopAdvertising(Reply),
   SetProfile {
      profile: AdvertisingProfile,
      reply: Reply,
   },
   Send {
      payload: Payload,
      reply: oneshot::Sender<Result<usize>>,
   },
   GetSubscribers(oneshot::Sender<Vec<SubscriberHandle>>),

   // Transport events
   AdvertiseResult {
      epoch: u64,
      result: std::result::Result<(), AdvertiseError>,
   },
   ProfileFailed {
      epoch: u64,
      error: AdvertiseError,
   },
   Subscription(SubscriptionEvent),
   NotifyFailed {
      central: SubscriberHandle,
      error: NotifyError,
   },
}

/// Handle to a peripheral session. Dropping it stops advertising.
pub struct PeripheralSession {
   inbox: mpsc::Sender<PeripheralCommand>,
   state: Arc<AtomicCell<PeripheralState>>,
   identity: ServiceIdentity,
   characteristic: Uuid,
}

impl PeripheralSession {
   /// Spawns the session actor. The identity must name exactly one
   /// characteristic.
   pub fn new<T: PeripheralTransport>(
      identity: ServiceIdentity,
      transport: Arc<T>,
      event_tx: EventSender,
   ) -> Result<Self> {
      let characteristic = identity.sole_characteristic().ok_or_else(|| {
         LinkError::InvalidIdentity(format!(
            "a peripheral exposes exactly one characteristic, {} configured",
            identity.characteristic_uuids().len()
         ))
      })?;

      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let state = Arc::new(AtomicCell::new(PeripheralState::Stopped));
      let actor =
         PeripheralActor::new(identity.clone(), transport, event_tx, state.clone(), command_rx);
      tokio::spawn(actor.run());

      Ok(Self {
         inbox: command_tx,
         state,
         identity,
         characteristic,
      })
   }

   /// Starts advertising. No-op if already advertising; failures arrive as
   /// [`PeripheralEvent::AdvertiseFailed`].
   pub async fn start_advertising(&self) -> Result<()> {
      self.request(PeripheralCommand::StartAdvertising).await
   }

   /// Stops advertising. Current subscribers are kept.
   pub async fn stop_advertising(&self) -> Result<()> {
      self.request(PeripheralCommand::StopAdvertising).await
   }

   pub fn is_advertising(&self) -> bool {
      self.state.load() == PeripheralState::Advertising
   }

   pub fn state(&self) -> PeripheralState {
      self.state.load()
   }

   /// Notifies every current subscriber with `payload`.
   ///
   /// Returns the number of centrals addressed. Per-central failures are
   /// reported as [`PeripheralEvent::NotifyFailed`] and do not affect the
   /// others.
   pub async fn send_to_subscribers(&self, payload: &[u8]) -> Result<usize> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(PeripheralCommand::Send {
            payload: Payload::from_slice(payload),
            reply: tx,
         })
         .await
         .map_err(|_| LinkError::SessionShutdown)?;
      rx.await.map_err(|_| LinkError::SessionShutdown)?
   }

   /// Switches to the low duty cycle advertising profile.
   pub async fn on_background(&self) -> Result<()> {
      self.set_profile(AdvertisingProfile::Background).await
   }

   pub async fn on_foreground(&self) -> Result<()> {
      self.set_profile(AdvertisingProfile::Foreground).await
   }

   pub async fn subscribers(&self) -> Vec<SubscriberHandle> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(PeripheralCommand::GetSubscribers(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub fn identity(&self) -> &ServiceIdentity {
      &self.identity
   }

   pub fn characteristic(&self) -> Uuid {
      self.characteristic
   }

   async fn set_profile(&self, profile: AdvertisingProfile) -> Result<()> {
      self
         .request(|reply| PeripheralCommand::SetProfile { profile, reply })
         .await
   }

   async fn request(&self, command: impl FnOnce(Reply) -> PeripheralCommand) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| LinkError::SessionShutdown)?;
      rx.await.map_err(|_| LinkError::SessionShutdown)?
   }
}

struct PeripheralActor<T> {
   identity: ServiceIdentity,
   transport: Arc<T>,
   event_tx: EventSender,
   shared_state: Arc<AtomicCell<PeripheralState>>,
   command_rx: mpsc::Receiver<PeripheralCommand>,
   loopback_rx: mpsc::Receiver<PeripheralCommand>,
   loopback_tx: mpsc::Sender<PeripheralCommand>,

   state: PeripheralState,
   epoch: u64,
   profile: AdvertisingProfile,
   subscribers: SubscriberSet,

   advertise_task: Option<JoinHandle<()>>,
   pump_task: Option<JoinHandle<()>>,
}

impl<T: PeripheralTransport> PeripheralActor<T> {
   fn new(
      identity: ServiceIdentity,
      transport: Arc<T>,
      event_tx: EventSender,
      shared_state: Arc<AtomicCell<PeripheralState>>,
      command_rx: mpsc::Receiver<PeripheralCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         identity,
         transport,
         event_tx,
         shared_state,
         command_rx,
         loopback_rx,
         loopback_tx,
         state: PeripheralState::Stopped,
         epoch: 0,
         profile: AdvertisingProfile::default(),
         subscribers: SubscriberSet::new(),
         advertise_task: None,
         pump_task: None,
      }
   }

   async fn run(mut self) {
      info!("Peripheral session for {} starting", self.identity);
      self.start_subscription_pump();

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     debug!("Peripheral session handle dropped");
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

   /// Forwards stack subscription changes into the actor.
   fn start_subscription_pump(&mut self) {
      let mut events = self.transport.subscription_events();
      let loopback = self.loopback_tx.clone();
      self.pump_task = Some(tokio::spawn(async move {
         while let Some(event) = events.next().await {
            if loopback
               .send(PeripheralCommand::Subscription(event))
               .await
               .is_err()
            {
               break;
            }
         }
         debug!("Subscription event stream ended");
      }));
   }

   fn handle_command(&mut self, cmd: PeripheralCommand) {
      match cmd {
         PeripheralCommand::StartAdvertising(reply) => {
            self.start_advertising();
            let _ = reply.send(Ok(()));
         },
         PeripheralCommand::StopAdvertising(reply) => {
            self.stop_advertising();
            let _ = reply.send(Ok(()));
         },
         PeripheralCommand::SetProfile { profile, reply } => {
            self.set_profile(profile);
            let _ = reply.send(Ok(()));
         },
         PeripheralCommand::Send { payload, reply } => {
            let _ = reply.send(Ok(self.fan_out(payload)));
         },
         PeripheralCommand::GetSubscribers(reply) => {
            let _ = reply.send(self.subscribers.snapshot());
         },
         PeripheralCommand::AdvertiseResult { epoch, result } => {
            self.handle_advertise_result(epoch, result);
         },
         PeripheralCommand::ProfileFailed { epoch, error } => {
            if epoch == self.epoch && self.state == PeripheralState::Advertising {
               warn!("Failed to apply {} advertising profile: {error}", self.profile);
               self.emit(PeripheralEvent::AdvertiseFailed(error));
            }
         },
         PeripheralCommand::Subscription(event) => {
            self.handle_subscription(event);
         },
         PeripheralCommand::NotifyFailed { central, error } => {
            warn!("Notify to {central} failed: {error}");
            self.emit(PeripheralEvent::NotifyFailed { central, error });
         },
      }
   }

   fn set_state(&mut self, state: PeripheralState) {
      if self.state != state {
         debug!("Peripheral {}: {} -> {state}", self.identity.name(), self.state);
      }
      self.state = state;
      self.shared_state.store(state);
   }

   fn emit(&self, event: PeripheralEvent) {
      self.event_tx.emit(event.into());
   }

   fn start_advertising(&mut self) {
      if self.state == PeripheralState::Advertising {
         debug!("Already advertising");
         return;
      }

      self.epoch += 1;
      self.set_state(PeripheralState::Advertising);
      info!("Advertising {} ({} profile)", self.identity, self.profile);

      let epoch = self.epoch;
      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      let identity = self.identity.clone();
      let profile = self.profile;
      self.advertise_task = Some(tokio::spawn(async move {
         let result = transport.advertise(&identity, profile).await;
         let _ = loopback
            .send(PeripheralCommand::AdvertiseResult { epoch, result })
            .await;
      }));
   }

   fn handle_advertise_result(
      &mut self,
      epoch: u64,
      result: std::result::Result<(), AdvertiseError>,
   ) {
      if epoch != self.epoch {
         if result.is_ok() && self.state == PeripheralState::Stopped {
            debug!("Withdrawing advertisement registered after stop");
            self.transport.stop_advertise();
         }
         return;
      }

      self.advertise_task = None;
      match result {
         Ok(()) => {
            info!("Advertising started");
            self.emit(PeripheralEvent::AdvertisingStarted);
         },
         Err(error) => {
            warn!("Failed to start advertising: {error}");
            self.set_state(PeripheralState::Stopped);
            self.emit(PeripheralEvent::AdvertiseFailed(error));
         },
      }
   }

   fn stop_advertising(&mut self) {
      if self.state == PeripheralState::Stopped {
         debug!("Advertising already stopped");
         return;
      }

      // A registration still in flight reports back with a stale epoch and
      // is withdrawn then.
      self.epoch += 1;
      self.advertise_task = None;
      self.transport.stop_advertise();
      self.set_state(PeripheralState::Stopped);
      info!(
         "Advertising stopped, {} subscriber(s) retained",
         self.subscribers.len()
      );
      self.emit(PeripheralEvent::AdvertisingStopped);
   }

   fn set_profile(&mut self, profile: AdvertisingProfile) {
      if self.profile == profile {
         return;
      }
      self.profile = profile;
      if self.state != PeripheralState::Advertising {
         debug!("Advertising profile set to {profile}, applied on next start");
         return;
      }

      info!("Switching advertising to {profile} profile");
      let epoch = self.epoch;
      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         if let Err(error) = transport.set_advertising_profile(profile).await {
            let _ = loopback
               .send(PeripheralCommand::ProfileFailed { epoch, error })
               .await;
         }
      });
   }

   /// Membership changes are idempotent; every transport report is
   /// forwarded as an event.
   fn handle_subscription(&mut self, event: SubscriptionEvent) {
      match event {
         SubscriptionEvent::Subscribed(central) => {
            if self.subscribers.insert(central.clone()) {
               info!("Central {central} subscribed");
            } else {
               debug!("Central {central} subscribed again");
            }
            self.emit(PeripheralEvent::CentralSubscribed(central));
         },
         SubscriptionEvent::Unsubscribed(central) | SubscriptionEvent::Disconnected(central) => {
            if self.subscribers.remove(&central) {
               info!("Central {central} unsubscribed");
            } else {
               debug!("Unsubscribe from unknown central {central}");
            }
            self.emit(PeripheralEvent::CentralUnsubscribed(central));
         },
      }
   }

   /// Dispatches `payload` to a snapshot of the current subscribers.
   fn fan_out(&self, payload: Payload) -> usize {
      let targets = self.subscribers.snapshot();
      let count = targets.len();
      if count == 0 {
         debug!("No subscribers, dropping {} byte payload", payload.len());
         return 0;
      }

      debug!("→ {count} subscriber(s): {}", hex::encode(&payload));
      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let sends = targets.iter().map(|central| {
            let transport = &transport;
            let payload = &payload;
            async move { (central, transport.notify_subscriber(central, payload).await) }
         });
         for (central, result) in future::join_all(sends).await {
            if let Err(error) = result {
               let _ = loopback
                  .send(PeripheralCommand::NotifyFailed {
                     central: central.clone(),
                     error,
                  })
                  .await;
            }
         }
      });
      count
   }

   fn cleanup(&mut self) {
      if let Some(task) = self.pump_task.take() {
         task.abort();
      }
      if let Some(task) = self.advertise_task.take() {
         task.abort();
      }
      if self.state == PeripheralState::Advertising {
         info!("Peripheral session released, stopping advertising");
         self.stop_advertising();
      }
   }
}
