//! Session events and the sink they are delivered to.
//!
//! Sessions emit one tagged [`SessionEvent`] per transition or data arrival.
//! The sink is handed to a session at construction as an [`EventSender`].

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use serde_json::json;
use tokio::{sync::Notify, time};
use uuid::Uuid;

use crate::{
   error::{AdvertiseError, CharacteristicError, ConnectError, NotifyError},
   transport::{Payload, PeripheralHandle, SubscriberHandle},
};

/// Events emitted by a [`crate::central::CentralSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
   Connected(PeripheralHandle),
   ConnectFailed(ConnectError),
   Disconnected,
   Subscribed,
   Unsubscribed,
   CharacteristicRequestFailed {
      characteristic: Uuid,
      error: CharacteristicError,
   },
   ValueUpdate {
      characteristic: Uuid,
      payload: Payload,
   },
}

/// Events emitted by a [`crate::peripheral::PeripheralSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
   AdvertisingStarted,
   AdvertisingStopped,
   AdvertiseFailed(AdvertiseError),
   CentralSubscribed(SubscriberHandle),
   CentralUnsubscribed(SubscriberHandle),
   NotifyFailed {
      central: SubscriberHandle,
      error: NotifyError,
   },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
   Central(CentralEvent),
   Peripheral(PeripheralEvent),
}

impl From<CentralEvent> for SessionEvent {
   fn from(event: CentralEvent) -> Self {
      Self::Central(event)
   }
}

impl From<PeripheralEvent> for SessionEvent {
   fn from(event: PeripheralEvent) -> Self {
      Self::Peripheral(event)
   }
}

impl SessionEvent {
   /// Converts the event to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      match self {
         Self::Central(event) => match event {
            CentralEvent::Connected(handle) => {
               json!({ "event": "connected", "peripheral": handle.id().as_str() })
            },
            CentralEvent::ConnectFailed(e) => {
               json!({ "event": "connect_failed", "error": e.to_string() })
            },
            CentralEvent::Disconnected => json!({ "event": "disconnected" }),
            CentralEvent::Subscribed => json!({ "event": "subscribed" }),
            CentralEvent::Unsubscribed => json!({ "event": "unsubscribed" }),
            CentralEvent::CharacteristicRequestFailed {
               characteristic,
               error,
            } => json!({
                "event": "characteristic_request_failed",
                "characteristic": characteristic.to_string(),
                "error": error.to_string(),
            }),
            CentralEvent::ValueUpdate {
               characteristic,
               payload,
            } => json!({
                "event": "value_update",
                "characteristic": characteristic.to_string(),
                "payload": hex::encode(payload),
            }),
         },
         Self::Peripheral(event) => match event {
            PeripheralEvent::AdvertisingStarted => json!({ "event": "advertising_started" }),
            PeripheralEvent::AdvertisingStopped => json!({ "event": "advertising_stopped" }),
            PeripheralEvent::AdvertiseFailed(e) => {
               json!({ "event": "advertise_failed", "error": e.to_string() })
            },
            PeripheralEvent::CentralSubscribed(central) => {
               json!({ "event": "central_subscribed", "central": central.id().as_str() })
            },
            PeripheralEvent::CentralUnsubscribed(central) => {
               json!({ "event": "central_unsubscribed", "central": central.id().as_str() })
            },
            PeripheralEvent::NotifyFailed { central, error } => json!({
                "event": "notify_failed",
                "central": central.id().as_str(),
                "error": error.to_string(),
            }),
         },
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Delivers an event to the application.
   fn emit(&self, event: SessionEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Lock-free FIFO sink with an async receiver.
pub struct EventQueue {
   queue: SegQueue<SessionEvent>,
   notifier: Notify,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   /// Waits for the next event. Returns `None` once every producer is gone
   /// and the queue is drained.
   pub async fn recv(self: &Arc<Self>) -> Option<SessionEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   pub fn try_recv(&self) -> Option<SessionEvent> {
      self.queue.pop()
   }

   /// Pops everything currently queued.
   pub fn drain(&self) -> Vec<SessionEvent> {
      std::iter::from_fn(|| self.queue.pop()).collect()
   }

   pub fn len(&self) -> usize {
      self.queue.len()
   }

   pub fn is_empty(&self) -> bool {
      self.queue.is_empty()
   }
}

impl EventBus for EventQueue {
   fn emit(&self, event: SessionEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::transport::PeerId;

   #[tokio::test]
   async fn test_queue_preserves_order() {
      let queue = EventQueue::new();
      queue.emit(CentralEvent::Subscribed.into());
      queue.emit(CentralEvent::Unsubscribed.into());

      assert_eq!(queue.len(), 2);
      assert_eq!(queue.recv().await, Some(CentralEvent::Subscribed.into()));
      assert_eq!(queue.try_recv(), Some(CentralEvent::Unsubscribed.into()));
      assert!(queue.is_empty());
   }

   #[tokio::test]
   async fn test_recv_ends_without_producers() {
      let queue = EventQueue::new();
      queue.emit(CentralEvent::Disconnected.into());
      assert!(queue.recv().await.is_some());
      assert!(queue.recv().await.is_none());
   }

   #[tokio::test]
   async fn test_recv_wakes_on_emit() {
      let queue = EventQueue::new();
      let producer = queue.clone();
      tokio::spawn(async move {
         time::sleep(Duration::from_millis(10)).await;
         producer.emit(PeripheralEvent::AdvertisingStarted.into());
      });
      let event = time::timeout(Duration::from_secs(5), queue.recv())
         .await
         .unwrap();
      assert_eq!(event, Some(PeripheralEvent::AdvertisingStarted.into()));
   }

   #[test]
   fn test_event_json() {
      let event: SessionEvent = CentralEvent::ValueUpdate {
         characteristic: Uuid::from_u128(1),
         payload: Payload::from_slice(&[0x01, 0x02]),
      }
      .into();
      let value = event.to_json();
      assert_eq!(value["event"], "value_update");
      assert_eq!(value["payload"], "0102");

      let central = SubscriberHandle::new(PeerId::new("AA:BB:CC:DD:EE:FF"));
      let value = SessionEvent::from(PeripheralEvent::CentralSubscribed(central)).to_json();
      assert_eq!(value["central"], "AA:BB:CC:DD:EE:FF");
   }
}
