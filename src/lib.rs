//! BLE central/peripheral sessions.
//!
//! A [`CentralSession`] discovers a peripheral exposing a known service,
//! connects, subscribes to its characteristics and reports value updates.
//! A [`PeripheralSession`] advertises that service and pushes payloads to
//! subscribed centrals. Both report through an [`EventBus`] and drive a
//! platform transport; [`transport::bluez`] is the Linux backend.

pub mod central;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod peripheral;
pub mod subscribers;
pub mod transport;

pub use central::{CentralSession, CentralState, SubscriptionStatus};
pub use config::{Config, Timeouts};
pub use error::{LinkError, Result};
pub use event::{CentralEvent, EventBus, EventQueue, EventSender, PeripheralEvent, SessionEvent};
pub use identity::ServiceIdentity;
pub use peripheral::{PeripheralSession, PeripheralState};
pub use transport::{AdvertisingProfile, CentralTransport, PeripheralTransport};
