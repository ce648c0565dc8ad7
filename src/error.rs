//! Error types for the BLE sessions.
//!
//! Transport-level failures are small cloneable enums so they can travel
//! inside session events; [`LinkError`] covers everything a caller of the
//! public API can see directly.

use thiserror::Error;
use uuid::Uuid;

/// Discovery or connection failure on the central side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
   #[error("Scan failed: {0}")]
   ScanFailed(String),

   #[error("Scan ended without a matching peripheral")]
   ScanEnded,

   #[error("Timed out waiting for a matching peripheral")]
   ScanTimeout,

   #[error("Connection rejected: {0}")]
   Rejected(String),

   #[error("Connection attempt timed out")]
   Timeout,
}

/// Service or characteristic lookup failure on a connected peripheral.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
   #[error("Service {0} not found on peer")]
   ServiceNotFound(Uuid),

   #[error("Characteristic {0} not found on peer")]
   CharacteristicNotFound(Uuid),

   #[error("Peer not connected")]
   NotConnected,

   #[error("Service discovery failed: {0}")]
   Transport(String),
}

/// Notify enable/disable rejected for a characteristic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
   #[error("Characteristic {0} does not support notifications")]
   NotifyUnsupported(Uuid),

   #[error("Characteristic {0} was never resolved")]
   NotResolved(Uuid),

   #[error("Notify request rejected: {0}")]
   Rejected(String),
}

/// Advertising could not be started or adjusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertiseError {
   #[error("Radio unavailable: {0}")]
   RadioUnavailable(String),

   #[error("Already advertising")]
   AlreadyAdvertising,

   #[error("Failed to register GATT service: {0}")]
   Registration(String),
}

/// Delivery of one notification to one subscriber failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
   #[error("Central is not subscribed")]
   NotSubscribed,

   #[error("Central disconnected")]
   Disconnected,

   #[error("Payload of {len} bytes exceeds the {mtu} byte MTU")]
   PayloadTooLarge { len: usize, mtu: usize },

   #[error("Notification delivery failed: {0}")]
   Transport(String),
}

/// Per-characteristic failure reported while (un)subscribing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CharacteristicError {
   #[error(transparent)]
   Resolve(#[from] ResolveError),

   #[error(transparent)]
   Subscribe(#[from] SubscribeError),
}

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid service identity: {0}")]
   InvalidIdentity(String),

   #[error("Invalid UUID {0:?}")]
   InvalidUuid(String),

   #[error("Cannot {operation} while {state}")]
   InvalidState {
      operation: &'static str,
      state: String,
   },

   #[error("Session has been shut down")]
   SessionShutdown,

   #[error("Bluetooth LE is not supported on this system")]
   BluetoothNotSupported,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl LinkError {
   pub(crate) fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
      Self::InvalidState {
         operation,
         state: state.to_string(),
      }
   }
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
