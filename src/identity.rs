//! Service identity shared by both roles.

use std::{fmt, str::FromStr};

use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::{LinkError, Result};

/// Bluetooth base UUID, `0000xxxx-0000-1000-8000-00805f9b34fb`.
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expands a 16-bit assigned number against the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
   Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parses either a full UUID or a 16/32-bit short form (`c0de`, `0000c0de`).
pub fn parse_uuid(text: &str) -> Result<Uuid> {
   let trimmed = text.trim();
   let short = trimmed.strip_prefix("0x").unwrap_or(trimmed);
   if matches!(short.len(), 4 | 8) {
      return u32::from_str_radix(short, 16)
         .map(|v| Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96)))
         .map_err(|_| LinkError::InvalidUuid(text.to_owned()));
   }
   Uuid::from_str(trimmed).map_err(|_| LinkError::InvalidUuid(text.to_owned()))
}

/// The service a session targets (central) or exposes (peripheral).
///
/// Immutable once built. Characteristic UUIDs keep their configured order
/// with duplicates removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
   name: SmolStr,
   service_uuid: Uuid,
   characteristic_uuids: Vec<Uuid>,
}

impl ServiceIdentity {
   /// Validates and builds an identity.
   pub fn new(
      name: impl Into<SmolStr>,
      service_uuid: Uuid,
      characteristic_uuids: impl IntoIterator<Item = Uuid>,
   ) -> Result<Self> {
      if service_uuid.is_nil() {
         return Err(LinkError::InvalidIdentity("service UUID is nil".into()));
      }

      let mut chars: Vec<Uuid> = Vec::new();
      for uuid in characteristic_uuids {
         if uuid.is_nil() {
            return Err(LinkError::InvalidIdentity("characteristic UUID is nil".into()));
         }
         if uuid == service_uuid {
            return Err(LinkError::InvalidIdentity(format!(
               "characteristic {uuid} collides with the service UUID"
            )));
         }
         if !chars.contains(&uuid) {
            chars.push(uuid);
         }
      }

      Ok(Self {
         name: name.into(),
         service_uuid,
         characteristic_uuids: chars,
      })
   }

   pub fn name(&self) -> &SmolStr {
      &self.name
   }

   pub fn service_uuid(&self) -> Uuid {
      self.service_uuid
   }

   pub fn characteristic_uuids(&self) -> &[Uuid] {
      &self.characteristic_uuids
   }

   /// The single characteristic exposed by a peripheral, if exactly one is configured.
   pub fn sole_characteristic(&self) -> Option<Uuid> {
      match self.characteristic_uuids.as_slice() {
         [only] => Some(*only),
         _ => None,
      }
   }
}

impl fmt::Display for ServiceIdentity {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} ({})", self.name, self.service_uuid)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

   #[test]
   fn test_short_uuid_expansion() {
      assert_eq!(
         uuid16(0xc0de).to_string(),
         "0000c0de-0000-1000-8000-00805f9b34fb"
      );
      assert_eq!(parse_uuid("c0de").unwrap(), uuid16(0xc0de));
      assert_eq!(parse_uuid("0xC0DE").unwrap(), uuid16(0xc0de));
      assert_eq!(parse_uuid(&SERVICE.to_string()).unwrap(), SERVICE);
      assert!(parse_uuid("not-a-uuid").is_err());
   }

   #[test]
   fn test_duplicate_characteristics_collapse() {
      let c1 = uuid16(0x0001);
      let c2 = uuid16(0x0002);
      let identity = ServiceIdentity::new("svc", SERVICE, [c1, c2, c1]).unwrap();
      assert_eq!(identity.characteristic_uuids(), &[c1, c2]);
      assert_eq!(identity.sole_characteristic(), None);
   }

   #[test]
   fn test_rejects_nil_and_colliding_uuids() {
      assert!(matches!(
         ServiceIdentity::new("svc", Uuid::nil(), Vec::new()),
         Err(LinkError::InvalidIdentity(_))
      ));
      assert!(matches!(
         ServiceIdentity::new("svc", SERVICE, [Uuid::nil()]),
         Err(LinkError::InvalidIdentity(_))
      ));
      assert!(matches!(
         ServiceIdentity::new("svc", SERVICE, [SERVICE]),
         Err(LinkError::InvalidIdentity(_))
      ));
   }

   #[test]
   fn test_empty_characteristics_allowed() {
      let identity = ServiceIdentity::new("svc", SERVICE, Vec::new()).unwrap();
      assert!(identity.characteristic_uuids().is_empty());
      assert_eq!(identity.to_string(), format!("svc ({SERVICE})"));
   }
}
