//! Subscriber bookkeeping for the peripheral role.

use crate::transport::SubscriberHandle;

/// Set of centrals currently subscribed to the local characteristic.
///
/// Membership is unique per central; insertion order is kept so fan-out
/// happens in subscription order.
#[derive(Debug, Default, Clone)]
pub struct SubscriberSet {
   members: Vec<SubscriberHandle>,
}

impl SubscriberSet {
   pub const fn new() -> Self {
      Self {
         members: Vec::new(),
      }
   }

   /// Adds `central`. Returns `false` if it was already present.
   pub fn insert(&mut self, central: SubscriberHandle) -> bool {
      if self.contains(&central) {
         return false;
      }
      self.members.push(central);
      true
   }

   /// Removes `central`. Returns `false` if it was not a member.
   pub fn remove(&mut self, central: &SubscriberHandle) -> bool {
      let before = self.members.len();
      self.members.retain(|m| m != central);
      self.members.len() != before
   }

   pub fn contains(&self, central: &SubscriberHandle) -> bool {
      self.members.iter().any(|m| m == central)
   }

   pub fn len(&self) -> usize {
      self.members.len()
   }

   pub fn is_empty(&self) -> bool {
      self.members.is_empty()
   }

   pub fn snapshot(&self) -> Vec<SubscriberHandle> {
      self.members.clone()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::transport::PeerId;

   fn central(id: &str) -> SubscriberHandle {
      SubscriberHandle::new(PeerId::new(id))
   }

   #[test]
   fn test_insert_is_idempotent() {
      let mut set = SubscriberSet::new();
      assert!(set.insert(central("a")));
      assert!(!set.insert(central("a")));
      assert_eq!(set.len(), 1);
   }

   #[test]
   fn test_remove_non_member_is_noop() {
      let mut set = SubscriberSet::new();
      set.insert(central("a"));
      assert!(!set.remove(&central("b")));
      assert_eq!(set.len(), 1);
      assert!(set.remove(&central("a")));
      assert!(set.is_empty());
      assert!(!set.remove(&central("a")));
   }

   #[test]
   fn test_keeps_subscription_order() {
      let mut set = SubscriberSet::new();
      for id in ["c", "a", "b", "a"] {
         set.insert(central(id));
      }
      let order: Vec<_> = set.snapshot().iter().map(|c| c.id().as_str().to_owned()).collect();
      assert_eq!(order, ["c", "a", "b"]);
      assert!(set.contains(&central("b")));
      assert_eq!(set.snapshot().len(), 3);
   }
}
