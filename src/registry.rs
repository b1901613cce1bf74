use std::collections::HashMap;

use tokio::time::Instant;

use crate::messages::LifecycleState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub address: String,
    pub lifecycle_state: LifecycleState,
    pub state_timestamp: Instant,
    pub last_notification: Option<Instant>,
}

/// Last known lifecycle state per device address.
#[derive(Debug, Default)]
pub struct Registry {
    devices: HashMap<String, DeviceRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `state` for `address` and returns the state it replaced
    /// (`Unknown` for a new address).
    pub fn upsert(&mut self, address: &str, state: LifecycleState, now: Instant) -> LifecycleState {
        match self.devices.get_mut(address) {
            Some(record) => {
                let previous = record.lifecycle_state;
                record.lifecycle_state = state;
                record.state_timestamp = now;
                previous
            }
            None => {
                self.devices.insert(
                    address.to_string(),
                    DeviceRecord {
                        address: address.to_string(),
                        lifecycle_state: state,
                        state_timestamp: now,
                        last_notification: None,
                    },
                );
                LifecycleState::Unknown
            }
        }
    }

    pub fn get(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices.get(address)
    }

    /// Never moves `last_notification` backwards.
    pub fn record_notification_sent(&mut self, address: &str, now: Instant) {
        if let Some(record) = self.devices.get_mut(address) {
            if record.last_notification.is_none_or(|last| now > last) {
                record.last_notification = Some(now);
            }
        }
    }

    pub fn remove(&mut self, address: &str) -> Option<DeviceRecord> {
        self.devices.remove(address)
    }

    /// Copies of every record. The iterator can be cloned to walk it again.
    pub fn snapshot(&self) -> impl Iterator<Item = DeviceRecord> + Clone + '_ {
        self.devices.values().cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_upsert_returns_previous_state() {
        let mut registry = Registry::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);

        assert_eq!(
            registry.upsert("a", LifecycleState::Background, t0),
            LifecycleState::Unknown
        );
        assert_eq!(
            registry.upsert("a", LifecycleState::Foreground, t1),
            LifecycleState::Background
        );

        let record = registry.get("a").unwrap();
        assert_eq!(record.lifecycle_state, LifecycleState::Foreground);
        assert_eq!(record.state_timestamp, t1);
        assert_eq!(record.last_notification, None);
    }

    #[test]
    fn test_notification_timestamp_only_advances() {
        let mut registry = Registry::new();
        let t0 = Instant::now();
        registry.upsert("a", LifecycleState::Hidden, t0);

        registry.record_notification_sent("a", t0 + Duration::from_secs(2));
        registry.record_notification_sent("a", t0 + Duration::from_secs(1));
        assert_eq!(
            registry.get("a").unwrap().last_notification,
            Some(t0 + Duration::from_secs(2))
        );

        // unknown addresses are ignored
        registry.record_notification_sent("b", t0);
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn test_remove_and_snapshot() {
        let mut registry = Registry::new();
        let now = Instant::now();
        registry.upsert("a", LifecycleState::Hidden, now);
        registry.upsert("b", LifecycleState::Terminated, now);

        let snapshot = registry.snapshot();
        let mut first: Vec<String> = snapshot.clone().map(|r| r.address).collect();
        let mut second: Vec<String> = snapshot.map(|r| r.address).collect();
        first.sort();
        second.sort();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(first, second);

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.snapshot().count(), 1);
    }
}
