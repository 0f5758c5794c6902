//! Client-side mirror of standing watch registrations.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::frame::{EndpointId, Frame};
use crate::router::CorrelationKey;

/// Watch requests this client issued, so they can be replayed when a
/// device comes back on-line. Not persisted.
#[derive(Debug, Default)]
pub struct ActiveSync {
    records: Mutex<BTreeMap<EndpointId, Vec<(CorrelationKey, Frame)>>>,
}

impl ActiveSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the same watch is already recorded.
    pub fn record(&self, key: CorrelationKey, request: Frame) -> bool {
        let mut records = self.records.lock();
        let entries = records.entry(key.device.clone()).or_default();
        if entries.iter().any(|(existing, _)| *existing == key) {
            return false;
        }
        entries.push((key, request));
        true
    }

    pub fn remove(&self, key: &CorrelationKey) -> bool {
        let mut records = self.records.lock();
        let Some(entries) = records.get_mut(&key.device) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| existing != key);
        let removed = entries.len() != before;
        if entries.is_empty() {
            records.remove(&key.device);
        }
        removed
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.records
            .lock()
            .get(&key.device)
            .map(|entries| entries.iter().any(|(existing, _)| existing == key))
            .unwrap_or(false)
    }

    /// Recorded requests for `device` with the relay-issued fields of the
    /// announcement copied in, ready to be sent again.
    pub fn refresh(&self, device: &EndpointId, announcement: &Frame) -> Vec<Frame> {
        let mut records = self.records.lock();
        let Some(entries) = records.get_mut(device) else {
            return Vec::new();
        };
        entries
            .iter_mut()
            .map(|(_, request)| {
                for field in ["aid", "ak"] {
                    if let Some(value) = announcement.get(field) {
                        request.set(field, value.clone());
                    }
                }
                request.clone()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn watch(device: u64, name: &str) -> Frame {
        Frame::new()
            .with("id", device)
            .with("name", name)
            .with("channel", true)
            .with("event", true)
            .with("watch", true)
            .with("aid", "old")
    }

    #[test]
    fn records_once_and_refreshes_aid() {
        let sync = ActiveSync::new();
        let frame = watch(100, "temp");
        let key = CorrelationKey::from_frame(&frame).unwrap();
        assert!(sync.record(key.clone(), frame.clone()));
        assert!(!sync.record(key.clone(), frame));
        let other = watch(200, "temp");
        sync.record(CorrelationKey::from_frame(&other).unwrap(), other);
        assert_eq!(sync.len(), 2);

        let announcement = Frame::new().with("id", 100).with("activeStart", true).with("aid", "new");
        let resend = sync.refresh(&EndpointId::Num(100), &announcement);
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].get("aid"), Some(&json!("new")));

        assert!(sync.remove(&key));
        assert!(!sync.contains(&key));
        assert!(sync.refresh(&EndpointId::Num(100), &announcement).is_empty());
        assert_eq!(sync.len(), 1);
    }
}
