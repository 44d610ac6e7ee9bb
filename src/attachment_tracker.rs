//! In-memory volume-attachment state machine.
//!
//! Libvirt only knows "attached" or "not attached"; AWS clients expect
//! the `attaching`/`attached`/`detaching`/`detached` transition states
//! `AttachVolume`/`DetachVolume` return immediately while the actual
//! libvirt operation settles. A 3-second timer (spawned per transition)
//! advances the state; each transition is idempotent and terminal for
//! its `(volume_id, instance_id)` pair, so no cancellation bookkeeping
//! is needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

const SETTLE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStatus {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Attaching => "attaching",
            AttachmentStatus::Attached => "attached",
            AttachmentStatus::Detaching => "detaching",
            AttachmentStatus::Detached => "detached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub device: String,
    pub status: AttachmentStatus,
}

type Key = (String, String);

#[derive(Default)]
pub struct AttachmentTracker {
    entries: Mutex<HashMap<Key, Attachment>>,
}

impl AttachmentTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seeds the tracker at startup: anything libvirt already reports
    /// attached is treated as already-settled, not replayed through the
    /// `attaching` transition.
    pub async fn seed_attached(&self, volume_id: &str, instance_id: &str, device: &str) {
        self.entries.lock().await.insert(
            (volume_id.to_string(), instance_id.to_string()),
            Attachment { device: device.to_string(), status: AttachmentStatus::Attached },
        );
    }

    pub async fn get(&self, volume_id: &str, instance_id: &str) -> Option<Attachment> {
        self.entries.lock().await.get(&(volume_id.to_string(), instance_id.to_string())).cloned()
    }

    pub async fn for_volume(&self, volume_id: &str) -> Vec<((String, String), Attachment)> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|((vid, _), _)| vid == volume_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn for_instance(&self, instance_id: &str) -> Vec<((String, String), Attachment)> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|((_, iid), _)| iid == instance_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// A volume is "available" iff it has no attachment that isn't `detached`.
    pub async fn is_available(&self, volume_id: &str) -> bool {
        self.for_volume(volume_id).await.iter().all(|(_, a)| a.status == AttachmentStatus::Detached)
    }

    pub fn begin_attach(self: &Arc<Self>, volume_id: String, instance_id: String, device: String) {
        let tracker = Arc::clone(self);
        let key = (volume_id, instance_id);
        let tracker_key = key.clone();
        tokio::spawn(async move {
            tracker
                .entries
                .lock()
                .await
                .insert(tracker_key, Attachment { device: device.clone(), status: AttachmentStatus::Attaching });
        });
        let settle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_DELAY).await;
            if let Some(entry) = settle.entries.lock().await.get_mut(&key) {
                entry.status = AttachmentStatus::Attached;
            }
        });
    }

    pub fn begin_detach(self: &Arc<Self>, volume_id: String, instance_id: String, device: String) {
        let tracker = Arc::clone(self);
        let key = (volume_id, instance_id);
        let tracker_key = key.clone();
        tokio::spawn(async move {
            tracker
                .entries
                .lock()
                .await
                .insert(tracker_key, Attachment { device: device.clone(), status: AttachmentStatus::Detaching });
        });
        let settle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_DELAY).await;
            if let Some(entry) = settle.entries.lock().await.get_mut(&key) {
                entry.status = AttachmentStatus::Detached;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn available_when_no_attachments_recorded() {
        let tracker = AttachmentTracker::new();
        assert!(tracker.is_available("vol-1").await);
    }

    #[tokio::test]
    async fn for_instance_filters_across_volumes() {
        let tracker = AttachmentTracker::new();
        tracker.seed_attached("vol-1", "i-1", "vdb").await;
        tracker.seed_attached("vol-2", "i-1", "vdc").await;
        tracker.seed_attached("vol-3", "i-2", "vdb").await;
        let entries = tracker.for_instance("i-1").await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn seeded_attachment_is_not_available() {
        let tracker = AttachmentTracker::new();
        tracker.seed_attached("vol-1", "i-1", "vdb").await;
        assert!(!tracker.is_available("vol-1").await);
        let entry = tracker.get("vol-1", "i-1").await.unwrap();
        assert_eq!(entry.status, AttachmentStatus::Attached);
    }

    #[tokio::test]
    async fn attach_settles_to_attached_after_delay() {
        let tracker = AttachmentTracker::new();
        tracker.clone().begin_attach("vol-1".into(), "i-1".into(), "vdb".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.get("vol-1", "i-1").await.unwrap().status, AttachmentStatus::Attaching);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_then_detach_round_trips_through_paused_clock() {
        let tracker = AttachmentTracker::new();
        tracker.clone().begin_attach("vol-1".into(), "i-1".into(), "vdb".into());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(tracker.get("vol-1", "i-1").await.unwrap().status, AttachmentStatus::Attached);

        tracker.clone().begin_detach("vol-1".into(), "i-1".into(), "vdb".into());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(tracker.get("vol-1", "i-1").await.unwrap().status, AttachmentStatus::Detached);
        assert!(tracker.is_available("vol-1").await);
    }
}
