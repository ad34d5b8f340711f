//! Event emission for user-visible transitions.
//!
//! Events are regular resources in the store, deduplicated by
//! (involved object, reason, message): repeats bump a counter instead of
//! producing a new object.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use virtrigaud_api::meta::{ObjectMeta, Resource};
use virtrigaud_api::workload::{Event, EventDetail, EventType};

use super::api::Api;

/// Records events against resources.
#[derive(Clone)]
pub struct EventRecorder {
    events: Api<Event>,
    /// Reported as the event source
    component: String,
}

impl EventRecorder {
    pub fn new(events: Api<Event>, component: impl Into<String>) -> Self {
        Self {
            events,
            component: component.into(),
        }
    }

    /// Record a normal event.
    pub async fn normal<R: Resource>(&self, obj: &R, reason: &str, message: impl Into<String>) {
        self.record(obj, EventType::Normal, reason, message.into()).await;
    }

    /// Record a warning event.
    pub async fn warning<R: Resource>(&self, obj: &R, reason: &str, message: impl Into<String>) {
        self.record(obj, EventType::Warning, reason, message.into()).await;
    }

    async fn record<R: Resource>(&self, obj: &R, r#type: EventType, reason: &str, message: String) {
        let meta = obj.meta();
        let name = event_name(R::KIND, &meta.name, reason, &message);
        let now = chrono::Utc::now();

        // Dedup by (object, reason, message): bump the counter on repeats.
        // A lost conflict just drops the count bump; the event exists.
        if let Some(mut existing) = self.events.get_opt(&meta.namespace, &name).await {
            existing.spec.count += 1;
            existing.spec.last_seen = Some(now);
            if let Err(e) = self.events.update(existing).await {
                debug!(event = %name, error = %e, "Event count bump lost");
            }
            return;
        }

        let event = Event {
            meta: ObjectMeta {
                labels: [("source".to_string(), self.component.clone())]
                    .into_iter()
                    .collect(),
                ..ObjectMeta::new(&meta.namespace, &name)
            },
            spec: EventDetail {
                involved_kind: R::KIND.to_string(),
                involved_name: meta.name.clone(),
                r#type,
                reason: reason.to_string(),
                message,
                count: 1,
                first_seen: Some(now),
                last_seen: Some(now),
            },
        };

        if let Err(e) = self.events.create(event).await {
            warn!(event = %name, error = %e, "Failed to record event");
        }
    }
}

/// Deterministic event name: involved object plus a digest of the cause.
fn event_name(kind: &str, name: &str, reason: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(reason.as_bytes());
    hasher.update(message.as_bytes());
    let digest = hex::encode(hasher.finalize());
    // Keep within DNS-1123 label limits.
    let prefix: String = name.chars().take(40).collect();
    format!("{}-{}", prefix.trim_end_matches('-'), &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::Cluster;
    use virtrigaud_api::meta::ObjectMeta;
    use virtrigaud_api::VirtualMachine;

    #[tokio::test]
    async fn test_events_deduplicate_by_cause() {
        let cluster = Cluster::new();
        let recorder = EventRecorder::new(cluster.api(), "test-controller");
        let vm = VirtualMachine {
            meta: ObjectMeta::new("default", "web-1"),
            ..Default::default()
        };

        recorder.normal(&vm, "Created", "VM created at provider").await;
        recorder.normal(&vm, "Created", "VM created at provider").await;
        recorder.warning(&vm, "TaskFailed", "task timed out").await;

        let events = cluster.api::<Event>().list(Some("default")).await;
        assert_eq!(events.len(), 2);

        let created = events
            .iter()
            .find(|e| e.spec.reason == "Created")
            .expect("created event");
        assert_eq!(created.spec.count, 2);
        assert_eq!(created.spec.r#type, EventType::Normal);

        let failed = events
            .iter()
            .find(|e| e.spec.reason == "TaskFailed")
            .expect("task failed event");
        assert_eq!(failed.spec.count, 1);
        assert_eq!(failed.spec.r#type, EventType::Warning);
    }
}
