//! Upgrade Events
//!
//! Kubernetes events emitted on every upgrade transition.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeEvent {
    pub type_: EventType,
    pub reason: &'static str,
    pub note: String,
}

impl UpgradeEvent {
    pub fn normal(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            note: note.into(),
        }
    }

    pub fn warning(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            note: note.into(),
        }
    }
}

/// Sink for upgrade events. Publishing never fails the caller.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, object: &ObjectReference, event: UpgradeEvent);
}

/// Publishes through the `events.k8s.io` API.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, object: &ObjectReference, event: UpgradeEvent) {
        let type_ = match event.type_ {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        };
        let kube_event = Event {
            type_,
            reason: event.reason.to_string(),
            note: Some(event.note),
            action: "InPlaceUpgrade".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&kube_event, object).await {
            warn!(
                object = object.name.as_deref().unwrap_or_default(),
                reason = event.reason,
                "Failed to publish event: {}",
                e
            );
        }
    }
}
