//! Liveness probes for the long-running loops of a Kafka pipeline process.
//!
//! Each loop registers a component and checks in through its `HealthHandle`.
//! The process is live only while every component checked in within its own
//! deadline. Check-ins are synchronous so the rdkafka statistics callback can
//! report from librdkafka's threads.
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered, no check-in yet
    Starting,
    Healthy { expires: OffsetDateTime },
    Unhealthy { reason: String },
    /// Last healthy check-in expired at `since`
    Stalled { since: OffsetDateTime },
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    fn at(&self, now: OffsetDateTime) -> Self {
        match self {
            Self::Healthy { expires } if *expires <= now => Self::Stalled { since: *expires },
            other => other.clone(),
        }
    }
}

/// Snapshot of every registered component.
#[derive(Debug, Default)]
pub struct HealthStatus {
    pub components: BTreeMap<String, ComponentStatus>,
}

impl HealthStatus {
    /// An empty registry is not live: nothing has started yet.
    pub fn healthy(&self) -> bool {
        !self.components.is_empty() && self.components.values().all(ComponentStatus::is_healthy)
    }
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let mut body = String::new();
        for (name, status) in &self.components {
            _ = writeln!(body, "{name}: {status:?}");
        }
        (code, body).into_response()
    }
}

struct Entry {
    deadline: Duration,
    status: ComponentStatus,
}

type Entries = Arc<RwLock<BTreeMap<String, Entry>>>;

/// Check-in handle for one component; cheap to clone into callbacks.
#[derive(Clone)]
pub struct HealthHandle {
    name: Arc<str>,
    entries: Entries,
}

impl HealthHandle {
    /// Extends the component's liveness by its registered deadline.
    pub fn report_healthy(&self) {
        self.update(|entry| ComponentStatus::Healthy {
            expires: OffsetDateTime::now_utc() + entry.deadline,
        });
    }

    pub fn report_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.update(move |_| ComponentStatus::Unhealthy { reason });
    }

    fn update(&self, next: impl FnOnce(&Entry) -> ComponentStatus) {
        let Ok(mut entries) = self.entries.write() else {
            // The probe keeps failing and the process gets restarted
            warn!("liveness lock poisoned, dropping report for {}", self.name);
            return;
        };
        if let Some(entry) = entries.get_mut(&*self.name) {
            entry.status = next(entry);
        }
    }
}

/// Registry behind one probe endpoint.
#[derive(Clone)]
pub struct HealthRegistry {
    probe: String,
    entries: Entries,
}

impl HealthRegistry {
    pub fn new(probe: &str) -> Self {
        Self {
            probe: probe.to_owned(),
            entries: Entries::default(),
        }
    }

    /// Adds `component` in `Starting` state. Registering the same name again
    /// resets it.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(
                    component.to_owned(),
                    Entry {
                        deadline,
                        status: ComponentStatus::Starting,
                    },
                );
            }
            Err(_) => warn!("liveness lock poisoned, cannot register {}", component),
        }
        HealthHandle {
            name: component.into(),
            entries: self.entries.clone(),
        }
    }

    /// Current snapshot, usable directly as an axum handler response.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components = match self.entries.read() {
            Ok(entries) => entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.status.at(now)))
                .collect(),
            Err(_) => BTreeMap::new(),
        };
        let status = HealthStatus { components };

        if status.healthy() {
            debug!("{} probe ok", self.probe);
        } else {
            warn!("{} probe failing: {:?}", self.probe, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_not_live() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy());
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry.register("consumer_loop", Duration::seconds(30));
        assert_eq!(
            registry.get_status().components["consumer_loop"],
            ComponentStatus::Starting
        );

        consumer.report_healthy();
        assert!(registry.get_status().healthy());

        consumer.report_unhealthy("commit failed");
        let status = registry.get_status();
        assert!(!status.healthy());
        assert_eq!(
            status.components["consumer_loop"],
            ComponentStatus::Unhealthy {
                reason: "commit failed".to_owned()
            }
        );
    }

    #[test]
    fn expired_check_in_stalls() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry.register("consumer_loop", Duration::seconds(-1));

        consumer.report_healthy();
        let status = registry.get_status();
        assert!(!status.healthy());
        assert!(matches!(
            status.components["consumer_loop"],
            ComponentStatus::Stalled { .. }
        ));
    }

    #[test]
    fn all_components_must_check_in() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry.register("consumer_loop", Duration::seconds(30));
        let client = registry.register("rdkafka", Duration::seconds(30));

        consumer.report_healthy();
        assert!(!registry.get_status().healthy());

        client.report_healthy();
        assert!(registry.get_status().healthy());

        let status = registry.get_status().into_response();
        assert_eq!(status.status(), StatusCode::OK);
    }

    #[test]
    fn failing_probe_is_unavailable() {
        let response = HealthStatus::default().into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
