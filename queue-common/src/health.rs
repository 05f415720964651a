//! # Health
//!
//! Liveness reporting for the long-running loops of a process, such as pool workers.
//!
//! Every loop registers a component and must report healthy more often than its deadline.
//! The process is healthy when every registered component reported recently and none
//! reported itself unhealthy. A registry with no components is unhealthy.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, warn};

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if all components are healthy.
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise, with every component's status in the body.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let status = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, never reported.
    Starting,
    /// Must report again before this instant.
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Missed its `HealthyUntil` deadline.
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

/// Handed to a component so it can report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy until `deadline` from now, or until the latest representable instant.
    pub fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc()
            .checked_add(self.deadline)
            .unwrap_or(PrimitiveDateTime::MAX.assume_utc());
        self.report_status(ComponentStatus::HealthyUntil(until));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                _ = components.insert(self.component.clone(), status);
            }
            // The probe will fail and the process restart.
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }

    /// Stop tracking this component, e.g. once a worker exits cleanly.
    pub fn deregister(&self) {
        if let Ok(mut components) = self.components.write() {
            _ = components.remove(&self.component);
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register `component`, which must then report healthy at least once every `deadline`.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// The overall process status. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            _ = result.components.insert(name.clone(), status);
        }

        if result.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_component_lifecycle() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry.register("worker-0".to_owned(), Duration::seconds(30));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker-0"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker-0"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn test_missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker-0".to_owned(), Duration::seconds(30));

        handle.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() - Duration::seconds(1),
        ));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker-0"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn test_unbounded_deadline_saturates() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker-0".to_owned(), Duration::MAX);

        handle.report_healthy();

        let status = registry.get_status();
        assert!(status.healthy);
        assert_eq!(
            status.components.get("worker-0"),
            Some(&ComponentStatus::HealthyUntil(
                PrimitiveDateTime::MAX.assume_utc()
            ))
        );
    }

    #[test]
    fn test_every_component_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let first = registry.register("worker-0".to_owned(), Duration::seconds(30));
        let second = registry.register("worker-1".to_owned(), Duration::seconds(30));

        first.report_healthy();
        assert!(!registry.get_status().healthy);

        second.report_healthy();
        assert!(registry.get_status().healthy);

        second.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);

        second.deregister();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn test_into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
