use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::warn;

/// Liveness reporting for the long-running loops of the service.
///
/// The pipeline runtime is a collection of asynchronous workers (ingestors,
/// dedup shards, join owners, sink flushers). The process can only be trusted
/// with data if all of them are making progress, so each worker registers
/// here with a reporting deadline and must check in before it elapses.
///
/// The process-level probe is the conjunction of the individual reports:
///   - any component reporting unhealthy fails the probe,
///   - a component that missed its deadline is considered stalled and fails
///     the probe,
///   - the probe only passes once every registered component has reported.
///
/// This registry intentionally models liveness only. Pipeline-level status
/// (paused, degraded, terminating) is a separate, richer model owned by the
/// pipeline manager; conflating the two makes kubernetes restart loops out
/// of ordinary lifecycle transitions.
#[derive(Default, Debug)]
pub struct LivenessStatus {
    pub healthy: bool,
    /// Last reported status per component, for probe body output.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, before the first report.
    Starting,
    /// Healthy until the embedded deadline; must re-report before it.
    HealthyUntil(time::OffsetDateTime),
    Unhealthy,
    /// Set by the registry when a HealthyUntil deadline was missed.
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            _ => false,
        }
    }
}

struct Report {
    component: String,
    status: ComponentStatus,
}

/// Handle given to a worker loop so it can check in with the registry.
#[derive(Clone)]
pub struct LivenessHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<Report>,
}

impl LivenessHandle {
    /// Report healthy, valid for the configured deadline. Must be called
    /// more frequently than the deadline elapses.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_unhealthy(&self) {
        self.report_status(ComponentStatus::Unhealthy).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let report = Report {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(report).await {
            warn!("failed to report liveness status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct LivenessRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<Report>,
}

impl LivenessRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<Report>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(report.component, report.status);
                } else {
                    // Poisoned lock: the probes will fail and the process restart
                    warn!("poisoned LivenessRegistry lock")
                }
            }
        });

        registry
    }

    /// Registers a component. The returned handle must be moved into the
    /// worker so it can report within the deadline.
    pub async fn register(&self, component: String, deadline: Duration) -> LivenessHandle {
        let handle = LivenessHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Computes the process liveness from all registered components.
    /// Usable directly as an axum handler through IntoResponse.
    pub fn get_status(&self) -> LivenessStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("poisoned LivenessRegistry lock");
                return LivenessStatus::default();
            }
        };

        let now = time::OffsetDateTime::now_utc();
        let mut result = LivenessStatus {
            // Unhealthy until at least one component has registered.
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    _ = result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), status.clone());
                }
            }
        }

        if !result.healthy {
            warn!("{} probe failed: {:?}", self.name, result.components);
        }
        result
    }
}
