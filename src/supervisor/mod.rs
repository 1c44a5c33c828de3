//! Supervisor
//!
//! Owns one state-machine task per service, the dependency graph between
//! them, and the cascade semantics: stopping a service first stops everything
//! that depends on it (reason `dependency`), and a service recovering to a
//! healthy state restarts dependents that were stopped for that reason.
//! Manual stops are sticky.

pub mod driver;
pub mod service;

use crate::event::{
    BackpressurePolicy, EventBus, EventPayload, EventRecord, EventSink, ObjectReference,
};
use crate::graph::DependencyGraph;
use crate::model::{
    HealthCheckConfig, McpServerDefinition, ServiceClassDefinition, ServiceInstance, ServiceState,
    ServiceStatus, ServiceType, StopReason,
};
use crate::registry::HandlerRegistry;
use crate::{MusterError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use driver::{InstanceDriver, McpServerDriver, ServiceDriver};
pub use service::{Command, DependencyCheck, RunnerConfig, ServiceHandle};

/// How long a cascade waits for one service to reach Stopped
const CASCADE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle coordinator for all supervised services
pub struct Supervisor {
    registry: Arc<HandlerRegistry>,
    bus: Arc<EventBus>,
    sink: Arc<dyn EventSink>,
    graph: Arc<RwLock<DependencyGraph>>,
    services: Arc<DashMap<String, Arc<ServiceHandle>>>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        bus: Arc<EventBus>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            registry,
            bus,
            sink,
            graph: Arc::new(RwLock::new(DependencyGraph::new())),
            services: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        });

        supervisor.clone().spawn_monitor();
        supervisor
    }

    // -----------------------------------------------------------------------
    // Service registration
    // -----------------------------------------------------------------------

    /// Supervise an MCPServer definition. Starts it when auto_start is set
    /// (entering Waiting if a dependency is not healthy yet).
    pub async fn add_mcp_server(&self, definition: McpServerDefinition) -> Result<()> {
        definition.validate()?;
        let name = definition.name.clone();
        let dependencies = definition.dependencies.clone();
        let config = runner_config(definition.health.as_ref());
        let auto_start = definition.auto_start;
        let driver = Arc::new(McpServerDriver::new(definition, self.registry.clone()));

        self.add_with_driver(
            &name,
            ServiceType::McpServer,
            &dependencies,
            driver,
            config,
            auto_start,
        )
        .await
    }

    /// Supervise an instance created from a ServiceClass
    pub async fn add_instance(
        &self,
        class: ServiceClassDefinition,
        instance: ServiceInstance,
        auto_start: bool,
    ) -> Result<()> {
        class.validate()?;
        let name = instance.name.clone();
        let dependencies = class.dependencies.clone();
        let config = runner_config(class.health_check.as_ref());
        let service_type = ServiceType::Instance {
            class: class.name.clone(),
        };
        let driver = Arc::new(InstanceDriver::new(class, instance, self.registry.clone()));

        self.add_with_driver(&name, service_type, &dependencies, driver, config, auto_start)
            .await
    }

    /// The seam every definition kind funnels through: register the graph
    /// node, spawn the runner, optionally start.
    pub async fn add_with_driver(
        &self,
        name: &str,
        service_type: ServiceType,
        dependencies: &[String],
        driver: Arc<dyn ServiceDriver>,
        config: RunnerConfig,
        auto_start: bool,
    ) -> Result<()> {
        if self.services.contains_key(name) {
            return Err(MusterError::validation(format!(
                "service '{}' already supervised",
                name
            )));
        }

        self.graph.write().add_service(name, dependencies);

        let handle = self.spawn(name, service_type, driver, config);
        self.services.insert(name.to_string(), Arc::new(handle));

        if auto_start {
            self.start_service(name, None).await;
        }
        Ok(())
    }

    /// Stop and forget a service (definition deleted)
    pub async fn remove_service(&self, name: &str) -> Result<()> {
        if !self.services.contains_key(name) {
            return Err(MusterError::not_found("service", name));
        }
        self.stop_service(name, StopReason::Manual).await;

        if let Some((_, handle)) = self.services.remove(name) {
            handle.abort();
        }
        self.graph.write().remove_service(name);
        Ok(())
    }

    fn spawn(
        &self,
        name: &str,
        service_type: ServiceType,
        driver: Arc<dyn ServiceDriver>,
        config: RunnerConfig,
    ) -> ServiceHandle {
        let graph = self.graph.clone();
        let services = self.services.clone();
        let service_name = name.to_string();
        let deps: DependencyCheck = Arc::new(move || {
            let graph = graph.read();
            graph.first_unsatisfied(&service_name, |dep| {
                services
                    .get(dep)
                    .map(|handle| handle.status().state.is_healthy())
                    .unwrap_or(false)
            })
        });

        service::spawn_runner(
            name,
            service_type,
            driver,
            config,
            deps,
            self.bus.clone(),
            self.cancel.child_token(),
        )
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn start_service(&self, name: &str, correlation: Option<String>) {
        if let Some(handle) = self.handle(name) {
            handle.send(Command::Start { correlation }).await;
        }
    }

    /// Stop a service and everything that depends on it. Dependents stop
    /// with reason `dependency` so recovery restarts them; the target keeps
    /// the caller's reason.
    pub async fn stop_service(&self, name: &str, reason: StopReason) {
        let correlation = Uuid::new_v4().to_string();
        let dependents = self.graph.read().dependents_closure(name);

        for dependent in &dependents {
            if let Some(handle) = self.handle(dependent) {
                if !handle.status().state.is_healthy()
                    && handle.status().state != ServiceState::Starting
                {
                    continue;
                }
                handle
                    .send(Command::Stop {
                        reason: StopReason::Dependency,
                        correlation: Some(correlation.clone()),
                    })
                    .await;
                handle
                    .wait_for(&[ServiceState::Stopped], CASCADE_STOP_TIMEOUT)
                    .await;
            }
        }

        if let Some(handle) = self.handle(name) {
            handle
                .send(Command::Stop {
                    reason,
                    correlation: Some(correlation),
                })
                .await;
            handle
                .wait_for(&[ServiceState::Stopped], CASCADE_STOP_TIMEOUT)
                .await;
        }
    }

    /// Cascade-stop dependents, then restart the target. Dependents come
    /// back through the dependency-aware restarter once the target is
    /// healthy again.
    pub async fn restart_service(&self, name: &str) {
        let correlation = Uuid::new_v4().to_string();
        let dependents = self.graph.read().dependents_closure(name);

        for dependent in &dependents {
            if let Some(handle) = self.handle(dependent)
                && handle.status().state.is_healthy()
            {
                handle
                    .send(Command::Stop {
                        reason: StopReason::Dependency,
                        correlation: Some(correlation.clone()),
                    })
                    .await;
                handle
                    .wait_for(&[ServiceState::Stopped], CASCADE_STOP_TIMEOUT)
                    .await;
            }
        }

        if let Some(handle) = self.handle(name) {
            handle
                .send(Command::Restart {
                    correlation: Some(correlation),
                })
                .await;
        }
    }

    pub async fn trigger_health_check(&self, name: &str) {
        if let Some(handle) = self.handle(name) {
            handle.send(Command::TriggerHealthCheck).await;
        }
    }

    // -----------------------------------------------------------------------
    // State queries
    // -----------------------------------------------------------------------

    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.handle(name).map(|handle| handle.status())
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.services
            .iter()
            .map(|entry| entry.value().status())
            .collect()
    }

    pub fn is_supervised(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Wait until a service reaches one of the given states
    pub async fn wait_for_state(
        &self,
        name: &str,
        states: &[ServiceState],
        timeout: Duration,
    ) -> Option<ServiceState> {
        let handle = self.handle(name)?;
        handle.wait_for(states, timeout).await
    }

    fn handle(&self, name: &str) -> Option<Arc<ServiceHandle>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    // -----------------------------------------------------------------------
    // Dependency-aware monitor
    // -----------------------------------------------------------------------

    fn spawn_monitor(self: Arc<Self>) {
        let mut subscription = self
            .bus
            .subscribe("supervisor-monitor", BackpressurePolicy::EvictOldest);
        let supervisor = Arc::downgrade(&self);
        drop(self);

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                if let EventPayload::StateChange(change) = event.payload {
                    let correlation = event.correlation_id.clone();
                    tokio::spawn(async move {
                        supervisor.on_state_change(change, correlation).await;
                    });
                }
            }
        });
    }

    async fn on_state_change(
        &self,
        change: crate::event::StateChangeEvent,
        correlation: Option<String>,
    ) {
        self.record_sink_event(&change).await;

        if change.new_state.is_healthy() {
            // Cascade restart: bring back dependents that were stopped for
            // this dependency (never the manually stopped ones).
            tokio::time::sleep(crate::constants::RESTART_GRACE).await;
            let candidates = self.start_candidates_depending_on(&change.service);
            for candidate in candidates {
                tracing::info!(
                    "dependency '{}' healthy, restarting '{}'",
                    change.service,
                    candidate
                );
                self.start_service(&candidate, correlation.clone()).await;
            }
        } else if change.new_state == ServiceState::Failed {
            // Cascade stop: a failed dependency takes its dependents down
            // with reason dependency so recovery can bring them back.
            let dependents = self.graph.read().dependents_closure(&change.service);
            let correlation = correlation
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            for dependent in dependents {
                if let Some(handle) = self.handle(&dependent)
                    && matches!(
                        handle.status().state,
                        ServiceState::Running
                            | ServiceState::Connected
                            | ServiceState::Starting
                            | ServiceState::Retrying
                    )
                {
                    handle
                        .send(Command::Stop {
                            reason: StopReason::Dependency,
                            correlation: Some(correlation.clone()),
                        })
                        .await;
                }
            }
        }
    }

    /// Services whose dependency closure includes `name` and which are
    /// waiting on dependencies or stopped with reason `dependency`, with all
    /// dependencies now satisfied.
    fn start_candidates_depending_on(&self, name: &str) -> Vec<String> {
        let graph = self.graph.read();
        let mut candidates = Vec::new();
        for dependent in graph.dependents_closure(name) {
            let Some(handle) = self.services.get(&dependent) else {
                continue;
            };
            let status = handle.status();
            let eligible = status.state == ServiceState::Waiting
                || (status.state == ServiceState::Stopped
                    && status.stop_reason == Some(StopReason::Dependency));
            if !eligible {
                continue;
            }
            let satisfied = graph.dependencies_satisfied(&dependent, |dep| {
                self.services
                    .get(dep)
                    .map(|h| h.status().state.is_healthy())
                    .unwrap_or(false)
            });
            if satisfied {
                candidates.push(dependent);
            }
        }
        candidates
    }

    async fn record_sink_event(&self, change: &crate::event::StateChangeEvent) {
        let object = ObjectReference::new("Service", &change.service);
        let record = match change.new_state {
            ServiceState::Failed => EventRecord::warning(
                object,
                "Failed",
                change
                    .error
                    .clone()
                    .unwrap_or_else(|| "service failed".to_string()),
            ),
            ServiceState::Retrying => {
                EventRecord::warning(object, "Unhealthy", "health probes failing, backing off")
            }
            ServiceState::Running | ServiceState::Connected => {
                EventRecord::normal(object, "Started", "service is healthy")
            }
            ServiceState::Stopped => EventRecord::normal(
                object,
                "Stopped",
                match change.stop_reason {
                    Some(StopReason::Dependency) => "stopped because a dependency went away",
                    Some(StopReason::Manual) => "stopped by operator",
                    Some(StopReason::Shutdown) => "stopped during shutdown",
                    _ => "stopped",
                },
            ),
            _ => return,
        };
        if let Err(e) = self.sink.record(record).await {
            tracing::debug!("event sink write failed: {}", e);
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop everything in reverse dependency order and wait for Stopped.
    pub async fn shutdown(&self) {
        let order = {
            let graph = self.graph.read();
            let mut order = graph.topological_order().unwrap_or_else(|_| {
                self.services.iter().map(|e| e.key().clone()).collect()
            });
            order.reverse();
            order
        };

        for name in order {
            if let Some(handle) = self.handle(&name) {
                handle
                    .send(Command::Stop {
                        reason: StopReason::Shutdown,
                        correlation: None,
                    })
                    .await;
                handle
                    .wait_for(&[ServiceState::Stopped], CASCADE_STOP_TIMEOUT)
                    .await;
            }
        }

        self.cancel.cancel();
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }
}

fn runner_config(health: Option<&HealthCheckConfig>) -> RunnerConfig {
    match health {
        Some(health) => RunnerConfig {
            health_interval: Duration::from_secs(health.interval_secs.max(1)),
            failure_threshold: health.failure_threshold.max(1),
            success_threshold: health.success_threshold.max(1),
            retry_cap: crate::constants::DEFAULT_RETRY_CAP,
        },
        None => RunnerConfig::default(),
    }
}
