//! Per-service state machine
//!
//! One cooperative task per service consumes a command channel and a health
//! tick, drives the lifecycle state machine, and publishes every transition
//! on the event bus. External mutation happens only through the command
//! channel, so state is serialized by construction.

use super::driver::ServiceDriver;
use crate::event::{EventBus, EventPayload, StateChangeEvent};
use crate::model::{HealthState, ServiceState, ServiceStatus, ServiceType, StopReason};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Commands accepted by a service runner
#[derive(Debug, Clone)]
pub enum Command {
    Start {
        correlation: Option<String>,
    },
    Stop {
        reason: StopReason,
        correlation: Option<String>,
    },
    Restart {
        correlation: Option<String>,
    },
    TriggerHealthCheck,
}

/// Returns the first unsatisfied dependency of this service, if any
pub type DependencyCheck = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Tuning knobs resolved from the definition's health config
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub health_interval: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub retry_cap: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            health_interval: crate::constants::DEFAULT_HEALTH_INTERVAL,
            failure_threshold: crate::constants::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: crate::constants::DEFAULT_SUCCESS_THRESHOLD,
            retry_cap: crate::constants::DEFAULT_RETRY_CAP,
        }
    }
}

/// Handle the supervisor keeps per service
pub struct ServiceHandle {
    pub name: String,
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ServiceStatus>,
    join: tokio::task::JoinHandle<()>,
}

impl ServiceHandle {
    pub fn status(&self) -> ServiceStatus {
        self.status_rx.borrow().clone()
    }

    pub async fn send(&self, command: Command) {
        if self.cmd_tx.send(command).await.is_err() {
            tracing::warn!("service '{}' runner is gone", self.name);
        }
    }

    /// Wait until the service reaches one of the given states
    pub async fn wait_for(
        &self,
        states: &[ServiceState],
        timeout: Duration,
    ) -> Option<ServiceState> {
        let mut rx = self.status_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = rx.borrow().state;
            if states.contains(&current) {
                return Some(current);
            }
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    pub async fn shutdown(self) {
        let _ = self
            .cmd_tx
            .send(Command::Stop {
                reason: StopReason::Shutdown,
                correlation: None,
            })
            .await;
        let _ = self.join.await;
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawn the runner task for one service
pub fn spawn_runner(
    name: &str,
    service_type: ServiceType,
    driver: Arc<dyn ServiceDriver>,
    config: RunnerConfig,
    deps: DependencyCheck,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) -> ServiceHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(ServiceStatus::new(name, service_type));

    let runner = Runner {
        name: name.to_string(),
        driver,
        config,
        deps,
        bus,
        cancel,
        status_tx,
        backoff_attempts: 0,
        success_streak: 0,
    };

    let join = tokio::spawn(runner.run(cmd_rx));

    ServiceHandle {
        name: name.to_string(),
        cmd_tx,
        status_rx,
        join,
    }
}

struct Runner {
    name: String,
    driver: Arc<dyn ServiceDriver>,
    config: RunnerConfig,
    deps: DependencyCheck,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    status_tx: watch::Sender<ServiceStatus>,
    backoff_attempts: u32,
    success_streak: u32,
}

impl Runner {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut health_tick = tokio::time::interval(self.config.health_interval);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        health_tick.reset();

        loop {
            let state = self.status_tx.borrow().state;
            let retry_due = self.retry_delay(state);

            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                _ = health_tick.tick(), if state.is_healthy() => {
                    self.run_health_probe(None).await;
                }
                _ = tokio::time::sleep(retry_due.unwrap_or(Duration::MAX)), if retry_due.is_some() => {
                    self.attempt_recovery().await;
                }
                _ = self.cancel.cancelled() => {
                    if !matches!(state, ServiceState::Stopped) {
                        self.do_stop(StopReason::Shutdown, None).await;
                    }
                    break;
                }
            }
        }
    }

    fn retry_delay(&self, state: ServiceState) -> Option<Duration> {
        if state != ServiceState::Retrying {
            return None;
        }
        let next = self.status_tx.borrow().next_retry_after?;
        let now = Utc::now();
        if next <= now {
            Some(Duration::ZERO)
        } else {
            (next - now).to_std().ok()
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { correlation } => self.do_start(correlation).await,
            Command::Stop {
                reason,
                correlation,
            } => self.do_stop(reason, correlation).await,
            Command::Restart { correlation } => {
                self.do_stop(StopReason::Manual, correlation.clone()).await;
                tokio::time::sleep(crate::constants::RESTART_GRACE).await;
                self.do_start(correlation).await;
            }
            Command::TriggerHealthCheck => self.run_health_probe(None).await,
        }
    }

    async fn do_start(&mut self, correlation: Option<String>) {
        let state = self.status_tx.borrow().state;
        if !matches!(
            state,
            ServiceState::Stopped | ServiceState::Failed | ServiceState::Waiting
        ) {
            tracing::debug!("start of '{}' ignored in state {:?}", self.name, state);
            return;
        }

        if let Some(missing) = (self.deps)() {
            if state == ServiceState::Waiting {
                self.status_tx.send_modify(|status| {
                    status.last_error = Some(format!("waiting for dependency '{}'", missing));
                });
            } else {
                self.transition(ServiceState::Waiting, correlation, |status| {
                    status.last_error = Some(format!("waiting for dependency '{}'", missing));
                    status.stop_reason = None;
                })
                .await;
            }
            return;
        }

        self.transition(ServiceState::Starting, correlation.clone(), |status| {
            status.last_attempt = Some(Utc::now());
            status.last_error = None;
            status.stop_reason = None;
        })
        .await;

        match self.driver.start().await {
            Ok(()) => {
                let health = self.driver.probe().await;
                if matches!(health, HealthState::Unhealthy) {
                    let _ = self.driver.stop().await;
                    self.transition(ServiceState::Failed, correlation, |status| {
                        status.health = HealthState::Unhealthy;
                        status.last_error =
                            Some("initial health probe failed".to_string());
                    })
                    .await;
                    return;
                }

                self.backoff_attempts = 0;
                self.success_streak = 0;
                let healthy_state = self.healthy_state();
                self.transition(healthy_state, correlation, |status| {
                    status.health = if health == HealthState::Unknown {
                        HealthState::Healthy
                    } else {
                        health
                    };
                    status.consecutive_failures = 0;
                    status.next_retry_after = None;
                })
                .await;
            }
            Err(e) => {
                let cancelled = matches!(e, crate::MusterError::Cancelled(_));
                self.transition(ServiceState::Failed, correlation, |status| {
                    status.health = HealthState::Unknown;
                    status.last_error = Some(e.to_string());
                })
                .await;
                if cancelled {
                    tracing::debug!("start of '{}' was cancelled", self.name);
                }
            }
        }
    }

    async fn do_stop(&mut self, reason: StopReason, correlation: Option<String>) {
        let state = self.status_tx.borrow().state;
        if matches!(state, ServiceState::Stopped | ServiceState::Stopping) {
            // Record the strongest reason even when already stopped: a manual
            // stop of an already-cascaded service must stay sticky.
            if reason == StopReason::Manual {
                self.status_tx.send_modify(|status| {
                    status.stop_reason = Some(StopReason::Manual);
                });
            }
            return;
        }

        // Emit the intent state before actually closing the handle.
        self.transition(ServiceState::Stopping, correlation.clone(), |status| {
            status.stop_reason = Some(reason);
        })
        .await;

        if let Err(e) = self.driver.stop().await {
            // Expected errors on shutdown (broken pipes) are suppressed.
            tracing::debug!("stop of '{}' reported: {}", self.name, e);
        }

        self.backoff_attempts = 0;
        self.success_streak = 0;
        self.transition(ServiceState::Stopped, correlation, |status| {
            status.health = HealthState::Unknown;
            status.stop_reason = Some(reason);
            status.next_retry_after = None;
        })
        .await;
    }

    async fn run_health_probe(&mut self, correlation: Option<String>) {
        let state = self.status_tx.borrow().state;
        if !state.is_healthy() {
            return;
        }

        let health = self.driver.probe().await;
        match health {
            HealthState::Healthy => {
                self.status_tx.send_modify(|status| {
                    status.health = HealthState::Healthy;
                    status.consecutive_failures = 0;
                });
            }
            // Auth-required is not a health failure.
            HealthState::AuthRequired => {
                self.status_tx.send_modify(|status| {
                    status.health = HealthState::AuthRequired;
                    status.consecutive_failures = 0;
                });
            }
            HealthState::Unknown => {}
            HealthState::Unhealthy => {
                let failures = {
                    let mut failures = 0;
                    self.status_tx.send_modify(|status| {
                        status.health = HealthState::Unhealthy;
                        status.consecutive_failures += 1;
                        failures = status.consecutive_failures;
                    });
                    failures
                };

                // Flapping below the threshold must not cause a transition.
                if failures >= self.config.failure_threshold {
                    self.enter_retrying(correlation).await;
                }
            }
        }
    }

    async fn enter_retrying(&mut self, correlation: Option<String>) {
        self.success_streak = 0;
        let delay = self.next_backoff();
        self.transition(ServiceState::Retrying, correlation, |status| {
            status.health = HealthState::Unhealthy;
            status.last_attempt = Some(Utc::now());
            status.next_retry_after =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        })
        .await;
    }

    async fn attempt_recovery(&mut self) {
        if self.backoff_attempts > self.config.retry_cap {
            self.transition(ServiceState::Failed, None, |status| {
                status.stop_reason = Some(StopReason::Failure);
                status.last_error = Some("retry attempts exhausted".to_string());
                status.next_retry_after = None;
            })
            .await;
            return;
        }

        self.status_tx.send_modify(|status| {
            status.last_attempt = Some(Utc::now());
        });

        // A plain probe first: remote blips recover without a restart.
        let mut health = self.driver.probe().await;

        if health != HealthState::Healthy && self.driver.is_local() {
            // Local processes do not come back on their own.
            let _ = self.driver.stop().await;
            tokio::time::sleep(crate::constants::RESTART_GRACE).await;
            health = match self.driver.start().await {
                Ok(()) => self.driver.probe().await,
                Err(e) => {
                    tracing::debug!("reconnect of '{}' failed: {}", self.name, e);
                    HealthState::Unhealthy
                }
            };
        }

        if matches!(health, HealthState::Healthy | HealthState::AuthRequired) {
            self.success_streak += 1;
            if self.success_streak >= self.config.success_threshold {
                self.backoff_attempts = 0;
                self.success_streak = 0;
                let healthy_state = self.healthy_state();
                self.transition(healthy_state, None, |status| {
                    status.health = health;
                    status.consecutive_failures = 0;
                    status.next_retry_after = None;
                    status.last_error = None;
                })
                .await;
            } else {
                // Passed but below the success threshold: probe again soon.
                self.status_tx.send_modify(|status| {
                    status.next_retry_after =
                        Some(Utc::now() + chrono::Duration::seconds(1));
                });
            }
        } else {
            self.success_streak = 0;
            let delay = self.next_backoff();
            self.status_tx.send_modify(|status| {
                status.health = HealthState::Unhealthy;
                status.next_retry_after =
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            });
        }
    }

    fn healthy_state(&self) -> ServiceState {
        if self.driver.is_local() {
            ServiceState::Running
        } else {
            ServiceState::Connected
        }
    }

    /// Doubling delay from the base to the cap
    fn next_backoff(&mut self) -> Duration {
        let delay = crate::constants::BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(self.backoff_attempts))
            .min(crate::constants::BACKOFF_CAP);
        self.backoff_attempts = self.backoff_attempts.saturating_add(1);
        delay
    }

    /// Apply a state transition, mutate the status, and publish the event.
    /// Invalid edges are invariant violations: logged, task continues.
    async fn transition<F>(&mut self, to: ServiceState, correlation: Option<String>, mutate: F)
    where
        F: FnOnce(&mut ServiceStatus),
    {
        let from = self.status_tx.borrow().state;
        if !from.can_transition_to(to) {
            tracing::error!(
                "invalid state transition for '{}': {:?} -> {:?}",
                self.name,
                from,
                to
            );
            return;
        }

        self.status_tx.send_modify(|status| {
            status.state = to;
            mutate(status);
        });

        let status = self.status_tx.borrow().clone();
        self.bus
            .publish_correlated(
                EventPayload::StateChange(StateChangeEvent {
                    service: self.name.clone(),
                    old_state: from,
                    new_state: to,
                    health: status.health,
                    error: status.last_error.clone(),
                    stop_reason: status.stop_reason,
                }),
                correlation,
                None,
            )
            .await;

        tracing::info!("service '{}': {:?} -> {:?}", self.name, from, to);
    }
}
