//! Per-component circuit breakers.
//!
//! One [`BreakerRegistry`] owns the health record of every guarded
//! component. Call sites wrap fallible work in [`BreakerRegistry::call`];
//! the registry admits or short-circuits the call, then applies exactly one
//! health update when it completes. There is no ambient global state — the
//! registry is constructed once and injected wherever it is needed.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::obs;

/// Components guarded by the breaker layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    ModelApi,
    Executor,
    Serialization,
    Validation,
    ExternalIo,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::ModelApi,
        Component::Executor,
        Component::Serialization,
        Component::Validation,
        Component::ExternalIo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::ModelApi => "model_api",
            Component::Executor => "executor",
            Component::Serialization => "serialization",
            Component::Validation => "validation",
            Component::ExternalIo => "external_io",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health states a component moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failing,
    CircuitOpen,
    Recovering,
}

/// Breaker settings for one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit stays closed to traffic (milliseconds).
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Mutable health record for one component. Only the registry writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    /// When the circuit last opened, if it ever did.
    pub opened_at: Option<DateTime<Utc>>,
    pub config: BreakerConfig,
}

impl ComponentHealth {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            opened_at: None,
            config,
        }
    }

    fn state_for_failures(&self, failures: u32) -> HealthState {
        let threshold = self.config.failure_threshold.max(1);
        if failures >= threshold {
            HealthState::CircuitOpen
        } else if failures * 2 >= threshold {
            HealthState::Failing
        } else if failures > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn recovery_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(opened) => {
                let elapsed = (now - opened).num_milliseconds().max(0) as u64;
                elapsed >= self.config.recovery_timeout_ms
            }
            None => true,
        }
    }
}

/// Outcome of asking the registry whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Normal traffic.
    Admit,
    /// Single probe through a recovering circuit.
    Probe,
    /// Circuit open, fail fast.
    Reject,
}

/// Owns every component's health record and applies the state machine.
pub struct BreakerRegistry {
    inner: Mutex<HashMap<Component, ComponentHealth>>,
}

impl BreakerRegistry {
    /// Build a registry from per-component settings; components without an
    /// entry get [`BreakerConfig::default`].
    pub fn new(configs: &HashMap<Component, BreakerConfig>) -> Self {
        let mut map = HashMap::new();
        for component in Component::ALL {
            let config = configs.get(&component).cloned().unwrap_or_default();
            map.insert(component, ComponentHealth::new(config));
        }
        Self {
            inner: Mutex::new(map),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&HashMap::new())
    }

    /// Snapshot of one component's health.
    pub fn health(&self, component: Component) -> ComponentHealth {
        let guard = self.lock();
        guard
            .get(&component)
            .cloned()
            .unwrap_or_else(|| ComponentHealth::new(BreakerConfig::default()))
    }

    /// Run `work` under the breaker for `component`.
    ///
    /// An open circuit rejects the call with
    /// [`CoreError::UpstreamUnavailable`] without invoking `work`. Once the
    /// recovery timeout has elapsed a single probe call flows; its outcome
    /// decides between full recovery and re-opening the circuit.
    pub async fn call<F, Fut, T>(&self, component: Component, work: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut probe_guard = None;
        match self.admit(component, Utc::now()) {
            Admission::Reject => {
                obs::emit_breaker_rejected(component.as_str());
                return Err(CoreError::UpstreamUnavailable { component });
            }
            Admission::Probe => {
                obs::emit_breaker_probe(component.as_str());
                // If the caller drops this future mid-probe, the circuit
                // must not stay `Recovering` with no probe in flight.
                probe_guard = Some(ProbeGuard {
                    registry: self,
                    component,
                    armed: true,
                });
            }
            Admission::Admit => {}
        }

        let result = work().await;
        if let Some(mut guard) = probe_guard.take() {
            guard.armed = false;
        }
        match &result {
            Ok(_) => self.record_success(component),
            Err(_) => self.record_failure(component, Utc::now()),
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Component, ComponentHealth>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self, component: Component, now: DateTime<Utc>) -> Admission {
        let mut guard = self.lock();
        let Some(health) = guard.get_mut(&component) else {
            return Admission::Admit;
        };
        match health.state {
            HealthState::CircuitOpen => {
                if health.recovery_elapsed(now) {
                    health.state = HealthState::Recovering;
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            // One probe at a time: further traffic keeps failing fast until
            // the probe resolves the circuit one way or the other.
            HealthState::Recovering => Admission::Reject,
            _ => Admission::Admit,
        }
    }

    fn record_success(&self, component: Component) {
        let mut guard = self.lock();
        if let Some(health) = guard.get_mut(&component) {
            let was_recovering = health.state == HealthState::Recovering;
            health.consecutive_failures = 0;
            health.opened_at = None;
            health.state = HealthState::Healthy;
            if was_recovering {
                obs::emit_breaker_closed(component.as_str());
            }
        }
    }

    /// An admitted probe whose future was dropped before reporting back:
    /// re-open the circuit with a fresh recovery window.
    fn reopen_abandoned_probe(&self, component: Component, now: DateTime<Utc>) {
        let mut guard = self.lock();
        if let Some(health) = guard.get_mut(&component) {
            if health.state == HealthState::Recovering {
                health.state = HealthState::CircuitOpen;
                health.opened_at = Some(now);
                obs::emit_breaker_opened(component.as_str(), health.consecutive_failures);
            }
        }
    }

    fn record_failure(&self, component: Component, now: DateTime<Utc>) {
        let mut guard = self.lock();
        if let Some(health) = guard.get_mut(&component) {
            if health.state == HealthState::Recovering {
                // Failed probe: re-open with a fresh recovery window.
                health.state = HealthState::CircuitOpen;
                health.opened_at = Some(now);
                obs::emit_breaker_opened(component.as_str(), health.consecutive_failures);
                return;
            }
            health.consecutive_failures += 1;
            let next = health.state_for_failures(health.consecutive_failures);
            if next == HealthState::CircuitOpen && health.state != HealthState::CircuitOpen {
                health.opened_at = Some(now);
                obs::emit_breaker_opened(component.as_str(), health.consecutive_failures);
            }
            health.state = next;
        }
    }
}

struct ProbeGuard<'a> {
    registry: &'a BreakerRegistry,
    component: Component,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry
                .reopen_abandoned_probe(self.component, Utc::now());
        }
    }
}
