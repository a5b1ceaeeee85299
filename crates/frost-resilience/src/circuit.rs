//! Per-identity circuit breaker.
//!
//! Each worker identity has its own closed -> open -> half-open state machine.
//! A circuit opens after `failure_threshold` consecutive failures and refuses
//! work until `cooldown` has passed since the last failure. After that the
//! circuit is half-open: the next `allow` call is admitted as the single probe,
//! and the probe's reported outcome closes or re-opens the circuit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ResilienceError;

/// Circuit state for one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is admitted.
    #[serde(with = "crate::millis")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Health record for one worker identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub state: CircuitState,
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    opened_at: Option<Instant>,
    #[serde(skip)]
    probe_in_flight: bool,
}

impl AgentHealth {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            state: CircuitState::Closed,
            last_failure_time: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn cooled_down(&self, cooldown: Duration) -> bool {
        self.opened_at
            .is_some_and(|opened| opened.elapsed() >= cooldown)
    }

    /// State as seen from outside: an open circuit whose cooldown has passed is half-open.
    fn effective_state(&self, cooldown: Duration) -> CircuitState {
        match self.state {
            CircuitState::Open if self.cooled_down(cooldown) => CircuitState::HalfOpen,
            state => state,
        }
    }
}

/// Per-identity circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    health: DashMap<String, AgentHealth>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            health: DashMap::new(),
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            health: DashMap::new(),
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Record a successful call: resets the failure streak and closes the circuit.
    pub fn record_success(&self, agent_id: &str) {
        let mut entry = self
            .health
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentHealth::new(agent_id));
        let health = entry.value_mut();

        let previous = health.state;
        health.total_successes += 1;
        health.consecutive_failures = 0;
        health.state = CircuitState::Closed;
        health.opened_at = None;
        health.probe_in_flight = false;

        if previous != CircuitState::Closed {
            info!(agent_id, from = ?previous, "circuit closed");
        }
    }

    /// Record a failed call; opens the circuit once the threshold is reached.
    pub fn record_failure(&self, agent_id: &str) {
        let mut entry = self
            .health
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentHealth::new(agent_id));
        let health = entry.value_mut();

        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.total_failures += 1;
        health.last_failure_time = Some(Utc::now());

        match health.state {
            CircuitState::HalfOpen => {
                health.state = CircuitState::Open;
                health.opened_at = Some(Instant::now());
                health.probe_in_flight = false;
                warn!(
                    agent_id,
                    consecutive_failures = health.consecutive_failures,
                    "probe failed, circuit re-opened"
                );
            }
            CircuitState::Open => {
                // Cooldown runs from the most recent failure.
                health.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                if health.consecutive_failures >= self.config.failure_threshold {
                    health.state = CircuitState::Open;
                    health.opened_at = Some(Instant::now());
                    warn!(
                        agent_id,
                        consecutive_failures = health.consecutive_failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                } else {
                    debug!(
                        agent_id,
                        consecutive_failures = health.consecutive_failures,
                        "failure recorded"
                    );
                }
            }
        }
    }

    /// Whether work may be dispatched to `agent_id`.
    ///
    /// Closed circuits always allow. An open circuit refuses until the cooldown
    /// has passed; the first caller after that moves it to half-open and is
    /// admitted as the probe. Later callers are refused until the probe reports.
    pub fn allow(&self, agent_id: &str) -> bool {
        let Some(mut entry) = self.health.get_mut(agent_id) else {
            return true;
        };
        let health = entry.value_mut();

        match health.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if health.cooled_down(self.config.cooldown) {
                    health.state = CircuitState::HalfOpen;
                    health.probe_in_flight = true;
                    info!(agent_id, "circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => !health.probe_in_flight,
        }
    }

    /// Snapshot of one identity's health.
    pub fn get_health(&self, agent_id: &str) -> Option<AgentHealth> {
        self.health.get(agent_id).map(|entry| {
            let mut health = entry.value().clone();
            health.state = health.effective_state(self.config.cooldown);
            health
        })
    }

    /// Current state; identities never seen are closed.
    pub fn state(&self, agent_id: &str) -> CircuitState {
        self.get_health(agent_id)
            .map(|h| h.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of every tracked identity, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentHealth> {
        let mut all: Vec<AgentHealth> = self
            .health
            .iter()
            .map(|entry| {
                let mut health = entry.value().clone();
                health.state = health.effective_state(self.config.cooldown);
                health
            })
            .collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Forget an identity entirely.
    pub fn reset(&self, agent_id: &str) {
        if self.health.remove(agent_id).is_some() {
            info!(agent_id, "circuit reset");
        }
    }
}
