//!
//! Circuit breaker guarding primitive invocations
//!
//! Tracks consecutive failures per capability key and fast-fails calls
//! while the backing capability is given time to recover.
//!

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{ConveyorError, DataPacket, Primitive};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Observable snapshot of one capability's circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStatus {
    /// Whether the circuit is currently open (fast-failing)
    pub open: bool,

    /// Consecutive failures recorded while closed
    pub failure_count: u32,

    /// When the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerStatus {
    fn closed() -> Self {
        Self {
            open: false,
            failure_count: 0,
            opened_at: None,
        }
    }
}

/// Per-key circuit state
struct Circuit {
    open: bool,
    failure_count: u32,
    opened_at: Instant,
    opened_at_wall: Option<DateTime<Utc>>,
    // When the in-flight half-open probe was admitted; other callers
    // keep fast-failing until it reports back or goes stale
    probe_started: Option<Instant>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            open: false,
            failure_count: 0,
            opened_at: Instant::now(),
            opened_at_wall: None,
            probe_started: None,
        }
    }

    fn trip(&mut self) {
        self.open = true;
        self.probe_started = None;
        self.opened_at = Instant::now();
        self.opened_at_wall = Some(Utc::now());
    }
}

/// Circuit breaker keyed by capability
///
/// Each key (typically a primitive name) gets an independent circuit.
/// Failures of one capability never open another's circuit. Internal
/// state lives behind its own mutex, independent of run locking.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a call for `key` may proceed
    ///
    /// An open circuit whose timeout has elapsed admits one half-open
    /// probe; concurrent callers keep fast-failing until the probe
    /// reports back. A probe that never reports back (its future was
    /// dropped mid-call, e.g. by a step timeout) only blocks for
    /// `open_timeout`, after which the next caller becomes the probe.
    async fn allow(&self, key: &str) -> Result<(), ConveyorError> {
        let mut circuits = self.circuits.lock().await;
        let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);

        if !circuit.open {
            return Ok(());
        }
        let now = Instant::now();
        if let Some(started) = circuit.probe_started {
            if now.duration_since(started) <= self.config.open_timeout {
                return Err(ConveyorError::CircuitOpen(key.to_string()));
            }
            debug!(capability = %key, "Stale probe, admitting a new one");
        }
        if circuit.opened_at.elapsed() > self.config.open_timeout {
            debug!(capability = %key, "Circuit half-open, admitting probe");
            circuit.probe_started = Some(now);
            Ok(())
        } else {
            Err(ConveyorError::CircuitOpen(key.to_string()))
        }
    }

    /// Record a successful call for `key`
    async fn report_success(&self, key: &str) {
        let mut circuits = self.circuits.lock().await;
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.open {
                debug!(capability = %key, "Circuit closed after successful probe");
            }
            circuit.open = false;
            circuit.probe_started = None;
            circuit.failure_count = 0;
            circuit.opened_at_wall = None;
        }
    }

    /// Record a failed call for `key`
    async fn report_failure(&self, key: &str) {
        let mut circuits = self.circuits.lock().await;
        let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);

        if circuit.open {
            // Failed probe keeps the circuit open with a fresh timer
            warn!(capability = %key, "Probe failed, circuit stays open");
            circuit.trip();
        } else {
            circuit.failure_count += 1;
            if circuit.failure_count >= self.config.failure_threshold {
                warn!(
                    capability = %key,
                    failures = circuit.failure_count,
                    "Failure threshold reached, circuit opened"
                );
                circuit.trip();
            }
        }
    }

    /// Run `operation` under the circuit for `key`
    ///
    /// Fast-fails with `CircuitOpen` without invoking the operation when
    /// the circuit is open.
    pub async fn call<T, F, Fut>(&self, key: &str, operation: F) -> Result<T, ConveyorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ConveyorError>>,
    {
        self.allow(key).await?;

        match operation().await {
            Ok(value) => {
                self.report_success(key).await;
                Ok(value)
            }
            Err(error) => {
                self.report_failure(key).await;
                Err(error)
            }
        }
    }

    /// Current status of a key's circuit
    pub async fn status(&self, key: &str) -> CircuitBreakerStatus {
        let circuits = self.circuits.lock().await;
        circuits
            .get(key)
            .map(|circuit| CircuitBreakerStatus {
                open: circuit.open,
                failure_count: circuit.failure_count,
                opened_at: circuit.opened_at_wall,
            })
            .unwrap_or_else(CircuitBreakerStatus::closed)
    }
}

/// Decorator running a primitive's calls through a circuit breaker
///
/// The same breaker instance can guard primitives, network clients, or
/// adapters; the key decides which circuit each call lands on.
pub struct GuardedPrimitive {
    inner: Arc<dyn Primitive>,
    breaker: Arc<CircuitBreaker>,
    key: String,
}

impl GuardedPrimitive {
    /// Wrap a primitive with a breaker and a circuit key
    pub fn new(inner: Arc<dyn Primitive>, breaker: Arc<CircuitBreaker>, key: impl Into<String>) -> Self {
        Self {
            inner,
            breaker,
            key: key.into(),
        }
    }
}

#[async_trait]
impl Primitive for GuardedPrimitive {
    async fn invoke(&self, request: DataPacket) -> Result<DataPacket, ConveyorError> {
        let inner = self.inner.clone();
        self.breaker
            .call(&self.key, move || async move { inner.invoke(request).await })
            .await
    }
}
