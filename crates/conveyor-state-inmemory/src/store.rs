use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use conveyor_core::{ConveyorError, ExecutionContext, ExecutionData, RunId, RunStateStore};

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Period of the background sweep for expired entries
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A stored value with an optional expiry
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn live(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

struct LockEntry {
    holder: String,
    expires_at: Instant,
}

/// In-memory run state store
///
/// Expiry is enforced on every read, so the background sweeper is an
/// optimization for memory, not for correctness. An expired run reads
/// back exactly like one that never existed.
pub struct InMemoryRunStateStore {
    config: StoreConfig,
    contexts: DashMap<String, Expiring<ExecutionContext>>,
    data: DashMap<String, Expiring<ExecutionData>>,
    locks: DashMap<String, LockEntry>,
}

impl InMemoryRunStateStore {
    /// Create a store with the given configuration
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            contexts: DashMap::new(),
            data: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Create a store with default configuration
    pub fn with_defaults() -> Self {
        Self::new(StoreConfig::default())
    }

    /// Start the background sweep task for expired entries
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(store.config.sweep_interval).await;
                store.sweep();
            }
        })
    }

    /// Drop expired contexts, data, and locks
    pub fn sweep(&self) {
        let before = self.contexts.len() + self.data.len();
        self.contexts.retain(|_, entry| !entry.is_expired());
        self.data.retain(|_, entry| !entry.is_expired());
        let now = Instant::now();
        self.locks.retain(|_, lock| lock.expires_at > now);
        let after = self.contexts.len() + self.data.len();
        if before != after {
            debug!(evicted = before - after, "Swept expired run state");
        }
    }

    /// Number of live contexts; test introspection
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn read_live<T: Clone>(map: &DashMap<String, Expiring<T>>, key: &str) -> Option<T> {
        {
            let entry = map.get(key)?;
            if !entry.is_expired() {
                return Some(entry.value.clone());
            }
        }
        map.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    fn contains_live<T>(map: &DashMap<String, Expiring<T>>, key: &str) -> bool {
        map.get(key).map(|entry| !entry.is_expired()).unwrap_or(false)
    }
}

#[async_trait]
impl RunStateStore for InMemoryRunStateStore {
    async fn save_context(&self, context: &ExecutionContext) -> Result<(), ConveyorError> {
        trace!(run = %context.run_id, status = ?context.status, "Saving context");
        self.contexts
            .insert(context.run_id.0.clone(), Expiring::live(context.clone()));
        Ok(())
    }

    async fn find_context(&self, run_id: &RunId) -> Result<ExecutionContext, ConveyorError> {
        Self::read_live(&self.contexts, &run_id.0)
            .ok_or_else(|| ConveyorError::RunNotFound(run_id.0.clone()))
    }

    async fn save_data(&self, run_id: &RunId, data: &ExecutionData) -> Result<(), ConveyorError> {
        self.data
            .insert(run_id.0.clone(), Expiring::live(data.clone()));
        Ok(())
    }

    async fn find_data(&self, run_id: &RunId) -> Result<ExecutionData, ConveyorError> {
        Self::read_live(&self.data, &run_id.0)
            .ok_or_else(|| ConveyorError::RunNotFound(run_id.0.clone()))
    }

    async fn remove_state(&self, run_id: &RunId) -> Result<(), ConveyorError> {
        self.contexts.remove(&run_id.0);
        self.data.remove(&run_id.0);
        Ok(())
    }

    async fn contains_context(&self, run_id: &RunId) -> Result<bool, ConveyorError> {
        Ok(Self::contains_live(&self.contexts, &run_id.0))
    }

    async fn contains_data(&self, run_id: &RunId) -> Result<bool, ConveyorError> {
        Ok(Self::contains_live(&self.data, &run_id.0))
    }

    async fn acquire_lock(
        &self,
        run_id: &RunId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ConveyorError> {
        let now = Instant::now();
        let mut acquired = false;

        self.locks
            .entry(run_id.0.clone())
            .and_modify(|lock| {
                // Reentrant for the same holder; expired locks are fair game
                if lock.holder == holder || lock.expires_at <= now {
                    lock.holder = holder.to_string();
                    lock.expires_at = now + ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockEntry {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                }
            });

        if !acquired {
            debug!(run = %run_id, holder = %holder, "Lock contention");
        }
        Ok(acquired)
    }

    async fn release_lock(&self, run_id: &RunId, holder: &str) -> Result<(), ConveyorError> {
        // Only the current holder may release; anything else is a no-op
        self.locks.remove_if(&run_id.0, |_, lock| lock.holder == holder);
        Ok(())
    }

    async fn set_ttl(&self, run_id: &RunId, ttl: Duration) -> Result<(), ConveyorError> {
        let deadline = Instant::now() + ttl;
        let mut touched = false;

        if let Some(mut entry) = self.contexts.get_mut(&run_id.0) {
            entry.expires_at = Some(deadline);
            touched = true;
        }
        if let Some(mut entry) = self.data.get_mut(&run_id.0) {
            entry.expires_at = Some(deadline);
            touched = true;
        }

        if touched {
            Ok(())
        } else {
            Err(ConveyorError::RunNotFound(run_id.0.clone()))
        }
    }
}
