use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};

use crate::config::BranchConfig;
use crate::error::{BranchError, Result};
use crate::model::CoordinationRecord;
use crate::store::{CoordinationStore, FileStore, StoreLock};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const POLL_JITTER_MS: u64 = 100;

/// Elects one creator per key among cooperating workers and publishes what
/// it created.
///
/// Without a store the coordinator runs solo: this process is always the
/// creator and signals are no-ops.
///
/// A scoped coordinator prefixes every key with its namespace, so records
/// of one session never answer for another.
#[derive(Clone)]
pub struct Coordinator {
    store: Option<Arc<dyn CoordinationStore>>,
    namespace: Option<String>,
    worker_id: String,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl Coordinator {
    pub fn solo() -> Self {
        Self {
            store: None,
            namespace: None,
            worker_id: "solo".to_string(),
            lock_timeout: Duration::from_secs(300),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn shared(store: Arc<dyn CoordinationStore>, worker_id: impl Into<String>) -> Self {
        Self {
            store: Some(store),
            worker_id: worker_id.into(),
            ..Self::solo()
        }
    }

    /// File-backed when a coordination directory is configured, solo otherwise
    pub fn from_config(config: &BranchConfig) -> Result<Self> {
        let coordinator = match config.coordination_path() {
            Some(dir) => {
                let store = FileStore::new(&dir)?;
                info!("Coordinating through {} as {}", dir.display(), config.worker_id());
                Self::shared(Arc::new(store), config.worker_id())
            }
            None => Self::solo(),
        };
        Ok(coordinator.with_lock_timeout(config.lock_timeout()))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Same store and settings, keys prefixed with `namespace`
    pub fn scoped(&self, namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..self.clone()
        }
    }

    pub fn is_shared(&self) -> bool {
        self.store.is_some()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Return the resource published under `key`, creating it with `factory`
    /// when nobody has yet. The flag is true only in the process whose
    /// factory ran.
    ///
    /// A factory failure is published so that waiting workers fail with
    /// `CreatorFailed` instead of trying again.
    pub async fn coordinate_resource<T, F, Fut>(&self, key: &str, factory: F) -> Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(store) = &self.store else {
            return factory().await.map(|value| (value, true));
        };
        let key = &self.key(key);

        if let Some(value) = self.read_ready(store.as_ref(), key).await? {
            debug!("{} already published, reusing", key);
            return Ok((value, false));
        }

        let _lock = self.acquire(store.as_ref(), key).await?;

        // The previous holder may have published while we waited
        if let Some(value) = self.read_ready(store.as_ref(), key).await? {
            debug!("{} published while waiting for the lock", key);
            return Ok((value, false));
        }

        info!("{} elected to create {}", self.worker_id, key);
        match factory().await {
            Ok(value) => {
                let json = serde_json::to_value(&value).map_err(|e| BranchError::json(key, e))?;
                store
                    .write_record(key, &CoordinationRecord::ready(json, &self.worker_id))
                    .await?;
                Ok((value, true))
            }
            Err(e) => {
                let record = CoordinationRecord::failed(e.to_string(), &self.worker_id);
                if let Err(write_err) = store.write_record(key, &record).await {
                    warn!("Could not publish failure of {}: {}", key, write_err);
                }
                Err(e)
            }
        }
    }

    /// Read what another worker published under `key`, without ever creating
    pub async fn published<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match &self.store {
            Some(store) => self.read_ready(store.as_ref(), &self.key(key)).await,
            None => Ok(None),
        }
    }

    /// Drop the record under `key` so the next session starts over
    pub async fn retire(&self, key: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let key = self.key(key);
        let _lock = self.acquire(store.as_ref(), &key).await?;
        store.remove_record(&key).await?;
        debug!("{} retired {}", self.worker_id, key);
        Ok(())
    }

    pub async fn retire_signal(&self, name: &str) -> Result<()> {
        self.retire(&signal_key(name)).await
    }

    pub async fn send_signal(&self, name: &str) -> Result<()> {
        let record = CoordinationRecord::ready(serde_json::Value::Bool(true), &self.worker_id);
        self.write_signal(name, record).await
    }

    /// Release waiters of `name` with an error instead of success
    pub async fn fail_signal(&self, name: &str, message: &str) -> Result<()> {
        let record = CoordinationRecord::failed(message, &self.worker_id);
        self.write_signal(name, record).await
    }

    pub async fn wait_for_signal(&self, name: &str, timeout: Duration) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let key = self.key(&signal_key(name));
        let started = Instant::now();
        loop {
            if let Some(record) = store.read_record(&key).await? {
                if let Some(message) = record.error {
                    return Err(BranchError::SignalFailed {
                        signal: name.to_string(),
                        message,
                    });
                }
                if record.ready {
                    debug!("Signal {} received from {}", name, record.created_by);
                    return Ok(());
                }
            }

            if started.elapsed() >= timeout {
                return Err(BranchError::CoordinationTimeout {
                    what: format!("signal '{}'", name),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.next_poll()).await;
        }
    }

    async fn write_signal(&self, name: &str, record: CoordinationRecord) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let key = self.key(&signal_key(name));
        let _lock = self.acquire(store.as_ref(), &key).await?;
        store.write_record(&key, &record).await
    }

    async fn read_ready<T: DeserializeOwned>(
        &self,
        store: &dyn CoordinationStore,
        key: &str,
    ) -> Result<Option<T>> {
        let Some(record) = store.read_record(key).await? else {
            return Ok(None);
        };
        if let Some(message) = &record.error {
            return Err(BranchError::CreatorFailed {
                key: key.to_string(),
                message: message.clone(),
            });
        }
        record.decode().map_err(|e| BranchError::json(key, e))
    }

    async fn acquire(&self, store: &dyn CoordinationStore, key: &str) -> Result<Box<dyn StoreLock>> {
        let started = Instant::now();
        loop {
            if let Some(lock) = store.try_lock(key).await? {
                return Ok(lock);
            }
            if started.elapsed() >= self.lock_timeout {
                return Err(BranchError::CoordinationTimeout {
                    what: format!("lock '{}'", key),
                    waited: started.elapsed(),
                });
            }
            debug!("{} waiting for lock {}", self.worker_id, key);
            tokio::time::sleep(self.next_poll()).await;
        }
    }

    fn key(&self, key: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}_{}", namespace, key),
            None => key.to_string(),
        }
    }

    fn next_poll(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=POLL_JITTER_MS);
        self.poll_interval + Duration::from_millis(jitter)
    }
}

pub fn signal_key(name: &str) -> String {
    format!("signal_{}", name)
}
