use crate::clock::Clock;
use crate::error::RegistrationError;
use crate::storage::DocumentStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CachedValue<V> {
    value: V,
    loaded_at: DateTime<Utc>,
}

/// Single-value cache that owns its invalidation policy.
///
/// Entries older than `ttl` according to the injected clock are reloaded on the next read.
pub struct TtlCache<V: Clone + Send + Sync> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slot: RwLock<Option<CachedValue<V>>>,
}

impl<V: Clone + Send + Sync> TtlCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slot: RwLock::new(None),
        }
    }

    /// Fresh cached value, if any.
    pub async fn peek(&self) -> Option<V> {
        let now = self.clock.now();
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|cached| now - cached.loaded_at < self.ttl)
            .map(|cached| cached.value.clone())
    }

    pub async fn store(&self, value: V) {
        let mut slot = self.slot.write().await;
        *slot = Some(CachedValue {
            value,
            loaded_at: self.clock.now(),
        });
    }

    /// Stale value regardless of age; used when a reload fails.
    pub async fn last_known(&self) -> Option<V> {
        self.slot
            .read()
            .await
            .as_ref()
            .map(|cached| cached.value.clone())
    }
}

/// Process-local allow-list of society origins, rebuilt from the store every `ttl`.
///
/// Staleness only affects CORS answers, so a failed reload falls back to the last list.
pub struct OriginAllowList {
    store: Arc<dyn DocumentStore>,
    cache: TtlCache<Arc<BTreeSet<String>>>,
    static_origins: BTreeSet<String>,
}

impl OriginAllowList {
    pub const DEFAULT_TTL_SECS: i64 = 300;

    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl, clock),
            static_origins: BTreeSet::new(),
        }
    }

    /// Origins that are always allowed (e.g. the platform's own front end).
    pub fn with_static_origins(mut self, origins: impl IntoIterator<Item = String>) -> Self {
        self.static_origins
            .extend(origins.into_iter().map(|o| normalize_origin(&o)));
        self
    }

    pub async fn is_allowed(&self, origin: &str) -> bool {
        let origin = normalize_origin(origin);
        if self.static_origins.contains(&origin) {
            return true;
        }
        match self.origins().await {
            Ok(origins) => origins.contains(&origin),
            Err(err) => {
                warn!(error = %err, "origin allow-list unavailable");
                false
            }
        }
    }

    pub async fn origins(&self) -> Result<Arc<BTreeSet<String>>, RegistrationError> {
        if let Some(cached) = self.cache.peek().await {
            return Ok(cached);
        }

        match self.store.list_allowed_origins().await {
            Ok(list) => {
                let origins: Arc<BTreeSet<String>> =
                    Arc::new(list.iter().map(|o| normalize_origin(o)).collect());
                debug!(count = origins.len(), "origin allow-list reloaded");
                self.cache.store(origins.clone()).await;
                Ok(origins)
            }
            Err(err) => match self.cache.last_known().await {
                Some(stale) => {
                    warn!(error = %err, "origin allow-list reload failed; serving stale list");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
