use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::metrics::RuntimeMetrics;
use crate::store::{StateStore, StoreError, TokenBucket};

/// Stable hint when a bucket can never serve the request (zero refill).
const STALLED_RETRY_MS: u64 = 60_000;
/// Hint after losing every CAS attempt to contention.
const CONTENTION_RETRY_MS: u64 = 25;

#[derive(Debug, Clone)]
pub struct CredentialLimit {
    pub name: String,
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct EndpointLimit {
    pub endpoint: String,
    pub credentials: Vec<CredentialLimit>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub endpoints: Vec<EndpointLimit>,
    /// Bounded CAS retries per acquire before reporting contention.
    pub cas_attempts: u32,
    /// Tokens taken per local sub-lease; 0 disables sub-leasing.
    pub sublease_tokens: f64,
    pub sublease_ttl_ms: u64,
}

impl RateLimitConfig {
    /// One endpoint with a single credential.
    pub fn single(endpoint: &str, capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            endpoints: vec![EndpointLimit {
                endpoint: endpoint.to_string(),
                credentials: vec![CredentialLimit {
                    name: "default".to_string(),
                    capacity,
                    refill_per_sec,
                }],
            }],
            cas_attempts: 8,
            sublease_tokens: 0.0,
            sublease_ttl_ms: 10_000,
        }
    }

    /// The ATProto ceiling: 3000 requests per 5 minutes per credential.
    pub fn atproto_default() -> Self {
        Self::single("atproto", 3000.0, 10.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Acquire {
    Granted { credential: String },
    RetryAfter { ms: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit budget exhausted for {endpoint} after {waited_ms}ms")]
    Exhausted { endpoint: String, waited_ms: u64 },
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct SubLease {
    credential: String,
    tokens: f64,
    expires_at: DateTime<Utc>,
}

/// Shared token buckets per `(endpoint, credential)`.
///
/// Canonical bucket state lives in the state store and is mutated by CAS, so
/// every worker process sees the same budget. Credential selection picks the
/// fullest bucket (ties round-robin); fairness under contention comes from
/// bounded CAS attempts plus jittered waits in [`acquire`](Self::acquire).
pub struct RateLimitManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<RuntimeMetrics>,
    cfg: RateLimitConfig,
    rr: AtomicUsize,
    subleases: Mutex<HashMap<String, SubLease>>,
}

impl RateLimitManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<RuntimeMetrics>,
        cfg: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            cfg,
            rr: AtomicUsize::new(0),
            subleases: Mutex::new(HashMap::new()),
        }
    }

    fn bucket_key(endpoint: &str, credential: &str) -> String {
        format!("{endpoint}/{credential}")
    }

    fn refilled(bucket: &TokenBucket, now: DateTime<Utc>) -> TokenBucket {
        let elapsed_ms = (now - bucket.last_refill_at).num_milliseconds().max(0);
        let refill = bucket.refill_per_sec * elapsed_ms as f64 / 1000.0;
        TokenBucket {
            available: (bucket.available + refill).min(bucket.capacity),
            last_refill_at: now,
            ..bucket.clone()
        }
    }

    /// Create any missing bucket rows at their full capacity.
    pub async fn ensure_buckets(&self) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        for ep in &self.cfg.endpoints {
            for cred in &ep.credentials {
                let key = Self::bucket_key(&ep.endpoint, &cred.name);
                if self.store.load_bucket(&key).await?.is_none() {
                    let bucket = TokenBucket {
                        capacity: cred.capacity,
                        refill_per_sec: cred.refill_per_sec,
                        available: cred.capacity,
                        last_refill_at: now,
                        version: 1,
                    };
                    // A racing creator winning the insert is fine.
                    let _ = self.store.store_bucket(&key, 0, &bucket).await?;
                }
            }
        }
        Ok(())
    }

    /// One grant attempt. Never sleeps; returns the server-style hint when
    /// tokens are short.
    pub async fn try_acquire(&self, endpoint: &str, cost: f64) -> Result<Acquire, RateLimitError> {
        self.surrender_expired_subleases().await?;
        if let Some(granted) = self.try_acquire_from_sublease(endpoint, cost) {
            return Ok(Acquire::Granted { credential: granted });
        }

        let ep = self
            .cfg
            .endpoints
            .iter()
            .find(|e| e.endpoint == endpoint)
            .ok_or_else(|| RateLimitError::UnknownEndpoint(endpoint.to_string()))?;

        let now = self.clock.now();
        for _ in 0..self.cfg.cas_attempts.max(1) {
            // Load every credential's bucket, refilled to `now`.
            let mut states: Vec<(String, TokenBucket, i64)> = Vec::with_capacity(ep.credentials.len());
            for cred in &ep.credentials {
                let key = Self::bucket_key(endpoint, &cred.name);
                let bucket = match self.store.load_bucket(&key).await? {
                    Some(b) => b,
                    None => {
                        self.ensure_buckets().await?;
                        match self.store.load_bucket(&key).await? {
                            Some(b) => b,
                            None => continue,
                        }
                    }
                };
                let version = bucket.version;
                states.push((cred.name.clone(), Self::refilled(&bucket, now), version));
            }
            if states.is_empty() {
                return Err(RateLimitError::UnknownEndpoint(endpoint.to_string()));
            }

            // Highest fill ratio wins; ties rotate round-robin.
            let best_ratio = states
                .iter()
                .map(|(_, b, _)| fill_ratio(b))
                .fold(f64::MIN, f64::max);
            let tied: Vec<usize> = states
                .iter()
                .enumerate()
                .filter(|(_, (_, b, _))| fill_ratio(b) >= best_ratio)
                .map(|(i, _)| i)
                .collect();
            let pick = tied[self.rr.fetch_add(1, Ordering::Relaxed) % tied.len()];
            let (credential, refreshed, old_version) = &states[pick];

            if refreshed.available >= cost {
                let next = TokenBucket {
                    available: refreshed.available - cost,
                    version: old_version + 1,
                    ..refreshed.clone()
                };
                let key = Self::bucket_key(endpoint, credential);
                if self.store.store_bucket(&key, *old_version, &next).await? {
                    return Ok(Acquire::Granted {
                        credential: credential.clone(),
                    });
                }
                // Lost the CAS; re-read and try again.
                continue;
            }

            let shortfall = cost - refreshed.available;
            let ms = if refreshed.refill_per_sec > 0.0 {
                (shortfall / refreshed.refill_per_sec * 1000.0).ceil() as u64
            } else {
                STALLED_RETRY_MS
            };
            return Ok(Acquire::RetryAfter { ms });
        }

        Ok(Acquire::RetryAfter {
            ms: CONTENTION_RETRY_MS,
        })
    }

    /// Blocking acquire with a bounded wait budget. Waits are guided by the
    /// bucket's own hint plus jitter and are surfaced in metrics.
    pub async fn acquire(
        &self,
        endpoint: &str,
        cost: f64,
        max_wait: std::time::Duration,
    ) -> Result<String, RateLimitError> {
        let budget_ms = max_wait.as_millis() as u64;
        let mut waited_ms = 0u64;
        loop {
            match self.try_acquire(endpoint, cost).await? {
                Acquire::Granted { credential } => return Ok(credential),
                Acquire::RetryAfter { ms } => {
                    if waited_ms >= budget_ms {
                        return Err(RateLimitError::Exhausted {
                            endpoint: endpoint.to_string(),
                            waited_ms,
                        });
                    }
                    let jitter = rand::thread_rng().gen_range(0..=ms / 4 + 1);
                    let sleep_ms = (ms + jitter).min(budget_ms - waited_ms).max(1);
                    RuntimeMetrics::inc(&self.metrics.rate_limit_waits);
                    RuntimeMetrics::add(&self.metrics.rate_limit_wait_ms, sleep_ms as i64);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    waited_ms += sleep_ms;
                }
            }
        }
    }

    fn try_acquire_from_sublease(&self, endpoint: &str, cost: f64) -> Option<String> {
        let now = self.clock.now();
        let mut subleases = self.subleases.lock().unwrap_or_else(|e| e.into_inner());
        let lease = subleases.get_mut(endpoint)?;
        if lease.expires_at < now || lease.tokens < cost {
            return None;
        }
        lease.tokens -= cost;
        Some(lease.credential.clone())
    }

    /// Pull a block of tokens into this process so subsequent acquires skip
    /// the store round-trip. Returns false when the shared bucket is short.
    pub async fn take_sublease(&self, endpoint: &str) -> Result<bool, RateLimitError> {
        let tokens = self.cfg.sublease_tokens;
        if tokens <= 0.0 {
            return Ok(false);
        }
        match self.try_acquire(endpoint, tokens).await? {
            Acquire::Granted { credential } => {
                let expires_at =
                    self.clock.now() + Duration::milliseconds(self.cfg.sublease_ttl_ms as i64);
                let mut subleases = self.subleases.lock().unwrap_or_else(|e| e.into_inner());
                subleases.insert(
                    endpoint.to_string(),
                    SubLease {
                        credential,
                        tokens,
                        expires_at,
                    },
                );
                Ok(true)
            }
            Acquire::RetryAfter { .. } => Ok(false),
        }
    }

    /// Return unused sub-leased tokens to their shared buckets. Called on
    /// clean shutdown.
    pub async fn surrender_subleases(&self) -> Result<(), RateLimitError> {
        let drained: Vec<(String, SubLease)> = {
            let mut subleases = self.subleases.lock().unwrap_or_else(|e| e.into_inner());
            subleases.drain().collect()
        };
        for (endpoint, lease) in drained {
            self.return_tokens(&endpoint, &lease).await?;
        }
        Ok(())
    }

    /// Lapsed sub-leases give their leftover tokens back before anyone
    /// acquires past them.
    async fn surrender_expired_subleases(&self) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        let expired: Vec<(String, SubLease)> = {
            let mut subleases = self.subleases.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<String> = subleases
                .iter()
                .filter(|(_, lease)| lease.expires_at < now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| subleases.remove(&k).map(|lease| (k, lease)))
                .collect()
        };
        for (endpoint, lease) in expired {
            self.return_tokens(&endpoint, &lease).await?;
        }
        Ok(())
    }

    async fn return_tokens(&self, endpoint: &str, lease: &SubLease) -> Result<(), RateLimitError> {
        if lease.tokens <= 0.0 {
            return Ok(());
        }
        let key = Self::bucket_key(endpoint, &lease.credential);
        for _ in 0..self.cfg.cas_attempts.max(1) {
            let Some(bucket) = self.store.load_bucket(&key).await? else {
                return Ok(());
            };
            let now = self.clock.now();
            let refreshed = Self::refilled(&bucket, now);
            let next = TokenBucket {
                available: (refreshed.available + lease.tokens).min(refreshed.capacity),
                version: bucket.version + 1,
                ..refreshed
            };
            if self.store.store_bucket(&key, bucket.version, &next).await? {
                return Ok(());
            }
        }
        Ok(())
    }
}

fn fill_ratio(bucket: &TokenBucket) -> f64 {
    if bucket.capacity <= 0.0 {
        return 0.0;
    }
    bucket.available / bucket.capacity
}
