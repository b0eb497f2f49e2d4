//! A response cache in front of a text-completion service
//!
//! The service itself is opaque to this crate, it only has to implement
//! [Completion]. Successful responses are remembered for a while, keyed by a
//! digest of everything in the request.

use crate::errors::CompletionError;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    str::FromStr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Default number of cached responses
pub const DEFAULT_CACHE_ENTRIES: usize = 48;

/// Default age after which a cached response is dropped
pub const DEFAULT_CACHE_AGE: Duration = Duration::from_secs(10 * 60);

/// Inference providers we know how to talk to
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceProvider {
    HuggingFace,
}

impl InferenceProvider {
    pub fn name(&self) -> &'static str {
        match self {
            InferenceProvider::HuggingFace => "huggingface",
        }
    }
}

impl fmt::Display for InferenceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InferenceProvider {
    type Err = CompletionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "huggingface" => Ok(InferenceProvider::HuggingFace),
            _ => Err(CompletionError::UnsupportedProvider(s.to_string())),
        }
    }
}

/// One prompt for a completion service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub provider: InferenceProvider,
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl CompletionRequest {
    /// Cache key covering every field of the request
    pub fn cache_key(&self) -> String {
        let joined = [
            self.provider.name().to_string(),
            self.model.clone(),
            self.prompt.clone(),
            self.max_tokens.to_string(),
            self.temperature.to_string(),
        ]
        .join("::");
        format!("{:x}", Sha256::digest(joined.as_bytes()))
    }
}

/// A text-completion service
pub trait Completion: Send + Sync {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<String, CompletionError>> + Send;
}

#[derive(Debug)]
struct CacheEntry {
    value: String,
    stored: Instant,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
}

/// Thread-safe LRU cache with time-based eviction
#[derive(Debug)]
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    max_age: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        ResponseCache::new(DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_AGE)
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        ResponseCache {
            inner: Mutex::new(CacheInner::default()),
            max_entries,
            max_age,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;
        let expired = match inner.entries.get_mut(key) {
            None => return None,
            Some(entry) if entry.stored.elapsed() > self.max_age => true,
            Some(entry) => {
                entry.last_used = now;
                return Some(entry.value.clone());
            }
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    pub fn put(&self, key: &str, value: String) {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored: Instant::now(),
                last_used: now,
            },
        );
        let max_age = self.max_age;
        inner.entries.retain(|_, entry| entry.stored.elapsed() <= max_age);
        while inner.entries.len() > self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => inner.entries.remove(&key),
                None => break,
            };
        }
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Number of live entries, after dropping expired ones
    pub fn len(&self) -> usize {
        let mut inner = self.lock();
        let max_age = self.max_age;
        inner.entries.retain(|_, entry| entry.stored.elapsed() <= max_age);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [Completion] service with a [ResponseCache] in front
#[derive(Debug)]
pub struct CachedCompletion<C> {
    inner: C,
    cache: ResponseCache,
}

impl<C: Completion> CachedCompletion<C> {
    pub fn new(inner: C) -> Self {
        CachedCompletion::with_cache(inner, ResponseCache::default())
    }

    pub fn with_cache(inner: C, cache: ResponseCache) -> Self {
        CachedCompletion { inner, cache }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Completion> Completion for CachedCompletion<C> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.get(&key) {
            log::debug!("completion cache hit for {}", request.model);
            return Ok(hit);
        }
        let response = self.inner.complete(request).await?;
        self.cache.put(&key, response.clone());
        Ok(response)
    }
}
