use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::error::AiClientError;

/// Atomic counter for unique request ids within the process.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

struct Entry {
    /// Distinguishes a reused caller id from the registration a lease owns.
    generation: u64,
    token: CancellationToken,
}

/// Tracks in-flight requests. An id present in the map is actively networking
/// and cancellable; once removed the request is terminal.
#[derive(Default)]
pub struct RequestLifecycle {
    inner: Mutex<HashMap<String, Entry>>,
    generation: AtomicU64,
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // Entries stay valid if a holder panicked; keep serving them.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, map: &mut HashMap<String, Entry>, id: &str) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        map.insert(
            id.to_string(),
            Entry {
                generation,
                token: token.clone(),
            },
        );
        (generation, token)
    }

    fn begin_generated(&self) -> (String, u64, CancellationToken) {
        let mut map = self.map();
        let id = loop {
            let candidate = next_request_id();
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };
        let (generation, token) = self.insert(&mut map, &id);
        (id, generation, token)
    }

    fn begin_named(&self, id: &str) -> Result<(u64, CancellationToken), AiClientError> {
        let mut map = self.map();
        if map.contains_key(id) {
            return Err(AiClientError::InvalidRequest(format!(
                "request id already in flight: {id}"
            )));
        }
        Ok(self.insert(&mut map, id))
    }

    /// Register a fresh id and cancellation token.
    pub fn begin(&self) -> (String, CancellationToken) {
        let (id, _, token) = self.begin_generated();
        (id, token)
    }

    /// Trigger cancellation and remove the entry. Returns whether it was found.
    pub fn cancel(&self, id: &str) -> bool {
        match self.map().remove(id) {
            Some(entry) => {
                entry.token.cancel();
                tracing::info!(request_id = id, "request cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Remove the entry whatever the outcome. Idempotent.
    pub fn end(&self, id: &str) {
        self.map().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Sorted ids of in-flight requests.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.map().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Begin a request whose entry is removed when the returned lease drops,
    /// covering success, error, panic and a dropped future alike.
    pub fn lease(&self, requested_id: Option<&str>) -> Result<Lease<'_>, AiClientError> {
        let (id, generation, token) = match requested_id {
            Some(id) => {
                let (generation, token) = self.begin_named(id)?;
                (id.to_string(), generation, token)
            }
            None => self.begin_generated(),
        };
        Ok(Lease {
            lifecycle: self,
            id,
            generation,
            token,
        })
    }

    fn end_generation(&self, id: &str, generation: u64) {
        let mut map = self.map();
        if map.get(id).is_some_and(|e| e.generation == generation) {
            map.remove(id);
        }
    }
}

pub struct Lease<'a> {
    lifecycle: &'a RequestLifecycle,
    id: String,
    generation: u64,
    token: CancellationToken,
}

impl Lease<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.lifecycle.end_generation(&self.id, self.generation);
    }
}

fn next_request_id() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req-{ts}-{seq}")
}
