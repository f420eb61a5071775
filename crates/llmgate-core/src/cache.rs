use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use llmgate_common::GatewayError;
use llmgate_protocol::openai::create_chat_completions::CreateChatCompletionRequestBody;

/// Content-derived cache key. Two requests that would produce the same upstream
/// call hash to the same fingerprint regardless of field order or `stream`/`user`/
/// other fields that don't affect the generated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Builds the fingerprint from the parts of a chat-completions request that
    /// actually influence the upstream's output. `resolved_model` is the mapped
    /// upstream model name, not the OpenAI-style alias the client sent.
    pub fn from_request(body: &CreateChatCompletionRequestBody, resolved_model: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("model".to_string(), Value::String(resolved_model.to_string()));
        fields.insert(
            "messages".to_string(),
            serde_json::to_value(&body.messages).unwrap_or(Value::Null),
        );
        insert_if_some(&mut fields, "tools", &body.tools);
        insert_if_some(&mut fields, "tool_choice", &body.tool_choice);
        insert_if_some(&mut fields, "parallel_tool_calls", &body.parallel_tool_calls);
        insert_if_some(&mut fields, "response_format", &body.response_format);
        insert_if_some(&mut fields, "temperature", &body.temperature);
        insert_if_some(&mut fields, "top_p", &body.top_p);
        insert_if_some(&mut fields, "max_tokens", &body.max_tokens);
        insert_if_some(&mut fields, "max_completion_tokens", &body.max_completion_tokens);
        insert_if_some(&mut fields, "n", &body.n);
        insert_if_some(&mut fields, "stop", &body.stop);
        insert_if_some(&mut fields, "seed", &body.seed);
        insert_if_some(&mut fields, "logit_bias", &body.logit_bias);
        insert_if_some(&mut fields, "frequency_penalty", &body.frequency_penalty);
        insert_if_some(&mut fields, "presence_penalty", &body.presence_penalty);

        // `Map` here is BTreeMap-backed (the `preserve_order` feature is never
        // enabled in this workspace), so this print already has sorted keys.
        let canonical = Value::Object(fields).to_string();
        Self(*blake3::hash(canonical.as_bytes()).as_bytes())
    }
}

/// Eligibility: non-streaming, no tools, and effectively-zero temperature
/// (unspecified defaults to the model's own default of 0).
pub fn is_cacheable(body: &CreateChatCompletionRequestBody, cache_enabled: bool) -> bool {
    if !cache_enabled {
        return false;
    }
    if body.stream.unwrap_or(false) {
        return false;
    }
    if body.tools.as_ref().is_some_and(|tools| !tools.is_empty()) {
        return false;
    }
    body.temperature.map(|t| t == 0.0).unwrap_or(true)
}

fn insert_if_some<T: serde::Serialize>(fields: &mut Map<String, Value>, key: &str, value: &Option<T>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), serde_json::to_value(value).unwrap_or(Value::Null));
    }
}

/// What gets cached: the buffered (non-streamed) response body plus enough to
/// reconstruct a streaming reply on a cache hit for a streaming request.
#[derive(Debug, Clone)]
pub struct CachedCompletion {
    pub response_json: Value,
}

type PendingSlot = Arc<OnceCell<Result<CachedCompletion, GatewayError>>>;

struct Entry {
    value: Result<CachedCompletion, GatewayError>,
    inserted_at: Instant,
    last_used_at: Instant,
}

struct Inner {
    entries: HashMap<Fingerprint, Entry>,
    pending: HashMap<Fingerprint, PendingSlot>,
}

/// Fingerprint-keyed response cache: TTL expiry, LRU eviction bounded by
/// `max_size`, and single-flight coalescing of concurrent identical requests.
///
/// Failures are never cached: a compute that returns `Err` is served to every
/// concurrent waiter but removed from `pending` immediately, so the next
/// request for the same fingerprint retries against the upstream.
pub struct ResponseCache {
    max_size: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl ResponseCache {
    pub fn new(max_size: u64, ttl_s: u64) -> Self {
        Self {
            max_size: max_size.max(1) as usize,
            ttl: Duration::from_secs(ttl_s),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Returns a fresh cache hit if one exists, without triggering any compute.
    pub fn lookup(&self, fingerprint: Fingerprint) -> Option<Result<CachedCompletion, GatewayError>> {
        let mut guard = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let hit = match guard.entries.get(&fingerprint) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => Some(entry.value.clone()),
            Some(_) => None,
            None => None,
        };
        if hit.is_some() {
            if let Some(entry) = guard.entries.get_mut(&fingerprint) {
                entry.last_used_at = now;
            }
        } else {
            guard.entries.remove(&fingerprint);
        }
        hit
    }

    /// Serves a cached hit, or runs `compute` with single-flight semantics: the
    /// first caller for a given fingerprint runs `compute`, all concurrent
    /// callers await the same in-flight future instead of issuing their own
    /// upstream calls.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        compute: F,
    ) -> Result<CachedCompletion, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedCompletion, GatewayError>>,
    {
        if let Some(hit) = self.lookup(fingerprint) {
            return hit;
        }

        let slot = {
            let mut guard = self.inner.lock().expect("cache lock poisoned");
            guard
                .pending
                .entry(fingerprint)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = slot
            .get_or_init(|| async { compute().await })
            .await
            .clone();

        let mut guard = self.inner.lock().expect("cache lock poisoned");
        if let Some(current) = guard.pending.get(&fingerprint)
            && Arc::ptr_eq(current, &slot)
        {
            guard.pending.remove(&fingerprint);
        }
        if let Ok(ref completion) = result {
            self.insert_locked(&mut guard, fingerprint, completion.clone());
        }
        result
    }

    fn insert_locked(&self, guard: &mut Inner, fingerprint: Fingerprint, completion: CachedCompletion) {
        let now = Instant::now();
        if guard.entries.len() >= self.max_size && !guard.entries.contains_key(&fingerprint) {
            if let Some(oldest) = guard
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used_at)
                .map(|(key, _)| *key)
            {
                guard.entries.remove(&oldest);
            }
        }
        guard.entries.insert(
            fingerprint,
            Entry {
                value: Ok(completion),
                inserted_at: now,
                last_used_at: now,
            },
        );
    }

    /// Drops every cached entry. Used by the admin key-reset/invalidate surface.
    pub fn invalidate_all(&self) {
        let mut guard = self.inner.lock().expect("cache lock poisoned");
        guard.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn body(model: &str) -> CreateChatCompletionRequestBody {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap()
    }

    #[test]
    fn fingerprint_ignores_field_order_and_matches_same_content() {
        let a = Fingerprint::from_request(&body("gpt-4o"), "gemini-1.5-pro");
        let b = Fingerprint::from_request(&body("gpt-4o"), "gemini-1.5-pro");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_resolved_model() {
        let a = Fingerprint::from_request(&body("gpt-4o"), "gemini-1.5-pro");
        let b = Fingerprint::from_request(&body("gpt-4o"), "gemini-1.5-flash");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_call_compute_once() {
        let cache = ResponseCache::new(16, 300);
        let fp = Fingerprint::from_request(&body("gpt-4o"), "gemini-1.5-pro");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = &cache;
            let calls = calls.clone();
            handles.push(async move {
                cache
                    .get_or_compute(fp, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(CachedCompletion {
                            response_json: Value::Null,
                        })
                    })
                    .await
            });
        }
        let results = futures_util::future::join_all(handles).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_compute_is_not_cached() {
        let cache = ResponseCache::new(16, 300);
        let fp = Fingerprint::from_request(&body("gpt-4o"), "gemini-1.5-pro");

        let first = cache
            .get_or_compute(fp, || async { Err(GatewayError::TransientUpstream("boom".into())) })
            .await;
        assert!(first.is_err());
        assert!(cache.is_empty());

        let second = cache
            .get_or_compute(fp, || async {
                Ok(CachedCompletion {
                    response_json: Value::Null,
                })
            })
            .await;
        assert!(second.is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lru_eviction_drops_oldest_when_full() {
        let cache = ResponseCache::new(1, 300);
        let mut guard = cache.inner.lock().unwrap();
        let fp_a = Fingerprint::from_request(&body("a"), "a");
        cache.insert_locked(
            &mut guard,
            fp_a,
            CachedCompletion {
                response_json: Value::Null,
            },
        );
        drop(guard);
        std::thread::sleep(Duration::from_millis(5));
        let mut guard = cache.inner.lock().unwrap();
        let fp_b = Fingerprint::from_request(&body("b"), "b");
        cache.insert_locked(
            &mut guard,
            fp_b,
            CachedCompletion {
                response_json: Value::Null,
            },
        );
        drop(guard);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(fp_a).is_none());
        assert!(cache.lookup(fp_b).is_some());
    }
}
