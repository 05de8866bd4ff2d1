use crate::cache::classify::{ContentType, TtlPolicy, classify};
use crate::cache::minhash::{LshIndex, prompt_bands};
use crate::cache::normalize::{djb2, normalize};
use crate::cache::similarity::similarity;
use crate::config::{CacheConfig, EncodingStrategy};
use crate::store::{KvStore, unversioned, versioned};
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One cached response. Immutable except for the access stats, which are
/// updated copy-on-read: a touched copy replaces the old entry in the map,
/// never a shared mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Normalized prompt; exact hits require equality here on top of the
    /// hash key to rule out djb2 collisions.
    pub normalized_key: String,
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub created_at: u64,
    pub access_count: u64,
    pub last_accessed: u64,
    pub content_type: ContentType,
}

impl CacheEntry {
    fn touched(&self, now: u64) -> Self {
        let mut copy = self.clone();
        copy.access_count += 1;
        copy.last_accessed = now;
        copy
    }

    fn expired(&self, ttl: &TtlPolicy, now: u64) -> bool {
        now.saturating_sub(self.created_at) > ttl.ttl_for(self.content_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Fuzzy,
}

/// Successful cache probe.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub match_type: MatchType,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_saved_tokens: u64,
    pub total_hits: u64,
    pub total_lookups: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    lsh: LshIndex,
    total_hits: u64,
    total_lookups: u64,
    total_saved_tokens: u64,
}

/// Prompts at or below this word count get a full-scan fuzzy fallback when
/// the LSH index yields no candidates.
const SHORT_PROMPT_WORDS: usize = 4;

/// Exact + fuzzy response cache with per-content-type TTL and LRU eviction.
///
/// KV failures degrade to memory-only operation and never surface to the
/// caller; corrupted persisted entries are silently deleted.
pub struct ResponseCache {
    max_entries: usize,
    threshold: f64,
    encoding: EncodingStrategy,
    ttl: TtlPolicy,
    namespace: String,
    semantic_seeds: Vec<String>,
    kv: Option<Arc<dyn KvStore>>,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, kv: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            max_entries: config.max_entries,
            threshold: config.similarity_threshold,
            encoding: config.encoding_strategy,
            ttl: TtlPolicy::from_config(config),
            namespace: config.store_name.clone(),
            semantic_seeds: config.semantic_seeds.clone(),
            kv,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn map_key(normalized: &str, model: &str) -> String {
        format!("{:08x}", djb2(&format!("{}|model:{}", normalized, model)))
    }

    /// Probe and update access stats on hit.
    pub async fn lookup(&self, prompt: &str, model: &str) -> Option<CacheHit> {
        self.probe(prompt, model, true).await
    }

    /// Read-only probe; no stats change, no touch.
    pub async fn peek(&self, prompt: &str, model: &str) -> Option<CacheHit> {
        self.probe(prompt, model, false).await
    }

    async fn probe(&self, prompt: &str, model: &str, mutate: bool) -> Option<CacheHit> {
        let now = now_millis();
        let norm = normalize(prompt);
        let key = Self::map_key(&norm, model);

        // 1. Memory exact.
        let mut expired_key: Option<String> = None;
        {
            let mut inner = self.lock();
            if mutate {
                inner.total_lookups += 1;
            }
            if let Some(entry) = inner.entries.get(&key).cloned() {
                if entry.normalized_key == norm && entry.model == model {
                    if entry.expired(&self.ttl, now) {
                        if mutate {
                            inner.entries.remove(&key);
                            inner.lsh.remove(&key);
                            expired_key = Some(key.clone());
                        }
                    } else {
                        let hit_entry = if mutate {
                            let touched = entry.touched(now);
                            inner.entries.insert(key.clone(), touched.clone());
                            inner.total_hits += 1;
                            inner.total_saved_tokens +=
                                u64::from(entry.input_tokens) + u64::from(entry.output_tokens);
                            touched
                        } else {
                            entry
                        };
                        return Some(CacheHit {
                            entry: hit_entry,
                            match_type: MatchType::Exact,
                            similarity: 1.0,
                        });
                    }
                }
            }
        }
        if let Some(stale) = expired_key {
            self.kv_del(&stale).await;
        }

        // 2. Persistent exact.
        if let Some(hit) = self.probe_kv(&key, &norm, model, now, mutate).await {
            return Some(hit);
        }

        // 3. Fuzzy via the LSH candidate set. Very short prompts produce
        //    degenerate signatures the bands may not capture, so they fall
        //    back to a full scan when the index returns nothing.
        let probe_bands = prompt_bands(&norm)?;
        let mut inner = self.lock();
        let mut candidates = inner.lsh.candidates(&probe_bands);
        if candidates.is_empty() && norm.split_whitespace().count() <= SHORT_PROMPT_WORDS {
            candidates = inner.entries.keys().cloned().collect();
        }
        let mut best: Option<(String, f64)> = None;
        for candidate_key in candidates {
            let Some(entry) = inner.entries.get(&candidate_key) else {
                continue;
            };
            if entry.model != model || entry.expired(&self.ttl, now) {
                continue;
            }
            let score = similarity(&norm, &entry.normalized_key, self.encoding);
            if score >= self.threshold
                && best.as_ref().is_none_or(|(_, best_score)| score > *best_score)
            {
                best = Some((candidate_key.clone(), score));
            }
        }
        let (best_key, score) = best?;
        let entry = inner.entries.get(&best_key)?.clone();
        let hit_entry = if mutate {
            let touched = entry.touched(now);
            inner.entries.insert(best_key, touched.clone());
            inner.total_hits += 1;
            inner.total_saved_tokens +=
                u64::from(entry.input_tokens) + u64::from(entry.output_tokens);
            touched
        } else {
            entry
        };
        Some(CacheHit {
            entry: hit_entry,
            match_type: MatchType::Fuzzy,
            similarity: score,
        })
    }

    async fn probe_kv(
        &self,
        key: &str,
        norm: &str,
        model: &str,
        now: u64,
        mutate: bool,
    ) -> Option<CacheHit> {
        let kv = self.kv.as_ref()?;
        let value = match kv.get(&self.namespace, key).await {
            Ok(value) => value?,
            Err(e) => {
                warn!("cache KV read failed, degrading to memory-only: {}", e);
                return None;
            }
        };
        let entry: CacheEntry = match unversioned(value).and_then(|p| serde_json::from_value(p).ok())
        {
            Some(entry) => entry,
            None => {
                // Corrupted or future-versioned payload: delete silently.
                self.kv_del(key).await;
                return None;
            }
        };
        if entry.normalized_key != norm || entry.model != model {
            return None;
        }
        if entry.expired(&self.ttl, now) {
            if mutate {
                self.kv_del(key).await;
            }
            return None;
        }
        let hit_entry = if mutate {
            let touched = entry.touched(now);
            {
                let mut inner = self.lock();
                inner.entries.insert(key.to_string(), touched.clone());
                if let Some(bands) = prompt_bands(norm) {
                    inner.lsh.insert(key, bands);
                }
                inner.total_hits += 1;
                inner.total_saved_tokens +=
                    u64::from(entry.input_tokens) + u64::from(entry.output_tokens);
            }
            // Write the touched copy back, best-effort.
            if let Err(e) = kv
                .set(
                    &self.namespace,
                    key,
                    versioned(serde_json::to_value(&touched).unwrap_or_default()),
                )
                .await
            {
                warn!("cache KV write-back failed: {}", e);
            }
            touched
        } else {
            entry
        };
        Some(CacheHit {
            entry: hit_entry,
            match_type: MatchType::Exact,
            similarity: 1.0,
        })
    }

    /// Insert into the memory layer and the LSH index; evicts the
    /// least-recently-accessed entry when over capacity. Returns the stored
    /// entry and the evicted key, if any.
    pub(crate) fn store_in_memory(
        &self,
        prompt: &str,
        response: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> (CacheEntry, Option<String>) {
        let now = now_millis();
        let norm = normalize(prompt);
        let key = Self::map_key(&norm, model);
        let entry = CacheEntry {
            key: key.clone(),
            normalized_key: norm.clone(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            created_at: now,
            access_count: 0,
            last_accessed: now,
            content_type: classify(prompt, &self.semantic_seeds),
        };

        let mut inner = self.lock();
        inner.entries.insert(key.clone(), entry.clone());
        if let Some(bands) = prompt_bands(&norm) {
            inner.lsh.insert(&key, bands);
        }

        let mut evicted = None;
        if inner.entries.len() > self.max_entries {
            let oldest = inner
                .entries
                .values()
                .min_by_key(|e| (e.last_accessed, e.key.clone()))
                .map(|e| e.key.clone());
            if let Some(victim) = oldest {
                inner.entries.remove(&victim);
                inner.lsh.remove(&victim);
                debug!("cache evicted least-recently-accessed entry {}", victim);
                evicted = Some(victim);
            }
        }
        (entry, evicted)
    }

    /// Add or replace an entry; persists best-effort when a KV is attached.
    pub async fn store(
        &self,
        prompt: &str,
        response: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) {
        let (entry, evicted) =
            self.store_in_memory(prompt, response, model, input_tokens, output_tokens);
        self.persist_entry(&entry).await;
        if let Some(victim) = evicted {
            self.kv_del(&victim).await;
        }
    }

    /// Touch a known entry at consumption time: bumps lookup/hit stats and
    /// the entry's access stats copy-on-read. Used by the pipeline, whose
    /// probe is a read-only `peek`.
    pub(crate) fn touch_entry(&self, key: &str) {
        let now = now_millis();
        let mut inner = self.lock();
        inner.total_lookups += 1;
        if let Some(entry) = inner.entries.get(key).cloned() {
            inner.total_hits += 1;
            inner.total_saved_tokens +=
                u64::from(entry.input_tokens) + u64::from(entry.output_tokens);
            inner.entries.insert(key.to_string(), entry.touched(now));
        }
    }

    /// Count a probe that found nothing.
    pub(crate) fn note_miss(&self) {
        self.lock().total_lookups += 1;
    }

    pub(crate) async fn persist_after_store(&self, entry: CacheEntry, evicted: Option<String>) {
        self.persist_entry(&entry).await;
        if let Some(victim) = evicted {
            self.kv_del(&victim).await;
        }
    }

    pub(crate) async fn persist_entry(&self, entry: &CacheEntry) {
        if let Some(kv) = &self.kv {
            let payload = versioned(serde_json::to_value(entry).unwrap_or_default());
            if let Err(e) = kv.set(&self.namespace, &entry.key, payload).await {
                warn!("cache KV write failed, entry kept in memory only: {}", e);
            }
        }
    }

    async fn kv_del(&self, key: &str) {
        if let Some(kv) = &self.kv
            && let Err(e) = kv.del(&self.namespace, key).await
        {
            warn!("cache KV delete failed: {}", e);
        }
    }

    /// Load non-expired entries from the KV and rebuild the LSH index.
    /// Returns the number of entries loaded.
    pub async fn hydrate(&self) -> usize {
        let Some(kv) = &self.kv else { return 0 };
        let keys = match kv.keys(&self.namespace).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("cache hydrate failed to list keys: {}", e);
                return 0;
            }
        };
        let now = now_millis();
        let mut loaded = 0;
        for key in keys {
            let value = match kv.get(&self.namespace, &key).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    warn!("cache hydrate read failed for {}: {}", key, e);
                    continue;
                }
            };
            let entry: Option<CacheEntry> =
                unversioned(value).and_then(|p| serde_json::from_value(p).ok());
            match entry {
                Some(entry) if !entry.expired(&self.ttl, now) => {
                    let mut inner = self.lock();
                    if let Some(bands) = prompt_bands(&entry.normalized_key) {
                        inner.lsh.insert(&entry.key, bands);
                    }
                    inner.entries.insert(entry.key.clone(), entry);
                    loaded += 1;
                }
                // Expired or corrupted: clean up opportunistically.
                _ => self.kv_del(&key).await,
            }
        }
        // Enforce capacity after a bulk load.
        loop {
            let victim = {
                let mut inner = self.lock();
                if inner.entries.len() <= self.max_entries {
                    break;
                }
                let oldest = inner
                    .entries
                    .values()
                    .min_by_key(|e| (e.last_accessed, e.key.clone()))
                    .map(|e| e.key.clone());
                if let Some(victim) = &oldest {
                    inner.entries.remove(victim);
                    inner.lsh.remove(victim);
                }
                oldest
            };
            match victim {
                Some(victim) => self.kv_del(&victim).await,
                None => break,
            }
        }
        loaded
    }

    pub async fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.entries.clear();
            inner.lsh.clear();
        }
        if let Some(kv) = &self.kv
            && let Err(e) = kv.clear(&self.namespace).await
        {
            warn!("cache KV clear failed: {}", e);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let hit_rate = if inner.total_lookups == 0 {
            0.0
        } else {
            inner.total_hits as f64 / inner.total_lookups as f64
        };
        CacheStats {
            entries: inner.entries.len(),
            total_saved_tokens: inner.total_saved_tokens,
            total_hits: inner.total_hits,
            total_lookups: inner.total_lookups,
            hit_rate,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
