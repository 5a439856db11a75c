//! Generation cache
//!
//! Per-conversation store of per-position state tensors, so that a follow-up
//! turn only computes the tokens the cache has not seen.
//!
//! Memory policy: the pool has a byte budget. Before a new entry is created,
//! least-recently-used entries are evicted while the budget is exceeded.
//! Entries with an in-flight or queued request are pinned and never evicted.
//! `evict_all` (session destroy) is the only other path that drops entries.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ndarray::Array1;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::chat::ChatMessage;
use crate::config::RequestParams;
use crate::device::{Allocation, DevicePool};
use crate::error::CacheError;
use crate::model::ModelHandle;
use crate::tokenizer::ASSISTANT_ROLE;

/// Cached state of one sequence
#[derive(Debug)]
pub struct CacheState {
    /// Token id at each cached position
    tokens: Vec<u32>,
    /// State tensor at each cached position
    states: Vec<Array1<f32>>,
    width: usize,
    limit: usize,
    reservation: Allocation,
    gauge: Arc<AtomicU64>,
}

impl CacheState {
    pub fn new(width: usize, limit: usize, reservation: Allocation) -> Self {
        let gauge = Arc::new(AtomicU64::new(reservation.bytes()));
        Self {
            tokens: Vec::new(),
            states: Vec::new(),
            width,
            limit,
            reservation,
            gauge,
        }
    }

    /// Number of cached positions
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Maximum number of positions (the model's context window)
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn last_state(&self) -> Option<&Array1<f32>> {
        self.states.last()
    }

    /// Device bytes held by this state
    pub fn bytes(&self) -> u64 {
        self.reservation.bytes()
    }

    fn bytes_per_position(&self) -> u64 {
        (self.width * std::mem::size_of::<f32>()) as u64
    }

    /// Append the states computed for `tokens`.
    ///
    /// Nothing is appended on error.
    pub fn extend(&mut self, tokens: &[u32], states: Vec<Array1<f32>>) -> Result<(), CacheError> {
        debug_assert_eq!(tokens.len(), states.len());

        let requested = self.states.len() + states.len();
        if requested > self.limit {
            return Err(CacheError::Overflow {
                requested,
                limit: self.limit,
            });
        }
        if let Some(bad) = states.iter().find(|s| s.len() != self.width) {
            return Err(CacheError::ShapeMismatch {
                expected: self.width,
                got: bad.len(),
            });
        }

        self.reservation
            .grow(states.len() as u64 * self.bytes_per_position())
            .map_err(CacheError::OutOfMemory)?;
        self.tokens.extend_from_slice(tokens);
        self.states.extend(states);
        self.gauge.store(self.reservation.bytes(), Ordering::Release);
        Ok(())
    }

    /// Drop every position from `len` on.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.states.len() {
            return;
        }
        let removed = self.states.len() - len;
        self.states.truncate(len);
        self.tokens.truncate(len);
        self.reservation
            .shrink(removed as u64 * self.bytes_per_position());
        self.gauge.store(self.reservation.bytes(), Ordering::Release);
    }

    /// Length of the longest common prefix of the cached tokens and `tokens`
    pub fn common_prefix(&self, tokens: &[u32]) -> usize {
        self.tokens
            .iter()
            .zip(tokens)
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Independent copy on the same device
    pub fn fork(&self) -> Result<CacheState, CacheError> {
        let mut reservation = self.reservation.sibling();
        reservation
            .grow(self.reservation.bytes())
            .map_err(CacheError::OutOfMemory)?;
        let gauge = Arc::new(AtomicU64::new(reservation.bytes()));
        Ok(Self {
            tokens: self.tokens.clone(),
            states: self.states.clone(),
            width: self.width,
            limit: self.limit,
            reservation,
            gauge,
        })
    }
}

/// Identity of a conversation within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub model_id: String,
    pub conversation: String,
}

impl ConversationKey {
    pub fn new(model_id: impl Into<String>, conversation: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            conversation: conversation.into(),
        }
    }

    /// Key for a chat request: the explicit conversation id if given,
    /// otherwise a hash of the messages before the first assistant turn.
    /// That opening stays fixed as the conversation grows.
    pub fn for_request(model_id: &str, messages: &[ChatMessage], params: &RequestParams) -> Self {
        if let Some(id) = &params.conversation_id {
            return Self::new(model_id, id.clone());
        }
        let opening = messages
            .iter()
            .position(|m| m.role == ASSISTANT_ROLE)
            .unwrap_or(messages.len())
            .max(1)
            .min(messages.len());

        let mut hasher = DefaultHasher::new();
        for message in &messages[..opening] {
            message.role.hash(&mut hasher);
            message.content.hash(&mut hasher);
        }
        Self::new(model_id, format!("auto-{:016x}", hasher.finish()))
    }

    /// Key for a raw prompt: the explicit conversation id if given, otherwise
    /// a hash of its first [`PROMPT_KEY_TOKENS`] tokens, so an appended-to
    /// history keeps its key once it is that long.
    pub fn for_prompt(model_id: &str, prompt: &[u32], params: &RequestParams) -> Self {
        if let Some(id) = &params.conversation_id {
            return Self::new(model_id, id.clone());
        }
        let mut hasher = DefaultHasher::new();
        prompt[..prompt.len().min(PROMPT_KEY_TOKENS)].hash(&mut hasher);
        Self::new(model_id, format!("prompt-{:016x}", hasher.finish()))
    }
}

/// Leading tokens that identify a raw-prompt conversation
pub const PROMPT_KEY_TOKENS: usize = 16;

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model_id, self.conversation)
    }
}

/// One cache entry
#[derive(Debug)]
pub struct CacheSlot {
    key: ConversationKey,
    device: usize,
    state: Arc<tokio::sync::Mutex<CacheState>>,
    gauge: Arc<AtomicU64>,
    pins: AtomicUsize,
    last_access: Mutex<Instant>,
}

impl CacheSlot {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Index of the owning device in the pool
    pub fn device(&self) -> usize {
        self.device
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn last_access(&self) -> Instant {
        *self.last_access.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    fn bytes(&self) -> u64 {
        self.gauge.load(Ordering::Acquire)
    }
}

/// A pinned reference to a slot; the slot cannot be evicted while it lives.
#[derive(Debug)]
pub struct SlotRef {
    slot: Arc<CacheSlot>,
}

impl SlotRef {
    fn pin(slot: Arc<CacheSlot>) -> Self {
        slot.pins.fetch_add(1, Ordering::AcqRel);
        Self { slot }
    }

    pub fn slot(&self) -> &CacheSlot {
        &self.slot
    }

    /// Wait for exclusive access to the entry.
    ///
    /// Requests on the same conversation queue here in FIFO order.
    pub async fn lease(self) -> CacheLease {
        let guard = Arc::clone(&self.slot.state).lock_owned().await;
        self.slot.touch();
        CacheLease { guard, pin: self }
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        self.slot.touch();
        self.slot.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive access to a conversation's cache for one request
#[derive(Debug)]
pub struct CacheLease {
    guard: OwnedMutexGuard<CacheState>,
    pin: SlotRef,
}

impl CacheLease {
    pub fn key(&self) -> &ConversationKey {
        &self.pin.slot.key
    }

    pub fn device(&self) -> usize {
        self.pin.slot.device
    }
}

impl Deref for CacheLease {
    type Target = CacheState;

    fn deref(&self) -> &CacheState {
        &self.guard
    }
}

impl DerefMut for CacheLease {
    fn deref_mut(&mut self) -> &mut CacheState {
        &mut self.guard
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub evictions: u64,
}

/// All cache entries of one session
#[derive(Debug)]
pub struct GenerationCache {
    entries: Mutex<HashMap<ConversationKey, Arc<CacheSlot>>>,
    budget_bytes: u64,
    evictions: AtomicU64,
}

impl GenerationCache {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            budget_bytes,
            evictions: AtomicU64::new(0),
        }
    }

    /// Find the entry for `key`, creating an empty one on the least-loaded
    /// device if needed. The returned reference pins the entry.
    pub fn get_or_create(
        &self,
        key: ConversationKey,
        model: &ModelHandle,
        devices: &DevicePool,
    ) -> SlotRef {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(slot) = entries.get(&key) {
            return SlotRef::pin(Arc::clone(slot));
        }

        self.evict_for_budget(&mut entries);

        let mut load = vec![0usize; devices.len()];
        for slot in entries.values() {
            if let Some(n) = load.get_mut(slot.device) {
                *n += 1;
            }
        }
        let device = load
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| **n)
            .map(|(i, _)| i)
            .unwrap_or(0);

        // Resolved pools always hold at least one device
        let state = model.new_cache(&devices.devices()[device]);
        let gauge = Arc::clone(&state.gauge);
        let slot = Arc::new(CacheSlot {
            key: key.clone(),
            device,
            state: Arc::new(tokio::sync::Mutex::new(state)),
            gauge,
            pins: AtomicUsize::new(0),
            last_access: Mutex::new(Instant::now()),
        });
        tracing::debug!("Created cache entry {} on device #{}", key, device);

        let pinned = SlotRef::pin(Arc::clone(&slot));
        entries.insert(key, slot);
        pinned
    }

    fn evict_for_budget(&self, entries: &mut HashMap<ConversationKey, Arc<CacheSlot>>) {
        loop {
            let total: u64 = entries.values().map(|s| s.bytes()).sum();
            if total < self.budget_bytes {
                return;
            }

            let victim = entries
                .values()
                .filter(|s| !s.is_pinned())
                .min_by_key(|s| s.last_access())
                .map(|s| s.key.clone());

            match victim {
                Some(key) => {
                    if let Some(slot) = entries.remove(&key) {
                        tracing::info!(
                            "Evicting cache entry {} ({} bytes)",
                            key,
                            slot.bytes()
                        );
                    }
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    tracing::warn!(
                        "Cache budget exceeded ({} / {} bytes) but every entry is in use",
                        total,
                        self.budget_bytes
                    );
                    return;
                }
            }
        }
    }

    /// Whether an entry exists for `key`
    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(key)
    }

    /// Release every entry. Returns how many were dropped.
    pub fn evict_all(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        CacheStats {
            entries: entries.len(),
            total_bytes: entries.values().map(|s| s.bytes()).sum(),
            budget_bytes: self.budget_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, DeviceKind, MemoryArena, StaticProbe};
    use crate::testing::{tiny_tokenizer, CountingModel};

    fn state(width: usize, limit: usize, capacity: u64) -> CacheState {
        CacheState::new(width, limit, MemoryArena::new(DeviceId::cpu(), capacity).empty())
    }

    fn states(n: usize, width: usize) -> Vec<Array1<f32>> {
        (0..n).map(|i| Array1::from_elem(width, i as f32)).collect()
    }

    fn setup(devices: &str) -> (DevicePool, ModelHandle) {
        let probe = StaticProbe::uniform(DeviceKind::Npu, 2, 1 << 24);
        let pool = DevicePool::from_spec(devices, &probe).unwrap();
        let handle = ModelHandle::place(
            "m",
            "/m",
            Arc::new(CountingModel::new()),
            tiny_tokenizer(),
            &pool,
            &Default::default(),
        )
        .unwrap();
        (pool, handle)
    }

    #[test]
    fn test_extend_and_truncate_track_memory() {
        let mut s = state(4, 8, 1024);
        s.extend(&[1, 2, 3], states(3, 4)).unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(s.bytes(), 3 * 16);
        assert_eq!(s.common_prefix(&[1, 2, 9]), 2);

        s.truncate(1);
        assert_eq!(s.tokens(), &[1]);
        assert_eq!(s.bytes(), 16);
    }

    #[test]
    fn test_extend_overflow_leaves_state_untouched() {
        let mut s = state(2, 4, 1024);
        s.extend(&[1, 2, 3], states(3, 2)).unwrap();
        let err = s.extend(&[4, 5], states(2, 2)).unwrap_err();
        assert_eq!(err, CacheError::Overflow { requested: 5, limit: 4 });
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn test_extend_out_of_memory() {
        let mut s = state(4, 100, 40);
        s.extend(&[1, 2], states(2, 4)).unwrap();
        assert!(matches!(
            s.extend(&[3], states(1, 4)),
            Err(CacheError::OutOfMemory(_))
        ));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_extend_rejects_wrong_width() {
        let mut s = state(4, 100, 1024);
        assert!(matches!(
            s.extend(&[1], states(1, 3)),
            Err(CacheError::ShapeMismatch { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_fork_is_independent() {
        let mut s = state(2, 10, 1024);
        s.extend(&[1, 2], states(2, 2)).unwrap();
        let mut f = s.fork().unwrap();
        f.extend(&[3], states(1, 2)).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(f.len(), 3);
        assert_eq!(f.tokens(), &[1, 2, 3]);
    }

    #[test]
    fn test_conversation_key_derivation() {
        let params = RequestParams::default();
        let a = vec![ChatMessage::system("rec"), ChatMessage::user("hi")];
        let mut b = a.clone();
        b.push(ChatMessage::assistant("x"));
        b.push(ChatMessage::user("more"));

        assert_eq!(
            ConversationKey::for_request("m", &a, &params),
            ConversationKey::for_request("m", &b, &params)
        );
        assert_ne!(
            ConversationKey::for_request("m", &a, &params),
            ConversationKey::for_request("other", &a, &params)
        );

        let explicit = RequestParams {
            conversation_id: Some("user-42".to_string()),
            ..Default::default()
        };
        assert_eq!(
            ConversationKey::for_request("m", &a, &explicit).conversation,
            "user-42"
        );
    }

    #[test]
    fn test_key_without_system_message_survives_follow_up() {
        let params = RequestParams::default();
        let first = vec![ChatMessage::user("h")];
        let follow_up = vec![
            ChatMessage::user("h"),
            ChatMessage::assistant("aaa"),
            ChatMessage::user("m"),
        ];
        assert_eq!(
            ConversationKey::for_request("m", &first, &params),
            ConversationKey::for_request("m", &follow_up, &params)
        );

        // Different openings stay apart
        let other = vec![ChatMessage::user("h"), ChatMessage::user("again")];
        assert_ne!(
            ConversationKey::for_request("m", &first, &params),
            ConversationKey::for_request("m", &other, &params)
        );
    }

    #[test]
    fn test_prompt_key_uses_leading_tokens() {
        let params = RequestParams::default();
        let history: Vec<u32> = (0..PROMPT_KEY_TOKENS as u32).collect();
        let mut longer = history.clone();
        longer.extend([100, 101, 102]);
        assert_eq!(
            ConversationKey::for_prompt("m", &history, &params),
            ConversationKey::for_prompt("m", &longer, &params)
        );
        assert_ne!(
            ConversationKey::for_prompt("m", &history[..4], &params),
            ConversationKey::for_prompt("m", &history, &params)
        );
    }

    #[test]
    fn test_new_entries_spread_across_devices() {
        let (pool, handle) = setup("npu:0,1");
        let cache = GenerationCache::new(u64::MAX);
        let a = cache.get_or_create(ConversationKey::new("m", "a"), &handle, &pool);
        let b = cache.get_or_create(ConversationKey::new("m", "b"), &handle, &pool);
        assert_ne!(a.slot().device(), b.slot().device());

        let again = cache.get_or_create(ConversationKey::new("m", "a"), &handle, &pool);
        assert_eq!(again.slot().device(), a.slot().device());
        assert_eq!(cache.stats().entries, 2);
    }

    #[tokio::test]
    async fn test_lru_eviction_skips_pinned_entries() {
        let (pool, handle) = setup("npu:0");
        // Budget smaller than one populated entry
        let cache = GenerationCache::new(1);

        let mut busy = cache
            .get_or_create(ConversationKey::new("m", "busy"), &handle, &pool)
            .lease()
            .await;
        let width = busy.width();

        let mut old = cache
            .get_or_create(ConversationKey::new("m", "old"), &handle, &pool)
            .lease()
            .await;
        old.extend(&[1], states(1, width)).unwrap();
        drop(old);
        busy.extend(&[1], states(1, width)).unwrap();

        // "old" is idle; "busy" is leased
        let _fresh = cache.get_or_create(ConversationKey::new("m", "fresh"), &handle, &pool);
        assert!(!cache.contains(&ConversationKey::new("m", "old")));
        assert!(cache.contains(&ConversationKey::new("m", "busy")));
        assert_eq!(cache.stats().evictions, 1);

        // Only pinned entries remain over budget: creation still proceeds
        let _another = cache.get_or_create(ConversationKey::new("m", "another"), &handle, &pool);
        assert!(cache.contains(&ConversationKey::new("m", "busy")));
        assert!(cache.contains(&ConversationKey::new("m", "another")));
        assert_eq!(cache.stats().evictions, 1);
        drop(busy);
    }

    #[tokio::test]
    async fn test_evicted_memory_returns_to_device() {
        let (pool, handle) = setup("npu:0");
        let arena = Arc::clone(pool.devices()[0].arena());
        let base = arena.used();
        let cache = GenerationCache::new(u64::MAX);

        let mut lease = cache
            .get_or_create(ConversationKey::new("m", "a"), &handle, &pool)
            .lease()
            .await;
        let width = lease.width();
        lease.extend(&[1, 2], states(2, width)).unwrap();
        drop(lease);
        assert!(arena.used() > base);
        assert!(cache.stats().total_bytes > 0);

        assert_eq!(cache.evict_all(), 1);
        assert_eq!(arena.used(), base);
    }

    #[tokio::test]
    async fn test_same_key_leases_are_serialized() {
        let (pool, handle) = setup("npu:0");
        let cache = Arc::new(GenerationCache::new(u64::MAX));
        let key = ConversationKey::new("m", "k");

        let first = cache.get_or_create(key.clone(), &handle, &pool).lease().await;
        let second = cache.get_or_create(key.clone(), &handle, &pool);

        let waiter = tokio::spawn(async move { second.lease().await.len() });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let mut first = first;
        let width = first.width();
        first.extend(&[7], states(1, width)).unwrap();
        drop(first);

        // The second request observes the first one's state
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
