//! Channel Engine (§4.6).
//!
//! A channel is the union of one append-only log per `(channelId,
//! owner)` pair; each owner is the sole writer of their own log, so
//! merging remote copies of a log is a deterministic sorted merge by
//! `(creationTime ASC, entryHash ASC)`, never a field-by-field CRDT
//! merge. A channel entry's `owner` is `None` for system/ownerless
//! channels (§4.6 permits an entry with no owner). Generalizes
//! `persistence::MessageLog` — an `RwLock<HashMap<channel,
//! Vec<SignedMessage>>>` kept sorted and deduplicated by id — into the
//! full per-owner-log contract, plus the chum sync helpers
//! generalizing `make_sync_request`/`process_sync_response`, gated by
//! access grants the way the teacher gates delivery by room
//! membership.

use crate::canonical::{canonical_hash, canonicalize, hash_hex, Hash};
use crate::error::{CoreError, CoreResult};
use crate::object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    #[serde(rename = "$type$")]
    pub type_tag: String,
    pub channel: Hash,
    pub owner: Option<Hash>,
    pub object_type: String,
    pub creation_time: i64,
    pub data: Hash,
    pub prev: Option<Hash>,
}

impl ChannelEntry {
    pub fn entry_hash(&self) -> CoreResult<Hash> {
        canonical_hash(self)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateNotice {
    pub channel: Hash,
    pub owner: Option<Hash>,
    pub time_of_earliest_change: i64,
    pub new_entries: Vec<ChannelEntry>,
}

type UpdateListener = Box<dyn Fn(&UpdateNotice) + Send + Sync>;

/// One append-only per-owner log, kept in creation-time order and
/// deduplicated by entry hash — the merge target of both local posts
/// and remote sync.
#[derive(Default, Clone)]
struct OwnerLog {
    entries: Vec<ChannelEntry>,
    seen: HashSet<Hash>,
}

impl OwnerLog {
    fn head(&self) -> Option<Hash> {
        self.entries.last().and_then(|e| e.entry_hash().ok())
    }

    /// Merge-in rule for §4.6: sort by `(creationTime ASC, entryHash
    /// ASC)`, drop duplicates by entry hash. Idempotent (re-inserting
    /// an already-seen entry is a no-op) and order-independent
    /// (applying the same entry set in any order yields the same
    /// final sequence).
    fn merge_entry(&mut self, entry: ChannelEntry) -> CoreResult<bool> {
        let hash = entry.entry_hash()?;
        if self.seen.contains(&hash) {
            return Ok(false);
        }
        self.seen.insert(hash);
        self.entries.push(entry);
        self.entries.sort_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then_with(|| a.entry_hash().unwrap_or([0; 32]).cmp(&b.entry_hash().unwrap_or([0; 32])))
        });
        Ok(true)
    }
}

/// Engine state for one channel: one log per owner plus a fast
/// id-hash lookup for `object_by_id`.
#[derive(Default)]
struct ChannelState {
    logs: HashMap<Option<Hash>, OwnerLog>,
}

/// Filter options for `ChannelEngine::objects_with_type` (§4.6/§4.7):
/// every field narrows the result, `None`/`false` leaves it
/// unconstrained. `channel_id: None` scans every channel; `owner:
/// None` scans every owner's log within the matched channel(s).
#[derive(Debug, Clone, Default)]
pub struct ObjectQuery {
    pub channel_id: Option<Hash>,
    pub owner: Option<Option<Hash>>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub count: Option<usize>,
    pub omit_data: bool,
}

/// Per-`(channelId, owner)` named locks (§5) so concurrent posts from
/// different owners never contend, but two posts to the same owner's
/// log serialize.
pub struct ChannelEngine {
    store: Arc<dyn ObjectStore>,
    channels: RwLock<HashMap<Hash, ChannelState>>,
    locks: RwLock<HashMap<(Hash, Option<Hash>), Arc<Mutex<()>>>>,
    listeners: RwLock<Vec<UpdateListener>>,
    access_grants: RwLock<HashMap<(Hash, Option<Hash>), HashSet<Hash>>>,
}

impl ChannelEngine {
    pub fn new(store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            channels: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            access_grants: RwLock::new(HashMap::new()),
        })
    }

    pub async fn on_updated(&self, listener: UpdateListener) {
        self.listeners.write().await.push(listener);
    }

    async fn lock_for(&self, channel: Hash, owner: Option<Hash>) -> Arc<Mutex<()>> {
        let mut locks = self.locks.write().await;
        locks.entry((channel, owner)).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Deterministic channel id from owner + name, so any peer can
    /// compute the same `channelId` given the same inputs. `owner ==
    /// None` derives the id for an ownerless/system channel.
    pub fn derive_channel_id(owner: Option<&Hash>, name: &str) -> Hash {
        let owner_bytes: &[u8] = owner.map(|h| h.as_slice()).unwrap_or(b"");
        crate::canonical::hash_bytes(&[owner_bytes, name.as_bytes()].concat())
    }

    pub async fn create_channel(&self, owner: Option<Hash>, name: &str) -> CoreResult<Hash> {
        let channel = Self::derive_channel_id(owner.as_ref(), name);
        self.channels.write().await.entry(channel).or_default();
        info!(channel = %hash_hex(&channel), "channel created");
        Ok(channel)
    }

    /// Append one entry to `owner`'s log within `channel`, linking it
    /// to that owner's previous head.
    pub async fn post_to_channel<T: Serialize>(
        &self,
        channel: Hash,
        owner: Option<Hash>,
        object_type: &str,
        payload: &T,
        creation_time: i64,
    ) -> CoreResult<Hash> {
        let lock = self.lock_for(channel, owner).await;
        let _guard = lock.lock().await;

        let data_bytes = canonicalize(payload)?;
        let data_hash = self.store.put(data_bytes).await?;

        let prev = {
            let channels = self.channels.read().await;
            channels.get(&channel).and_then(|s| s.logs.get(&owner)).and_then(|l| l.head())
        };

        let entry = ChannelEntry {
            type_tag: "ChannelEntry".to_string(),
            channel,
            owner,
            object_type: object_type.to_string(),
            creation_time,
            data: data_hash,
            prev,
        };
        let entry_hash = entry.entry_hash()?;
        self.store.put(canonicalize(&entry)?).await?;
        self.store.add_referrer(data_hash, entry_hash, "ChannelEntry").await?;

        {
            let mut channels = self.channels.write().await;
            let state = channels.entry(channel).or_default();
            state.logs.entry(owner).or_default().merge_entry(entry.clone())?;
        }

        self.notify_updated(channel, owner, creation_time, vec![entry]).await;
        Ok(entry_hash)
    }

    async fn notify_updated(&self, channel: Hash, owner: Option<Hash>, time_of_earliest_change: i64, new_entries: Vec<ChannelEntry>) {
        let notice = UpdateNotice { channel, owner, time_of_earliest_change, new_entries };
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener(&notice);
        }
    }

    /// Objects of `object_type` matching `options`, newest first (ties
    /// broken by data hash, descending). Skips fetching the payload
    /// body entirely when `options.omit_data` is set, returning
    /// `Value::Null` in its place — callers that only need hashes and
    /// timestamps (e.g. the directory cache) avoid the store round
    /// trip.
    pub async fn objects_with_type(&self, object_type: &str, options: &ObjectQuery) -> CoreResult<Vec<(Hash, i64, Value)>> {
        let entries: Vec<ChannelEntry> = {
            let channels = self.channels.read().await;
            let matched_channels: Vec<&ChannelState> = match options.channel_id {
                Some(id) => channels.get(&id).into_iter().collect(),
                None => channels.values().collect(),
            };
            matched_channels
                .into_iter()
                .flat_map(|state| state.logs.iter())
                .filter(|(owner, _)| match &options.owner {
                    Some(filter) => *owner == filter,
                    None => true,
                })
                .flat_map(|(_, log)| log.entries.iter().cloned())
                .filter(|e| e.object_type == object_type)
                .filter(|e| options.from.map_or(true, |from| e.creation_time >= from))
                .filter(|e| options.to.map_or(true, |to| e.creation_time <= to))
                .collect()
        };

        let mut by_time: Vec<(i64, Hash, Value)> = Vec::with_capacity(entries.len());
        for entry in entries {
            let value = if options.omit_data {
                Value::Null
            } else {
                let bytes = self.store.get(&entry.data).await?;
                serde_json::from_slice(&bytes).map_err(|e| CoreError::Invalid(format!("decode object: {e}")))?
            };
            by_time.push((entry.creation_time, entry.data, value));
        }
        by_time.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        if let Some(count) = options.count {
            by_time.truncate(count);
        }
        Ok(by_time.into_iter().map(|(t, h, v)| (h, t, v)).collect())
    }

    /// Fetch one object by its content hash, regardless of which
    /// owner's log it was posted through.
    pub async fn object_by_id(&self, data_hash: &Hash) -> CoreResult<Value> {
        let bytes = self.store.get(data_hash).await?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::Invalid(format!("decode object: {e}")))
    }

    pub async fn head_of(&self, channel: Hash, owner: Option<Hash>) -> Option<Hash> {
        let channels = self.channels.read().await;
        channels.get(&channel).and_then(|s| s.logs.get(&owner)).and_then(|l| l.head())
    }

    /// Merge a batch of remotely-received entries for one owner's log
    /// into local state, applying the §4.6 sort/dedup rule.
    pub async fn merge_remote_entries(&self, channel: Hash, owner: Option<Hash>, entries: Vec<ChannelEntry>) -> CoreResult<usize> {
        let lock = self.lock_for(channel, owner).await;
        let _guard = lock.lock().await;

        let mut accepted = Vec::new();
        let mut channels = self.channels.write().await;
        let state = channels.entry(channel).or_default();
        let log = state.logs.entry(owner).or_default();
        let mut earliest: Option<i64> = None;
        for entry in entries {
            if entry.channel != channel || entry.owner != owner {
                continue;
            }
            let t = entry.creation_time;
            if log.merge_entry(entry.clone())? {
                earliest = Some(earliest.map_or(t, |e: i64| e.min(t)));
                accepted.push(entry);
            }
        }
        drop(channels);
        let count = accepted.len();
        if let Some(t) = earliest {
            self.notify_updated(channel, owner, t, accepted).await;
        }
        Ok(count)
    }

    /// Grant `grantee` access to sync `(channel, owner)` entries
    /// through chum. No grant means the log isn't served.
    pub async fn grant_access(&self, channel: Hash, owner: Option<Hash>, grantee: Hash) {
        self.access_grants.write().await.entry((channel, owner)).or_default().insert(grantee);
    }

    pub async fn revoke_access(&self, channel: Hash, owner: Option<Hash>, grantee: Hash) {
        if let Some(grantees) = self.access_grants.write().await.get_mut(&(channel, owner)) {
            grantees.remove(&grantee);
        }
    }

    pub async fn is_access_granted(&self, channel: Hash, owner: Option<Hash>, grantee: Hash) -> bool {
        self.access_grants.read().await.get(&(channel, owner)).map(|g| g.contains(&grantee)).unwrap_or(false)
    }

    /// Producing side of chum sync: build the response to `request`
    /// on behalf of `requester`, refusing with `CoreError::Permission`
    /// if `requester` holds no access grant for `(channel, owner)`.
    pub async fn serve_chum_entries(&self, request: &ChumHeadsRequest, requester: Hash) -> CoreResult<ChumEntriesResponse> {
        if !self.is_access_granted(request.channel, request.owner, requester).await {
            return Err(CoreError::Permission(format!(
                "{} has no access grant for channel {} owner {:?}",
                hash_hex(&requester),
                hash_hex(&request.channel),
                request.owner.as_ref().map(hash_hex)
            )));
        }

        let channels = self.channels.read().await;
        let log = channels.get(&request.channel).and_then(|s| s.logs.get(&request.owner));
        let entries = match log {
            Some(log) => match log.head() {
                Some(head) => {
                    let by_hash: HashMap<Hash, ChannelEntry> =
                        log.entries.iter().filter_map(|e| e.entry_hash().ok().map(|h| (h, e.clone()))).collect();
                    let mut known = HashSet::new();
                    known.extend(request.local_head);
                    entries_missing_locally(&by_hash, head, &known)
                }
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        Ok(ChumEntriesResponse { channel: request.channel, owner: request.owner, entries })
    }
}

// ---------------------------------------------------------------------------
// Chum sync: heads exchange with bounded, per-hash-independent retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChumHeadsRequest {
    pub channel: Hash,
    pub owner: Option<Hash>,
    pub local_head: Option<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChumEntriesResponse {
    pub channel: Hash,
    pub owner: Option<Hash>,
    pub entries: Vec<ChannelEntry>,
}

const CHUM_MAX_WALK: usize = 10_000;
const CHUM_MAX_RETRIES: u32 = 3;

/// Walk `entries` backward (newest-to-oldest via `prev`) from
/// `remote_head` and collect everything not already present locally,
/// bounded by `CHUM_MAX_WALK` so a malformed or adversarial chain
/// can't force an unbounded walk.
pub fn entries_missing_locally(
    entries_by_hash: &HashMap<Hash, ChannelEntry>,
    remote_head: Hash,
    locally_known: &HashSet<Hash>,
) -> Vec<ChannelEntry> {
    let mut out = Vec::new();
    let mut cursor = Some(remote_head);
    let mut steps = 0;
    while let Some(hash) = cursor {
        if steps >= CHUM_MAX_WALK || locally_known.contains(&hash) {
            break;
        }
        steps += 1;
        match entries_by_hash.get(&hash) {
            Some(entry) => {
                out.push(entry.clone());
                cursor = entry.prev;
            }
            None => break,
        }
    }
    out.reverse();
    out
}

/// Tracks retry attempts per missing hash so one peer's unreachable
/// entry never blocks sync progress on the rest — each hash is
/// retried independently up to `CHUM_MAX_RETRIES` times before being
/// given up on for this sync round.
pub struct ChumRetryTracker {
    attempts: RwLock<HashMap<Hash, u32>>,
}

impl ChumRetryTracker {
    pub fn new() -> Self {
        Self { attempts: RwLock::new(HashMap::new()) }
    }

    /// Returns `true` if this hash may still be retried, incrementing
    /// its attempt counter as a side effect.
    pub async fn should_retry(&self, hash: Hash) -> bool {
        let mut attempts = self.attempts.write().await;
        let count = attempts.entry(hash).or_insert(0);
        if *count >= CHUM_MAX_RETRIES {
            return false;
        }
        *count += 1;
        true
    }

    pub async fn give_up_count(&self) -> usize {
        self.attempts.read().await.values().filter(|c| **c >= CHUM_MAX_RETRIES).count()
    }
}

impl Default for ChumRetryTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FileObjectStore;
    use tempfile::tempdir;

    fn engine() -> Arc<ChannelEngine> {
        ChannelEngine::new(FileObjectStore::new(tempdir().unwrap().into_path()))
    }

    #[tokio::test]
    async fn post_and_read_back_objects() {
        let engine = engine();
        let owner = Some(crate::canonical::hash_bytes(b"owner:alice"));
        let channel = engine.create_channel(owner, "diary").await.unwrap();

        engine
            .post_to_channel(channel, owner, "Note", &serde_json::json!({"text": "hello"}), 100)
            .await
            .unwrap();
        engine
            .post_to_channel(channel, owner, "Note", &serde_json::json!({"text": "world"}), 200)
            .await
            .unwrap();

        let objects = engine
            .objects_with_type("Note", &ObjectQuery { channel_id: Some(channel), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(objects.len(), 2);
        // newest first
        assert_eq!(objects[0].2["text"], "world");
        assert_eq!(objects[0].1, 200);
        assert_eq!(objects[1].2["text"], "hello");
    }

    #[tokio::test]
    async fn objects_with_type_honors_from_to_count_and_omit_data() {
        let engine = engine();
        let owner = Some(crate::canonical::hash_bytes(b"owner:eve"));
        let channel = engine.create_channel(owner, "diary").await.unwrap();
        for (n, t) in [(1, 100), (2, 200), (3, 300), (4, 400)] {
            engine
                .post_to_channel(channel, owner, "Note", &serde_json::json!({"n": n}), t)
                .await
                .unwrap();
        }

        let windowed = engine
            .objects_with_type(
                "Note",
                &ObjectQuery { channel_id: Some(channel), from: Some(200), to: Some(300), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(windowed.len(), 2);

        let limited = engine
            .objects_with_type("Note", &ObjectQuery { channel_id: Some(channel), count: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].1, 400);

        let no_data = engine
            .objects_with_type("Note", &ObjectQuery { channel_id: Some(channel), omit_data: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(no_data.len(), 4);
        assert!(no_data.iter().all(|(_, _, v)| v.is_null()));
    }

    #[tokio::test]
    async fn objects_with_type_filters_by_owner() {
        let engine = engine();
        let alice = Some(crate::canonical::hash_bytes(b"owner:alice2"));
        let bob = Some(crate::canonical::hash_bytes(b"owner:bob2"));
        let channel = engine.create_channel(alice, "shared").await.unwrap();
        engine.post_to_channel(channel, alice, "Note", &serde_json::json!({"who": "alice"}), 100).await.unwrap();
        engine.post_to_channel(channel, bob, "Note", &serde_json::json!({"who": "bob"}), 200).await.unwrap();

        let alice_only = engine
            .objects_with_type("Note", &ObjectQuery { channel_id: Some(channel), owner: Some(alice), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(alice_only.len(), 1);
        assert_eq!(alice_only[0].2["who"], "alice");
    }

    #[tokio::test]
    async fn post_links_to_previous_head() {
        let engine = engine();
        let owner = Some(crate::canonical::hash_bytes(b"owner:bob"));
        let channel = engine.create_channel(owner, "diary").await.unwrap();

        engine
            .post_to_channel(channel, owner, "Note", &serde_json::json!({"n": 1}), 100)
            .await
            .unwrap();
        let second = engine
            .post_to_channel(channel, owner, "Note", &serde_json::json!({"n": 2}), 200)
            .await
            .unwrap();

        let head = engine.head_of(channel, owner).await.unwrap();
        assert_eq!(head, second);
    }

    #[tokio::test]
    async fn merge_remote_entries_is_idempotent() {
        let engine = engine();
        let owner = Some(crate::canonical::hash_bytes(b"owner:carol"));
        let channel = engine.create_channel(owner, "diary").await.unwrap();

        let data_hash = engine.store.put(canonicalize(&serde_json::json!({"n": 1})).unwrap()).await.unwrap();
        let entry = ChannelEntry {
            type_tag: "ChannelEntry".to_string(),
            channel,
            owner,
            object_type: "Note".to_string(),
            creation_time: 100,
            data: data_hash,
            prev: None,
        };

        let accepted1 = engine.merge_remote_entries(channel, owner, vec![entry.clone()]).await.unwrap();
        let accepted2 = engine.merge_remote_entries(channel, owner, vec![entry]).await.unwrap();
        assert_eq!(accepted1, 1);
        assert_eq!(accepted2, 0);
    }

    #[tokio::test]
    async fn on_updated_fires_with_earliest_change_and_new_entries() {
        let engine = engine();
        let owner = Some(crate::canonical::hash_bytes(b"owner:dan"));
        let channel = engine.create_channel(owner, "diary").await.unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        engine
            .on_updated(Box::new(move |notice| {
                seen2.lock().unwrap().push((notice.owner, notice.time_of_earliest_change, notice.new_entries.len()));
            }))
            .await;

        engine
            .post_to_channel(channel, owner, "Note", &serde_json::json!({"n": 1}), 500)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(owner, 500, 1)]);
    }

    #[tokio::test]
    async fn ownerless_channel_entries_round_trip() {
        let engine = engine();
        let channel = engine.create_channel(None, "system").await.unwrap();
        engine.post_to_channel(channel, None, "Note", &serde_json::json!({"n": 1}), 100).await.unwrap();
        let head = engine.head_of(channel, None).await;
        assert!(head.is_some());
    }

    #[test]
    fn entries_missing_locally_walks_prev_chain_and_stops_at_known() {
        let mk = |channel: Hash, owner: Option<Hash>, t: i64, data: Hash, prev: Option<Hash>| ChannelEntry {
            type_tag: "ChannelEntry".to_string(),
            channel,
            owner,
            object_type: "Note".to_string(),
            creation_time: t,
            data,
            prev,
        };
        let channel = crate::canonical::hash_bytes(b"c");
        let owner = Some(crate::canonical::hash_bytes(b"o"));
        let e1 = mk(channel, owner, 1, crate::canonical::hash_bytes(b"d1"), None);
        let h1 = e1.entry_hash().unwrap();
        let e2 = mk(channel, owner, 2, crate::canonical::hash_bytes(b"d2"), Some(h1));
        let h2 = e2.entry_hash().unwrap();
        let e3 = mk(channel, owner, 3, crate::canonical::hash_bytes(b"d3"), Some(h2));
        let h3 = e3.entry_hash().unwrap();

        let mut by_hash = HashMap::new();
        by_hash.insert(h1, e1);
        by_hash.insert(h2, e2.clone());
        by_hash.insert(h3, e3.clone());

        let mut known = HashSet::new();
        known.insert(h1);

        let missing = entries_missing_locally(&by_hash, h3, &known);
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].creation_time, 2);
        assert_eq!(missing[1].creation_time, 3);
    }

    #[tokio::test]
    async fn chum_retry_tracker_gives_up_after_max_attempts() {
        let tracker = ChumRetryTracker::new();
        let h = crate::canonical::hash_bytes(b"missing");
        assert!(tracker.should_retry(h).await);
        assert!(tracker.should_retry(h).await);
        assert!(tracker.should_retry(h).await);
        assert!(!tracker.should_retry(h).await);
        assert_eq!(tracker.give_up_count().await, 1);
    }

    #[tokio::test]
    async fn serve_chum_entries_denies_without_a_grant() {
        let engine = engine();
        let owner = Some(crate::canonical::hash_bytes(b"owner:frank"));
        let channel = engine.create_channel(owner, "diary").await.unwrap();
        engine.post_to_channel(channel, owner, "Note", &serde_json::json!({"n": 1}), 100).await.unwrap();

        let requester = crate::canonical::hash_bytes(b"requester:mallory");
        let request = ChumHeadsRequest { channel, owner, local_head: None };
        let result = engine.serve_chum_entries(&request, requester).await;
        assert!(matches!(result, Err(CoreError::Permission(_))));
    }

    #[tokio::test]
    async fn serve_chum_entries_returns_missing_entries_once_granted() {
        let engine = engine();
        let owner = Some(crate::canonical::hash_bytes(b"owner:grace"));
        let channel = engine.create_channel(owner, "diary").await.unwrap();
        engine.post_to_channel(channel, owner, "Note", &serde_json::json!({"n": 1}), 100).await.unwrap();
        engine.post_to_channel(channel, owner, "Note", &serde_json::json!({"n": 2}), 200).await.unwrap();

        let requester = crate::canonical::hash_bytes(b"requester:heidi");
        engine.grant_access(channel, owner, requester).await;

        let request = ChumHeadsRequest { channel, owner, local_head: None };
        let response = engine.serve_chum_entries(&request, requester).await.unwrap();
        assert_eq!(response.entries.len(), 2);

        engine.revoke_access(channel, owner, requester).await;
        let result = engine.serve_chum_entries(&request, requester).await;
        assert!(matches!(result, Err(CoreError::Permission(_))));
    }
}
