//! Cached date-directory projection (§4.7).
//!
//! Groups one channel's objects-of-a-type by calendar day (and, by
//! aggregation, month/year) so a UI can page through history without
//! re-scanning the whole log on every render. Generalizes
//! `state::AppState::load_history`'s incremental rule — only fill the
//! cache when it's empty, never re-scan what's already loaded — into a
//! proper per-day cache invalidated by the `onUpdated` rule: a change
//! with `timeOfEarliestChange = t` only invalidates the day bucket
//! containing `t` and every day after it; earlier days cannot have
//! been affected since channel entries only ever get appended, never
//! rewritten.

use crate::canonical::Hash;
use crate::channel::{ChannelEngine, ObjectQuery, UpdateNotice};
use crate::error::CoreResult;
use chrono::{DateTime, Datelike, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub type DateKey = (i32, u32, u32); // (year, month, day)

fn date_key(timestamp: i64) -> DateKey {
    let dt: DateTime<Utc> = DateTime::from_timestamp(timestamp, 0).unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap());
    (dt.year(), dt.month(), dt.day())
}

#[derive(Default, Clone)]
struct DayBucket {
    entries: Vec<(i64, Hash)>, // (creation_time, data hash), sorted newest first
}

/// Per-`(channel, objectType)` day cache. One instance covers one
/// projection; a caller wanting several object types in the same
/// channel keeps one `DirectoryCache` per type, mirroring
/// `AppState::messages` being keyed per channel rather than global.
pub struct DirectoryCache {
    channel: Hash,
    object_type: String,
    days: Mutex<BTreeMap<DateKey, DayBucket>>,
    loaded: Mutex<bool>,
}

impl DirectoryCache {
    pub fn new(channel: Hash, object_type: &str) -> Arc<Self> {
        Arc::new(Self {
            channel,
            object_type: object_type.to_string(),
            days: Mutex::new(BTreeMap::new()),
            loaded: Mutex::new(false),
        })
    }

    /// Returns a listener suitable for `ChannelEngine::on_updated`
    /// that invalidates this cache's affected days whenever the
    /// matching channel changes. Does nothing for updates to other
    /// channels.
    pub fn invalidation_listener(self: &Arc<Self>) -> Box<dyn Fn(&UpdateNotice) + Send + Sync> {
        let cache = self.clone();
        Box::new(move |notice: &UpdateNotice| {
            if notice.channel != cache.channel {
                return;
            }
            cache.invalidate_from(notice.time_of_earliest_change);
        })
    }

    /// Drop every cached day at or after the day containing `t`,
    /// since only those days could have gained new entries.
    fn invalidate_from(&self, t: i64) {
        let cutoff = date_key(t);
        let mut days = self.days.lock().unwrap();
        days.retain(|k, _| *k < cutoff);
        *self.loaded.lock().unwrap() = false;
        debug!("directory cache invalidated from {:?}", cutoff);
    }

    /// Populate any missing days by re-scanning the channel through
    /// `ChannelEngine`. Cheap no-op once fully populated and no
    /// invalidation has occurred since, matching `load_history`'s
    /// "only load if the in-memory list is still empty" discipline.
    pub async fn ensure_loaded(&self, engine: &ChannelEngine) -> CoreResult<()> {
        if *self.loaded.lock().unwrap() {
            return Ok(());
        }
        let objects = engine
            .objects_with_type(
                &self.object_type,
                &ObjectQuery { channel_id: Some(self.channel), omit_data: true, ..Default::default() },
            )
            .await?;
        let mut days: BTreeMap<DateKey, DayBucket> = BTreeMap::new();
        for (hash, creation_time, _) in objects {
            let key = date_key(creation_time);
            days.entry(key).or_default().entries.push((creation_time, hash));
        }
        for bucket in days.values_mut() {
            bucket.entries.sort_by(|a, b| b.0.cmp(&a.0));
        }
        *self.days.lock().unwrap() = days;
        *self.loaded.lock().unwrap() = true;
        Ok(())
    }

    pub fn day(&self, year: i32, month: u32, day: u32) -> Vec<Hash> {
        self.days
            .lock()
            .unwrap()
            .get(&(year, month, day))
            .map(|b| b.entries.iter().map(|(_, h)| *h).collect())
            .unwrap_or_default()
    }

    pub fn month(&self, year: i32, month: u32) -> Vec<Hash> {
        let days = self.days.lock().unwrap();
        let mut out = Vec::new();
        for (key, bucket) in days.range((year, month, 0)..(year, month, 32)) {
            if key.0 == year && key.1 == month {
                out.extend(bucket.entries.iter().map(|(_, h)| *h));
            }
        }
        out
    }

    pub fn year(&self, year: i32) -> Vec<Hash> {
        let days = self.days.lock().unwrap();
        let mut out = Vec::new();
        for (key, bucket) in days.range((year, 0, 0)..(year, 13, 0)) {
            if key.0 == year {
                out.extend(bucket.entries.iter().map(|(_, h)| *h));
            }
        }
        out
    }

    pub fn cached_day_count(&self) -> usize {
        self.days.lock().unwrap().len()
    }
}
