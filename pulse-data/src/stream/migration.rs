use crate::{event::MigrationCounts, stream::protocol::PulseRow};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::time::Duration;
use tracing::debug;

/// Migration counters of an instrument's originator, keyed by both token and pair address.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStat {
    pub token_address: SmolStr,
    pub pair_address: SmolStr,
    pub migrated: u64,
    pub total: u64,
    pub observed_at: DateTime<Utc>,
}

impl MigrationStat {
    pub fn counts(&self) -> MigrationCounts {
        MigrationCounts::new(self.migrated, self.total)
    }
}

impl From<PulseRow> for MigrationStat {
    fn from(row: PulseRow) -> Self {
        Self {
            token_address: row.token_address,
            pair_address: row.pair_address,
            migrated: row.migrated,
            total: row.total,
            observed_at: row.observed_at,
        }
    }
}

/// Short-lived view of the most recent migration snapshot rows.
///
/// Rows older than the freshness window are neither accepted nor returned. Each batch
/// prunes stale entries and then caps the map to `capacity` keys, evicting the oldest
/// observations first.
#[derive(Debug)]
pub struct MigrationStatCache {
    freshness: TimeDelta,
    capacity: usize,
    entries: Mutex<FnvHashMap<SmolStr, MigrationStat>>,
}

impl MigrationStatCache {
    pub fn new(freshness: Duration, capacity: usize) -> Self {
        Self {
            freshness: TimeDelta::from_std(freshness).unwrap_or(TimeDelta::seconds(15)),
            capacity: capacity.max(2),
            entries: Mutex::new(FnvHashMap::default()),
        }
    }

    fn is_fresh(&self, stat: &MigrationStat, now: DateTime<Utc>) -> bool {
        now - stat.observed_at <= self.freshness
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Upsert fresh rows, prune stale entries and enforce the capacity.
    ///
    /// Returns the number of rows accepted.
    pub fn apply_batch<I>(&self, rows: I, now: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = PulseRow>,
    {
        let mut entries = self.entries.lock();

        let mut accepted = 0;
        for stat in rows.into_iter().map(MigrationStat::from) {
            if !self.is_fresh(&stat, now) {
                continue;
            }
            entries.insert(stat.pair_address.clone(), stat.clone());
            entries.insert(stat.token_address.clone(), stat);
            accepted += 1;
        }

        entries.retain(|_, stat| now - stat.observed_at <= self.freshness);

        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            let evicted = entries
                .iter()
                .sorted_by_key(|(_, stat)| stat.observed_at)
                .take(excess)
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();

            for key in evicted {
                entries.remove(&key);
            }
            debug!(excess, "migration cache over capacity, evicted oldest");
        }

        accepted
    }

    /// Fresh stat stored under `address`, if any.
    pub fn get(&self, address: &str, now: DateTime<Utc>) -> Option<MigrationStat> {
        self.entries
            .lock()
            .get(address)
            .filter(|stat| self.is_fresh(stat, now))
            .cloned()
    }

    /// Look an event up by token address, then by pair address.
    pub fn lookup(&self, token_address: &str, pair_address: &str, now: DateTime<Utc>) -> Option<MigrationStat> {
        self.get(token_address, now)
            .or_else(|| self.get(pair_address, now))
    }
}
