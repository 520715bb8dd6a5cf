//! In-memory state of one cycle.
//!
//! The coordinator loads the persisted counters and open alarms into these
//! indexes, hands them to the detection engine, and turns what comes back
//! into a single [`CycleChanges`](pvwatch_core::CycleChanges) write.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use pvwatch_core::{Alarm, Counter, DetectionKey, EntityId};

// ── Counter index ───────────────────────────────────────────────────

/// Debounce counters keyed by detection key.
///
/// Only counts above zero are held. A reset removes the entry; the removal
/// becomes a delete when the index is written back.
#[derive(Debug, Clone, Default)]
pub struct CounterIndex {
    counters: HashMap<DetectionKey, Counter>,
    loaded: HashSet<DetectionKey>,
    touched: HashSet<DetectionKey>,
}

impl CounterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index from persisted rows. Zero counts are ignored.
    pub fn from_loaded(rows: impl IntoIterator<Item = (DetectionKey, Counter)>) -> Self {
        let counters: HashMap<DetectionKey, Counter> =
            rows.into_iter().filter(|(_, c)| c.count > 0).collect();
        let loaded = counters.keys().cloned().collect();
        Self {
            counters,
            loaded,
            touched: HashSet::new(),
        }
    }

    /// Current count, zero when absent.
    pub fn count(&self, key: &DetectionKey) -> u32 {
        self.counters.get(key).map_or(0, |c| c.count)
    }

    pub fn get(&self, key: &DetectionKey) -> Option<&Counter> {
        self.counters.get(key)
    }

    /// Add one consecutive occurrence and return the new count.
    pub fn increment(&mut self, key: &DetectionKey, now: DateTime<Utc>) -> u32 {
        let counter = self.counters.entry(key.clone()).or_insert(Counter {
            count: 0,
            last_detected_at: now,
        });
        counter.count = counter.count.saturating_add(1);
        counter.last_detected_at = now;
        self.touched.insert(key.clone());
        counter.count
    }

    /// Drop the counter back to zero.
    pub fn reset(&mut self, key: &DetectionKey) {
        if self.counters.remove(key).is_some() {
            self.touched.insert(key.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Counter rows to upsert and keys to delete.
    ///
    /// Upserts cover every counter changed this cycle; deletes cover every
    /// persisted counter that is now zero.
    pub fn into_writes(self) -> (Vec<(DetectionKey, Counter)>, Vec<DetectionKey>) {
        let mut upserts: Vec<(DetectionKey, Counter)> = self
            .touched
            .iter()
            .filter_map(|key| self.counters.get(key).map(|c| (key.clone(), *c)))
            .collect();
        let mut deletes: Vec<DetectionKey> = self
            .loaded
            .iter()
            .filter(|key| !self.counters.contains_key(*key))
            .cloned()
            .collect();
        upserts.sort_by(|a, b| a.0.cmp(&b.0));
        deletes.sort();
        (upserts, deletes)
    }
}

// ── Open alarm index ────────────────────────────────────────────────

/// Currently open alarms keyed by detection key.
#[derive(Debug, Clone, Default)]
pub struct OpenAlarmIndex {
    by_key: HashMap<DetectionKey, Alarm>,
}

impl OpenAlarmIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index open alarms. Closed rows are ignored; if the registry somehow
    /// holds two open rows for one key, the older one is kept.
    pub fn from_alarms(alarms: impl IntoIterator<Item = Alarm>) -> Self {
        let mut by_key: HashMap<DetectionKey, Alarm> = HashMap::new();
        for alarm in alarms.into_iter().filter(Alarm::is_open) {
            match by_key.get(&alarm.key) {
                Some(existing) => {
                    warn!(
                        key = %alarm.key,
                        kept = %existing.id,
                        ignored = %alarm.id,
                        "multiple open alarms for one key"
                    );
                    if alarm.triggered_at < existing.triggered_at {
                        by_key.insert(alarm.key.clone(), alarm);
                    }
                }
                None => {
                    by_key.insert(alarm.key.clone(), alarm);
                }
            }
        }
        Self { by_key }
    }

    pub fn get(&self, key: &DetectionKey) -> Option<&Alarm> {
        self.by_key.get(key)
    }

    pub fn contains(&self, key: &DetectionKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Keys of every open alarm on one inverter.
    pub fn keys_for_entity<'a>(
        &'a self,
        entity: &'a EntityId,
    ) -> impl Iterator<Item = &'a DetectionKey> + 'a {
        self.by_key.keys().filter(move |k| k.entity() == entity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alarm> {
        self.by_key.values()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pvwatch_core::{RuleType, Severity};

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, min, 0).unwrap()
    }

    fn key(detail: &str) -> DetectionKey {
        DetectionKey::new(EntityId::new("p1", "inv1"), RuleType::StringDown, detail)
    }

    #[test]
    fn increment_and_reset_produce_writes() {
        let mut index = CounterIndex::from_loaded(vec![
            (key("String 1"), Counter { count: 1, last_detected_at: at(0) }),
            (key("String 2"), Counter { count: 3, last_detected_at: at(0) }),
            (key("String 3"), Counter { count: 2, last_detected_at: at(0) }),
        ]);

        assert_eq!(index.increment(&key("String 1"), at(5)), 2);
        index.reset(&key("String 2"));
        assert_eq!(index.increment(&key("String 4"), at(5)), 1);

        let (upserts, deletes) = index.into_writes();
        assert_eq!(
            upserts,
            vec![
                (key("String 1"), Counter { count: 2, last_detected_at: at(5) }),
                (key("String 4"), Counter { count: 1, last_detected_at: at(5) }),
            ]
        );
        // String 3 was untouched, so it is neither rewritten nor deleted.
        assert_eq!(deletes, vec![key("String 2")]);
    }

    #[test]
    fn reset_of_unknown_key_writes_nothing() {
        let mut index = CounterIndex::new();
        index.reset(&key("String 9"));
        let (upserts, deletes) = index.into_writes();
        assert!(upserts.is_empty());
        assert!(deletes.is_empty());
    }

    #[test]
    fn increment_then_reset_of_new_key_writes_nothing() {
        let mut index = CounterIndex::new();
        index.increment(&key("String 1"), at(0));
        index.reset(&key("String 1"));
        let (upserts, deletes) = index.into_writes();
        assert!(upserts.is_empty());
        assert!(deletes.is_empty());
    }

    #[test]
    fn zero_rows_are_not_loaded() {
        let index = CounterIndex::from_loaded(vec![(
            key("String 1"),
            Counter { count: 0, last_detected_at: at(0) },
        )]);
        assert!(index.is_empty());
        assert_eq!(index.count(&key("String 1")), 0);
    }

    #[test]
    fn open_index_skips_closed_and_keeps_oldest_duplicate() {
        let older = Alarm::open(key("String 1"), Severity::High, "older", at(0));
        let newer = Alarm::open(key("String 1"), Severity::High, "newer", at(10));
        let mut closed = Alarm::open(key("String 2"), Severity::High, "closed", at(0));
        closed.cleared_at = Some(at(3));

        let index = OpenAlarmIndex::from_alarms(vec![newer, older.clone(), closed]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&key("String 1")).unwrap().id, older.id);
        assert!(!index.contains(&key("String 2")));
    }

    #[test]
    fn keys_for_entity_filters_by_inverter() {
        let other = DetectionKey::new(EntityId::new("p1", "inv2"), RuleType::StringDown, "String 1");
        let index = OpenAlarmIndex::from_alarms(vec![
            Alarm::open(key("String 1"), Severity::High, "a", at(0)),
            Alarm::open(other, Severity::High, "b", at(0)),
        ]);
        let entity = EntityId::new("p1", "inv1");
        let keys: Vec<_> = index.keys_for_entity(&entity).collect();
        assert_eq!(keys, vec![&key("String 1")]);
    }
}
