use crate::config::CacheConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Bounded, non-durable map from normalized logical path to the last known
/// value. Eviction is FIFO by first insertion and only happens when
/// `evict_if_needed` runs (the database drives it from a background timer).
pub struct Cache {
    high_water_mark: usize,
    eviction_batch: usize,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Slot>,
    /// Insertion order; a key whose generation no longer matches its slot
    /// was removed (and possibly re-inserted) since and is skipped.
    order: VecDeque<(String, u64)>,
    next_generation: u64,
}

struct Slot {
    generation: u64,
    value: serde_yaml::Value,
}

impl Cache {
    pub fn new(config: &CacheConfig) -> Self {
        Cache {
            high_water_mark: config.high_water_mark.max(1),
            eviction_batch: config.eviction_batch.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_yaml::Value> {
        self.state.lock().entries.get(key).map(|slot| slot.value.clone())
    }

    pub fn insert(&self, key: &str, value: serde_yaml::Value) {
        let mut state = self.state.lock();
        if let Some(slot) = state.entries.get_mut(key) {
            slot.value = value;
            return;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(key.to_string(), Slot { generation, value });
        state.order.push_back((key.to_string(), generation));

        // Keep the order queue from growing without bound under churn
        if state.order.len() > 2 * state.entries.len() + self.eviction_batch {
            let CacheState { entries, order, .. } = &mut *state;
            order.retain(|(k, g)| entries.get(k).map(|s| s.generation) == Some(*g));
        }
    }

    pub fn remove(&self, key: &str) {
        self.state.lock().entries.remove(key);
    }

    /// Drop `prefix` itself and everything below it (`prefix/...`)
    pub fn remove_prefix(&self, prefix: &str) {
        let nested = format!("{prefix}/");
        self.state
            .lock()
            .entries
            .retain(|k, _| k != prefix && !k.starts_with(&nested));
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Run one eviction check. Once the resident count reaches the high-water
    /// mark, the oldest entries are evicted until the count is one batch
    /// below the mark. Returns the number of evicted entries.
    pub fn evict_if_needed(&self) -> usize {
        let mut state = self.state.lock();
        let resident = state.entries.len();
        if resident < self.high_water_mark {
            return 0;
        }

        let target = (resident - self.high_water_mark + self.eviction_batch).min(resident);
        let mut evicted = 0;
        while evicted < target {
            let Some((key, generation)) = state.order.pop_front() else {
                break;
            };
            let live = state
                .entries
                .get(&key)
                .map(|slot| slot.generation == generation)
                .unwrap_or(false);
            if live {
                state.entries.remove(&key);
                evicted += 1;
            }
        }

        log::debug!("Cache eviction dropped {evicted} of {resident} entries");
        evicted
    }
}
