// cache.rs
//
// The last decoded value of every register map entry, addressed by the
// same (component, register_map, decode) index triple as `Workspace`.
// This is `Decoded_Cache` from the original client: the poll loop writes
// into it, the publish path and every Set's "previous_raw" read out of
// it, and debounce suppression lives here rather than in the poll loop
// itself so a single slow-changing decode doesn't need its own timer.

use crate::decode::TypedValue;
use crate::workspace::Workspace;

#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeCacheEntry {
    pub raw: u64,
    pub value: Option<TypedValue>,
    pub last_change_ns: u64,
    initialized: bool,
}

impl DecodeCacheEntry {
    pub fn previous_raw(&self) -> Option<u64> {
        self.initialized.then_some(self.raw)
    }
}

#[derive(Debug)]
pub enum UpdateOutcome {
    /// Raw bits identical to the cached value; nothing to do.
    Unchanged,
    Changed {
        /// Whether this change survived debounce and should be published.
        should_publish: bool,
        /// Bits that differ from the previous raw value (meaningful for
        /// `individual_bits` decodes, where each caller bit maps 1:1).
        changed_bits: u64,
    },
}

pub struct DecodedCache {
    maps: Vec<Vec<Vec<DecodeCacheEntry>>>,
}

impl DecodedCache {
    pub fn new_for(workspace: &Workspace) -> Self {
        let maps = workspace
            .components
            .iter()
            .map(|comp| {
                comp.register_maps
                    .iter()
                    .map(|map| vec![DecodeCacheEntry::default(); map.decodes.len()])
                    .collect()
            })
            .collect();
        DecodedCache { maps }
    }

    pub fn get(&self, comp_idx: usize, map_idx: usize, decode_idx: usize) -> &DecodeCacheEntry {
        &self.maps[comp_idx][map_idx][decode_idx]
    }

    /// Record a freshly decoded value. `debounce_ms` comes from the
    /// decode's own spec (already defaulted from the connection at load
    /// time). `now_ns` is the caller's monotonic clock reading.
    pub fn update(
        &mut self,
        comp_idx: usize,
        map_idx: usize,
        decode_idx: usize,
        new_value: TypedValue,
        new_raw: u64,
        debounce_ms: u64,
        now_ns: u64,
    ) -> UpdateOutcome {
        let entry = &mut self.maps[comp_idx][map_idx][decode_idx];

        if !entry.initialized {
            entry.raw = new_raw;
            entry.value = Some(new_value);
            entry.last_change_ns = now_ns;
            entry.initialized = true;
            return UpdateOutcome::Changed {
                should_publish: true,
                changed_bits: new_raw,
            };
        }

        if entry.raw == new_raw {
            return UpdateOutcome::Unchanged;
        }

        let changed_bits = entry.raw ^ new_raw;
        let elapsed_ms = now_ns.saturating_sub(entry.last_change_ns) / 1_000_000;
        let should_publish = elapsed_ms >= debounce_ms;

        entry.raw = new_raw;
        entry.value = Some(new_value);
        if should_publish {
            entry.last_change_ns = now_ns;
        }

        UpdateOutcome::Changed {
            should_publish,
            changed_bits,
        }
    }
}
