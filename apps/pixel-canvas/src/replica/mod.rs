//! Local cache of the pixel table.
//!
//! The replica is written only by applying rows that arrived from the
//! authoritative store, strictly in arrival order. Each apply is a total
//! overwrite of the cell keyed by `(x, y)`, so two replicas fed the same
//! sequence converge to the same mapping regardless of timing.
//!
//! ```
//! # use pixel_canvas::replica::ReplicaStore;
//! # use pixel_canvas::model::{Color, Identity, Pixel};
//! let mut replica = ReplicaStore::default();
//! replica.apply_insert(Pixel::new(5, 5, Color::rgb(0xFF, 0, 0), Identity::ANONYMOUS));
//! replica.apply_insert(Pixel::new(5, 5, Color::rgb(0, 0xFF, 0), Identity::ANONYMOUS));
//! let live: Vec<_> = replica.read().collect();
//! assert_eq!(live.len(), 1);
//! assert_eq!(live[0].color, Color::rgb(0, 0xFF, 0));
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{CoordinateKey, Pixel};

/// Monotonic apply counter; later applies paint over earlier ones.
pub type Seq = u64;

/// What happens to cached cells the store does not redeliver after a resubscribe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StalePolicy {
    /// Keep everything seen this process lifetime.
    #[default]
    Retain,
    /// Drop cells that were not redelivered once the fresh subscription is ready.
    PruneOnResync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Overwrote { previous: Pixel },
}

#[derive(Debug, Clone)]
struct ReplicaEntry {
    pixel: Pixel,
    seq: Seq,
}

#[derive(Debug, Default)]
pub struct ReplicaStore {
    entries: HashMap<CoordinateKey, ReplicaEntry>,
    order: BTreeMap<Seq, CoordinateKey>,
    next_seq: Seq,
    version: u64,
    dirty: HashSet<CoordinateKey>,
    policy: StalePolicy,
    resync: Option<HashSet<CoordinateKey>>,
}

impl ReplicaStore {
    pub fn new(policy: StalePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn apply_insert(&mut self, pixel: Pixel) -> ApplyOutcome {
        if let Some(seen) = self.resync.as_mut() {
            seen.insert(pixel.key());
        }
        self.overwrite(pixel)
    }

    /// Applies a row that arrived on a superseded link. The cell is written,
    /// but it does not count as redelivered by the current resync.
    pub fn apply_superseded_insert(&mut self, pixel: Pixel) -> ApplyOutcome {
        self.overwrite(pixel)
    }

    fn overwrite(&mut self, pixel: Pixel) -> ApplyOutcome {
        let key = pixel.key();
        self.next_seq += 1;
        let seq = self.next_seq;
        self.version += 1;
        self.dirty.insert(key);
        self.order.insert(seq, key);
        match self.entries.insert(key, ReplicaEntry { pixel, seq }) {
            Some(previous) => {
                self.order.remove(&previous.seq);
                ApplyOutcome::Overwrote {
                    previous: previous.pixel,
                }
            }
            None => ApplyOutcome::Inserted,
        }
    }

    /// Applies a delete the store itself emitted. The replica never removes on its own.
    pub fn apply_delete(&mut self, key: CoordinateKey) -> Option<Pixel> {
        let removed = self.entries.remove(&key)?;
        self.order.remove(&removed.seq);
        self.version += 1;
        self.dirty.insert(key);
        Some(removed.pixel)
    }

    /// Live pixels, oldest apply first.
    pub fn read(&self) -> impl Iterator<Item = &Pixel> + '_ {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key).map(|entry| &entry.pixel))
    }

    pub fn get(&self, key: CoordinateKey) -> Option<&Pixel> {
        self.entries.get(&key).map(|entry| &entry.pixel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumped on every change; the render loop compares it to decide whether to redraw.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Keys touched since the previous call.
    pub fn take_dirty(&mut self) -> Vec<CoordinateKey> {
        let mut keys: Vec<_> = self.dirty.drain().collect();
        keys.sort_unstable();
        keys
    }

    pub fn snapshot(&self) -> Vec<Pixel> {
        self.read().cloned().collect()
    }

    /// Starts tracking which keys the fresh subscription redelivers.
    pub fn begin_resync(&mut self) {
        if self.policy == StalePolicy::PruneOnResync {
            self.resync = Some(HashSet::new());
        }
    }

    /// Ends a resync. Under `PruneOnResync`, returns how many stale cells were dropped.
    pub fn finish_resync(&mut self) -> usize {
        let Some(seen) = self.resync.take() else {
            return 0;
        };
        let stale: Vec<CoordinateKey> = self
            .entries
            .keys()
            .filter(|key| !seen.contains(key))
            .copied()
            .collect();
        for key in &stale {
            self.apply_delete(*key);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Color, Identity};

    const RED: Color = Color::rgb(0xFF, 0, 0);
    const GREEN: Color = Color::rgb(0, 0xFF, 0);

    fn px(x: i64, y: i64, color: Color) -> Pixel {
        Pixel::new(x, y, color, Identity::ANONYMOUS)
    }

    #[test]
    fn same_coordinate_is_overwritten_in_arrival_order() {
        let mut replica = ReplicaStore::default();
        replica.apply_insert(px(1, 1, RED));
        assert_eq!(replica.apply_insert(px(5, 5, RED)), ApplyOutcome::Inserted);
        assert_eq!(
            replica.apply_insert(px(5, 5, GREEN)),
            ApplyOutcome::Overwrote {
                previous: px(5, 5, RED)
            }
        );
        let at_five: Vec<_> = replica.read().filter(|p| p.key() == CoordinateKey::new(5, 5)).collect();
        assert_eq!(at_five, vec![&px(5, 5, GREEN)]);
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn identical_sequences_converge() {
        let sequence = vec![
            px(0, 0, RED),
            px(-3, 7, GREEN),
            px(0, 0, GREEN),
            px(12, 3, RED),
            px(1, 23, GREEN),
            px(-3, 7, RED),
        ];
        let mut a = ReplicaStore::default();
        let mut b = ReplicaStore::default();
        for pixel in &sequence {
            a.apply_insert(pixel.clone());
        }
        for pixel in &sequence {
            b.apply_insert(pixel.clone());
        }
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn read_orders_by_last_apply() {
        let mut replica = ReplicaStore::default();
        replica.apply_insert(px(1, 0, RED));
        replica.apply_insert(px(2, 0, RED));
        replica.apply_insert(px(1, 0, GREEN));
        let keys: Vec<_> = replica.read().map(|p| p.x).collect();
        assert_eq!(keys, vec![2, 1]);
    }

    #[test]
    fn version_and_dirty_track_changes() {
        let mut replica = ReplicaStore::default();
        assert_eq!(replica.version(), 0);
        replica.apply_insert(px(3, 3, RED));
        replica.apply_insert(px(3, 3, GREEN));
        replica.apply_insert(px(4, 4, GREEN));
        assert_eq!(replica.version(), 3);
        assert_eq!(
            replica.take_dirty(),
            vec![CoordinateKey::new(3, 3), CoordinateKey::new(4, 4)]
        );
        assert!(replica.take_dirty().is_empty());
    }

    #[test]
    fn retain_policy_never_prunes() {
        let mut replica = ReplicaStore::new(StalePolicy::Retain);
        replica.apply_insert(px(1, 1, RED));
        replica.begin_resync();
        replica.apply_insert(px(2, 2, RED));
        assert_eq!(replica.finish_resync(), 0);
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn prune_policy_drops_cells_missing_from_resync() {
        let mut replica = ReplicaStore::new(StalePolicy::PruneOnResync);
        replica.apply_insert(px(1, 1, RED));
        replica.apply_insert(px(2, 2, RED));
        replica.begin_resync();
        replica.apply_insert(px(2, 2, GREEN));
        assert_eq!(replica.finish_resync(), 1);
        assert_eq!(replica.get(CoordinateKey::new(1, 1)), None);
        assert_eq!(replica.get(CoordinateKey::new(2, 2)), Some(&px(2, 2, GREEN)));
        assert_eq!(replica.finish_resync(), 0);
    }

    #[test]
    fn superseded_rows_are_written_but_not_counted_as_redelivered() {
        let mut replica = ReplicaStore::new(StalePolicy::PruneOnResync);
        replica.apply_insert(px(1, 1, RED));
        replica.begin_resync();
        replica.apply_superseded_insert(px(1, 1, GREEN));
        assert_eq!(replica.get(CoordinateKey::new(1, 1)), Some(&px(1, 1, GREEN)));
        assert_eq!(replica.finish_resync(), 1);
        assert!(replica.is_empty());
    }

    #[test]
    fn store_delete_removes_cell() {
        let mut replica = ReplicaStore::default();
        replica.apply_insert(px(9, 9, RED));
        assert_eq!(replica.apply_delete(CoordinateKey::new(9, 9)), Some(px(9, 9, RED)));
        assert!(replica.is_empty());
        assert_eq!(replica.apply_delete(CoordinateKey::new(9, 9)), None);
    }
}
