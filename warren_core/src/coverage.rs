use std::sync::Arc;

use crate::hash::location_hash;
use crate::shmem::SharedRegion;

/// How far the previous-location register decays on every recorded edge.
/// The shift keeps A→A (a tight loop) distinguishable from A→B and from a
/// second visit of A along a different path.
const PREV_LOC_SHIFT: u32 = 1;

/// A cheaply clonable handle over the shared coverage bitmap.
///
/// Each byte of the bitmap is a saturating hit counter for one edge
/// (a transition between two instrumented call sites). The map is written
/// only by the live worker, through [`WorkerContext`], and read by the
/// controller (or an external aggregator) between iterations. Indices are
/// always reduced modulo the bitmap length, so every recorded edge lands
/// inside the region.
#[derive(Clone)]
pub struct CoverageMap {
    region: Arc<SharedRegion>,
}

impl CoverageMap {
    pub fn new(region: SharedRegion) -> Self {
        Self {
            region: Arc::new(region),
        }
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Read-only view of the bitmap. Intended for the controller side,
    /// after the worker whose hits it reflects has terminated.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region.as_ptr(), self.region.len()) }
    }

    /// Number of buckets with at least one hit.
    pub fn populated_buckets(&self) -> usize {
        self.as_slice().iter().filter(|&&b| b != 0).count()
    }

    /// Saturating increment of one bucket. Volatile because the bitmap is
    /// shared memory written in the worker and read in another process.
    fn bump(&self, index: usize) {
        debug_assert!(index < self.region.len());
        unsafe {
            let slot = self.region.as_ptr().add(index);
            let hits = slot.read_volatile();
            if hits != u8::MAX {
                slot.write_volatile(hits + 1);
            }
        }
    }
}

/// Per-worker execution state for coverage recording.
///
/// Holds the previous-location register (zeroed at worker entry) and the
/// edge-hash seed next to the map handle, so instrumentation hooks thread a
/// single value through instead of touching process-wide globals. Each
/// forked worker gets a fresh context over the *shared* map.
pub struct WorkerContext {
    map: CoverageMap,
    prev_location: u32,
    edge_seed: u32,
}

impl WorkerContext {
    pub fn new(map: CoverageMap, edge_seed: u32) -> Self {
        Self {
            map,
            prev_location: 0,
            edge_seed,
        }
    }

    /// Records the directed edge from the previously visited call site to
    /// `site`.
    ///
    /// The bucket is `hash(site XOR prev, seed) mod map_len`; the bucket
    /// byte saturates at 255 and never wraps. Afterwards the register decays
    /// to `site >> 1` so the next edge hashes differently from a self-loop.
    ///
    /// This is the hot path: no allocation, no branching beyond the
    /// saturation check, no error conditions.
    #[inline]
    pub fn record_edge(&mut self, site: u32) {
        let edge = (site ^ self.prev_location).to_le_bytes();
        let index = location_hash(&edge, self.edge_seed) as usize % self.map.len();
        self.map.bump(index);
        self.prev_location = site >> PREV_LOC_SHIFT;
    }

    /// Records a visit to a source location, deriving the call-site
    /// identifier from the file path and line number.
    ///
    /// This is the entry point an instrumentation layer calls once per
    /// traced location. Identifiers derived this way are only unique per
    /// process; nothing about them is stable across processes and nothing
    /// here relies on that.
    #[inline]
    pub fn record_location(&mut self, path: &str, line: u32) {
        self.record_edge(location_hash(path.as_bytes(), line));
    }

    pub fn map(&self) -> &CoverageMap {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map(len: usize) -> CoverageMap {
        CoverageMap::new(SharedRegion::anonymous(len).expect("anonymous mapping should succeed"))
    }

    #[test]
    fn every_recorded_edge_lands_inside_the_map() {
        let map = small_map(64);
        let mut ctx = WorkerContext::new(map.clone(), 0);
        // Adversarial identifiers: zero, maximal, repeated, alternating.
        for site in [0u32, u32::MAX, u32::MAX, 1, 0, u32::MAX / 2, 7, 7, 7] {
            ctx.record_edge(site);
        }
        for _ in 0..10_000 {
            ctx.record_edge(0xDEAD_BEEF);
            ctx.record_edge(3);
        }
        let total: u64 = map.as_slice().iter().map(|&b| u64::from(b)).sum();
        assert!(total > 0, "recording must have hit buckets inside the map");
    }

    #[test]
    fn bucket_counters_saturate_instead_of_wrapping() {
        // A single-bucket map forces every edge into bucket zero.
        let map = small_map(1);
        let mut ctx = WorkerContext::new(map.clone(), 0);
        for _ in 0..300 {
            ctx.record_edge(42);
        }
        assert_eq!(
            map.as_slice()[0],
            u8::MAX,
            "counter must cap at 255, never wrap to zero"
        );
        assert_eq!(map.populated_buckets(), 1);
    }

    #[test]
    fn revisiting_a_site_is_distinguishable_from_its_first_visit() {
        let map = small_map(1 << 16);
        let mut ctx = WorkerContext::new(map.clone(), 0);
        ctx.record_edge(5);
        ctx.record_edge(5);
        // First visit hashes 5 ^ 0, second hashes 5 ^ (5 >> 1): two buckets.
        assert_eq!(map.populated_buckets(), 2);
        assert_eq!(map.as_slice()[47552], 1);
        assert_eq!(map.as_slice()[14306], 1);
    }

    #[test]
    fn edge_direction_matters() {
        let forward = small_map(1 << 16);
        let mut ctx = WorkerContext::new(forward.clone(), 0);
        ctx.record_edge(17);
        ctx.record_edge(91);

        let backward = small_map(1 << 16);
        let mut ctx = WorkerContext::new(backward.clone(), 0);
        ctx.record_edge(91);
        ctx.record_edge(17);

        assert_ne!(
            forward.as_slice(),
            backward.as_slice(),
            "A→B and B→A must populate different buckets"
        );
    }

    #[test]
    fn fresh_context_restarts_from_a_zeroed_register() {
        let map = small_map(1 << 16);
        let mut first = WorkerContext::new(map.clone(), 0);
        first.record_edge(5);
        let first_bucket = 47552;
        assert_eq!(map.as_slice()[first_bucket], 1);

        // A second worker over the same map starts from prev = 0 again and
        // therefore hits the same bucket for the same first edge.
        let mut second = WorkerContext::new(map.clone(), 0);
        second.record_edge(5);
        assert_eq!(map.as_slice()[first_bucket], 2);
    }

    #[test]
    fn record_location_derives_stable_site_identifiers() {
        let a = small_map(1 << 16);
        let mut ctx = WorkerContext::new(a.clone(), 0);
        ctx.record_location("lib/app.rb", 10);
        ctx.record_location("lib/app.rb", 11);

        let b = small_map(1 << 16);
        let mut ctx = WorkerContext::new(b.clone(), 0);
        ctx.record_location("lib/app.rb", 10);
        ctx.record_location("lib/app.rb", 11);

        assert_eq!(
            a.as_slice(),
            b.as_slice(),
            "the same execution path must produce identical bitmaps"
        );
    }

    #[test]
    fn edge_seed_relocates_buckets() {
        let a = small_map(1 << 16);
        let mut ctx = WorkerContext::new(a.clone(), 0);
        ctx.record_edge(1234);

        let b = small_map(1 << 16);
        let mut ctx = WorkerContext::new(b.clone(), 99);
        ctx.record_edge(1234);

        assert_ne!(a.as_slice(), b.as_slice());
    }
}
