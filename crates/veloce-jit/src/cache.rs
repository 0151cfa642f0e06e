//! Block cache: compiled-block bookkeeping keyed by compilation location.
//!
//! The cache tracks, per block, the guest byte range it was translated
//! from and the state of its static link edges. Invalidation never frees
//! code (the arena reclaims storage only when everything is dropped at
//! once); it removes blocks from the lookup map and reports which linked
//! edges into them must be severed, so stale native code becomes
//! unreachable without being touched while a peer might still jump to it.

use rustc_hash::FxHashMap;

use crate::ir::{BlockFlags, LocationDescriptor};

/// One cached block. `C` is the backend payload: the native-code handle on
/// the JIT path, the IR itself on the interpreter path.
pub struct CachedBlock<C> {
    pub location: LocationDescriptor,
    /// Guest byte range `[guest_start, guest_end)` covered by the block.
    pub guest_start: u64,
    pub guest_end: u64,
    pub flags: BlockFlags,
    /// Body changes no guest state; with a self edge this is an idle loop.
    pub effect_free: bool,
    pub code: C,
    /// Link state per patch site, in patch-slot order.
    pub links: Vec<LinkState>,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkState {
    pub target: LocationDescriptor,
    pub linked: bool,
}

pub struct BlockCache<C> {
    /// Dense block storage; invalidated entries become tombstones so block
    /// ids baked into native exit words stay unambiguous.
    blocks: Vec<Option<CachedBlock<C>>>,
    by_location: FxHashMap<LocationDescriptor, u32>,
    /// Linked edges pointing at each location, as `(source block, slot)`.
    incoming: FxHashMap<LocationDescriptor, Vec<(u32, u8)>>,
    compile_count: u64,
}

impl<C> BlockCache<C> {
    pub fn new() -> BlockCache<C> {
        BlockCache {
            blocks: Vec::new(),
            by_location: FxHashMap::default(),
            incoming: FxHashMap::default(),
            compile_count: 0,
        }
    }

    /// Block id the next [`BlockCache::insert`] will return. The emitter
    /// bakes this id into the block's exit words, so it is fixed before
    /// compilation starts.
    pub fn next_id(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn insert(&mut self, block: CachedBlock<C>) -> u32 {
        let id = self.blocks.len() as u32;
        let previous = self.by_location.insert(block.location, id);
        assert!(
            previous.is_none(),
            "cache already holds a live block for this location"
        );
        self.blocks.push(Some(block));
        self.compile_count += 1;
        id
    }

    pub fn find(&self, location: LocationDescriptor) -> Option<u32> {
        self.by_location.get(&location).copied()
    }

    pub fn get(&self, id: u32) -> &CachedBlock<C> {
        self.blocks[id as usize]
            .as_ref()
            .expect("block id refers to an invalidated block")
    }

    /// Record that `slot` of block `id` now jumps directly to its target.
    pub fn mark_linked(&mut self, id: u32, slot: u8) {
        let block = self.blocks[id as usize]
            .as_mut()
            .expect("block id refers to an invalidated block");
        let link = &mut block.links[slot as usize];
        link.linked = true;
        let target = link.target;
        self.incoming.entry(target).or_default().push((id, slot));
    }

    /// Remove every block overlapping `[start, end)` from the lookup map.
    /// Returns the linked edges into the removed blocks; the caller must
    /// rewrite those patch sites back to their unlinked form.
    pub fn invalidate_range(&mut self, start: u64, end: u64) -> Vec<(u32, u8)> {
        let dead: Vec<u32> = self
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                let b = slot.as_ref()?;
                (b.guest_start < end && start < b.guest_end).then_some(id as u32)
            })
            .collect();
        let mut unlink = Vec::new();
        for id in &dead {
            let block = self.blocks[*id as usize]
                .take()
                .expect("invalidation target vanished");
            self.by_location.remove(&block.location);
            if let Some(sources) = self.incoming.remove(&block.location) {
                for (src, slot) in sources {
                    // The source may itself be dying in this sweep.
                    if let Some(Some(src_block)) = self.blocks.get_mut(src as usize) {
                        src_block.links[slot as usize].linked = false;
                        unlink.push((src, slot));
                    }
                }
            }
        }
        if !dead.is_empty() {
            tracing::debug!(
                start,
                end,
                blocks = dead.len(),
                "invalidated cached blocks"
            );
        }
        unlink
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.by_location.clear();
        self.incoming.clear();
    }

    /// Total blocks ever inserted; survives invalidation, so tests observe
    /// re-translation through it.
    pub fn compile_count(&self) -> u64 {
        self.compile_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(location: u64, start: u64, len: u64, targets: &[u64]) -> CachedBlock<()> {
        CachedBlock {
            location: LocationDescriptor(location),
            guest_start: start,
            guest_end: start + len,
            flags: BlockFlags::empty(),
            effect_free: false,
            code: (),
            links: targets
                .iter()
                .map(|&t| LinkState {
                    target: LocationDescriptor(t),
                    linked: false,
                })
                .collect(),
        }
    }

    #[test]
    fn lookup_by_location() {
        let mut cache = BlockCache::new();
        let id = cache.insert(block(0x1000, 0x1000, 8, &[]));
        assert_eq!(cache.find(LocationDescriptor(0x1000)), Some(id));
        assert_eq!(cache.find(LocationDescriptor(0x2000)), None);
        assert_eq!(cache.compile_count(), 1);
    }

    #[test]
    fn invalidation_reports_linked_predecessors() {
        let mut cache = BlockCache::new();
        let a = cache.insert(block(0x1000, 0x1000, 4, &[0x2000]));
        let b = cache.insert(block(0x2000, 0x2000, 4, &[]));
        cache.mark_linked(a, 0);

        // Range misses both blocks: nothing happens.
        assert!(cache.invalidate_range(0x3000, 0x4000).is_empty());
        assert_eq!(cache.find(LocationDescriptor(0x2000)), Some(b));

        // Invalidate b: a's linked edge must be severed.
        let unlink = cache.invalidate_range(0x2000, 0x2004);
        assert_eq!(unlink, vec![(a, 0)]);
        assert_eq!(cache.find(LocationDescriptor(0x2000)), None);
        assert_eq!(cache.find(LocationDescriptor(0x1000)), Some(a));
        assert!(!cache.get(a).links[0].linked);
    }

    #[test]
    fn invalidating_source_and_target_together_reports_neither() {
        let mut cache = BlockCache::new();
        let a = cache.insert(block(0x1000, 0x1000, 4, &[0x1004]));
        cache.insert(block(0x1004, 0x1004, 4, &[]));
        cache.mark_linked(a, 0);
        let unlink = cache.invalidate_range(0x1000, 0x1008);
        assert!(unlink.is_empty());
        assert_eq!(cache.find(LocationDescriptor(0x1000)), None);
        assert_eq!(cache.find(LocationDescriptor(0x1004)), None);
    }

    #[test]
    fn reinsert_after_invalidation_bumps_compile_count() {
        let mut cache = BlockCache::new();
        cache.insert(block(0x1000, 0x1000, 4, &[]));
        cache.invalidate_range(0x1000, 0x1004);
        cache.insert(block(0x1000, 0x1000, 4, &[]));
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    #[should_panic(expected = "already holds a live block")]
    fn duplicate_live_location_panics() {
        let mut cache = BlockCache::new();
        cache.insert(block(0x1000, 0x1000, 4, &[]));
        cache.insert(block(0x1000, 0x1000, 4, &[]));
    }
}
