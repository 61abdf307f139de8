//! Block-allocated descriptor sets with recycling.
//!
//! Descriptor sets are allocated out of fixed-capacity blocks (one Vulkan
//! descriptor pool each) and looked up by composed key in three tiers:
//! the pool-wide `immutable` table, a per-subordinate `mutable` table and
//! the `recycled` table. A subordinate ([`PoolSub`]) is an explicit writer
//! capability one recording thread holds; its table and its claimed block
//! are touched by no one else until a flush point.
//!
//! `get` may run concurrently with itself (different subordinates);
//! `flush`, `recycle` and `reset` require exclusive access to the pool and
//! every subordinate, which the renderer guarantees by stalling all frames.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use ash::vk::{self, Handle};
use parking_lot::{Mutex, RwLock};

use crate::{
    cache::{CacheElem, UpdateData},
    hash::{HashKey, MurmurBuildHasher},
    vulkan::DeviceShared,
    RenderError, RenderResult,
};

/// Set keys start with the set-layout element id; recycled entries are
/// re-keyed by that prefix alone so any structurally compatible composition
/// of bindings can claim them.
pub(crate) const RECYCLE_KEY_LEN: usize = 8;

const BLOCK_MAX_SETS: u32 = 1000;
const BLOCK_DESCRIPTORS_PER_TYPE: u32 = 1000;

/// The device calls the pool makes, as a seam so the bookkeeping can be
/// exercised without a live device.
pub(crate) trait PoolDevice: Send + Sync {
    fn create_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo,
    ) -> Result<vk::DescriptorPool, vk::Result>;
    fn destroy_pool(&self, pool: vk::DescriptorPool);
    fn allocate_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result>;
    fn update_set(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        data: *const std::ffi::c_void,
    );
    fn reset_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result>;
}

impl PoolDevice for DeviceShared {
    fn create_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        unsafe { self.raw.create_descriptor_pool(info, None) }
    }

    fn destroy_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.raw.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe {
            self.raw
                .allocate_descriptor_sets(&allocate_info)
                .map(|sets| sets[0])
        }
    }

    fn update_set(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        data: *const std::ffi::c_void,
    ) {
        unsafe {
            self.raw.update_descriptor_set_with_template(set, template, data);
        }
    }

    fn reset_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result> {
        unsafe {
            self.raw
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }
}

/// One fixed-capacity Vulkan descriptor pool.
struct PoolBlock {
    raw: vk::DescriptorPool,
    /// Live (unrecycled) sets allocated from this block. Any thread may
    /// decrement through recycling, so it must be atomic.
    sets: AtomicU32,
    full: AtomicBool,
}

/// A handle to one allocated descriptor set plus the block it came from.
pub struct PoolElem {
    pub(crate) set: vk::DescriptorSet,
    block: Arc<PoolBlock>,
    flushes: AtomicU32,
}

impl PoolElem {
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    #[cfg(test)]
    pub(crate) fn block_live_sets(&self) -> u32 {
        self.block.sets.load(Ordering::Acquire)
    }
}

type Table = std::collections::HashMap<HashKey, Vec<Arc<PoolElem>>, MurmurBuildHasher>;

/// Per-thread writer capability of a [`DescriptorPool`].
#[derive(Default)]
pub struct PoolSub {
    mutable: Table,
    block: Option<Arc<PoolBlock>>,
}

struct BlockLists {
    free: Vec<Arc<PoolBlock>>,
    full: Vec<Arc<PoolBlock>>,
}

pub struct DescriptorPool {
    device: Arc<dyn PoolDevice>,

    /// Flush count after which an untouched set is recycled.
    flushes: u32,

    immutable: RwLock<Table>,
    recycled: Mutex<Table>,
    blocks: Mutex<BlockLists>,
}

impl DescriptorPool {
    pub fn new(device: Arc<DeviceShared>, flushes: u32) -> Self {
        Self::with_device(device, flushes)
    }

    fn with_device(device: Arc<dyn PoolDevice>, flushes: u32) -> Self {
        Self {
            device,
            flushes,
            immutable: RwLock::new(Table::default()),
            recycled: Mutex::new(Table::default()),
            blocks: Mutex::new(BlockLists {
                free: Vec::new(),
                full: Vec::new(),
            }),
        }
    }

    fn alloc_block(&self) -> RenderResult<Arc<PoolBlock>> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = [
            vk::DescriptorType::SAMPLER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            vk::DescriptorType::INPUT_ATTACHMENT,
        ]
        .into_iter()
        .map(|ty| {
            vk::DescriptorPoolSize::default()
                .ty(ty)
                .descriptor_count(BLOCK_DESCRIPTORS_PER_TYPE)
        })
        .collect();

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(BLOCK_MAX_SETS)
            .pool_sizes(&pool_sizes);

        let raw = self.device.create_pool(&create_info).map_err(|result| {
            log::error!("Could not allocate a new Vulkan descriptor pool: {}", result);
            RenderError::from_vk(result)
        })?;

        Ok(Arc::new(PoolBlock {
            raw,
            sets: AtomicU32::new(0),
            full: AtomicBool::new(false),
        }))
    }

    fn free_block(&self, block: &PoolBlock) {
        // Destroying the descriptor pool frees all its sets for us.
        self.device.destroy_pool(block.raw);
    }

    /// Returns every subordinate's allocating block to the free list.
    /// Inserted at the front so hot blocks keep being used instead of
    /// dispersing allocations over all available blocks.
    fn unclaim_blocks(&self, subs: &mut [PoolSub]) {
        let mut blocks = self.blocks.lock();
        for sub in subs {
            if let Some(block) = sub.block.take() {
                blocks.free.insert(0, block);
            }
        }
    }

    /// Moves one element into the recycled table, re-keyed by its layout
    /// prefix. Destroys its block once the last live set is recycled.
    /// No subordinate may hold an allocating block.
    fn recycle_elem(&self, full_key: &HashKey, elem: Arc<PoolElem>) {
        let block = elem.block.clone();

        let recycle_key = full_key.prefix(RECYCLE_KEY_LEN);
        self.recycled
            .lock()
            .entry(recycle_key)
            .or_default()
            .push(elem);

        if block.sets.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Fully recycled: every remaining element of this block sits in
            // the recycled table. Drop them and the block itself.
            let mut recycled = self.recycled.lock();
            for vec in recycled.values_mut() {
                vec.retain(|elem| !Arc::ptr_eq(&elem.block, &block));
            }
            recycled.retain(|_, vec| !vec.is_empty());
            drop(recycled);

            let mut blocks = self.blocks.lock();
            blocks.free.retain(|candidate| !Arc::ptr_eq(candidate, &block));
            blocks.full.retain(|candidate| !Arc::ptr_eq(candidate, &block));
            drop(blocks);

            self.free_block(&block);
        }
    }

    /// Looks up or allocates a descriptor set.
    ///
    /// `key` must start with the set-layout element id; `update` holds one
    /// slot per descriptor, applied through the layout's update template.
    /// Exhausted block or pool memory surfaces as
    /// [`RenderError::OutOfMemory`].
    pub fn get(
        &self,
        sub: &mut PoolSub,
        set_layout: &Arc<CacheElem>,
        key: &HashKey,
        update: &[UpdateData],
    ) -> RenderResult<Arc<PoolElem>> {
        // The immutable table first: elements are always flushed into it,
        // so after one frame this is where everything lives.
        if let Some(elem) = self.immutable.read().get(key).and_then(|vec| vec.first()) {
            elem.flushes.store(0, Ordering::Relaxed);
            return Ok(elem.clone());
        }

        if let Some(elem) = sub.mutable.get(key).and_then(|vec| vec.first()) {
            elem.flushes.store(0, Ordering::Relaxed);
            return Ok(elem.clone());
        }

        // A recycled set with a compatible layout can be claimed and
        // re-keyed into this subordinate.
        let recycle_key = key.prefix(RECYCLE_KEY_LEN);
        let reclaimed = {
            let mut recycled = self.recycled.lock();
            let elem = recycled.get_mut(&recycle_key).and_then(|vec| vec.pop());
            recycled.retain(|_, vec| !vec.is_empty());
            elem
        };

        let elem = match reclaimed {
            Some(elem) => elem,
            None => self.allocate_elem(sub, set_layout)?,
        };

        elem.block.sets.fetch_add(1, Ordering::AcqRel);

        let template = set_layout.update_template();
        if !template.is_null() && !update.is_empty() {
            self.device
                .update_set(elem.set, template, update.as_ptr().cast());
        }

        elem.flushes.store(0, Ordering::Relaxed);
        sub.mutable
            .entry(key.clone())
            .or_default()
            .push(elem.clone());

        Ok(elem)
    }

    fn allocate_elem(
        &self,
        sub: &mut PoolSub,
        set_layout: &Arc<CacheElem>,
    ) -> RenderResult<Arc<PoolElem>> {
        loop {
            // Claim an allocating block: the free list first, a fresh block
            // otherwise. Once claimed, nothing but this subordinate touches
            // it (except the atomic set count).
            if sub.block.is_none() {
                sub.block = self.blocks.lock().free.pop();
                if let Some(block) = &sub.block {
                    debug_assert!(!block.full.load(Ordering::Relaxed));
                }

                if sub.block.is_none() {
                    sub.block = Some(self.alloc_block()?);
                }
            }

            let block = sub.block.as_ref().unwrap().clone();

            match self.device.allocate_set(block.raw, set_layout.set_layout()) {
                Ok(set) => {
                    return Ok(Arc::new(PoolElem {
                        set,
                        block,
                        flushes: AtomicU32::new(0),
                    }));
                }
                Err(vk::Result::ERROR_FRAGMENTED_POOL)
                | Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => {
                    // This block is spent; retire it and try another.
                    block.full.store(true, Ordering::Relaxed);
                    self.blocks.lock().full.push(block);
                    sub.block = None;
                }
                Err(result) => {
                    log::error!("Could not allocate a Vulkan descriptor set: {}", result);
                    return Err(RenderError::from_vk(result));
                }
            }
        }
    }

    /// Flags every element matching `key` for reuse, across the immutable
    /// table and all subordinates. Requires exclusive access.
    pub fn recycle(&self, subs: &mut [PoolSub], key: &HashKey) {
        self.unclaim_blocks(subs);

        for sub in subs.iter_mut() {
            if let Some(vec) = sub.mutable.remove(key) {
                for elem in vec {
                    self.recycle_elem(key, elem);
                }
            }
        }

        let from_immutable = self.immutable.write().remove(key);
        if let Some(vec) = from_immutable {
            for elem in vec {
                self.recycle_elem(key, elem);
            }
        }
    }

    /// Merges every subordinate's table into the immutable one, then
    /// recycles any element whose flush counter reached the threshold.
    /// Requires exclusive access; called once per frame after submission.
    pub fn flush(&self, subs: &mut [PoolSub]) {
        self.unclaim_blocks(subs);

        let mut immutable = self.immutable.write();
        for sub in subs.iter_mut() {
            for (key, mut vec) in sub.mutable.drain() {
                immutable.entry(key).or_default().append(&mut vec);
            }
        }

        // Count a flush on everything; sets untouched for `flushes` frames
        // get recycled so their descriptors can be reused.
        let mut expired: Vec<(HashKey, Arc<PoolElem>)> = Vec::new();
        for (key, vec) in immutable.iter_mut() {
            vec.retain(|elem| {
                if elem.flushes.fetch_add(1, Ordering::Relaxed) + 1 >= self.flushes {
                    expired.push((key.clone(), elem.clone()));
                    false
                } else {
                    true
                }
            });
        }
        immutable.retain(|_, vec| !vec.is_empty());
        drop(immutable);

        for (key, elem) in expired {
            self.recycle_elem(&key, elem);
        }
    }

    /// Wipes every table and resets every block's Vulkan pool. Used when a
    /// referenceable attachment is resized; requires all frames stalled.
    pub fn reset(&self, subs: &mut [PoolSub]) {
        self.unclaim_blocks(subs);

        self.immutable.write().clear();
        self.recycled.lock().clear();
        for sub in subs.iter_mut() {
            sub.mutable.clear();
        }

        let mut blocks = self.blocks.lock();
        let full = std::mem::take(&mut blocks.full);
        for block in full {
            block.full.store(false, Ordering::Relaxed);
            blocks.free.push(block);
        }

        for block in &blocks.free {
            block.sets.store(0, Ordering::Relaxed);
            if let Err(result) = self.device.reset_pool(block.raw) {
                log::error!("Could not reset a Vulkan descriptor pool: {}", result);
            }
        }
    }

    /// Retires a subordinate, making its sets visible pool-wide.
    pub fn unsub(&self, subs: &mut [PoolSub], retired: usize) {
        self.unclaim_blocks(subs);

        let mut table = std::mem::take(&mut subs[retired].mutable);
        let mut immutable = self.immutable.write();
        for (key, mut vec) in table.drain() {
            immutable.entry(key).or_default().append(&mut vec);
        }
    }

    /// Destroys all blocks. The caller must have synchronized all GPU work.
    pub fn clear(&self, subs: &mut [PoolSub]) {
        self.clear_tables_and_blocks(subs);
    }

    fn clear_tables_and_blocks(&self, subs: &mut [PoolSub]) {
        self.immutable.write().clear();
        self.recycled.lock().clear();
        for sub in subs.iter_mut() {
            sub.mutable.clear();
            if let Some(block) = sub.block.take() {
                self.free_block(&block);
            }
        }

        let mut blocks = self.blocks.lock();
        for block in blocks.free.drain(..) {
            self.free_block(&block);
        }
        for block in blocks.full.drain(..) {
            self.free_block(&block);
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.clear_tables_and_blocks(&mut []);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::cache::test_set_layout_elem;
    use crate::hash::HashBuilder;

    /// Counts device traffic and hands out unique fake handles; a pool
    /// runs out after `max_sets_per_pool` allocations.
    struct MockDevice {
        max_sets_per_pool: u32,
        created: AtomicU64,
        destroyed: AtomicU64,
        allocated: AtomicU64,
        resets: AtomicU64,
        live_per_pool: Mutex<HashMap<u64, u32>>,
    }

    impl MockDevice {
        fn new(max_sets_per_pool: u32) -> Arc<Self> {
            Arc::new(Self {
                max_sets_per_pool,
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
                resets: AtomicU64::new(0),
                live_per_pool: Mutex::new(HashMap::new()),
            })
        }

        fn counts(&self) -> (u64, u64, u64) {
            (
                self.created.load(Ordering::Relaxed),
                self.destroyed.load(Ordering::Relaxed),
                self.allocated.load(Ordering::Relaxed),
            )
        }
    }

    impl PoolDevice for MockDevice {
        fn create_pool(
            &self,
            _info: &vk::DescriptorPoolCreateInfo,
        ) -> Result<vk::DescriptorPool, vk::Result> {
            let id = self.created.fetch_add(1, Ordering::Relaxed) + 1;
            self.live_per_pool.lock().insert(id, 0);
            Ok(vk::DescriptorPool::from_raw(id))
        }

        fn destroy_pool(&self, pool: vk::DescriptorPool) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            self.live_per_pool.lock().remove(&pool.as_raw());
        }

        fn allocate_set(
            &self,
            pool: vk::DescriptorPool,
            _layout: vk::DescriptorSetLayout,
        ) -> Result<vk::DescriptorSet, vk::Result> {
            let mut live = self.live_per_pool.lock();
            let count = live.entry(pool.as_raw()).or_insert(0);
            if *count >= self.max_sets_per_pool {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }
            *count += 1;

            let id = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(vk::DescriptorSet::from_raw(id))
        }

        fn update_set(
            &self,
            _set: vk::DescriptorSet,
            _template: vk::DescriptorUpdateTemplate,
            _data: *const std::ffi::c_void,
        ) {
        }

        fn reset_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result> {
            self.resets.fetch_add(1, Ordering::Relaxed);
            self.live_per_pool.lock().insert(pool.as_raw(), 0);
            Ok(())
        }
    }

    fn pool_with(max_sets_per_pool: u32, flushes: u32) -> (DescriptorPool, Arc<MockDevice>) {
        let device = MockDevice::new(max_sets_per_pool);
        let pool = DescriptorPool::with_device(device.clone(), flushes);
        (pool, device)
    }

    fn set_key(layout: &Arc<CacheElem>, tail: u64) -> HashKey {
        let mut builder = HashBuilder::new();
        builder.push_handle(layout.id());
        builder.push_u64(tail);
        builder.finish()
    }

    #[test]
    fn get_allocates_once_per_key() {
        let (pool, device) = pool_with(16, 4);
        let layout = test_set_layout_elem();
        let mut sub = PoolSub::default();
        let key = set_key(&layout, 1);

        let first = pool.get(&mut sub, &layout, &key, &[]).unwrap();
        let second = pool.get(&mut sub, &layout, &key, &[]).unwrap();

        assert_eq!(first.set(), second.set());
        assert_eq!(device.counts(), (1, 0, 1));
    }

    #[test]
    fn recycled_set_is_reused_and_live_count_unchanged() {
        let (pool, device) = pool_with(16, 4);
        let layout = test_set_layout_elem();
        let mut sub = PoolSub::default();

        // Two sets of the same layout, different resources.
        let first = pool.get(&mut sub, &layout, &set_key(&layout, 1), &[]).unwrap();
        let second = pool.get(&mut sub, &layout, &set_key(&layout, 2), &[]).unwrap();
        let reused_handle = first.set();
        assert_eq!(second.block_live_sets(), 2);

        pool.recycle(std::slice::from_mut(&mut sub), &set_key(&layout, 1));
        assert_eq!(second.block_live_sets(), 1);

        // A structurally compatible new composition claims the recycled
        // set; no new allocation, live count back where it was.
        let third = pool.get(&mut sub, &layout, &set_key(&layout, 3), &[]).unwrap();
        assert_eq!(third.set(), reused_handle);
        assert_eq!(third.block_live_sets(), 2);
        assert_eq!(device.counts(), (1, 0, 2));
    }

    #[test]
    fn spent_block_is_retired_and_replaced() {
        let (pool, device) = pool_with(1, 4);
        let layout = test_set_layout_elem();
        let mut sub = PoolSub::default();

        let first = pool.get(&mut sub, &layout, &set_key(&layout, 1), &[]).unwrap();
        let second = pool.get(&mut sub, &layout, &set_key(&layout, 2), &[]).unwrap();

        assert_ne!(first.set(), second.set());
        // The first block filled up, a second one was made.
        assert_eq!(device.counts(), (2, 0, 2));
    }

    #[test]
    fn fully_recycled_block_is_destroyed() {
        let (pool, device) = pool_with(16, 4);
        let layout = test_set_layout_elem();
        let mut sub = PoolSub::default();

        pool.get(&mut sub, &layout, &set_key(&layout, 1), &[]).unwrap();
        pool.recycle(std::slice::from_mut(&mut sub), &set_key(&layout, 1));

        // The only live set was recycled, taking the block with it.
        assert_eq!(device.counts(), (1, 1, 1));

        // Nothing reusable remains; the next get starts a fresh block.
        pool.get(&mut sub, &layout, &set_key(&layout, 2), &[]).unwrap();
        assert_eq!(device.counts(), (2, 1, 2));
    }

    #[test]
    fn unsub_promotes_sets_to_immutable() {
        let (pool, device) = pool_with(16, 4);
        let layout = test_set_layout_elem();
        let mut subs = vec![PoolSub::default(), PoolSub::default()];
        let key = set_key(&layout, 1);

        let handle = {
            let (first, _) = subs.split_at_mut(1);
            pool.get(&mut first[0], &layout, &key, &[]).unwrap().set()
        };

        pool.unsub(&mut subs, 0);

        // Another subordinate now finds the set without allocating.
        let (_, second) = subs.split_at_mut(1);
        let found = pool.get(&mut second[0], &layout, &key, &[]).unwrap();
        assert_eq!(found.set(), handle);
        assert_eq!(device.counts(), (1, 0, 1));
    }

    #[test]
    fn flush_recycles_after_threshold() {
        let (pool, device) = pool_with(16, 2);
        let layout = test_set_layout_elem();
        let mut subs = vec![PoolSub::default()];

        let stale_handle = pool
            .get(&mut subs[0], &layout, &set_key(&layout, 1), &[])
            .unwrap()
            .set();
        pool.get(&mut subs[0], &layout, &set_key(&layout, 2), &[])
            .unwrap();

        // The second set is touched between flushes and survives; the
        // first goes untouched for two flushes and gets recycled.
        pool.flush(&mut subs);
        pool.get(&mut subs[0], &layout, &set_key(&layout, 2), &[])
            .unwrap();
        pool.flush(&mut subs);

        let reused = pool
            .get(&mut subs[0], &layout, &set_key(&layout, 3), &[])
            .unwrap();
        assert_eq!(reused.set(), stale_handle);
        assert_eq!(device.counts(), (1, 0, 2));
    }

    #[test]
    fn get_between_flushes_keeps_a_set_live() {
        let (pool, device) = pool_with(16, 2);
        let layout = test_set_layout_elem();
        let mut subs = vec![PoolSub::default()];
        let key = set_key(&layout, 1);

        pool.get(&mut subs[0], &layout, &key, &[]).unwrap();
        pool.flush(&mut subs);
        // Touched again: the counter resets, the next flush spares it.
        pool.get(&mut subs[0], &layout, &key, &[]).unwrap();
        pool.flush(&mut subs);

        let found = pool.get(&mut subs[0], &layout, &key, &[]).unwrap();
        assert_eq!(found.block_live_sets(), 1);
        assert_eq!(device.counts(), (1, 0, 1));
    }

    #[test]
    fn reset_clears_tables_and_reuses_blocks() {
        let (pool, device) = pool_with(16, 4);
        let layout = test_set_layout_elem();
        let mut subs = vec![PoolSub::default()];
        let key = set_key(&layout, 1);

        pool.get(&mut subs[0], &layout, &key, &[]).unwrap();
        pool.reset(&mut subs);
        assert_eq!(device.resets.load(Ordering::Relaxed), 1);

        // The key is gone; a new set is allocated from the same block.
        pool.get(&mut subs[0], &layout, &key, &[]).unwrap();
        let (created, destroyed, allocated) = device.counts();
        assert_eq!((created, destroyed), (1, 0));
        assert_eq!(allocated, 2);
    }
}
