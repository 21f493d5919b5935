//! Sliding-window delta search.
//!
//! For each candidate drawn from the sorted list, the previous `window`
//! candidates are tried as delta bases, most recent first, under a bounded
//! chain depth. Each window slot caches the candidate's decompressed
//! payload and a lazily built match-finding index; slot memory is bounded
//! by `pack.windowMemory` and chosen deltas by the global cache budget.
//!
//! Candidate results accumulate in a worker-local list and are committed to
//! the object table after the search phase completes, so the only
//! cross-worker state is the cache budget counter behind its mutex.
//!
//! # Invariants
//! - A slot's pending delta is committed before the slot can be evicted.
//! - The cache counter equals the summed size of live cached buffers at
//!   every release of the cache mutex.

use std::sync::{Mutex, MutexGuard};

use log::trace;

use super::config::PackConfig;
use super::delta::{create_delta, DeltaIndex};
use super::errors::PackError;
use super::object_table::{ObjectTable, PackedObject, NONE};
use super::store::ObjectStore;
use super::zlib;

/// Global budget counter for cached deltas.
///
/// The mutex is held only for size accounting; buffers are installed and
/// freed outside it to keep hold times short.
#[derive(Debug, Default)]
pub(crate) struct CacheBudget {
    used: Mutex<u64>,
}

impl CacheBudget {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.used.lock().expect("delta cache mutex poisoned")
    }

    #[cfg(test)]
    pub fn used(&self) -> u64 {
        *self.lock()
    }
}

/// Shared, read-only context for one search phase.
pub(crate) struct SearchCtx<'a, S: ?Sized> {
    pub store: &'a S,
    pub config: &'a PackConfig,
    pub cache: &'a CacheBudget,
}

/// A chosen delta, committed to the object table after workers join.
#[derive(Debug)]
pub(crate) struct DeltaResult {
    pub target: u32,
    pub base: u32,
    pub size: u64,
    /// Cached delta bytes (pre-compressed when `z_size > 0`).
    pub data: Option<Vec<u8>>,
    pub z_size: u64,
}

/// Delta chosen for the candidate currently under consideration.
#[derive(Debug)]
struct PendingDelta {
    base: u32,
    size: u64,
    data: Option<Vec<u8>>,
    z_size: u64,
}

/// One window slot: a recent candidate plus its cached search state.
#[derive(Debug)]
struct SlotEntry {
    ix: u32,
    depth: u32,
    data: Option<Vec<u8>>,
    index: Option<DeltaIndex>,
    pending: Option<PendingDelta>,
}

type Slot = Option<SlotEntry>;

enum TryOutcome {
    /// No further window slot can produce a delta; end the scan.
    Stop,
    /// This base does not improve the candidate; keep scanning.
    Skip,
    /// New best base accepted; later slots may still win.
    Accept,
}

/// Runs the windowed search over candidates produced by `next`.
///
/// `next` yields object-table indexes in candidate order; a shared cursor
/// behind it lets the parallel driver rebalance segments between calls.
/// Chosen deltas are appended to `results`.
pub(crate) fn find_deltas<S: ObjectStore + ?Sized>(
    ctx: &SearchCtx<'_, S>,
    table: &ObjectTable,
    mut next: impl FnMut() -> Option<u32>,
    window: usize,
    depth: u32,
    results: &mut Vec<DeltaResult>,
) -> Result<(), PackError> {
    let mut array: Vec<Slot> = Vec::new();
    array.resize_with(window, || None);
    let mut idx = 0usize;
    let mut count = 0usize;
    let mut mem_usage = 0u64;

    while let Some(po_ix) = next() {
        mem_usage -= free_slot(&mut array[idx]);
        array[idx] = Some(SlotEntry {
            ix: po_ix,
            depth: 0,
            data: None,
            index: None,
            pending: None,
        });

        // Trim the cold end of the window while over budget, always keeping
        // at least the current slot and one base.
        while ctx.config.window_memory_limit != 0
            && mem_usage > ctx.config.window_memory_limit
            && count > 1
        {
            let tail = (idx + window - count) % window;
            mem_usage -= free_slot(&mut array[tail]);
            count -= 1;
            trace!("window memory over budget, dropped slot {tail}");
        }

        // An object already serving as a delta base gets a reduced depth
        // budget so its existing descendants stay within the limit.
        let po = table.get(po_ix);
        let mut max_depth = i64::from(depth);
        if po.delta_child != NONE {
            max_depth -= i64::from(check_delta_limit(table, po_ix, 0));
            if max_depth <= 0 {
                idx = (idx + 1) % window;
                if count + 1 < window {
                    count += 1;
                }
                continue;
            }
        }
        let max_depth = max_depth as u32;

        let mut best_base: Option<usize> = None;
        for j in (1..window).rev() {
            let other = (idx + j) % window;
            if array[other].is_none() {
                break;
            }
            match try_delta(ctx, table, &mut array, idx, other, max_depth, &mut mem_usage)? {
                TryOutcome::Stop => break,
                TryOutcome::Skip => {}
                TryOutcome::Accept => best_base = Some(other),
            }
        }

        // Compress a cached delta immediately: the work lands in the
        // (possibly parallel) search phase and the smaller buffer stretches
        // the cache budget.
        {
            let entry = array[idx].as_mut().expect("current slot populated");
            if let Some(pending) = entry.pending.as_mut() {
                if let Some(raw) = pending.data.take() {
                    let z = zlib::deflate(&raw)?;
                    let z_size = z.len() as u64;
                    {
                        let mut used = ctx.cache.lock();
                        *used = *used - pending.size + z_size;
                    }
                    pending.z_size = z_size;
                    pending.data = Some(z);
                }
            }
        }

        let (became_delta, new_depth) = {
            let entry = array[idx].as_mut().expect("current slot populated");
            let depth_now = entry.depth;
            match entry.pending.take() {
                Some(p) => {
                    results.push(DeltaResult {
                        target: po_ix,
                        base: p.base,
                        size: p.size,
                        data: p.data,
                        z_size: p.z_size,
                    });
                    (true, depth_now)
                }
                None => (false, 0),
            }
        };

        // A fresh delta already at the depth budget cannot base anything
        // useful; leave the cursor so the next draw evicts it.
        if became_delta && new_depth >= max_depth {
            continue;
        }

        // Keep the winning base warm: rotate it to just behind the cursor
        // so it is the first slot tried for the next candidate.
        if became_delta {
            let best = best_base.expect("accepted delta records its base slot");
            let dist = (window + idx - best) % window;
            let swap = array[best].take();
            let mut dst = best;
            for _ in 0..dist {
                let src = (dst + 1) % window;
                let moved = array[src].take();
                array[dst] = moved;
                dst = src;
            }
            array[dst] = swap;
        }

        idx = (idx + 1) % window;
        if count + 1 < window {
            count += 1;
        }
    }

    Ok(())
}

/// Tries to delta the candidate in slot `n_idx` against the base in slot
/// `m_idx`.
fn try_delta<S: ObjectStore + ?Sized>(
    ctx: &SearchCtx<'_, S>,
    table: &ObjectTable,
    slots: &mut [Slot],
    n_idx: usize,
    m_idx: usize,
    max_depth: u32,
    mem_usage: &mut u64,
) -> Result<TryOutcome, PackError> {
    let (n_slot, m_slot) = pair_mut(slots, n_idx, m_idx);
    let n = n_slot.as_mut().expect("target slot populated");
    let m = m_slot.as_mut().expect("source slot populated");
    let trg = table.get(n.ix);
    let src = table.get(m.ix);

    // The candidate list is sorted by kind, so a mismatch means every older
    // slot mismatches too.
    if trg.kind != src.kind {
        return Ok(TryOutcome::Stop);
    }
    if m.depth >= max_depth {
        return Ok(TryOutcome::Stop);
    }

    // Size budget for an acceptable delta: half the target for a first
    // delta, the current delta size for a replacement, scaled by how much
    // chain headroom this base leaves.
    let trg_size = trg.size;
    let (max_size, ref_depth) = match &n.pending {
        None => ((trg_size / 2).saturating_sub(20), 1u32),
        Some(p) => (p.size, n.depth),
    };
    let max_size =
        max_size * u64::from(max_depth - m.depth) / u64::from(max_depth - ref_depth + 1);
    if max_size == 0 {
        return Ok(TryOutcome::Skip);
    }

    let src_size = src.size;
    let size_diff = trg_size.saturating_sub(src_size);
    if size_diff >= max_size {
        return Ok(TryOutcome::Skip);
    }
    if trg_size < src_size / 32 {
        return Ok(TryOutcome::Skip);
    }

    if n.data.is_none() {
        n.data = Some(load_payload(ctx.store, trg, mem_usage)?);
    }
    if m.data.is_none() {
        m.data = Some(load_payload(ctx.store, src, mem_usage)?);
    }
    if m.index.is_none() {
        match DeltaIndex::new(m.data.as_deref().expect("source payload loaded")) {
            Some(index) => {
                *mem_usage += index.size_bytes() as u64;
                m.index = Some(index);
            }
            // No usable index still yields a legal, merely less compact
            // pack.
            None => return Ok(TryOutcome::Skip),
        }
    }

    let delta = match create_delta(
        m.index.as_ref().expect("index built above"),
        m.data.as_deref().expect("source payload loaded"),
        n.data.as_deref().expect("target payload loaded"),
        max_size as usize,
    ) {
        Some(d) => d,
        None => return Ok(TryOutcome::Skip),
    };
    let delta_size = delta.len() as u64;

    if let Some(p) = &n.pending {
        if delta_size > p.size {
            return Ok(TryOutcome::Skip);
        }
        // A same-sized delta must buy a strictly shallower chain.
        if delta_size == p.size && m.depth + 1 >= n.depth {
            return Ok(TryOutcome::Skip);
        }
    }

    // Accounting happens under the cache mutex; the replaced buffer is
    // dropped and the new one installed after release.
    let (old_data, cache_new);
    {
        let mut used = ctx.cache.lock();
        old_data = match n.pending.as_mut() {
            Some(p) if p.data.is_some() => {
                *used -= cached_len(p);
                p.data.take()
            }
            _ => None,
        };
        cache_new = delta_cacheable(ctx.config, *used, src_size, trg_size, delta_size);
        if cache_new {
            *used += delta_size;
        }
    }
    drop(old_data);

    n.pending = Some(PendingDelta {
        base: m.ix,
        size: delta_size,
        data: cache_new.then_some(delta),
        z_size: 0,
    });
    n.depth = m.depth + 1;
    Ok(TryOutcome::Accept)
}

/// Maximum depth of the delta subtree rooted at `ix` (0 = the node itself).
pub(crate) fn check_delta_limit(table: &ObjectTable, ix: u32, n: u32) -> u32 {
    let mut deepest = n;
    let mut child = table.get(ix).delta_child;
    while child != NONE {
        deepest = deepest.max(check_delta_limit(table, child, n + 1));
        child = table.get(child).delta_sibling;
    }
    deepest
}

/// Cache admission: the budget must fit, and the delta must either be small
/// or buy back large objects.
fn delta_cacheable(
    config: &PackConfig,
    used: u64,
    src_size: u64,
    trg_size: u64,
    delta_size: u64,
) -> bool {
    if config.max_delta_cache_size != 0 && used + delta_size > config.max_delta_cache_size {
        return false;
    }
    if delta_size < config.cache_max_small_delta_size {
        return true;
    }
    (src_size >> 20) + (trg_size >> 21) > (delta_size >> 10)
}

fn cached_len(p: &PendingDelta) -> u64 {
    if p.z_size > 0 {
        p.z_size
    } else {
        p.size
    }
}

/// Reads a record's payload, verifying the stored size still matches.
fn load_payload<S: ObjectStore + ?Sized>(
    store: &S,
    record: &PackedObject,
    mem_usage: &mut u64,
) -> Result<Vec<u8>, PackError> {
    let obj = store.read(&record.id).map_err(PackError::Store)?;
    if obj.size() != record.size {
        return Err(PackError::ObjectSizeChanged {
            id: record.id,
            expected: record.size,
            actual: obj.size(),
        });
    }
    *mem_usage += record.size;
    Ok(obj.data)
}

/// Releases a slot's buffers, returning the bytes credited back.
fn free_slot(slot: &mut Slot) -> u64 {
    match slot.take() {
        None => 0,
        Some(entry) => {
            debug_assert!(entry.pending.is_none(), "evicting uncommitted delta");
            let mut freed = entry.data.map_or(0, |d| d.len() as u64);
            if let Some(index) = entry.index {
                freed += index.size_bytes() as u64;
            }
            freed
        }
    }
}

/// Mutably borrows two distinct slots.
fn pair_mut(slots: &mut [Slot], a: usize, b: usize) -> (&mut Slot, &mut Slot) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = slots.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = slots.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}
