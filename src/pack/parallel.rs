//! Parallel driver for the delta search.
//!
//! The candidate list is split into contiguous segments aligned to
//! name-hash boundaries, one worker per segment. Workers draw candidates
//! through a shared cursor; when one runs dry the driver steals half of the
//! busiest worker's remainder and hands it over, so long "paths" cannot
//! serialize the whole search.
//!
//! All worker bookkeeping (`start`/`end` cursors and the `working` flag)
//! lives behind a single progress mutex: the rebalancer must observe a
//! consistent snapshot, which individual atomics cannot give it. Each
//! worker additionally owns a tiny handoff monitor used to sleep between
//! assignments.
//!
//! Worker errors set a shared abort flag checked at the candidate draw, so
//! a failure drains the whole operation promptly; the first error is
//! retained and returned once every worker has been joined.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use log::debug;

use super::config::PackConfig;
use super::delta_search::{find_deltas, CacheBudget, DeltaResult, SearchCtx};
use super::errors::PackError;
use super::object_table::ObjectTable;
use super::store::ObjectStore;

/// Per-worker cursor into the candidate list.
///
/// `start` advances as candidates are drawn; `end` shrinks when the
/// rebalancer steals from the tail.
#[derive(Debug)]
struct WorkerSlot {
    start: usize,
    end: usize,
    working: bool,
}

/// Monitor over all worker cursors.
struct Progress {
    state: Mutex<Vec<WorkerSlot>>,
    cond: Condvar,
}

/// Per-worker handoff: `ready` is set before the signal and reset before
/// every wait, so a signal sent before the worker sleeps is never lost.
#[derive(Default)]
struct Handoff {
    ready: Mutex<bool>,
    cond: Condvar,
}

/// Runs the delta search over `list`, serially or across workers.
///
/// `workers == 0` autodetects the CPU count; `1` forces the caller thread.
pub(crate) fn run_delta_search<S: ObjectStore + Sync + ?Sized>(
    store: &S,
    config: &PackConfig,
    table: &ObjectTable,
    list: &[u32],
    workers: usize,
) -> Result<Vec<DeltaResult>, PackError> {
    let window = config.window + 1;
    let depth = config.depth;
    let cache = CacheBudget::new();
    let ctx = SearchCtx {
        store,
        config,
        cache: &cache,
    };

    let workers = resolve_worker_count(workers);
    let segments = if workers > 1 {
        partition_candidates(table, list, workers, window)
    } else {
        Vec::new()
    };

    if segments.len() <= 1 {
        let mut results = Vec::new();
        let mut pos = 0usize;
        find_deltas(
            &ctx,
            table,
            || {
                let item = list.get(pos).copied();
                pos += 1;
                item
            },
            window,
            depth,
            &mut results,
        )?;
        return Ok(results);
    }

    threaded_find_deltas(&ctx, table, list, segments, window, depth)
}

fn resolve_worker_count(workers: usize) -> usize {
    if workers != 0 {
        workers
    } else {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

/// Splits the candidate list into per-worker segments.
///
/// Segments shorter than twice the window find no deltas and fold into
/// their successor. Segment ends extend forward while the name hash
/// repeats, so one path never straddles two workers.
fn partition_candidates(
    table: &ObjectTable,
    list: &[u32],
    workers: usize,
    window: usize,
) -> Vec<Range<usize>> {
    let hash = |i: usize| table.get(list[i]).name_hash;
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut left = list.len();
    for i in 0..workers {
        let mut sub = left / (workers - i);
        if sub < 2 * window && i + 1 < workers {
            sub = 0;
        }
        while sub > 0 && sub < left && hash(start + sub) != 0 && hash(start + sub) == hash(start + sub - 1)
        {
            sub += 1;
        }
        if sub > 0 {
            segments.push(start..start + sub);
        }
        start += sub;
        left -= sub;
    }
    segments
}

fn threaded_find_deltas<S: ObjectStore + Sync + ?Sized>(
    ctx: &SearchCtx<'_, S>,
    table: &ObjectTable,
    list: &[u32],
    segments: Vec<Range<usize>>,
    window: usize,
    depth: u32,
) -> Result<Vec<DeltaResult>, PackError> {
    let n = segments.len();
    debug!("delta search: {n} workers over {} candidates", list.len());

    let progress = Progress {
        state: Mutex::new(
            segments
                .iter()
                .map(|r| WorkerSlot {
                    start: r.start,
                    end: r.end,
                    working: true,
                })
                .collect(),
        ),
        cond: Condvar::new(),
    };
    let handoffs: Vec<Handoff> = (0..n).map(|_| Handoff::default()).collect();
    let abort = AtomicBool::new(false);
    let first_err: Mutex<Option<PackError>> = Mutex::new(None);
    let mut all_results: Vec<DeltaResult> = Vec::new();

    thread::scope(|scope| {
        let mut handles: Vec<Option<thread::ScopedJoinHandle<'_, Vec<DeltaResult>>>> =
            Vec::with_capacity(n);
        for w in 0..n {
            let progress = &progress;
            let handoffs = &handoffs;
            let abort = &abort;
            let first_err = &first_err;
            let spawned = thread::Builder::new()
                .name(format!("delta-search-{w}"))
                .spawn_scoped(scope, move || {
                    worker_loop(
                        ctx,
                        table,
                        list,
                        w,
                        progress,
                        &handoffs[w],
                        abort,
                        first_err,
                        window,
                        depth,
                    )
                });
            match spawned {
                Ok(handle) => handles.push(Some(handle)),
                Err(err) => {
                    handles.push(None);
                    abort.store(true, Ordering::Relaxed);
                    first_err
                        .lock()
                        .expect("error mutex poisoned")
                        .get_or_insert(PackError::Thread(err));
                }
            }
        }

        // Each time a worker goes idle, steal half of the remainder of the
        // busiest worker and hand it over. When nothing is worth splitting
        // any more, hand the idle worker nothing and join it.
        let mut active = handles.iter().filter(|h| h.is_some()).count();
        while active > 0 {
            let (target, handed) = {
                let mut st = progress.state.lock().expect("progress mutex poisoned");
                let target = loop {
                    let idle = (0..n).find(|&w| handles[w].is_some() && !st[w].working);
                    match idle {
                        Some(w) => break w,
                        None => st = progress.cond.wait(st).expect("progress condvar poisoned"),
                    }
                };

                let mut victim: Option<usize> = None;
                for w in 0..n {
                    let rem = st[w].end - st[w].start;
                    if rem > 2 * window
                        && victim.map_or(true, |v| st[v].end - st[v].start < rem)
                    {
                        victim = Some(w);
                    }
                }

                let mut handed = 0usize;
                if let Some(v) = victim {
                    let rem = st[v].end - st[v].start;
                    let mut sub = rem / 2;
                    let mut split = st[v].end - sub;
                    let hash = |i: usize| table.get(list[i]).name_hash;
                    while sub > 0 && hash(split) != 0 && hash(split) == hash(split - 1) {
                        split += 1;
                        sub -= 1;
                    }
                    if sub == 0 {
                        // A single path can be so long that no hash
                        // boundary exists in the half; steal the exact
                        // half instead.
                        sub = rem / 2;
                        split = st[v].end - sub;
                    }
                    st[target].start = split;
                    st[target].end = st[v].end;
                    st[v].end = split;
                    handed = sub;
                    debug!("rebalanced {sub} candidates from worker {v} to worker {target}");
                } else {
                    st[target].start = 0;
                    st[target].end = 0;
                }
                st[target].working = true;
                (target, handed)
            };

            {
                let mut ready = handoffs[target].ready.lock().expect("handoff mutex poisoned");
                *ready = true;
                handoffs[target].cond.notify_one();
            }

            if handed == 0 {
                let handle = handles[target].take().expect("target is live");
                match handle.join() {
                    Ok(results) => all_results.extend(results),
                    Err(payload) => std::panic::resume_unwind(payload),
                }
                active -= 1;
            }
        }
    });

    match first_err.into_inner().expect("error mutex poisoned") {
        Some(err) => Err(err),
        None => Ok(all_results),
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop<S: ObjectStore + Sync + ?Sized>(
    ctx: &SearchCtx<'_, S>,
    table: &ObjectTable,
    list: &[u32],
    w: usize,
    progress: &Progress,
    handoff: &Handoff,
    abort: &AtomicBool,
    first_err: &Mutex<Option<PackError>>,
    window: usize,
    depth: u32,
) -> Vec<DeltaResult> {
    let mut results = Vec::new();
    loop {
        let has_work = {
            let st = progress.state.lock().expect("progress mutex poisoned");
            st[w].start < st[w].end
        };
        if !has_work {
            break;
        }

        let next = || {
            let mut st = progress.state.lock().expect("progress mutex poisoned");
            if abort.load(Ordering::Relaxed) {
                st[w].start = st[w].end;
                return None;
            }
            if st[w].start == st[w].end {
                return None;
            }
            let item = list[st[w].start];
            st[w].start += 1;
            Some(item)
        };
        if let Err(err) = find_deltas(ctx, table, next, window, depth, &mut results) {
            abort.store(true, Ordering::Relaxed);
            first_err
                .lock()
                .expect("error mutex poisoned")
                .get_or_insert(err);
            let mut st = progress.state.lock().expect("progress mutex poisoned");
            st[w].start = st[w].end;
        }

        {
            let mut st = progress.state.lock().expect("progress mutex poisoned");
            st[w].working = false;
            progress.cond.notify_one();
        }

        // The ready flag may already be set: it was initialized to false
        // before this worker spawned and is reset before every wait, so a
        // true here always means fresh work (or an empty final handoff).
        {
            let mut ready = handoff.ready.lock().expect("handoff mutex poisoned");
            while !*ready {
                ready = handoff.cond.wait(ready).expect("handoff condvar poisoned");
            }
            *ready = false;
        }
    }
    results
}
