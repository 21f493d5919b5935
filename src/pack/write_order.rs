//! Write-order planning over the delta forest.
//!
//! Computes the permutation in which objects are emitted: every delta's
//! base precedes it, and related objects stay close. The order is built in
//! phases over the original insertion order:
//! 1. leading objects up to the first tagged one,
//! 2. all tagged objects,
//! 3. remaining commits and tags,
//! 4. remaining trees,
//! 5. everything left, visited family by family — each delta root followed
//!    by its descendants depth-first, siblings in recency order.
//!
//! The forest is re-linked on every call: iterating records in reverse
//! insertion order and prepending each delta to its base's child list makes
//! sibling order equal original recency order going forward.

use super::errors::PackError;
use super::object_id::ObjectKind;
use super::object_table::{ObjectTable, NONE};
use super::store::ObjectStore;

/// Computes the emit permutation for the current delta graph.
///
/// Resets and repopulates all planner scratch; callable repeatedly.
pub(crate) fn compute_write_order<S: ObjectStore + ?Sized>(
    table: &mut ObjectTable,
    store: &S,
) -> Result<Vec<u32>, PackError> {
    let n = table.len();

    for po in table.iter_mut() {
        po.tagged = false;
        po.filled = false;
        po.delta_child = NONE;
        po.delta_sibling = NONE;
    }

    // Fully connect the child/sibling forest. Reverse order keeps each
    // sibling list in original recency order.
    for ix in (0..n).rev() {
        let base = table.get(ix).delta_base;
        if base == NONE {
            continue;
        }
        table.get_mut(ix).delta_sibling = table.get(base).delta_child;
        table.get_mut(base).delta_child = ix;
    }

    // Mark objects at the tip of tag refs.
    let mut tagged_tips = Vec::new();
    store
        .for_each_tag(&mut |id| {
            if let Some(ix) = table.lookup(id) {
                tagged_tips.push(ix);
            }
        })
        .map_err(PackError::Store)?;
    for ix in tagged_tips {
        table.get_mut(ix).tagged = true;
    }

    let mut order = Vec::with_capacity(n as usize);

    // Original recency order until the first tagged tip.
    let mut i = 0;
    while i < n && !table.get(i).tagged {
        add_to_write_order(table, &mut order, i);
        i += 1;
    }
    let last_untagged = i;

    // All the tagged tips.
    for ix in last_untagged..n {
        if table.get(ix).tagged {
            add_to_write_order(table, &mut order, ix);
        }
    }

    // The remaining commits and tags.
    for ix in last_untagged..n {
        let kind = table.get(ix).kind;
        if matches!(kind, ObjectKind::Commit | ObjectKind::Tag) {
            add_to_write_order(table, &mut order, ix);
        }
    }

    // The trees.
    for ix in last_untagged..n {
        if table.get(ix).kind == ObjectKind::Tree {
            add_to_write_order(table, &mut order, ix);
        }
    }

    // Everything else in really tight order.
    for ix in last_untagged..n {
        if !table.get(ix).filled {
            add_family_to_write_order(table, &mut order, ix);
        }
    }

    if order.len() as u32 != n {
        return Err(PackError::InvalidWriteOrder {
            planned: order.len() as u32,
            total: n,
        });
    }
    Ok(order)
}

fn add_to_write_order(table: &mut ObjectTable, order: &mut Vec<u32>, ix: u32) {
    let po = table.get_mut(ix);
    if po.filled {
        return;
    }
    po.filled = true;
    order.push(ix);
}

/// Adds a whole delta family, starting from its root.
fn add_family_to_write_order(table: &mut ObjectTable, order: &mut Vec<u32>, ix: u32) {
    let mut root = ix;
    loop {
        let base = table.get(root).delta_base;
        if base == NONE {
            break;
        }
        root = base;
    }
    add_descendants_to_write_order(table, order, root);
}

/// Depth-first walk of a delta subtree: each node, then its siblings, then
/// down into the first child; backtracks through bases when a level is
/// exhausted.
fn add_descendants_to_write_order(table: &mut ObjectTable, order: &mut Vec<u32>, start: u32) {
    let mut ix = start;
    let mut add = true;
    loop {
        if add {
            add_to_write_order(table, order, ix);
            let mut sibling = table.get(ix).delta_sibling;
            while sibling != NONE {
                add_to_write_order(table, order, sibling);
                sibling = table.get(sibling).delta_sibling;
            }
        }

        let child = table.get(ix).delta_child;
        if child != NONE {
            add = true;
            ix = child;
            continue;
        }

        add = false;
        let sibling = table.get(ix).delta_sibling;
        if sibling != NONE {
            // Our sibling might have children; it is next.
            ix = sibling;
            continue;
        }

        // Climb until an ancestor has an unvisited sibling.
        let mut up = table.get(ix).delta_base;
        while up != NONE && table.get(up).delta_sibling == NONE {
            up = table.get(up).delta_base;
        }
        if up == NONE {
            // Back at the original root.
            return;
        }
        ix = table.get(up).delta_sibling;
    }
}
