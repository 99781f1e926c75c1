//! Load balancing plan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Move `count` tasks from thread `from` to thread `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transfer {
    pub from: usize,
    pub to: usize,
    pub count: usize,
}

/// Plan steals for the given run-queue depths.
///
/// Nothing moves unless some thread has an empty queue and the average
/// depth is at least one. Threads above the average give up their surplus,
/// one task at a time, to whichever below-average thread is currently the
/// least loaded. Surplus nobody needs stays where it is.
pub(crate) fn plan(depths: &[usize]) -> Vec<Transfer> {
    if depths.len() < 2 || !depths.contains(&0) {
        return Vec::new();
    }
    let total: usize = depths.iter().sum();
    let avg = total / depths.len();
    if avg == 0 {
        return Vec::new();
    }

    let mut targets: BinaryHeap<Reverse<(usize, usize)>> = depths
        .iter()
        .enumerate()
        .filter(|&(_, &depth)| depth < avg)
        .map(|(thread, &depth)| Reverse((depth, thread)))
        .collect();

    let mut moves: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    'donors: for (from, &depth) in depths.iter().enumerate() {
        for _ in avg..depth {
            let Some(Reverse((load, to))) = targets.pop() else {
                break 'donors;
            };
            *moves.entry((from, to)).or_default() += 1;
            if load + 1 < avg {
                targets.push(Reverse((load + 1, to)));
            }
        }
    }

    moves
        .into_iter()
        .map(|((from, to), count)| Transfer { from, to, count })
        .collect()
}
