//! Wait-for graph cycle search.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use super::{LockRank, ThreadRecord};

/// One blocked thread in a deadlock cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitEdge {
    /// The blocked thread.
    pub thread: String,
    /// The rank it is waiting for.
    pub waiting_for: LockRank,
    /// The thread holding that rank.
    pub held_by: String,
}

/// A cycle of threads each waiting for a lock held by the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockReport {
    /// The edges of the cycle; the last edge's `held_by` is the first edge's
    /// `thread`.
    pub cycle: Vec<WaitEdge>,
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deadlock cycle:")?;
        for edge in &self.cycle {
            write!(
                f,
                " [{} waits for rank {} held by {}]",
                edge.thread, edge.waiting_for, edge.held_by
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Returns the first cycle found in the wait-for graph of `threads`.
///
/// A thread waiting for rank `r` has an edge to every other thread that holds
/// `r`; shared read sides may have several holders.
pub(super) fn find_cycle(threads: &HashMap<usize, ThreadRecord>) -> Option<DeadlockReport> {
    let mut holders: HashMap<LockRank, Vec<usize>> = HashMap::new();
    for (&token, record) in threads {
        for &rank in &record.held {
            holders.entry(rank).or_default().push(token);
        }
    }

    let successors = |token: usize| -> Vec<usize> {
        threads[&token]
            .waiting_for
            .and_then(|rank| holders.get(&rank))
            .map(|owners| owners.iter().copied().filter(|owner| *owner != token).collect())
            .unwrap_or_default()
    };

    let mut starts: Vec<usize> = threads
        .iter()
        .filter(|(_, record)| record.waiting_for.is_some())
        .map(|(&token, _)| token)
        .collect();
    starts.sort_unstable();

    let mut marks: HashMap<usize, Mark> = HashMap::new();
    for start in starts {
        if marks.contains_key(&start) {
            continue;
        }
        // Iterative DFS; `path` holds the current chain of threads.
        let mut path = vec![start];
        let mut pending = vec![successors(start)];
        marks.insert(start, Mark::OnPath);

        while let Some(next) = pending.last_mut() {
            let Some(successor) = next.pop() else {
                if let Some(done) = path.pop() {
                    marks.insert(done, Mark::Done);
                }
                pending.pop();
                continue;
            };
            match marks.get(&successor) {
                Some(Mark::OnPath) => {
                    let from = path.iter().position(|token| *token == successor)?;
                    return Some(report(threads, &path[from..]));
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(successor, Mark::OnPath);
                    path.push(successor);
                    pending.push(successors(successor));
                }
            }
        }
    }
    None
}

fn report(threads: &HashMap<usize, ThreadRecord>, cycle: &[usize]) -> DeadlockReport {
    let edges = cycle
        .iter()
        .enumerate()
        .filter_map(|(i, token)| {
            let record = &threads[token];
            let holder = &threads[&cycle[(i + 1) % cycle.len()]];
            Some(WaitEdge {
                thread: record.label.clone(),
                waiting_for: record.waiting_for?,
                held_by: holder.label.clone(),
            })
        })
        .collect();
    DeadlockReport { cycle: edges }
}
