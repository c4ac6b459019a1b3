use std::collections::VecDeque;

use tracing::{debug, info};

use crate::input::{TailEvent, TailSource, TraceStore};
use crate::merge::{Merger, Refinement};

/// Streaming state-merging: consumes traces from a source in batches.
///
/// Per batch the previous batch's refinement list is replayed — every
/// refinement is structurally re-checked and re-tested for consistency
/// against the grown trie, with structurally invalid ones re-queued behind
/// fresh refinements in case later merges make them viable again. After the
/// batch reaches a fixed point everything is rolled back, so the next batch
/// appends to a raw trie. At end of input the final refinement list stays
/// applied and is returned.
pub fn stream_run(
    merger: &mut Merger,
    store: &mut TraceStore,
    source: &mut dyn TailSource,
) -> Vec<Refinement> {
    let batch_size = merger.config().batch_size.max(1);
    let mut current: Vec<Refinement> = Vec::new();
    let mut batch_number = 0usize;

    loop {
        let mut read = 0;
        let mut exhausted = false;
        while read < batch_size {
            match read_one_trace(source, store) {
                Some(trace) => {
                    merger.add_trace(&trace);
                    read += 1;
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        batch_number += 1;
        debug!(batch = batch_number, traces = read, "batch read");

        let next = run_batch(merger, std::mem::take(&mut current));

        if exhausted {
            info!(
                batches = batch_number,
                refinements = next.len(),
                "stream ended, keeping the final hypothesis applied"
            );
            return next;
        }

        // roll everything back so the next batch extends the raw trie
        let mut next = next;
        for refinement in next.iter_mut().rev() {
            merger.undo(refinement);
        }
        current = next;
    }
}

/// Replays the previous refinement list and extends it with fresh best
/// refinements until a fixed point; leaves everything applied.
fn run_batch(merger: &mut Merger, previous: Vec<Refinement>) -> Vec<Refinement> {
    let mut next: Vec<Refinement> = Vec::new();
    let mut failed: VecDeque<Refinement> = VecDeque::new();

    for refinement in previous {
        if merger.structurally_valid(&refinement) {
            if let Some(mut fresh) = merger.retest(&refinement) {
                merger.doref(&mut fresh);
                next.push(fresh);
            }
            // re-tested and found inconsistent on the grown trie: dropped
            merger.erase(refinement);
        } else {
            failed.push_back(refinement);
        }
    }

    while let Some(mut best) = merger.best_refinement() {
        merger.doref(&mut best);
        next.push(best);

        // a fresh merge may have restored the structure an earlier
        // refinement relied on
        let mut still_failed = VecDeque::new();
        while let Some(refinement) = failed.pop_front() {
            if merger.structurally_valid(&refinement) {
                if let Some(mut fresh) = merger.retest(&refinement) {
                    merger.doref(&mut fresh);
                    next.push(fresh);
                }
                merger.erase(refinement);
            } else {
                still_failed.push_back(refinement);
            }
        }
        failed = still_failed;
    }

    next
}

fn read_one_trace(
    source: &mut dyn TailSource,
    store: &mut TraceStore,
) -> Option<std::rc::Rc<crate::input::Trace>> {
    let mut symbols = Vec::new();
    let mut values = Vec::new();
    loop {
        match source.read_next_tail() {
            TailEvent::Symbol { symbol, values: v } => {
                symbols.push(symbol);
                values.push(v);
            }
            TailEvent::EndOfTrace { ttype } => {
                return Some(store.create(symbols, values, ttype, Vec::new()));
            }
            TailEvent::EndOfInput => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::input::VecSource;

    fn stream_config(batch_size: usize) -> Config {
        Config {
            evaluation: "divergence".to_string(),
            mu: f64::INFINITY,
            final_probabilities: false,
            batch_size,
            ..Config::default()
        }
    }

    #[test_log::test]
    fn streaming_matches_batch_result_on_uniform_data() {
        let traces = vec![
            (vec![0, 1], 0),
            (vec![0, 0], 0),
            (vec![1, 1], 0),
            (vec![1, 0, 1], 0),
        ];

        let mut batch_merger = Merger::new(stream_config(100)).unwrap();
        let mut batch_store = TraceStore::new();
        for (symbols, ttype) in &traces {
            let tr = batch_store.from_symbols(symbols, *ttype);
            batch_merger.add_trace(&tr);
        }
        let batch_refs = crate::greedy::greedy_run(&mut batch_merger);
        assert!(!batch_refs.is_empty());

        let mut stream_merger = Merger::new(stream_config(2)).unwrap();
        let mut store = TraceStore::new();
        let mut source = VecSource::new(traces);
        let performed = stream_run(&mut stream_merger, &mut store, &mut source);

        assert!(!performed.is_empty());
        assert_eq!(
            stream_merger.apta().merged_walk().count(),
            batch_merger.apta().merged_walk().count()
        );
    }

    #[test]
    fn final_state_is_fully_applied() {
        let mut merger = Merger::new(stream_config(1)).unwrap();
        let mut store = TraceStore::new();
        let mut source = VecSource::new(vec![(vec![0], 0), (vec![0, 0], 0), (vec![0, 0, 0], 0)]);
        let mut performed = stream_run(&mut merger, &mut store, &mut source);

        // with an infinite threshold everything collapses into the root
        assert_eq!(merger.apta().merged_walk().count(), 1);
        // and the refinement list undoes cleanly back to the raw trie
        for refinement in performed.iter_mut().rev() {
            merger.undo(refinement);
        }
        assert_eq!(merger.apta().merged_walk().count(), merger.apta().len());
    }

    #[test]
    fn empty_input_yields_root_only() {
        let mut merger = Merger::new(stream_config(4)).unwrap();
        let mut store = TraceStore::new();
        let mut source = VecSource::new(vec![]);
        let performed = stream_run(&mut merger, &mut store, &mut source);
        assert!(performed.is_empty());
        assert_eq!(merger.apta().merged_walk().count(), 1);
    }
}
