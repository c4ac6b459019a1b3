use tracing::info;

use crate::merge::{Merger, Refinement};

/// Runs the batch state-merging search: repeatedly applies the best
/// supported refinement over the frontier until no refinement is left,
/// producing a hypothesis automaton in the merger.
///
/// Returns the applied refinements in order; undoing them in reverse
/// restores the raw trie. On red-state budget exhaustion the search stops
/// with everything so far fully applied, never half-applied.
pub fn greedy_run(merger: &mut Merger) -> Vec<Refinement> {
    let mut performed = Vec::new();
    while let Some(mut refinement) = merger.best_refinement() {
        if merger.apta().red_count() >= merger.config().max_red_states {
            info!("red-state budget exhausted, keeping the hypothesis so far");
            break;
        }
        merger.doref(&mut refinement);
        performed.push(refinement);
    }
    info!(
        refinements = performed.len(),
        states = merger.apta().merged_walk().count(),
        "merging reached a fixed point"
    );
    performed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::input::TraceStore;
    use crate::merge::RefinementKind;

    #[test]
    fn everything_merges_under_infinite_threshold() {
        let config = Config {
            evaluation: "divergence".to_string(),
            mu: f64::INFINITY,
            final_probabilities: false,
            ..Config::default()
        };
        let mut merger = Merger::new(config).unwrap();
        let mut store = TraceStore::new();
        for symbols in [&[0u32, 1][..], &[0, 2], &[1, 1, 0]] {
            let tr = store.from_symbols(symbols, 0);
            merger.add_trace(&tr);
        }

        let performed = greedy_run(&mut merger);
        assert!(performed.iter().all(Refinement::is_merge));
        assert_eq!(merger.apta().merged_walk().count(), 1);
    }

    #[test]
    fn conflicting_types_promote_instead_of_merging() {
        let config = Config {
            evaluation: "counts".to_string(),
            ..Config::default()
        };
        let mut merger = Merger::new(config).unwrap();
        let mut store = TraceStore::new();
        for (symbols, ttype) in [(&[0u32][..], 0), (&[1][..], 1)] {
            let tr = store.from_symbols(symbols, ttype);
            merger.add_trace(&tr);
        }

        let performed = greedy_run(&mut merger);
        // the first child folds into the root, the second conflicts with the
        // root's acquired type and must be promoted
        assert!(performed
            .iter()
            .any(|r| matches!(r.kind, RefinementKind::Extend { .. })));
        assert_eq!(merger.apta().merged_walk().count(), 2);
    }

    #[test]
    fn distinct_types_at_depth_one_promote_both_children() {
        let config = Config {
            evaluation: "divergence".to_string(),
            mu: 0.35,
            final_probabilities: true,
            ..Config::default()
        };
        let mut merger = Merger::new(config).unwrap();
        let mut store = TraceStore::new();
        for (symbols, ttype) in [(&[0u32][..], 0), (&[1][..], 1)] {
            let tr = store.from_symbols(symbols, ttype);
            merger.add_trace(&tr);
        }

        let performed = greedy_run(&mut merger);
        // the root never terminates while both children always do, so
        // neither child has a legal merge and both are promoted
        assert_eq!(performed.len(), 2);
        assert!(performed
            .iter()
            .all(|r| matches!(r.kind, RefinementKind::Extend { .. })));
        assert_eq!(merger.apta().merged_walk().count(), 3);
    }

    #[test]
    fn undoing_the_run_restores_the_trie() {
        let config = Config {
            evaluation: "divergence".to_string(),
            mu: f64::INFINITY,
            final_probabilities: false,
            ..Config::default()
        };
        let mut merger = Merger::new(config).unwrap();
        let mut store = TraceStore::new();
        for symbols in [&[0u32, 0][..], &[1, 0]] {
            let tr = store.from_symbols(symbols, 0);
            merger.add_trace(&tr);
        }
        let raw_states = merger.apta().merged_walk().count();

        let mut performed = greedy_run(&mut merger);
        assert!(merger.apta().merged_walk().count() < raw_states);
        for refinement in performed.iter_mut().rev() {
            merger.undo(refinement);
        }
        assert_eq!(merger.apta().merged_walk().count(), raw_states);
    }
}
