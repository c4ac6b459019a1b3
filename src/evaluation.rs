use std::any::Any;

use crate::config::{Config, ConfigError};
use crate::input::{Tail, Vocabulary};
use crate::serialize::SnapshotError;
use crate::{SymbolId, TypeId};

pub mod counts;
pub mod divergence;

pub use counts::Counts;
pub use divergence::Divergence;

/// Per-node statistics payload, opaque to the merge engine.
///
/// `update` and `undo` must be exact inverses: the engine relies on them to
/// restore bit-identical payloads when a merge is undone. Implementations
/// therefore fold raw counts, never only normalized values.
pub trait EvalData {
    fn as_any(&self) -> &dyn Any;

    /// Resets the statistics to empty.
    fn reset(&mut self);

    /// Folds one observed tail into the statistics. Called once per tail
    /// during trie construction; the sentinel tail records termination with
    /// the trace type.
    fn add_tail(&mut self, tail: &Tail);

    /// Removes one previously added tail. Exact inverse of [`add_tail`],
    /// used when splits re-route tails.
    ///
    /// [`add_tail`]: EvalData::add_tail
    fn del_tail(&mut self, tail: &Tail);

    /// Additively folds another node's statistics into this one.
    fn update(&mut self, other: &dyn EvalData);

    /// Subtracts another node's statistics from this one. Exact inverse of
    /// [`update`].
    ///
    /// [`update`]: EvalData::update
    fn undo(&mut self, other: &dyn EvalData);

    /// Probability-like score for observing `symbol` next, where `None`
    /// asks for the termination probability.
    fn predict_score(&self, symbol: Option<SymbolId>) -> f64 {
        let _ = symbol;
        0.0
    }

    /// The most likely trace type at this state, when the strategy models
    /// types.
    fn predict_type(&self) -> Option<TypeId> {
        None
    }

    /// Sink classification of the owning state, `None` when it is a regular
    /// state.
    fn sink_type(&self) -> Option<u32> {
        None
    }

    /// Human-readable label for dot output.
    fn state_label(&self, vocab: &Vocabulary) -> String {
        let _ = vocab;
        String::new()
    }

    /// Serializes the payload for the snapshot format.
    fn write_json(&self, vocab: &Vocabulary) -> serde_json::Value;

    /// Restores the payload from the snapshot format.
    fn read_json(
        &mut self,
        value: &serde_json::Value,
        vocab: &mut Vocabulary,
    ) -> Result<(), SnapshotError>;
}

/// The global strategy object of an evaluation plugin.
///
/// A strategy accumulates a consistency/divergence state across the pairwise
/// checks of a single merge test; [`reset`] is called between independent
/// tests.
///
/// [`reset`]: Evaluation::reset
pub trait Evaluation {
    /// The name this strategy is registered under.
    fn name(&self) -> &'static str;

    /// Creates an empty per-node payload.
    fn fresh_data(&self) -> Box<dyn EvalData>;

    /// Applies configuration before any traces are added.
    fn configure(&mut self, config: &Config) {
        let _ = config;
    }

    /// Clears accumulated state between independent merge tests.
    fn reset(&mut self);

    /// Pairwise compatibility of two states' statistics. May accumulate a
    /// divergence measure across calls belonging to the same merge test.
    fn consistent(&mut self, left: &dyn EvalData, right: &dyn EvalData) -> bool;

    /// Priority for ranking candidate merges; higher is better.
    fn compute_score(&self, left: &dyn EvalData, right: &dyn EvalData) -> f64;

    /// Priority for ranking candidate splits; partitions that differ more
    /// rank higher. Unlike [`compute_score`] this is a pure pairwise
    /// measure, independent of any accumulated merge-test state.
    ///
    /// [`compute_score`]: Evaluation::compute_score
    fn split_score(&self, left: &dyn EvalData, right: &dyn EvalData) -> f64;
}

fn make_counts() -> Box<dyn Evaluation> {
    Box::<Counts>::default()
}

fn make_divergence() -> Box<dyn Evaluation> {
    Box::<Divergence>::default()
}

/// The registry of named evaluation factories.
const REGISTRY: &[(&str, fn() -> Box<dyn Evaluation>)] =
    &[("counts", make_counts), ("divergence", make_divergence)];

/// Instantiates and configures the strategy registered under `name`.
pub fn evaluation_from_name(name: &str, config: &Config) -> Result<Box<dyn Evaluation>, ConfigError> {
    for (registered, factory) in REGISTRY {
        if *registered == name {
            let mut eval = factory();
            eval.configure(config);
            return Ok(eval);
        }
    }
    Err(ConfigError::UnknownEvaluation(name.to_string()))
}

/// Names of all registered strategies, in registration order.
pub fn registered_evaluations() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_names() {
        let config = Config::default();
        assert!(evaluation_from_name("counts", &config).is_ok());
        assert!(evaluation_from_name("divergence", &config).is_ok());
        assert!(matches!(
            evaluation_from_name("nonsense", &config),
            Err(ConfigError::UnknownEvaluation(_))
        ));
        assert_eq!(registered_evaluations().count(), 2);
    }
}
