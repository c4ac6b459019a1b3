use thiserror::Error;
use tracing::{debug, trace};

use crate::active::search::SearchStrategy;
use crate::active::teacher::{Sul, Teacher};
use crate::merge::Hypothesis;
use crate::{SymbolId, TypeId};

/// A word the hypothesis gets wrong, with the type it should have.
pub type Counterexample = (Vec<SymbolId>, TypeId);

#[derive(Debug, Error)]
pub enum OracleError {
    /// The verification procedure itself became intractable; the caller
    /// falls back to another oracle or terminates with a partial result.
    #[error("equivalence check became intractable: {0}")]
    Intractable(String),
}

/// Checks a hypothesis against ground truth.
///
/// Implementations differ in how they search, but all answer through the
/// same contract: `Ok(None)` means no counterexample was found. An oracle
/// must not return the same counterexample twice in a row for an unchanged
/// hypothesis; the learning loop treats a repeat as exhaustion of the
/// oracle's strategy and switches or terminates.
pub trait EquivalenceOracle<S: Sul> {
    fn name(&self) -> &'static str;

    fn check(
        &mut self,
        hypothesis: &Hypothesis<'_>,
        teacher: &mut Teacher<S>,
    ) -> Result<Option<Counterexample>, OracleError>;
}

/// Replays a fixed set of classified traces against the hypothesis and
/// reports the first one it gets wrong.
///
/// Classification goes through the evaluation payload's type prediction,
/// so this oracle requires a type-modeling strategy such as `counts`.
#[derive(Debug, Default)]
pub struct ReplayOracle {
    samples: Vec<(Vec<SymbolId>, TypeId)>,
}

impl ReplayOracle {
    pub fn new<I: IntoIterator<Item = (Vec<SymbolId>, TypeId)>>(samples: I) -> Self {
        Self {
            samples: samples.into_iter().collect(),
        }
    }
}

impl<S: Sul> EquivalenceOracle<S> for ReplayOracle {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn check(
        &mut self,
        hypothesis: &Hypothesis<'_>,
        _teacher: &mut Teacher<S>,
    ) -> Result<Option<Counterexample>, OracleError> {
        for (word, ttype) in &self.samples {
            if hypothesis.classify(word) != Some(*ttype) {
                debug!(?word, ttype, "replayed trace is misclassified");
                return Ok(Some((word.clone(), *ttype)));
            }
        }
        Ok(None)
    }
}

/// Samples query strings from a search strategy and compares the teacher's
/// string probability against the hypothesis prefix by prefix; a gap above
/// the distance budget is a counterexample.
///
/// Words the teacher cannot price are skipped, never guessed at. The
/// reported type is `0`; probabilistic counterexamples carry no type of
/// their own.
pub struct SampleOracle<T: SearchStrategy> {
    strategy: T,
    max_distance: f64,
}

impl<T: SearchStrategy> SampleOracle<T> {
    pub fn new(strategy: T, max_distance: f64) -> Self {
        Self {
            strategy,
            max_distance,
        }
    }
}

impl<S: Sul, T: SearchStrategy> EquivalenceOracle<S> for SampleOracle<T> {
    fn name(&self) -> &'static str {
        "sample"
    }

    fn check(
        &mut self,
        hypothesis: &Hypothesis<'_>,
        teacher: &mut Teacher<S>,
    ) -> Result<Option<Counterexample>, OracleError> {
        'words: while let Some(word) = self.strategy.next_word() {
            if teacher.string_probability(&word).is_none() {
                trace!(?word, "teacher cannot price word, skipped");
                continue;
            }
            for i in 1..=word.len() {
                let prefix = &word[..i];
                let Some(inferred) = hypothesis.prefix_probability(prefix) else {
                    debug!(?word, "hypothesis cannot parse counterexample");
                    self.strategy.reset();
                    return Ok(Some((word, 0)));
                };
                let Some(expected) = teacher.string_probability(prefix) else {
                    continue 'words;
                };
                if (expected - inferred).abs() > self.max_distance {
                    debug!(
                        ?word,
                        expected, inferred, "probability gap above the distance budget"
                    );
                    self.strategy.reset();
                    return Ok(Some((word, 0)));
                }
            }
        }
        self.strategy.reset();
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active::search::BreadthFirst;
    use crate::active::teacher::TraceStoreSul;
    use crate::config::Config;
    use crate::input::TraceStore;
    use crate::Merger;

    fn merger_over(traces: &[(&[SymbolId], TypeId)]) -> Merger {
        let config = Config {
            evaluation: "counts".to_string(),
            ..Config::default()
        };
        let mut merger = Merger::new(config).unwrap();
        let mut store = TraceStore::new();
        for &(symbols, ttype) in traces {
            let tr = store.from_symbols(symbols, ttype);
            merger.add_trace(&tr);
        }
        merger
    }

    #[test]
    fn replay_oracle_finds_the_misclassified_trace() {
        let merger = merger_over(&[(&[0], 0)]);
        let mut oracle = ReplayOracle::new([(vec![0], 0), (vec![1], 1)]);
        let mut teacher = Teacher::new(TraceStoreSul::default());

        let cex = oracle
            .check(&merger.hypothesis(), &mut teacher)
            .unwrap()
            .expect("the hypothesis cannot know about 1");
        assert_eq!(cex, (vec![1], 1));
    }

    #[test]
    fn replay_oracle_accepts_a_faithful_hypothesis() {
        let merger = merger_over(&[(&[0], 0), (&[1], 1)]);
        let mut oracle = ReplayOracle::new([(vec![0], 0), (vec![1], 1)]);
        let mut teacher = Teacher::new(TraceStoreSul::default());
        assert!(oracle
            .check(&merger.hypothesis(), &mut teacher)
            .unwrap()
            .is_none());
    }

    #[test]
    fn sample_oracle_reports_unparsable_words() {
        struct Uniform;
        impl Sul for Uniform {
            fn membership(&mut self, _: &[SymbolId]) -> Option<TypeId> {
                None
            }
            fn string_probability(&mut self, _: &[SymbolId]) -> Option<f64> {
                Some(0.5)
            }
        }

        let merger = merger_over(&[(&[0], 0)]);
        let mut oracle = SampleOracle::new(BreadthFirst::new(vec![0, 1], 2), 1.0);
        let mut teacher = Teacher::new(Uniform);

        let (word, _) = oracle
            .check(&merger.hypothesis(), &mut teacher)
            .unwrap()
            .expect("words over symbol 1 cannot be parsed");
        assert!(word.contains(&1));
    }

    #[test]
    fn sample_oracle_skips_unpriceable_words() {
        struct Silent;
        impl Sul for Silent {
            fn membership(&mut self, _: &[SymbolId]) -> Option<TypeId> {
                None
            }
        }

        let merger = merger_over(&[(&[0], 0)]);
        let mut oracle = SampleOracle::new(BreadthFirst::new(vec![0], 3), 0.1);
        let mut teacher = Teacher::new(Silent);
        // nothing can be priced, so nothing is reported
        assert!(oracle
            .check(&merger.hypothesis(), &mut teacher)
            .unwrap()
            .is_none());
    }
}
