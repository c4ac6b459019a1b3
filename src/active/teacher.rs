use fxhash::FxHashMap;
use tracing::trace;

use crate::{SymbolId, TypeId};

/// The system under learning, queried through a fixed contract.
///
/// `membership` answers with the type of a word or `None` when the system
/// cannot classify it — an unknown answer is never a type and must never be
/// inserted into the hypothesis as one. The probabilistic and weighted
/// queries are optional capabilities; backends that do not support them
/// return `None`.
pub trait Sul {
    fn membership(&mut self, word: &[SymbolId]) -> Option<TypeId>;

    fn string_probability(&mut self, word: &[SymbolId]) -> Option<f64> {
        let _ = word;
        None
    }

    fn weight_distribution(&mut self, word: &[SymbolId]) -> Option<Vec<f64>> {
        let _ = word;
        None
    }
}

/// The narrow query surface the learning loop sees of a SUL: queries only,
/// with bookkeeping of how many were posed.
pub struct Teacher<S: Sul> {
    sul: S,
    membership_queries: u64,
    probability_queries: u64,
}

impl<S: Sul> Teacher<S> {
    pub fn new(sul: S) -> Self {
        Self {
            sul,
            membership_queries: 0,
            probability_queries: 0,
        }
    }

    /// Asks for the type of a word. `None` means the SUL could not answer;
    /// the caller records such words as unknown and skips them.
    pub fn membership(&mut self, word: &[SymbolId]) -> Option<TypeId> {
        self.membership_queries += 1;
        let answer = self.sul.membership(word);
        trace!(?word, ?answer, "membership query");
        answer
    }

    /// Membership of a prefix-suffix concatenation.
    pub fn membership_with(&mut self, prefix: &[SymbolId], suffix: &[SymbolId]) -> Option<TypeId> {
        let mut word = Vec::with_capacity(prefix.len() + suffix.len());
        word.extend_from_slice(prefix);
        word.extend_from_slice(suffix);
        self.membership(&word)
    }

    /// Probability the SUL assigns to a word, truncated to a fixed grid so
    /// repeated queries compare exactly.
    pub fn string_probability(&mut self, word: &[SymbolId]) -> Option<f64> {
        self.probability_queries += 1;
        self.sul
            .string_probability(word)
            .map(|p| (p * 1e5).trunc() / 1e5)
    }

    /// Per-symbol weight distribution for the weighted variants.
    pub fn weight_distribution(&mut self, word: &[SymbolId]) -> Option<Vec<f64>> {
        self.sul.weight_distribution(word)
    }

    pub fn membership_queries(&self) -> u64 {
        self.membership_queries
    }

    pub fn probability_queries(&self) -> u64 {
        self.probability_queries
    }
}

/// An in-memory SUL over a fixed table of classified words, the replay
/// backend used by tests and by the replay oracle's sample sets.
#[derive(Debug, Default)]
pub struct TraceStoreSul {
    words: FxHashMap<Vec<SymbolId>, TypeId>,
}

impl TraceStoreSul {
    pub fn new<I: IntoIterator<Item = (Vec<SymbolId>, TypeId)>>(words: I) -> Self {
        Self {
            words: words.into_iter().collect(),
        }
    }

    pub fn words(&self) -> impl Iterator<Item = (&Vec<SymbolId>, TypeId)> {
        self.words.iter().map(|(w, &t)| (w, t))
    }

    pub fn insert(&mut self, word: Vec<SymbolId>, ttype: TypeId) {
        self.words.insert(word, ttype);
    }
}

impl Sul for TraceStoreSul {
    fn membership(&mut self, word: &[SymbolId]) -> Option<TypeId> {
        self.words.get(word).copied()
    }
}
