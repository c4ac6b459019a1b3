use std::collections::BTreeSet;

use fxhash::FxHashSet;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::active::oracle::{Counterexample, EquivalenceOracle, OracleError};
use crate::active::teacher::{Sul, Teacher};
use crate::config::{Config, ConfigError};
use crate::input::TraceStore;
use crate::merge::{Merger, Refinement, RefinementSet};
use crate::{NodeId, SymbolId, TypeId};

/// How a learning run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No oracle could produce a counterexample for the final hypothesis.
    Converged,
    /// An iteration or state budget ran out; the hypothesis is the best
    /// effort so far, fully applied.
    BudgetExhausted,
    /// Every configured oracle ran out of strategy (repeated
    /// counterexamples or intractable checks); partial result.
    OracleExhausted,
}

#[derive(Debug)]
pub struct LearnResult {
    pub outcome: Outcome,
    /// Hypothesis rounds performed (equivalence checks asked).
    pub rounds: usize,
    /// States of the final merged view.
    pub states: usize,
}

enum Step {
    Converged,
    Exhausted,
    Counterexample(Counterexample),
}

/// A counterexample-guided learning loop in the L# family.
///
/// Drives the state-merging engine over a growing APTA: resolves the blue
/// frontier (merge, promote, or gather more data on ambiguity), stabilizes
/// the hypothesis, asks the equivalence oracles, and folds counterexamples
/// back into the trie. All memoization is per-run state on this instance.
pub struct LSharp<S: Sul> {
    merger: Merger,
    teacher: Teacher<S>,
    oracles: Vec<Box<dyn EquivalenceOracle<S>>>,
    store: TraceStore,
    alphabet: Vec<SymbolId>,
    completed: FxHashSet<NodeId>,
    to_complete: BTreeSet<NodeId>,
    added: FxHashSet<Vec<SymbolId>>,
    performed: Vec<Refinement>,
    prev_cex: Option<Counterexample>,
}

impl<S: Sul> LSharp<S> {
    pub fn new(config: Config, alphabet: Vec<SymbolId>, sul: S) -> Result<Self, ConfigError> {
        Ok(Self {
            merger: Merger::new(config)?,
            teacher: Teacher::new(sul),
            oracles: Vec::new(),
            store: TraceStore::new(),
            alphabet,
            completed: FxHashSet::default(),
            to_complete: BTreeSet::new(),
            added: FxHashSet::default(),
            performed: Vec::new(),
            prev_cex: None,
        })
    }

    pub fn add_oracle(&mut self, oracle: Box<dyn EquivalenceOracle<S>>) {
        self.oracles.push(oracle);
    }

    pub fn with_oracle(mut self, oracle: Box<dyn EquivalenceOracle<S>>) -> Self {
        self.add_oracle(oracle);
        self
    }

    pub fn merger(&self) -> &Merger {
        &self.merger
    }

    pub fn teacher(&self) -> &Teacher<S> {
        &self.teacher
    }

    /// Hands back the merger carrying the final hypothesis.
    pub fn into_merger(self) -> Merger {
        self.merger
    }

    /// Runs the loop to a terminal state. The APTA is left with the final
    /// hypothesis fully applied — never with a half-applied refinement.
    pub fn run(&mut self) -> LearnResult {
        let root = self.merger.apta().root();
        self.complete_state(root);

        let mut rounds = 1usize;
        let max_runs = self.merger.config().max_runs;
        loop {
            if self.merger.apta().red_count() > self.merger.config().max_red_states {
                info!("red-state budget exhausted, keeping the best hypothesis");
                return self.finish(Outcome::BudgetExhausted, rounds);
            }

            let mut isolated = false;
            let mut ambiguous: Vec<(NodeId, Vec<NodeId>)> = Vec::new();

            let blues = self.merger.apta().blue_states().collect_vec();
            for blue in blues {
                let blue = self.merger.find(blue);
                if !self.merger.apta().is_blue(blue) {
                    // an earlier refinement of this pass changed its role
                    continue;
                }
                if self.merger.config().use_sinks && self.merger.apta().is_sink(blue) {
                    continue;
                }
                let mut candidates = self.merger.candidate_merges(blue).into_sorted();
                match candidates.len() {
                    0 => {
                        isolated = true;
                        let mut refinement = self.merger.extend_refinement(blue);
                        self.merger.doref(&mut refinement);
                        self.performed.push(refinement);
                    }
                    1 => {
                        let mut refinement = candidates.pop().expect("exactly one");
                        self.merger.doref(&mut refinement);
                        self.performed.push(refinement);
                    }
                    _ => {
                        ambiguous.push((blue, candidates.iter().map(|r| r.red_node()).collect()));
                        for refinement in candidates {
                            self.merger.erase(refinement);
                        }
                    }
                }
            }

            if !ambiguous.is_empty() && self.process_unidentified(ambiguous) {
                isolated = true;
            }
            if isolated {
                continue;
            }

            if !self.to_complete.is_empty() {
                // the whole APTA is unrolled first, then the extra
                // information is added to the raw trie
                self.reset_all();
                let targets: Vec<NodeId> = std::mem::take(&mut self.to_complete).into_iter().collect();
                debug!(states = targets.len(), "completing under-explored states");
                for n in targets {
                    self.complete_state(n);
                }
                continue;
            }

            // frontier is quiet: close the hypothesis
            self.minimize();

            match self.check_equivalence() {
                Step::Converged => {
                    info!(rounds, "no counterexample left, hypothesis is consistent");
                    return self.finish(Outcome::Converged, rounds);
                }
                Step::Exhausted => {
                    warn!("all oracles exhausted, terminating with a partial result");
                    return self.finish(Outcome::OracleExhausted, rounds);
                }
                Step::Counterexample(cex) => {
                    info!(length = cex.0.len(), ttype = cex.1, "processing counterexample");
                    self.process_counterexample(&cex);
                    rounds += 1;
                    if rounds > max_runs {
                        info!("iteration budget exhausted");
                        self.minimize();
                        return self.finish(Outcome::BudgetExhausted, rounds);
                    }
                }
            }
        }
    }

    fn finish(&mut self, outcome: Outcome, rounds: usize) -> LearnResult {
        LearnResult {
            outcome,
            rounds,
            states: self.merger.apta().merged_walk().count(),
        }
    }

    /// Resolves blue states with several legal merges: apply the clearly
    /// best one, otherwise queue the participating states for completion
    /// queries — and when nothing is left to ask, accept the best anyway.
    /// Returns whether any state ended up without a legal merge.
    fn process_unidentified(&mut self, groups: Vec<(NodeId, Vec<NodeId>)>) -> bool {
        let mut isolated = false;
        for (blue, reds) in groups {
            let blue = self.merger.find(blue);
            if !self.merger.apta().is_blue(blue) {
                continue;
            }
            // earlier refinements of this pass may have invalidated the
            // candidates, so each one is re-tested
            let mut fresh = RefinementSet::new(self.merger.config().tie_break);
            let mut seen = FxHashSet::default();
            for red in reds {
                let red = self.merger.find(red);
                if !self.merger.apta().node(red).red || !seen.insert(red) {
                    continue;
                }
                if let Some(refinement) = self.merger.test_merge(red, blue) {
                    fresh.push(refinement);
                }
            }
            let mut sorted = fresh.into_sorted();
            match sorted.len() {
                0 => isolated = true,
                1 => {
                    let mut refinement = sorted.pop().expect("exactly one");
                    self.merger.doref(&mut refinement);
                    self.performed.push(refinement);
                }
                _ => {
                    let second_score = sorted[1].score;
                    let second_red = sorted[1].red_node();
                    let mut best = sorted.remove(0);
                    let threshold = self.merger.config().score_ratio;
                    if best.score > threshold * second_score {
                        // clearly better than the runner-up
                        self.merger.doref(&mut best);
                        self.performed.push(best);
                    } else {
                        let mut all_completed = true;
                        for seed in [blue, best.red_node(), second_red] {
                            for m in self.merger.apta().class_members(self.merger.find(seed)) {
                                if !self.completed.contains(&m) {
                                    self.to_complete.insert(m);
                                    all_completed = false;
                                }
                            }
                        }
                        if all_completed {
                            // no more information can be gathered
                            self.merger.doref(&mut best);
                            self.performed.push(best);
                        } else {
                            self.merger.erase(best);
                        }
                    }
                    for refinement in sorted {
                        self.merger.erase(refinement);
                    }
                }
            }
        }
        isolated
    }

    /// Applies best refinements until none is left, closing the hypothesis.
    fn minimize(&mut self) {
        while let Some(mut refinement) = self.merger.best_refinement() {
            if self.merger.apta().red_count() > self.merger.config().max_red_states {
                self.merger.erase(refinement);
                return;
            }
            self.merger.doref(&mut refinement);
            self.performed.push(refinement);
        }
    }

    /// Undoes every refinement applied since the last stable point, in
    /// reverse order.
    fn reset_all(&mut self) {
        for refinement in self.performed.iter_mut().rev() {
            self.merger.undo(refinement);
        }
        debug!(undone = self.performed.len(), "apta unrolled");
        self.performed.clear();
    }

    /// Inserts a classified word into the store and the raw trie, once.
    fn add_trace(&mut self, word: &[SymbolId], ttype: TypeId) {
        if !self.added.insert(word.to_vec()) {
            return;
        }
        let tr = self.store.from_symbols(word, ttype);
        self.merger.add_trace(&tr);
    }

    /// Queries the teacher for the state's access sequence and each of its
    /// one-symbol extensions; unknown answers are recorded as unknown and
    /// skipped, never inserted with a guessed type.
    fn complete_state(&mut self, n: NodeId) -> bool {
        if !self.completed.insert(n) {
            return false;
        }
        let access = self.merger.apta().node(n).access.clone();
        if let Some(ttype) = self.teacher.membership(&access) {
            let word = access.clone();
            self.add_trace(&word, ttype);
        }
        for i in 0..self.alphabet.len() {
            let symbol = self.alphabet[i];
            let mut word = access.clone();
            word.push(symbol);
            match self.teacher.membership(&word) {
                Some(ttype) => self.add_trace(&word, ttype),
                None => debug!(?word, "teacher cannot classify, skipped"),
            }
        }
        true
    }

    /// Consults the configured oracles in order, falling back to the next
    /// one when a strategy is exhausted (repeated counterexample) or the
    /// check became intractable.
    fn check_equivalence(&mut self) -> Step {
        loop {
            if self.oracles.is_empty() {
                return Step::Exhausted;
            }
            let result = {
                let hypothesis = self.merger.hypothesis();
                self.oracles[0].check(&hypothesis, &mut self.teacher)
            };
            match result {
                Err(OracleError::Intractable(reason)) => {
                    warn!(%reason, "oracle became intractable, falling back");
                    self.oracles.remove(0);
                }
                Ok(None) => return Step::Converged,
                Ok(Some(cex)) => {
                    if self.prev_cex.as_ref() == Some(&cex) {
                        warn!("repeated counterexample, oracle strategy exhausted");
                        self.oracles.remove(0);
                    } else {
                        self.prev_cex = Some(cex.clone());
                        return Step::Counterexample(cex);
                    }
                }
            }
        }
    }

    /// Unrolls the APTA, walks the counterexample down the trie, queries
    /// the teacher for every prefix past the fringe, inserts the full
    /// counterexample, and re-completes the states along its path.
    fn process_counterexample(&mut self, cex: &Counterexample) {
        let (word, ttype) = cex;
        self.reset_all();

        if self.merger.config().complete_path_cex {
            let mut n = Some(self.merger.apta().root());
            let mut prefix: Vec<SymbolId> = Vec::new();
            for &s in word {
                match n {
                    Some(node) => {
                        prefix.push(s);
                        n = self.merger.child(node, s);
                    }
                    None => {
                        // past the fringe: ask for the still-missing prefix
                        // before extending it
                        if let Some(t) = self.teacher.membership(&prefix) {
                            let word = prefix.clone();
                            self.add_trace(&word, t);
                        }
                        prefix.push(s);
                    }
                }
            }
        }

        self.add_trace(word, *ttype);

        if self.merger.config().explore_outside_cex {
            let mut n = self.merger.apta().root();
            for i in 0..word.len() {
                match self.merger.child(n, word[i]) {
                    Some(next) => {
                        self.complete_state(next);
                        n = next;
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active::oracle::ReplayOracle;
    use crate::active::teacher::TraceStoreSul;
    use crate::merge::Hypothesis;

    fn config() -> Config {
        Config {
            evaluation: "counts".to_string(),
            ..Config::default()
        }
    }

    fn classify(h: &Hypothesis<'_>, word: &[SymbolId]) -> Option<TypeId> {
        h.classify(word)
    }

    #[test]
    fn counterexample_is_found_inserted_and_not_repeated() {
        // the target accepts only "x"; the oracle knows about "x y"
        let sul = TraceStoreSul::new([(vec![0], 0), (vec![0, 1], 1)]);
        let oracle = ReplayOracle::new([(vec![0], 0), (vec![0, 1], 1)]);
        let mut learner = LSharp::new(config(), vec![0, 1], sul)
            .unwrap()
            .with_oracle(Box::new(oracle));

        let result = learner.run();
        assert_eq!(result.outcome, Outcome::Converged);

        let merger = learner.merger();
        let hypothesis = merger.hypothesis();
        assert_eq!(classify(&hypothesis, &[0]), Some(0));
        assert_eq!(classify(&hypothesis, &[0, 1]), Some(1));
        assert!(learner.teacher().membership_queries() > 0);
    }

    #[test_log::test]
    fn learns_parity_of_first_symbol_count() {
        struct Parity;
        impl Sul for Parity {
            fn membership(&mut self, word: &[SymbolId]) -> Option<TypeId> {
                Some((word.iter().filter(|&&s| s == 0).count() % 2) as TypeId)
            }
        }

        // every word up to length three, correctly classified
        let mut samples = Vec::new();
        let mut queue = vec![Vec::new()];
        while let Some(word) = queue.pop() {
            samples.push((
                word.clone(),
                (word.iter().filter(|&&s| s == 0).count() % 2) as TypeId,
            ));
            if word.len() < 3 {
                for s in [0, 1] {
                    let mut w = word.clone();
                    w.push(s);
                    queue.push(w);
                }
            }
        }

        let oracle = ReplayOracle::new(samples);
        let mut learner = LSharp::new(config(), vec![0, 1], Parity)
            .unwrap()
            .with_oracle(Box::new(oracle));

        let result = learner.run();
        assert_eq!(result.outcome, Outcome::Converged);
        assert_eq!(result.states, 2);

        let merger = learner.merger();
        let hypothesis = merger.hypothesis();
        assert_eq!(classify(&hypothesis, &[]), Some(0));
        assert_eq!(classify(&hypothesis, &[0]), Some(1));
        assert_eq!(classify(&hypothesis, &[0, 1, 0]), Some(0));
        assert_eq!(classify(&hypothesis, &[1, 1]), Some(0));
    }

    #[test]
    fn ambiguity_triggers_completion_queries_then_resolves() {
        // type of a word is decided by its first symbol; [1,1] stays
        // unknown so the node reached by it has merge candidates on both
        // red states
        let sul = TraceStoreSul::new([
            (vec![], 0),
            (vec![0], 1),
            (vec![1], 2),
            (vec![1, 1, 0], 2),
        ]);
        let oracle = ReplayOracle::new([(vec![1, 1, 0], 2)]);
        let mut learner = LSharp::new(config(), vec![0, 1], sul)
            .unwrap()
            .with_oracle(Box::new(oracle));

        let result = learner.run();
        assert_eq!(result.outcome, Outcome::Converged);
        assert_eq!(result.states, 3);

        let hypothesis = learner.merger().hypothesis();
        assert_eq!(classify(&hypothesis, &[1, 1, 0]), Some(2));
    }

    #[test]
    fn repeated_counterexample_exhausts_the_oracle() {
        struct Stubborn;
        impl<S: Sul> EquivalenceOracle<S> for Stubborn {
            fn name(&self) -> &'static str {
                "stubborn"
            }
            fn check(
                &mut self,
                _hypothesis: &Hypothesis<'_>,
                _teacher: &mut Teacher<S>,
            ) -> Result<Option<Counterexample>, OracleError> {
                Ok(Some((vec![1], 0)))
            }
        }

        let sul = TraceStoreSul::new([(vec![0], 0)]);
        let mut learner = LSharp::new(config(), vec![0, 1], sul)
            .unwrap()
            .with_oracle(Box::new(Stubborn));

        let result = learner.run();
        // the counterexample is processed once, returned again, detected as
        // repeated, and the oracle is dropped
        assert_eq!(result.outcome, Outcome::OracleExhausted);
        assert_eq!(result.rounds, 2);
    }

    #[test]
    fn intractable_oracles_fall_back_to_the_next_one() {
        struct Hopeless;
        impl<S: Sul> EquivalenceOracle<S> for Hopeless {
            fn name(&self) -> &'static str {
                "hopeless"
            }
            fn check(
                &mut self,
                _hypothesis: &Hypothesis<'_>,
                _teacher: &mut Teacher<S>,
            ) -> Result<Option<Counterexample>, OracleError> {
                Err(OracleError::Intractable("state space too large".into()))
            }
        }

        let sul = TraceStoreSul::new([(vec![0], 0)]);
        let mut learner = LSharp::new(config(), vec![0, 1], sul).unwrap();
        learner.add_oracle(Box::new(Hopeless));
        learner.add_oracle(Box::new(ReplayOracle::new([(vec![0], 0)])));

        let result = learner.run();
        assert_eq!(result.outcome, Outcome::Converged);
    }

    #[test]
    fn iteration_budget_yields_best_effort_hypothesis() {
        struct Stubborn;
        impl<S: Sul> EquivalenceOracle<S> for Stubborn {
            fn name(&self) -> &'static str {
                "stubborn"
            }
            fn check(
                &mut self,
                _hypothesis: &Hypothesis<'_>,
                _teacher: &mut Teacher<S>,
            ) -> Result<Option<Counterexample>, OracleError> {
                Ok(Some((vec![1], 0)))
            }
        }

        let sul = TraceStoreSul::new([(vec![0], 0)]);
        let mut learner = LSharp::new(
            Config {
                max_runs: 1,
                ..config()
            },
            vec![0, 1],
            sul,
        )
        .unwrap()
        .with_oracle(Box::new(Stubborn));

        let result = learner.run();
        assert_eq!(result.outcome, Outcome::BudgetExhausted);
        // the hypothesis is still a usable, fully-applied model
        assert!(result.states >= 1);
    }
}
