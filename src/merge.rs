use std::rc::Rc;

use itertools::Itertools;
use tracing::{debug, trace};

use crate::apta::{Apta, Guard};
use crate::config::{Config, ConfigError};
use crate::evaluation::{evaluation_from_name, EvalData, Evaluation};
use crate::input::{Tail, Trace};
use crate::{AttrId, NodeId, SymbolId, TypeId};

pub mod refinement;
pub use refinement::{Refinement, RefinementKind, RefinementSet, SplitStage};

/// The state merger: owns the APTA and the active evaluation strategy and
/// implements the full refinement lifecycle — testing candidate edits
/// without committing, applying them, and undoing them exactly.
pub struct Merger {
    apta: Apta,
    eval: Box<dyn Evaluation>,
    config: Config,
}

impl Merger {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let eval = evaluation_from_name(&config.evaluation, &config)?;
        let apta = Apta::new(eval.as_ref(), config.store_tails);
        debug!(evaluation = eval.name(), "created state merger");
        Ok(Self { apta, eval, config })
    }

    /// Reassembles a merger around a deserialized APTA.
    pub(crate) fn from_parts(apta: Apta, eval: Box<dyn Evaluation>, config: Config) -> Self {
        Self { apta, eval, config }
    }

    pub fn apta(&self) -> &Apta {
        &self.apta
    }

    pub fn apta_mut(&mut self) -> &mut Apta {
        &mut self.apta
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn evaluation(&self) -> &dyn Evaluation {
        self.eval.as_ref()
    }

    pub fn add_trace(&mut self, trace: &Rc<Trace>) {
        self.apta.add_trace(self.eval.as_ref(), trace);
    }

    pub fn find(&self, n: NodeId) -> NodeId {
        self.apta.find(n)
    }

    pub fn child(&self, n: NodeId, symbol: SymbolId) -> Option<NodeId> {
        self.apta.child(n, symbol)
    }

    pub fn sift(&self, symbols: &[SymbolId]) -> Option<NodeId> {
        self.apta.sift(symbols)
    }

    /// Folds the evaluation payload of `blue` into `red` and unions the
    /// classes.
    fn apply_union(&mut self, red: NodeId, blue: NodeId) {
        let (rn, bn) = self.apta.pair_mut(red, blue);
        rn.data.update(bn.data.as_ref());
        self.apta.union(red, blue);
    }

    /// Exact inverse of [`apply_union`].
    ///
    /// [`apply_union`]: Merger::apply_union
    fn revert_union(&mut self, red: NodeId, blue: NodeId) {
        self.apta.ununion(red, blue);
        let (rn, bn) = self.apta.pair_mut(red, blue);
        rn.data.undo(bn.data.as_ref());
    }

    /// Worklist merge of `blue`'s subtree into `red`'s: checks each
    /// corresponding state pair against the evaluation strategy, staging
    /// unions as it goes. Returns the staged pair list, or the partial list
    /// on inconsistency so the caller can unwind.
    fn stage_merge(
        &mut self,
        red: NodeId,
        blue: NodeId,
    ) -> Result<Vec<(NodeId, NodeId)>, Vec<(NodeId, NodeId)>> {
        let mut staged = Vec::new();
        let mut work = vec![(red, blue)];
        while let Some((l, r)) = work.pop() {
            let l = self.apta.find(l);
            let r = self.apta.find(r);
            if l == r {
                continue;
            }
            let consistent = self.eval.consistent(
                self.apta.node(l).data.as_ref(),
                self.apta.node(r).data.as_ref(),
            );
            if !consistent {
                trace!(left = l, right = r, "merge pair inconsistent");
                return Err(staged);
            }
            // corresponding children are paired before the union changes
            // what `find` resolves to
            let mut pairs = Vec::new();
            for m in self.apta.class_members(r) {
                for gi in 0..self.apta.node(m).guards.len() {
                    let g = &self.apta.node(m).guards[gi];
                    let Some(t) = g.target else { continue };
                    let symbol = g.symbol;
                    let rc = self.apta.find(t);
                    let g = g.clone();
                    if let Some(lc) = self.apta.matching_guard_child(l, symbol, &g) {
                        if lc != rc {
                            pairs.push((lc, rc));
                        }
                    }
                }
            }
            self.apply_union(l, r);
            staged.push((l, r));
            for pair in pairs.into_iter().rev() {
                work.push(pair);
            }
        }
        Ok(staged)
    }

    /// Attempts to unify `blue`'s subtree into `red`'s without committing.
    ///
    /// Returns `None` if any reachable pair of corresponding states fails
    /// the active evaluation's consistency predicate; the APTA is left
    /// byte-identical to its pre-call state either way. On success the
    /// returned merge refinement carries the computed score and the full
    /// pair list needed for apply and undo.
    pub fn test_merge(&mut self, red: NodeId, blue: NodeId) -> Option<Refinement> {
        let red = self.apta.find(red);
        let blue = self.apta.find(blue);
        if red == blue {
            return None;
        }
        self.eval.reset();
        match self.stage_merge(red, blue) {
            Ok(staged) => {
                let score = self.eval.compute_score(
                    self.apta.node(red).data.as_ref(),
                    self.apta.node(blue).data.as_ref(),
                );
                for &(l, r) in staged.iter().rev() {
                    self.revert_union(l, r);
                }
                trace!(red, blue, score, pairs = staged.len(), "merge tested");
                Some(Refinement::merge(red, blue, score, staged))
            }
            Err(staged) => {
                for &(l, r) in staged.iter().rev() {
                    self.revert_union(l, r);
                }
                None
            }
        }
    }

    /// A promotion of `blue` to red, scored by the state's evidence.
    pub fn extend_refinement(&self, blue: NodeId) -> Refinement {
        Refinement::extend(blue, self.apta.node(blue).size as f64)
    }

    /// Tests materializing the bound `attr < threshold` on the transition
    /// of `node` under `symbol`. Returns `None` unless both partitions of
    /// the affected tails are non-empty.
    pub fn test_split(
        &mut self,
        node: NodeId,
        symbol: SymbolId,
        attr: AttrId,
        threshold: f64,
    ) -> Option<Refinement> {
        if !self.config.store_tails {
            return None;
        }
        let node = self.apta.find(node);
        let gi = self
            .apta
            .node(node)
            .guards
            .iter()
            .position(|g| g.symbol == symbol && g.target.is_some())?;
        let target = self.apta.node(node).guards[gi].target.expect("checked above");

        let mut below = self.eval.fresh_data();
        let mut above = self.eval.fresh_data();
        let (mut n_below, mut n_above) = (0u32, 0u32);
        for u in &self.apta.node(target).tails {
            if u.past().is_some_and(|p| p.value(attr) < threshold) {
                below.add_tail(u);
                n_below += 1;
            } else {
                above.add_tail(u);
                n_above += 1;
            }
        }
        if n_below == 0 || n_above == 0 {
            return None;
        }
        let score = self.eval.split_score(below.as_ref(), above.as_ref());
        Some(Refinement::split(node, symbol, attr, threshold, score))
    }

    fn apply_split(
        &mut self,
        node: NodeId,
        symbol: SymbolId,
        attr: AttrId,
        threshold: f64,
    ) -> SplitStage {
        let gi = self
            .apta
            .node(node)
            .guards
            .iter()
            .position(|g| g.symbol == symbol && g.target.is_some())
            .expect("split on a missing transition");
        let old_target = self.apta.node(node).guards[gi].target.expect("checked above");
        let arena_len_before = self.apta.len();

        let fresh = self.eval.fresh_data();
        let new_target = self.apta.new_node(fresh, node, symbol);
        let old_guard = &self.apta.node(node).guards[gi];
        let bounded = Guard {
            symbol,
            mins: old_guard.mins.clone(),
            maxs: old_guard
                .maxs
                .iter()
                .copied()
                .chain(std::iter::once((attr, threshold)))
                .collect(),
            target: Some(new_target),
        };
        self.apta.node_mut(node).guards.insert(gi, bounded);

        let moved: Vec<Tail> = self
            .apta
            .node(old_target)
            .tails
            .iter()
            .filter(|u| u.past().is_some_and(|p| p.value(attr) < threshold))
            .cloned()
            .collect();
        for u in &moved {
            self.apta.remove_suffix(old_target, u.clone());
            self.apta.add_suffix(self.eval.as_ref(), new_target, u.clone());
        }
        debug!(
            node,
            symbol,
            attr,
            threshold,
            moved = moved.len(),
            "split applied"
        );
        SplitStage {
            guard_index: gi,
            arena_len_before,
            moved,
        }
    }

    fn revert_split(&mut self, node: NodeId, symbol: SymbolId, stage: SplitStage) {
        let new_target = self.apta.node(node).guards[stage.guard_index]
            .target
            .expect("applied split has a target");
        let old_target = self.apta.node(node).guards[stage.guard_index + 1..]
            .iter()
            .find(|g| g.symbol == symbol && g.target.is_some())
            .and_then(|g| g.target)
            .expect("split keeps the original transition");

        for u in stage.moved.iter().rev() {
            self.apta.remove_suffix(new_target, u.clone());
            self.apta.add_suffix(self.eval.as_ref(), old_target, u.clone());
        }
        self.apta.node_mut(node).guards.remove(stage.guard_index);
        self.apta.truncate_nodes(stage.arena_len_before);
    }

    /// Applies a previously tested refinement. Apply of a tested refinement
    /// always succeeds; anything else is an invariant violation.
    pub fn doref(&mut self, refinement: &mut Refinement) {
        match &mut refinement.kind {
            RefinementKind::Merge {
                red,
                blue,
                pairs,
                rewired,
            } => {
                debug_assert!(rewired.is_none(), "refinement already applied");
                let (red, blue) = (*red, *blue);
                for &(l, r) in pairs.iter() {
                    self.apply_union(l, r);
                }
                let (src, _) = self.apta.node(blue).source.expect("blue node has a source");
                let gi = self
                    .apta
                    .node(src)
                    .guards
                    .iter()
                    .position(|g| g.target == Some(blue))
                    .expect("source-side guard still targets the blue node");
                self.apta.node_mut(src).guards[gi].target = Some(red);
                *rewired = Some((src, gi));
                trace!(red, blue, "merge applied");
            }
            RefinementKind::Extend { blue } => {
                self.apta.node_mut(*blue).red = true;
                trace!(blue = *blue, "blue state promoted to red");
            }
            RefinementKind::Split {
                node,
                symbol,
                attr,
                threshold,
                staged,
            } => {
                debug_assert!(staged.is_none(), "refinement already applied");
                *staged = Some(self.apply_split(*node, *symbol, *attr, *threshold));
            }
        }
    }

    /// The exact structural and statistical inverse of [`doref`].
    ///
    /// [`doref`]: Merger::doref
    pub fn undo(&mut self, refinement: &mut Refinement) {
        match &mut refinement.kind {
            RefinementKind::Merge {
                blue,
                pairs,
                rewired,
                ..
            } => {
                let (src, gi) = rewired.take().expect("undoing an unapplied refinement");
                self.apta.node_mut(src).guards[gi].target = Some(*blue);
                for &(l, r) in pairs.iter().rev() {
                    self.revert_union(l, r);
                }
            }
            RefinementKind::Extend { blue } => {
                self.apta.node_mut(*blue).red = false;
            }
            RefinementKind::Split {
                node,
                symbol,
                staged,
                ..
            } => {
                let stage = staged.take().expect("undoing an unapplied refinement");
                self.revert_split(*node, *symbol, stage);
            }
        }
    }

    /// Discards a tested-but-unapplied refinement, releasing its staged
    /// state. Never mutates the APTA.
    pub fn erase(&mut self, refinement: Refinement) {
        match &refinement.kind {
            RefinementKind::Merge { rewired, .. } => {
                debug_assert!(rewired.is_none(), "erasing an applied refinement")
            }
            RefinementKind::Split { staged, .. } => {
                debug_assert!(staged.is_none(), "erasing an applied refinement")
            }
            RefinementKind::Extend { .. } => {}
        }
        drop(refinement);
    }

    /// Whether the refinement's participating nodes are still in a state
    /// where applying it makes sense. Used by the streaming driver when
    /// replaying a previous batch's refinements.
    pub fn structurally_valid(&self, refinement: &Refinement) -> bool {
        match &refinement.kind {
            RefinementKind::Merge { red, blue, .. } => {
                self.apta.node(*red).red
                    && self.apta.find(*red) == *red
                    && self.apta.find(*blue) == *blue
                    && self.apta.is_blue(*blue)
            }
            RefinementKind::Extend { blue } => self.apta.is_blue(*blue),
            RefinementKind::Split { node, symbol, .. } => {
                self.apta.find(*node) == *node
                    && self
                        .apta
                        .node(*node)
                        .guards
                        .iter()
                        .any(|g| g.symbol == *symbol && g.target.is_some())
            }
        }
    }

    /// Re-tests a structurally valid refinement against the current state,
    /// returning a fresh refinement with up-to-date staging, or `None` when
    /// it no longer passes.
    pub fn retest(&mut self, refinement: &Refinement) -> Option<Refinement> {
        if !self.structurally_valid(refinement) {
            return None;
        }
        match &refinement.kind {
            RefinementKind::Merge { red, blue, .. } => self.test_merge(*red, *blue),
            RefinementKind::Extend { blue } => Some(self.extend_refinement(*blue)),
            RefinementKind::Split {
                node,
                symbol,
                attr,
                threshold,
                ..
            } => self.test_split(*node, *symbol, *attr, *threshold),
        }
    }

    /// All legal merges of `blue` into some red state, in red visitation
    /// order.
    pub fn candidate_merges(&mut self, blue: NodeId) -> RefinementSet {
        let reds = self.apta.red_states().collect_vec();
        let mut set = RefinementSet::new(self.config.tie_break);
        for red in reds {
            if let Some(r) = self.test_merge(red, blue) {
                set.push(r);
            }
        }
        set
    }

    /// The best supported refinement over the current frontier: for the
    /// first blue state without any legal merge, its promotion; otherwise
    /// the best-scoring merge across all blue states.
    pub fn best_refinement(&mut self) -> Option<Refinement> {
        let blues = self.apta.blue_states().collect_vec();
        let mut all = RefinementSet::new(self.config.tie_break);
        for blue in blues {
            if self.config.use_sinks && self.apta.is_sink(blue) {
                continue;
            }
            let candidates = self.candidate_merges(blue);
            if candidates.is_empty() {
                return Some(self.extend_refinement(blue));
            }
            all.extend(candidates);
        }
        all.into_best()
    }

    /// Probability the hypothesis assigns to reading `symbols` as a prefix,
    /// `None` when the walk falls off the model.
    pub fn prefix_probability(&self, symbols: &[SymbolId]) -> Option<f64> {
        let mut n = self.apta.find(self.apta.root());
        let mut p = 1.0;
        for &s in symbols {
            p *= self.apta.node(n).data.predict_score(Some(s));
            n = self.apta.child(n, s)?;
        }
        Some(p)
    }

    /// Probability of the full trace, including termination.
    pub fn trace_probability(&self, symbols: &[SymbolId]) -> Option<f64> {
        let mut n = self.apta.find(self.apta.root());
        let mut p = 1.0;
        for &s in symbols {
            p *= self.apta.node(n).data.predict_score(Some(s));
            n = self.apta.child(n, s)?;
        }
        Some(p * self.apta.node(n).data.predict_score(None))
    }

    /// The narrow inspection surface handed to equivalence oracles.
    pub fn hypothesis(&self) -> Hypothesis<'_> {
        Hypothesis { merger: self }
    }
}

impl std::fmt::Debug for Merger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut builder = tabled::builder::Builder::default();
        builder.push_record(["state", "color", "size", "finals", "access"]);
        for n in self.apta.merged_walk() {
            let node = self.apta.node(n);
            let color = if node.red {
                "red"
            } else if self.apta.is_blue(n) {
                "blue"
            } else {
                "white"
            };
            builder.push_record([
                node.number.to_string(),
                color.to_string(),
                node.size.to_string(),
                node.final_count.to_string(),
                node.access.iter().map(|s| s.to_string()).join(" "),
            ]);
        }
        write!(f, "{}", builder.build())
    }
}

/// What an equivalence oracle may see of the current hypothesis: stepping,
/// classification and probability lookups, nothing else.
pub struct Hypothesis<'a> {
    merger: &'a Merger,
}

impl Hypothesis<'_> {
    pub fn initial(&self) -> NodeId {
        self.merger.apta.find(self.merger.apta.root())
    }

    pub fn step(&self, state: NodeId, symbol: SymbolId) -> Option<NodeId> {
        self.merger.apta.child(state, symbol)
    }

    /// Runs a word through the hypothesis and asks the reached state for
    /// its type; `None` when the walk falls off the model or the state has
    /// no type evidence.
    pub fn classify(&self, symbols: &[SymbolId]) -> Option<TypeId> {
        let reached = self.merger.sift(symbols)?;
        self.merger.apta.node(reached).data.predict_type()
    }

    pub fn prefix_probability(&self, symbols: &[SymbolId]) -> Option<f64> {
        self.merger.prefix_probability(symbols)
    }

    pub fn trace_probability(&self, symbols: &[SymbolId]) -> Option<f64> {
        self.merger.trace_probability(symbols)
    }

    /// Number of states in the merged view.
    pub fn size(&self) -> usize {
        self.merger.apta.merged_walk().count()
    }
}
