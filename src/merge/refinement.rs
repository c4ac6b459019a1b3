use crate::config::TieBreak;
use crate::input::Tail;
use crate::{AttrId, NodeId, SymbolId};

/// One proposed reversible edit to the APTA.
///
/// Lifecycle: *proposed/tested* (returned by `test_merge`/`test_split`,
/// nothing applied) → *applied* (`Merger::doref`) → *undone*
/// (`Merger::undo`) or *discarded* (`Merger::erase`, never applied). A
/// refinement is owned by whoever proposed it until it is applied; applied
/// refinements live in the performed list of the driving search, which
/// undoes them in reverse order.
pub struct Refinement {
    pub score: f64,
    pub kind: RefinementKind,
}

pub enum RefinementKind {
    /// Union `blue`'s subtree into `red`, pairwise.
    Merge {
        red: NodeId,
        blue: NodeId,
        /// Every union recorded at test time, in application order. Undo
        /// walks this list backwards.
        pairs: Vec<(NodeId, NodeId)>,
        /// While applied: the source node and guard index whose target was
        /// rewritten from `blue` to `red`.
        rewired: Option<(NodeId, usize)>,
    },
    /// Promote a blue node to red. A color flip, no structural change.
    Extend { blue: NodeId },
    /// Materialize a guard bound on a splittable attribute below `node`
    /// and redistribute the affected tails.
    Split {
        node: NodeId,
        symbol: SymbolId,
        attr: AttrId,
        threshold: f64,
        /// Staged state while applied.
        staged: Option<SplitStage>,
    },
}

/// Undo bookkeeping of an applied split.
pub struct SplitStage {
    /// Position of the materialized bounded guard in the node's guard list.
    pub(crate) guard_index: usize,
    /// Arena length before the split created nodes; undo truncates back.
    pub(crate) arena_len_before: usize,
    /// Tails re-routed into the new branch, in re-routing order.
    pub(crate) moved: Vec<Tail>,
}

impl Refinement {
    pub(crate) fn merge(red: NodeId, blue: NodeId, score: f64, pairs: Vec<(NodeId, NodeId)>) -> Self {
        Self {
            score,
            kind: RefinementKind::Merge {
                red,
                blue,
                pairs,
                rewired: None,
            },
        }
    }

    pub(crate) fn extend(blue: NodeId, score: f64) -> Self {
        Self {
            score,
            kind: RefinementKind::Extend { blue },
        }
    }

    pub(crate) fn split(node: NodeId, symbol: SymbolId, attr: AttrId, threshold: f64, score: f64) -> Self {
        Self {
            score,
            kind: RefinementKind::Split {
                node,
                symbol,
                attr,
                threshold,
                staged: None,
            },
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self.kind, RefinementKind::Merge { .. })
    }

    /// The red-side node of this refinement.
    pub fn red_node(&self) -> NodeId {
        match self.kind {
            RefinementKind::Merge { red, .. } => red,
            RefinementKind::Extend { blue } => blue,
            RefinementKind::Split { node, .. } => node,
        }
    }

    pub fn blue_node(&self) -> Option<NodeId> {
        match self.kind {
            RefinementKind::Merge { blue, .. } => Some(blue),
            RefinementKind::Extend { blue } => Some(blue),
            RefinementKind::Split { .. } => None,
        }
    }
}

impl std::fmt::Debug for Refinement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RefinementKind::Merge { red, blue, .. } => {
                write!(f, "merge({red}, {blue}; {:.4})", self.score)
            }
            RefinementKind::Extend { blue } => write!(f, "extend({blue})"),
            RefinementKind::Split {
                node,
                symbol,
                attr,
                threshold,
                ..
            } => write!(f, "split({node}, {symbol}, a{attr} @ {threshold}; {:.4})", self.score),
        }
    }
}

/// An ordered collection of competing refinements.
///
/// Ranking is by score under the configured tie-break mode; insertion order
/// (the visitation order candidates were produced in) breaks remaining ties,
/// so the best refinement is reproducible for identical input.
pub struct RefinementSet {
    items: Vec<Refinement>,
    tie_break: TieBreak,
}

impl RefinementSet {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            items: Vec::new(),
            tie_break,
        }
    }

    pub fn push(&mut self, refinement: Refinement) {
        self.items.push(refinement);
    }

    pub fn extend(&mut self, other: RefinementSet) {
        self.items.extend(other.items);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Refinement> {
        self.items.iter()
    }

    /// All candidates, best first. The sort is stable, preserving the
    /// deterministic insertion order among equal scores.
    pub fn into_sorted(mut self) -> Vec<Refinement> {
        let invert = self.tie_break == TieBreak::LowestScore;
        self.items.sort_by(|a, b| {
            let ord = b
                .score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal);
            if invert {
                ord.reverse()
            } else {
                ord
            }
        });
        self.items
    }

    /// The best candidate, everything else is dropped (erased unapplied).
    pub fn into_best(self) -> Option<Refinement> {
        self.into_sorted().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_is_stable_under_ties() {
        let mut set = RefinementSet::new(TieBreak::HighestScore);
        set.push(Refinement::merge(1, 10, 0.5, vec![]));
        set.push(Refinement::merge(2, 10, 0.9, vec![]));
        set.push(Refinement::merge(3, 10, 0.9, vec![]));

        let sorted = set.into_sorted();
        assert_eq!(sorted[0].red_node(), 2);
        assert_eq!(sorted[1].red_node(), 3);
        assert_eq!(sorted[2].red_node(), 1);
    }

    #[test]
    fn lowest_score_mode_inverts_ranking() {
        let mut set = RefinementSet::new(TieBreak::LowestScore);
        set.push(Refinement::merge(1, 10, 0.5, vec![]));
        set.push(Refinement::merge(2, 10, 0.9, vec![]));
        assert_eq!(set.into_best().unwrap().red_node(), 1);
    }
}
