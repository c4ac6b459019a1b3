use std::collections::VecDeque;

use fxhash::FxHashSet;

use crate::apta::Apta;
use crate::{NodeId, SymbolId};

/// Pre-order walk of the raw trie, following original-source links only.
///
/// The walk is deterministic (guard order) and finite: the raw trie is
/// loop-free, merge loops exist only through the union-find layer which
/// this walk ignores.
pub struct Walk<'a> {
    apta: &'a Apta,
    queue: VecDeque<NodeId>,
    seen: FxHashSet<NodeId>,
}

impl<'a> Walk<'a> {
    pub(crate) fn new(apta: &'a Apta) -> Self {
        let mut seen = FxHashSet::default();
        seen.insert(apta.root());
        Self {
            apta,
            queue: VecDeque::from([apta.root()]),
            seen,
        }
    }

    /// The original child of `current` under a guard, undoing the
    /// source-side rewiring an applied merge leaves behind.
    fn original_child(&self, current: NodeId, symbol: SymbolId, target: NodeId) -> Option<NodeId> {
        if self.apta.node(target).source == Some((current, symbol)) {
            return Some(target);
        }
        self.apta
            .class_members(self.apta.find(target))
            .into_iter()
            .find(|&m| self.apta.node(m).source == Some((current, symbol)))
    }
}

impl Iterator for Walk<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.queue.pop_front()?;
        for g in &self.apta.node(current).guards {
            let Some(target) = g.target else { continue };
            if let Some(child) = self.original_child(current, g.symbol, target) {
                if self.seen.insert(child) {
                    self.queue.push_back(child);
                }
            }
        }
        Some(current)
    }
}

/// Walk of the union-find-collapsed view: yields representatives only,
/// following edges whose source representative equals the current node and
/// whose target is not itself absorbed into another class.
pub struct MergedWalk<'a> {
    apta: &'a Apta,
    queue: VecDeque<NodeId>,
    seen: FxHashSet<NodeId>,
}

impl<'a> MergedWalk<'a> {
    pub(crate) fn new(apta: &'a Apta) -> Self {
        let root = apta.find(apta.root());
        let mut seen = FxHashSet::default();
        seen.insert(root);
        Self {
            apta,
            queue: VecDeque::from([root]),
            seen,
        }
    }

    fn push_children(&mut self, current: NodeId, reds_only: bool) {
        for m in self.apta.class_members(current) {
            for g in &self.apta.node(m).guards {
                let Some(target) = g.target else { continue };
                let node = self.apta.node(target);
                if node.representative.is_some() {
                    continue;
                }
                if node.source.map(|(s, _)| self.apta.find(s)) != Some(current) {
                    continue;
                }
                if reds_only && !node.red {
                    continue;
                }
                if self.seen.insert(target) {
                    self.queue.push_back(target);
                }
            }
        }
    }
}

impl Iterator for MergedWalk<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.queue.pop_front()?;
        self.push_children(current, false);
        Some(current)
    }
}

/// Blue-state filter of the merged view: descends through red states only
/// and yields their non-red children, in the deterministic merged-view
/// order.
pub struct BlueWalk<'a> {
    inner: MergedWalk<'a>,
}

impl<'a> BlueWalk<'a> {
    pub(crate) fn new(apta: &'a Apta) -> Self {
        Self {
            inner: MergedWalk::new(apta),
        }
    }
}

impl Iterator for BlueWalk<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        loop {
            let current = self.inner.queue.pop_front()?;
            if self.inner.apta.node(current).red {
                self.inner.push_children(current, false);
                continue;
            }
            return Some(current);
        }
    }
}

/// Red-state filter of the merged view.
pub struct RedWalk<'a> {
    inner: MergedWalk<'a>,
}

impl<'a> RedWalk<'a> {
    pub(crate) fn new(apta: &'a Apta) -> Self {
        Self {
            inner: MergedWalk::new(apta),
        }
    }
}

impl Iterator for RedWalk<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.inner.queue.pop_front()?;
        if !self.inner.apta.node(current).red {
            return None;
        }
        self.inner.push_children(current, true);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use crate::apta::Apta;
    use crate::config::Config;
    use crate::evaluation::evaluation_from_name;
    use crate::input::TraceStore;
    use itertools::Itertools;

    fn sample_apta() -> Apta {
        let config = Config::default();
        let eval = evaluation_from_name("counts", &config).unwrap();
        let mut apta = Apta::new(eval.as_ref(), true);
        let mut store = TraceStore::new();
        for symbols in [&[0u32, 0][..], &[0, 1], &[1]] {
            let tr = store.from_symbols(symbols, 0);
            apta.add_trace(eval.as_ref(), &tr);
        }
        apta
    }

    #[test]
    fn raw_walk_visits_every_node_once() {
        let apta = sample_apta();
        let order = apta.walk().collect_vec();
        assert_eq!(order.len(), apta.len());
        assert_eq!(order[0], apta.root());
        assert_eq!(order.iter().unique().count(), order.len());
    }

    #[test]
    fn walks_are_deterministic_and_restartable() {
        let apta = sample_apta();
        assert_eq!(apta.walk().collect_vec(), apta.walk().collect_vec());
        assert_eq!(
            apta.merged_walk().collect_vec(),
            apta.merged_walk().collect_vec()
        );
    }

    #[test]
    fn merged_walk_skips_absorbed_nodes() {
        let mut apta = sample_apta();
        let a = apta.child(apta.root(), 0).unwrap();
        let b = apta.child(apta.root(), 1).unwrap();
        apta.union(a, b);

        let order = apta.merged_walk().collect_vec();
        assert!(order.contains(&a));
        assert!(!order.contains(&b));
    }

    #[test]
    fn blue_states_are_children_of_reds() {
        let apta = sample_apta();
        // only the root is red, so its two children are blue
        let blues = apta.blue_states().collect_vec();
        let a = apta.child(apta.root(), 0).unwrap();
        let b = apta.child(apta.root(), 1).unwrap();
        assert_eq!(blues, vec![a, b]);
        assert_eq!(apta.red_states().collect_vec(), vec![apta.root()]);
    }

    #[test]
    fn blue_view_is_live() {
        let mut apta = sample_apta();
        let a = apta.child(apta.root(), 0).unwrap();
        apta.node_mut(a).red = true;
        let blues = apta.blue_states().collect_vec();
        // a's children became blue, a itself no longer shows up
        assert!(!blues.contains(&a));
        assert!(blues.contains(&apta.child(a, 0).unwrap()));
        assert!(blues.contains(&apta.child(a, 1).unwrap()));
    }
}
