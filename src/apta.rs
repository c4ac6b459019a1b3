use std::rc::Rc;

use tracing::trace;

use crate::evaluation::{EvalData, Evaluation};
use crate::input::{Tail, Trace};
use crate::{AttrId, NodeId, SymbolId};

pub mod walk;
pub use walk::{BlueWalk, MergedWalk, RedWalk, Walk};

/// A guarded transition out of a node, keyed by symbol and refined by
/// attribute bounds for data-aware learning.
///
/// Guards are matched in order; the first guard whose bounds are satisfied
/// wins. Two guards for the same symbol with overlapping bounds are a
/// configuration error, not something the engine detects.
#[derive(Clone, Debug, PartialEq)]
pub struct Guard {
    pub symbol: SymbolId,
    /// Attribute lower bounds: value must be `>=` the bound.
    pub mins: Vec<(AttrId, f64)>,
    /// Attribute upper bounds: value must be `<` the bound.
    pub maxs: Vec<(AttrId, f64)>,
    pub target: Option<NodeId>,
}

impl Guard {
    /// An unbounded guard for `symbol`.
    pub fn plain(symbol: SymbolId) -> Self {
        Self {
            symbol,
            mins: Vec::new(),
            maxs: Vec::new(),
            target: None,
        }
    }

    /// Whether the given attribute values satisfy all bounds.
    pub fn accepts(&self, values: &[f64]) -> bool {
        let value = |attr: AttrId| values.get(attr as usize).copied().unwrap_or(0.0);
        self.mins.iter().all(|&(a, bound)| value(a) >= bound)
            && self.maxs.iter().all(|&(a, bound)| value(a) < bound)
    }

    /// Whether two guards carry exactly the same bounds.
    pub fn same_bounds(&self, other: &Guard) -> bool {
        self.mins == other.mins && self.maxs == other.maxs
    }
}

/// One node of the APTA.
///
/// `number` is assigned at creation and never reused for a different node.
/// `source` is the provenance link into the original trie; merging never
/// deletes it. The union-find bookkeeping is an explicit, reversible list:
/// `representative` points at the node this one is merged into, `represents`
/// lists the nodes merged directly into this one, in merge order, so undoing
/// a union removes exactly one entry. There is no path compression.
pub struct Node {
    pub number: NodeId,
    pub source: Option<(NodeId, SymbolId)>,
    pub red: bool,
    pub depth: u32,
    pub size: u32,
    pub final_count: u32,
    pub sink: Option<u32>,
    pub access: Vec<SymbolId>,
    pub guards: Vec<Guard>,
    pub(crate) representative: Option<NodeId>,
    pub(crate) represents: Vec<NodeId>,
    pub data: Box<dyn EvalData>,
    pub tails: Vec<Tail>,
}

impl Node {
    pub fn representative(&self) -> Option<NodeId> {
        self.representative
    }

    pub fn represents(&self) -> &[NodeId] {
        &self.represents
    }

    /// Whether this node has been merged into another class.
    pub fn is_absorbed(&self) -> bool {
        self.representative.is_some()
    }

    /// Index of the first own guard accepting `(symbol, values)`.
    pub fn own_guard(&self, symbol: SymbolId, values: &[f64]) -> Option<usize> {
        self.guards
            .iter()
            .position(|g| g.symbol == symbol && g.accepts(values))
    }
}

/// The augmented prefix tree acceptor: an arena of nodes built by prefix
/// sharing, with a union-find layer that lets sets of nodes act as one
/// merged state without deleting structure.
pub struct Apta {
    nodes: Vec<Node>,
    root: NodeId,
    store_tails: bool,
}

impl Apta {
    pub fn new(eval: &dyn Evaluation, store_tails: bool) -> Self {
        let root = Node {
            number: 0,
            source: None,
            red: true,
            depth: 0,
            size: 0,
            final_count: 0,
            sink: None,
            access: Vec::new(),
            guards: Vec::new(),
            representative: None,
            represents: Vec::new(),
            data: eval.fresh_data(),
            tails: Vec::new(),
        };
        Self {
            nodes: vec![root],
            root: 0,
            store_tails,
        }
    }

    /// Reassembles an APTA from deserialized nodes. Used by snapshot
    /// reading only; invariants are the reader's responsibility.
    pub(crate) fn from_raw_parts(nodes: Vec<Node>, root: NodeId, store_tails: bool) -> Self {
        Self {
            nodes,
            root,
            store_tails,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, n: NodeId) -> &Node {
        &self.nodes[n as usize]
    }

    pub fn node_mut(&mut self, n: NodeId) -> &mut Node {
        &mut self.nodes[n as usize]
    }

    /// Mutable access to two distinct nodes at once.
    pub(crate) fn pair_mut(&mut self, a: NodeId, b: NodeId) -> (&mut Node, &mut Node) {
        assert_ne!(a, b, "pair_mut requires distinct nodes");
        let (a, b) = (a as usize, b as usize);
        if a < b {
            let (lo, hi) = self.nodes.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.nodes.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// The canonical node of `n`'s union-find class. Safe to call during
    /// partial merge sequences; callers must re-resolve through this before
    /// every transition dereference.
    pub fn find(&self, mut n: NodeId) -> NodeId {
        while let Some(rep) = self.nodes[n as usize].representative {
            n = rep;
        }
        n
    }

    /// All nodes of the class rooted at representative `rep`, the
    /// representative first, then members in merge order.
    pub fn class_members(&self, rep: NodeId) -> Vec<NodeId> {
        let mut out = vec![rep];
        let mut i = 0;
        while i < out.len() {
            let n = out[i];
            out.extend(self.nodes[n as usize].represents.iter().copied());
            i += 1;
        }
        out
    }

    /// Resolves a transition through the representative's merged transition
    /// set: the first accepting guard of the class wins, the target is
    /// dereferenced through [`find`].
    ///
    /// [`find`]: Apta::find
    pub fn child_with(&self, n: NodeId, symbol: SymbolId, values: &[f64]) -> Option<NodeId> {
        let rep = self.find(n);
        for m in self.class_members(rep) {
            for g in &self.nodes[m as usize].guards {
                if g.symbol == symbol && g.accepts(values) {
                    if let Some(t) = g.target {
                        return Some(self.find(t));
                    }
                }
            }
        }
        None
    }

    /// [`child_with`] without attribute values.
    ///
    /// [`child_with`]: Apta::child_with
    pub fn child(&self, n: NodeId, symbol: SymbolId) -> Option<NodeId> {
        self.child_with(n, symbol, &[])
    }

    /// The class child reached through a guard with exactly the same bounds
    /// as `like`, if any.
    pub(crate) fn matching_guard_child(
        &self,
        rep: NodeId,
        symbol: SymbolId,
        like: &Guard,
    ) -> Option<NodeId> {
        for m in self.class_members(rep) {
            for g in &self.nodes[m as usize].guards {
                if g.symbol == symbol && g.same_bounds(like) {
                    if let Some(t) = g.target {
                        return Some(self.find(t));
                    }
                }
            }
        }
        None
    }

    /// Blue nodes are exactly the unabsorbed non-red children of red
    /// states. This is a live view, never cached.
    pub fn is_blue(&self, n: NodeId) -> bool {
        let node = self.node(n);
        !node.red
            && node.representative.is_none()
            && node
                .source
                .is_some_and(|(s, _)| self.node(self.find(s)).red)
    }

    pub fn is_white(&self, n: NodeId) -> bool {
        let node = self.node(n);
        !node.red && node.representative.is_none() && !self.is_blue(n)
    }

    pub fn is_sink(&self, n: NodeId) -> bool {
        let node = self.node(n);
        node.sink.is_some() || node.data.sink_type().is_some()
    }

    pub fn mark_sink(&mut self, n: NodeId, tag: u32) {
        self.node_mut(n).sink = Some(tag);
    }

    /// Creates a fresh node below `source` under `symbol`.
    pub(crate) fn new_node(
        &mut self,
        data: Box<dyn EvalData>,
        source: NodeId,
        symbol: SymbolId,
    ) -> NodeId {
        let number = self.nodes.len() as NodeId;
        let parent = self.node(source);
        let mut access = parent.access.clone();
        access.push(symbol);
        let depth = parent.depth + 1;
        self.nodes.push(Node {
            number,
            source: Some((source, symbol)),
            red: false,
            depth,
            size: 0,
            final_count: 0,
            sink: None,
            access,
            guards: Vec::new(),
            representative: None,
            represents: Vec::new(),
            data,
            tails: Vec::new(),
        });
        number
    }

    /// Removes the newest nodes down to `len` arena entries. Only valid for
    /// nodes staged by an unapplied or just-undone refinement.
    pub(crate) fn truncate_nodes(&mut self, len: usize) {
        debug_assert!(self
            .nodes
            .iter()
            .skip(len)
            .all(|n| n.size == 0 && n.represents.is_empty() && n.representative.is_none()));
        self.nodes.truncate(len);
    }

    /// Adds one finalized trace to the raw trie, folding every tail into
    /// the statistics of the node it leaves.
    pub fn add_trace(&mut self, eval: &dyn Evaluation, trace: &Rc<Trace>) {
        trace!(trace = trace.sequence(), "adding trace to apta");
        self.add_suffix(eval, self.root, trace.head());
    }

    /// Drops a tail chain into the raw trie starting at `start`, creating
    /// nodes as needed. Used by trie construction and by split refinements
    /// re-routing tails.
    pub(crate) fn add_suffix(&mut self, eval: &dyn Evaluation, start: NodeId, tail: Tail) {
        let mut n = start;
        let mut tail = tail;
        loop {
            {
                let store = self.store_tails;
                let node = self.node_mut(n);
                node.size += 1;
                node.data.add_tail(&tail);
                if store {
                    node.tails.push(tail.clone());
                }
            }
            if tail.is_final() {
                self.node_mut(n).final_count += 1;
                return;
            }
            let symbol = tail.symbol().expect("non-final tail carries a symbol");
            let next = match self.node(n).own_guard(symbol, tail.values()) {
                Some(gi) => match self.node(n).guards[gi].target {
                    Some(t) => t,
                    None => {
                        let t = self.new_node(eval.fresh_data(), n, symbol);
                        self.node_mut(n).guards[gi].target = Some(t);
                        t
                    }
                },
                None => {
                    let t = self.new_node(eval.fresh_data(), n, symbol);
                    let mut guard = Guard::plain(symbol);
                    guard.target = Some(t);
                    self.node_mut(n).guards.push(guard);
                    t
                }
            };
            n = next;
            tail = tail.future().expect("non-final tail has a successor");
        }
    }

    /// Exact inverse of [`add_suffix`] over existing structure: walks the
    /// tail chain from `start` subtracting its contribution. Nodes are
    /// never deleted here.
    ///
    /// [`add_suffix`]: Apta::add_suffix
    pub(crate) fn remove_suffix(&mut self, start: NodeId, tail: Tail) {
        let mut n = start;
        let mut tail = tail;
        loop {
            {
                let node = self.node_mut(n);
                node.size -= 1;
                node.data.del_tail(&tail);
                if let Some(pos) = node.tails.iter().position(|t| t.same_position(&tail)) {
                    node.tails.remove(pos);
                }
            }
            if tail.is_final() {
                self.node_mut(n).final_count -= 1;
                return;
            }
            let symbol = tail.symbol().expect("non-final tail carries a symbol");
            let next = self
                .node(n)
                .own_guard(symbol, tail.values())
                .and_then(|gi| self.node(n).guards[gi].target)
                .expect("removed suffix must run over existing structure");
            n = next;
            tail = tail.future().expect("non-final tail has a successor");
        }
    }

    /// Resolves the state reached by an access sequence through the merged
    /// view, `None` if the sequence falls off the trie.
    pub fn sift(&self, symbols: &[SymbolId]) -> Option<NodeId> {
        let mut n = self.find(self.root);
        for &s in symbols {
            n = self.child(n, s)?;
        }
        Some(n)
    }

    /// Unions `blue`'s class into `red`, folding size bookkeeping. The
    /// evaluation payload fold is the caller's responsibility.
    pub(crate) fn union(&mut self, red: NodeId, blue: NodeId) {
        debug_assert_ne!(red, blue);
        debug_assert!(self.nodes[red as usize].representative.is_none());
        debug_assert!(self.nodes[blue as usize].representative.is_none());
        let (size, finals) = {
            let b = self.node(blue);
            (b.size, b.final_count)
        };
        self.node_mut(blue).representative = Some(red);
        let r = self.node_mut(red);
        r.represents.push(blue);
        r.size += size;
        r.final_count += finals;
    }

    /// Exact inverse of [`union`]: removes exactly one `represents` entry.
    ///
    /// [`union`]: Apta::union
    pub(crate) fn ununion(&mut self, red: NodeId, blue: NodeId) {
        let (size, finals) = {
            let b = self.node(blue);
            (b.size, b.final_count)
        };
        let popped = self.node_mut(red).represents.pop();
        debug_assert_eq!(popped, Some(blue), "ununion out of merge order");
        let r = self.node_mut(red);
        r.size -= size;
        r.final_count -= finals;
        self.node_mut(blue).representative = None;
    }

    /// Pre-order walk of the raw trie.
    pub fn walk(&self) -> Walk<'_> {
        Walk::new(self)
    }

    /// Walk of the union-find-collapsed view.
    pub fn merged_walk(&self) -> MergedWalk<'_> {
        MergedWalk::new(self)
    }

    /// Blue-state filter of the merged view.
    pub fn blue_states(&self) -> BlueWalk<'_> {
        BlueWalk::new(self)
    }

    /// Red-state filter of the merged view.
    pub fn red_states(&self) -> RedWalk<'_> {
        RedWalk::new(self)
    }

    pub fn red_count(&self) -> usize {
        self.red_states().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::evaluation::evaluation_from_name;
    use crate::input::TraceStore;

    fn counts_apta() -> (Apta, Box<dyn Evaluation>, TraceStore) {
        let config = Config::default();
        let eval = evaluation_from_name("counts", &config).unwrap();
        let apta = Apta::new(eval.as_ref(), true);
        (apta, eval, TraceStore::new())
    }

    #[test]
    fn prefix_sharing_is_structural() {
        let (mut apta, eval, mut store) = counts_apta();
        let ab = store.from_symbols(&[0, 1], 0);
        let ac = store.from_symbols(&[0, 2], 0);
        apta.add_trace(eval.as_ref(), &ab);
        apta.add_trace(eval.as_ref(), &ac);

        // root, shared "a" node, "b" node, "c" node
        assert_eq!(apta.len(), 4);
        let a = apta.child(apta.root(), 0).unwrap();
        assert_eq!(apta.node(a).size, 2);
        let b = apta.child(a, 1).unwrap();
        let c = apta.child(a, 2).unwrap();
        assert_ne!(b, c);
        assert_eq!(apta.node(b).access, vec![0, 1]);
    }

    #[test]
    fn find_resolves_chains_and_stays_stable() {
        let (mut apta, eval, mut store) = counts_apta();
        for tr in [
            store.from_symbols(&[0], 0),
            store.from_symbols(&[1], 0),
            store.from_symbols(&[2], 0),
        ] {
            apta.add_trace(eval.as_ref(), &tr);
        }
        let a = apta.child(apta.root(), 0).unwrap();
        let b = apta.child(apta.root(), 1).unwrap();
        let c = apta.child(apta.root(), 2).unwrap();

        apta.union(a, b);
        apta.union(a, c);
        assert_eq!(apta.find(b), a);
        assert_eq!(apta.find(c), a);
        assert_eq!(apta.find(a), a);

        // unrelated merges elsewhere must not disturb representatives
        let root = apta.root();
        assert_eq!(apta.find(root), root);

        apta.ununion(a, c);
        assert_eq!(apta.find(c), c);
        assert_eq!(apta.find(b), a);
    }

    #[test]
    fn child_resolves_through_merged_transition_set() {
        let (mut apta, eval, mut store) = counts_apta();
        let xa = store.from_symbols(&[0, 2], 0);
        let yb = store.from_symbols(&[1, 3], 0);
        apta.add_trace(eval.as_ref(), &xa);
        apta.add_trace(eval.as_ref(), &yb);

        let x = apta.child(apta.root(), 0).unwrap();
        let y = apta.child(apta.root(), 1).unwrap();
        assert_eq!(apta.child(x, 3), None);

        apta.union(x, y);
        // y's transition on 3 is now part of x's effective set
        assert!(apta.child(x, 3).is_some());
        assert_eq!(apta.child(x, 3), apta.child(y, 3));
    }

    #[test]
    fn guards_match_first_by_bounds() {
        let (mut apta, eval, mut store) = counts_apta();
        let tr = store.from_symbols(&[0], 0);
        apta.add_trace(eval.as_ref(), &tr);
        let plain_child = apta.child(apta.root(), 0).unwrap();

        // materialize a bounded guard in front of the plain one
        let bounded_child = apta.new_node(eval.fresh_data(), apta.root(), 0);
        let root = apta.root();
        let guard = Guard {
            symbol: 0,
            mins: Vec::new(),
            maxs: vec![(0, 0.5)],
            target: Some(bounded_child),
        };
        apta.node_mut(root).guards.insert(0, guard);

        assert_eq!(apta.child_with(root, 0, &[0.2]), Some(bounded_child));
        assert_eq!(apta.child_with(root, 0, &[0.7]), Some(plain_child));
    }

    #[test]
    fn sift_follows_access_sequences() {
        let (mut apta, eval, mut store) = counts_apta();
        let tr = store.from_symbols(&[0, 1, 0], 0);
        apta.add_trace(eval.as_ref(), &tr);
        let reached = apta.sift(&[0, 1]).unwrap();
        assert_eq!(apta.node(reached).access, vec![0, 1]);
        assert_eq!(apta.sift(&[1]), None);
    }
}
