use std::collections::VecDeque;
use std::rc::Rc;

use crate::{AttrId, SymbolId, TypeId};

/// An observed trace: a finalized sequence of symbols with optional
/// per-symbol and per-trace attribute values, a type and a sequence number.
///
/// A trace is immutable once finalized. Positions are addressed through
/// [`Tail`] cursors; the position one past the last symbol is the sentinel
/// tail that marks acceptance with the trace type.
#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    sequence: u64,
    ttype: TypeId,
    symbols: Vec<SymbolId>,
    values: Vec<Vec<f64>>,
    attrs: Vec<f64>,
}

impl Trace {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn ttype(&self) -> TypeId {
        self.ttype
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> &[SymbolId] {
        &self.symbols
    }

    /// Trace-level attribute value, `0.0` when not recorded.
    pub fn attr(&self, attr: AttrId) -> f64 {
        self.attrs.get(attr as usize).copied().unwrap_or(0.0)
    }

    /// Cursor at the first position. For the empty trace this is already the
    /// sentinel.
    pub fn head(self: &Rc<Self>) -> Tail {
        Tail {
            trace: Rc::clone(self),
            index: 0,
        }
    }
}

/// One position in a trace; the atomic unit fed into the trie.
///
/// A tail is a cheap cursor into a reference-counted trace. The sentinel
/// tail at position `len` reports `symbol() == None` and `is_final()`.
#[derive(Clone, Debug)]
pub struct Tail {
    trace: Rc<Trace>,
    index: usize,
}

impl Tail {
    /// The symbol at this position, `None` for the sentinel.
    pub fn symbol(&self) -> Option<SymbolId> {
        self.trace.symbols.get(self.index).copied()
    }

    /// Whether this is the sentinel position terminating the trace.
    pub fn is_final(&self) -> bool {
        self.index == self.trace.symbols.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Attribute value at this position, `0.0` when not recorded.
    pub fn value(&self, attr: AttrId) -> f64 {
        self.trace
            .values
            .get(self.index)
            .and_then(|row| row.get(attr as usize))
            .copied()
            .unwrap_or(0.0)
    }

    /// All attribute values at this position.
    pub fn values(&self) -> &[f64] {
        self.trace
            .values
            .get(self.index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The next position, `None` past the sentinel.
    pub fn future(&self) -> Option<Tail> {
        if self.index < self.trace.symbols.len() {
            Some(Tail {
                trace: Rc::clone(&self.trace),
                index: self.index + 1,
            })
        } else {
            None
        }
    }

    /// The previous position, `None` at the head.
    pub fn past(&self) -> Option<Tail> {
        if self.index > 0 {
            Some(Tail {
                trace: Rc::clone(&self.trace),
                index: self.index - 1,
            })
        } else {
            None
        }
    }

    pub fn trace(&self) -> &Rc<Trace> {
        &self.trace
    }

    pub fn ttype(&self) -> TypeId {
        self.trace.ttype
    }

    /// Identity of the underlying (trace, position) pair.
    pub fn same_position(&self, other: &Tail) -> bool {
        Rc::ptr_eq(&self.trace, &other.trace) && self.index == other.index
    }
}

/// Owns the traces of a run and hands out reference-counted handles.
///
/// A trace stays alive as long as the store or the APTA holds a handle and
/// is destroyed when the last handle drops.
#[derive(Debug, Default)]
pub struct TraceStore {
    traces: Vec<Rc<Trace>>,
    next_sequence: u64,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalizes a trace with full per-symbol attribute rows.
    pub fn create(
        &mut self,
        symbols: Vec<SymbolId>,
        values: Vec<Vec<f64>>,
        ttype: TypeId,
        attrs: Vec<f64>,
    ) -> Rc<Trace> {
        debug_assert!(values.is_empty() || values.len() == symbols.len());
        let trace = Rc::new(Trace {
            sequence: self.next_sequence,
            ttype,
            symbols,
            values,
            attrs,
        });
        self.next_sequence += 1;
        self.traces.push(Rc::clone(&trace));
        trace
    }

    /// Finalizes a plain trace without attribute values.
    pub fn from_symbols(&mut self, symbols: &[SymbolId], ttype: TypeId) -> Rc<Trace> {
        self.create(symbols.to_vec(), Vec::new(), ttype, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Trace>> {
        self.traces.iter()
    }
}

/// One event produced by a trace source.
#[derive(Clone, Debug, PartialEq)]
pub enum TailEvent {
    /// The next symbol of the current trace, with its attribute values.
    Symbol { symbol: SymbolId, values: Vec<f64> },
    /// The current trace ended with the given type.
    EndOfTrace { ttype: TypeId },
    /// No further traces.
    EndOfInput,
}

/// The collaborator boundary towards input parsing: a lazy, finite sequence
/// of symbol events, terminated per trace by an explicit end marker.
///
/// Concrete readers (Abbadingo, CSV, ...) live outside the core and only
/// need to implement this.
pub trait TailSource {
    fn read_next_tail(&mut self) -> TailEvent;
}

/// In-memory tail source over pre-classified symbol sequences. Used by tests
/// and by the streaming driver's unit tests.
#[derive(Debug, Default)]
pub struct VecSource {
    queue: VecDeque<(Vec<SymbolId>, TypeId)>,
    emitting: Option<(VecDeque<SymbolId>, TypeId)>,
}

impl VecSource {
    pub fn new<I: IntoIterator<Item = (Vec<SymbolId>, TypeId)>>(traces: I) -> Self {
        Self {
            queue: traces.into_iter().collect(),
            emitting: None,
        }
    }
}

impl TailSource for VecSource {
    fn read_next_tail(&mut self) -> TailEvent {
        loop {
            if let Some((symbols, ttype)) = &mut self.emitting {
                return match symbols.pop_front() {
                    Some(symbol) => TailEvent::Symbol {
                        symbol,
                        values: Vec::new(),
                    },
                    None => {
                        let ttype = *ttype;
                        self.emitting = None;
                        TailEvent::EndOfTrace { ttype }
                    }
                };
            }
            match self.queue.pop_front() {
                Some((symbols, ttype)) => {
                    self.emitting = Some((symbols.into_iter().collect(), ttype));
                }
                None => return TailEvent::EndOfInput,
            }
        }
    }
}

/// Reads full traces from a source into the store until end of input.
pub fn read_all(source: &mut dyn TailSource, store: &mut TraceStore) -> Vec<Rc<Trace>> {
    let mut out = Vec::new();
    let mut symbols = Vec::new();
    let mut values = Vec::new();
    loop {
        match source.read_next_tail() {
            TailEvent::Symbol { symbol, values: v } => {
                symbols.push(symbol);
                values.push(v);
            }
            TailEvent::EndOfTrace { ttype } => {
                out.push(store.create(
                    std::mem::take(&mut symbols),
                    std::mem::take(&mut values),
                    ttype,
                    Vec::new(),
                ));
            }
            TailEvent::EndOfInput => return out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_cursors_walk_the_chain() {
        let mut store = TraceStore::new();
        let tr = store.from_symbols(&[0, 1, 2], 0);
        let head = tr.head();
        assert_eq!(head.symbol(), Some(0));
        let second = head.future().unwrap();
        assert_eq!(second.symbol(), Some(1));
        assert!(second.past().unwrap().same_position(&head));

        let sentinel = second.future().unwrap().future().unwrap();
        assert_eq!(sentinel.symbol(), None);
        assert!(sentinel.is_final());
        assert!(sentinel.future().is_none());
    }

    #[test]
    fn empty_trace_head_is_sentinel() {
        let mut store = TraceStore::new();
        let tr = store.from_symbols(&[], 1);
        let head = tr.head();
        assert!(head.is_final());
        assert_eq!(head.ttype(), 1);
    }

    #[test]
    fn vec_source_emits_end_markers() {
        let mut source = VecSource::new([(vec![0, 1], 0), (vec![], 1)]);
        let mut store = TraceStore::new();
        let traces = read_all(&mut source, &mut store);
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].symbols(), &[0, 1]);
        assert_eq!(traces[1].ttype(), 1);
        assert_eq!(source.read_next_tail(), TailEvent::EndOfInput);
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut store = TraceStore::new();
        let a = store.from_symbols(&[0], 0);
        let b = store.from_symbols(&[1], 0);
        assert!(a.sequence() < b.sequence());
    }
}
