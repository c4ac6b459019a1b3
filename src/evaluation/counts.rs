use std::any::Any;

use fxhash::FxHashMap;
use serde_json::{json, Value};

use crate::evaluation::{EvalData, Evaluation};
use crate::input::{Tail, Vocabulary};
use crate::serialize::SnapshotError;
use crate::{SymbolId, TypeId};

/// Count-driven statistics: how often each next symbol was observed and how
/// often the trace ended here, per type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CountsData {
    symbol_counts: FxHashMap<SymbolId, u64>,
    type_counts: FxHashMap<TypeId, u64>,
    finals: u64,
    total: u64,
}

impl CountsData {
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn finals(&self) -> u64 {
        self.finals
    }

    pub fn symbol_count(&self, symbol: SymbolId) -> u64 {
        self.symbol_counts.get(&symbol).copied().unwrap_or(0)
    }

    /// The most frequent final type, smallest id on ties, `None` when no
    /// trace ends here.
    pub fn majority_type(&self) -> Option<TypeId> {
        self.type_counts
            .iter()
            .map(|(&t, &c)| (t, c))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(t, _)| t)
    }
}

fn add_count<K: std::hash::Hash + Eq>(map: &mut FxHashMap<K, u64>, key: K, amount: u64) {
    *map.entry(key).or_insert(0) += amount;
}

fn sub_count<K: std::hash::Hash + Eq>(map: &mut FxHashMap<K, u64>, key: K, amount: u64) {
    let count = map
        .get_mut(&key)
        .expect("subtracting a count that was never added");
    *count = count
        .checked_sub(amount)
        .expect("count underflow, update/undo out of balance");
    if *count == 0 {
        map.remove(&key);
    }
}

impl EvalData for CountsData {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn add_tail(&mut self, tail: &Tail) {
        self.total += 1;
        match tail.symbol() {
            Some(symbol) => add_count(&mut self.symbol_counts, symbol, 1),
            None => {
                self.finals += 1;
                add_count(&mut self.type_counts, tail.ttype(), 1);
            }
        }
    }

    fn del_tail(&mut self, tail: &Tail) {
        self.total -= 1;
        match tail.symbol() {
            Some(symbol) => sub_count(&mut self.symbol_counts, symbol, 1),
            None => {
                self.finals -= 1;
                sub_count(&mut self.type_counts, tail.ttype(), 1);
            }
        }
    }

    fn update(&mut self, other: &dyn EvalData) {
        let other = other
            .as_any()
            .downcast_ref::<CountsData>()
            .expect("mismatched evaluation payloads");
        for (&symbol, &count) in &other.symbol_counts {
            add_count(&mut self.symbol_counts, symbol, count);
        }
        for (&ttype, &count) in &other.type_counts {
            add_count(&mut self.type_counts, ttype, count);
        }
        self.finals += other.finals;
        self.total += other.total;
    }

    fn undo(&mut self, other: &dyn EvalData) {
        let other = other
            .as_any()
            .downcast_ref::<CountsData>()
            .expect("mismatched evaluation payloads");
        for (&symbol, &count) in &other.symbol_counts {
            sub_count(&mut self.symbol_counts, symbol, count);
        }
        for (&ttype, &count) in &other.type_counts {
            sub_count(&mut self.type_counts, ttype, count);
        }
        self.finals -= other.finals;
        self.total -= other.total;
    }

    fn predict_score(&self, symbol: Option<SymbolId>) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let count = match symbol {
            Some(s) => self.symbol_count(s),
            None => self.finals,
        };
        count as f64 / self.total as f64
    }

    fn predict_type(&self) -> Option<TypeId> {
        self.majority_type()
    }

    fn state_label(&self, vocab: &Vocabulary) -> String {
        match self.majority_type() {
            Some(t) => format!("{}:{}", vocab.type_name(t), self.total),
            None => format!("-:{}", self.total),
        }
    }

    fn write_json(&self, vocab: &Vocabulary) -> Value {
        let mut symbols = serde_json::Map::new();
        for (&symbol, &count) in &self.symbol_counts {
            symbols.insert(vocab.symbol_name(symbol).to_string(), json!(count));
        }
        let mut types = serde_json::Map::new();
        for (&ttype, &count) in &self.type_counts {
            types.insert(vocab.type_name(ttype).to_string(), json!(count));
        }
        json!({ "symbols": symbols, "types": types })
    }

    fn read_json(&mut self, value: &Value, vocab: &mut Vocabulary) -> Result<(), SnapshotError> {
        self.reset();
        let symbols = value
            .get("symbols")
            .and_then(Value::as_object)
            .ok_or_else(|| SnapshotError::malformed("counts payload misses `symbols`"))?;
        for (name, count) in symbols {
            let count = count
                .as_u64()
                .ok_or_else(|| SnapshotError::malformed("symbol count is not an integer"))?;
            add_count(&mut self.symbol_counts, vocab.symbol_id(name), count);
            self.total += count;
        }
        let types = value
            .get("types")
            .and_then(Value::as_object)
            .ok_or_else(|| SnapshotError::malformed("counts payload misses `types`"))?;
        for (name, count) in types {
            let count = count
                .as_u64()
                .ok_or_else(|| SnapshotError::malformed("type count is not an integer"))?;
            add_count(&mut self.type_counts, vocab.type_id(name), count);
            self.finals += count;
            self.total += count;
        }
        Ok(())
    }
}

/// The count-driven strategy: two states are compatible unless they carry
/// conflicting majority final types; candidate merges are ranked by the
/// amount of overlapping evidence.
#[derive(Debug, Default)]
pub struct Counts {
    inconsistency_found: bool,
    overlap: u64,
}

impl Evaluation for Counts {
    fn name(&self) -> &'static str {
        "counts"
    }

    fn fresh_data(&self) -> Box<dyn EvalData> {
        Box::<CountsData>::default()
    }

    fn reset(&mut self) {
        self.inconsistency_found = false;
        self.overlap = 0;
    }

    fn consistent(&mut self, left: &dyn EvalData, right: &dyn EvalData) -> bool {
        if self.inconsistency_found {
            return false;
        }
        let l = left
            .as_any()
            .downcast_ref::<CountsData>()
            .expect("mismatched evaluation payloads");
        let r = right
            .as_any()
            .downcast_ref::<CountsData>()
            .expect("mismatched evaluation payloads");

        if let (Some(lt), Some(rt)) = (l.majority_type(), r.majority_type()) {
            if lt != rt {
                self.inconsistency_found = true;
                return false;
            }
        }

        for (&symbol, &count) in &l.symbol_counts {
            self.overlap += count.min(r.symbol_count(symbol));
        }
        self.overlap += l.finals.min(r.finals);
        true
    }

    fn compute_score(&self, _left: &dyn EvalData, _right: &dyn EvalData) -> f64 {
        self.overlap as f64
    }

    fn split_score(&self, left: &dyn EvalData, right: &dyn EvalData) -> f64 {
        let l = left
            .as_any()
            .downcast_ref::<CountsData>()
            .expect("mismatched evaluation payloads");
        let r = right
            .as_any()
            .downcast_ref::<CountsData>()
            .expect("mismatched evaluation payloads");
        if l.total == 0 || r.total == 0 {
            return 0.0;
        }
        // total variation between the two partitions' next-event profiles
        let symbols: std::collections::BTreeSet<SymbolId> = l
            .symbol_counts
            .keys()
            .chain(r.symbol_counts.keys())
            .copied()
            .collect();
        let mut distance = 0.0;
        for symbol in symbols {
            let lp = l.symbol_count(symbol) as f64 / l.total as f64;
            let rp = r.symbol_count(symbol) as f64 / r.total as f64;
            distance += (lp - rp).abs();
        }
        distance + (l.finals as f64 / l.total as f64 - r.finals as f64 / r.total as f64).abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::TraceStore;

    fn folded(data: &mut CountsData, store: &mut TraceStore, symbols: &[SymbolId], ttype: TypeId) {
        let tr = store.from_symbols(symbols, ttype);
        let mut tail = Some(tr.head());
        while let Some(t) = tail {
            let done = t.is_final();
            data.add_tail(&t);
            if done {
                break;
            }
            tail = t.future();
        }
    }

    #[test]
    fn update_undo_is_identity() {
        let mut store = TraceStore::new();
        let mut left = CountsData::default();
        let mut right = CountsData::default();
        folded(&mut left, &mut store, &[0, 1], 0);
        folded(&mut right, &mut store, &[0, 0, 2], 1);

        let before = left.clone();
        left.update(&right);
        assert_ne!(before, left);
        left.undo(&right);
        assert_eq!(before, left);
    }

    #[test]
    fn conflicting_majority_types_are_inconsistent() {
        let mut store = TraceStore::new();
        let mut eval = Counts::default();
        let mut left = CountsData::default();
        let mut right = CountsData::default();
        folded(&mut left, &mut store, &[], 0);
        folded(&mut right, &mut store, &[], 1);

        eval.reset();
        assert!(!eval.consistent(&left, &right));
        // stays inconsistent for the remainder of this merge test
        assert!(!eval.consistent(&left, &left));
    }

    #[test]
    fn overlap_accumulates_across_pairs() {
        let mut store = TraceStore::new();
        let mut eval = Counts::default();
        let mut left = CountsData::default();
        let mut right = CountsData::default();
        folded(&mut left, &mut store, &[0, 0], 0);
        folded(&mut right, &mut store, &[0], 0);

        eval.reset();
        assert!(eval.consistent(&left, &right));
        assert!(eval.consistent(&left, &right));
        assert_eq!(eval.compute_score(&left, &right), 4.0);
    }

    #[test]
    fn majority_prefers_smallest_id_on_tie() {
        let mut store = TraceStore::new();
        let mut data = CountsData::default();
        folded(&mut data, &mut store, &[], 1);
        folded(&mut data, &mut store, &[], 0);
        assert_eq!(data.majority_type(), Some(0));
    }
}
