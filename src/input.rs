use bimap::BiMap;

use crate::{AttrId, SymbolId, TypeId};

pub mod trace;
pub use trace::{Tail, TailEvent, TailSource, Trace, TraceStore, VecSource};

/// A declared attribute of a symbol or a trace.
///
/// The flags steer how the engine may use the attribute: `splittable`
/// attributes can be turned into transition guards, `distributionable` ones
/// may be modeled by evaluation strategies, `target` marks prediction
/// targets.
#[derive(Clone, Debug)]
pub struct Attribute {
    pub name: String,
    pub splittable: bool,
    pub distributionable: bool,
    pub discrete: bool,
    pub target: bool,
}

impl Attribute {
    /// A splittable, continuous attribute with the given name.
    pub fn splittable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            splittable: true,
            distributionable: false,
            discrete: false,
            target: false,
        }
    }
}

/// The input-data context: two independent string-to-dense-id vocabularies,
/// one for input symbols and one for trace types, plus the declared
/// attributes.
///
/// Ids are allocated on first sight and never reused within a run. The
/// registry is owned by the run and passed by reference; there is no global
/// instance.
#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    symbols: BiMap<String, SymbolId>,
    types: BiMap<String, TypeId>,
    symbol_attributes: Vec<Attribute>,
    trace_attributes: Vec<Attribute>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, allocating a fresh one on first sight.
    pub fn symbol_id(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbols.get_by_left(name) {
            return id;
        }
        let id = self.symbols.len() as SymbolId;
        self.symbols.insert(name.to_string(), id);
        id
    }

    /// Looks up a symbol without allocating.
    pub fn try_symbol(&self, name: &str) -> Option<SymbolId> {
        self.symbols.get_by_left(name).copied()
    }

    /// The external name of a symbol id.
    pub fn symbol_name(&self, id: SymbolId) -> &str {
        self.symbols
            .get_by_right(&id)
            .expect("symbol id was handed out by this vocabulary")
    }

    /// Returns the id for type `name`, allocating a fresh one on first sight.
    pub fn type_id(&mut self, name: &str) -> TypeId {
        if let Some(&id) = self.types.get_by_left(name) {
            return id;
        }
        let id = self.types.len() as TypeId;
        self.types.insert(name.to_string(), id);
        id
    }

    /// Looks up a type without allocating.
    pub fn try_type(&self, name: &str) -> Option<TypeId> {
        self.types.get_by_left(name).copied()
    }

    /// The external name of a type id.
    pub fn type_name(&self, id: TypeId) -> &str {
        self.types
            .get_by_right(&id)
            .expect("type id was handed out by this vocabulary")
    }

    pub fn n_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn n_types(&self) -> usize {
        self.types.len()
    }

    /// All currently known symbol ids, in allocation order.
    pub fn symbols(&self) -> impl Iterator<Item = SymbolId> {
        0..self.symbols.len() as SymbolId
    }

    /// All currently known type ids, in allocation order.
    pub fn types(&self) -> impl Iterator<Item = TypeId> {
        0..self.types.len() as TypeId
    }

    pub fn declare_symbol_attribute(&mut self, attr: Attribute) -> AttrId {
        self.symbol_attributes.push(attr);
        (self.symbol_attributes.len() - 1) as AttrId
    }

    pub fn declare_trace_attribute(&mut self, attr: Attribute) -> AttrId {
        self.trace_attributes.push(attr);
        (self.trace_attributes.len() - 1) as AttrId
    }

    pub fn symbol_attribute(&self, id: AttrId) -> Option<&Attribute> {
        self.symbol_attributes.get(id as usize)
    }

    pub fn trace_attribute(&self, id: AttrId) -> Option<&Attribute> {
        self.trace_attributes.get(id as usize)
    }

    pub fn n_symbol_attributes(&self) -> usize {
        self.symbol_attributes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut vocab = Vocabulary::new();
        let a = vocab.symbol_id("a");
        let b = vocab.symbol_id("b");
        assert_eq!((a, b), (0, 1));
        assert_eq!(vocab.symbol_id("a"), a);
        assert_eq!(vocab.symbol_name(b), "b");
        assert_eq!(vocab.try_symbol("c"), None);

        let accept = vocab.type_id("accept");
        let reject = vocab.type_id("reject");
        assert_eq!((accept, reject), (0, 1));
        assert_eq!(vocab.type_name(accept), "accept");
    }
}
