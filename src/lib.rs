//! Inference of finite-state models from sequential data by red-blue state
//! merging over an augmented prefix tree acceptor (APTA).
//!
//! The engine builds a trie of observed traces, annotates every node with a
//! pluggable statistics payload, and then collapses the trie by merging
//! states through a reversible union-find layer. On top of the same engine
//! sits an active-learning loop that obtains additional traces on demand
//! from a teacher and validates hypotheses against equivalence oracles,
//! looping on counterexamples.

/// Fully-resolved run configuration, handed to the core by the caller.
pub mod config;

/// Vocabulary registry for symbols, types and attributes, plus the trace
/// model and the trace-source boundary.
pub mod input;

/// The augmented prefix tree acceptor and its deterministic traversals.
pub mod apta;

/// The state merger: testing, applying and undoing refinements.
pub mod merge;

/// Evaluation plugin contract and the named strategy registry.
pub mod evaluation;

/// Batch state-merging search to a fixed point.
pub mod greedy;

/// Streaming state-merging search with per-batch rollback and replay.
pub mod stream;

/// Active learning: teacher abstraction, equivalence oracles and the
/// counterexample-guided control loop.
pub mod active;

/// Dot printing and JSON snapshots of the current hypothesis.
pub mod serialize;

/// Stable identifier of an APTA node. Assigned at creation and never reused
/// for a different node within a run.
pub type NodeId = u32;

/// Dense id of an input symbol, allocated by the [`input::Vocabulary`].
pub type SymbolId = u32;

/// Dense id of a trace type (output label), allocated by the
/// [`input::Vocabulary`].
pub type TypeId = u32;

/// Index of a declared symbol or trace attribute.
pub type AttrId = u32;

pub use apta::Apta;
pub use config::Config;
pub use input::Vocabulary;
pub use merge::Merger;
