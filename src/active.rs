pub mod lsharp;
pub mod oracle;
pub mod search;
pub mod teacher;

pub use lsharp::{LSharp, LearnResult, Outcome};
pub use oracle::{Counterexample, EquivalenceOracle, OracleError, ReplayOracle, SampleOracle};
pub use search::{BreadthFirst, RandomWMethod, SearchStrategy};
pub use teacher::{Sul, Teacher, TraceStoreSul};
