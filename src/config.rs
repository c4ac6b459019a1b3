use thiserror::Error;

/// How competing refinements are ranked when several are legal.
///
/// The secondary criterion is always the visitation order of the red state
/// in the merged-view traversal, so ranking is reproducible for identical
/// input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Prefer the refinement with the highest score.
    #[default]
    HighestScore,
    /// Prefer the refinement with the lowest score.
    LowestScore,
}

/// Which node colors show up in dot output.
#[derive(Clone, Copy, Debug)]
pub struct DisplayFlags {
    pub red: bool,
    pub blue: bool,
    pub white: bool,
    pub sinks: bool,
}

impl Default for DisplayFlags {
    fn default() -> Self {
        Self {
            red: true,
            blue: true,
            white: false,
            sinks: false,
        }
    }
}

/// A fully-resolved run configuration.
///
/// No parsing happens here; the caller resolves command line or file input
/// into this record before constructing a [`crate::Merger`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Registered name of the evaluation strategy, see
    /// [`crate::evaluation::evaluation_from_name`].
    pub evaluation: String,
    /// Divergence threshold for the statistical evaluator.
    pub mu: f64,
    /// Whether termination probabilities take part in consistency checks.
    pub final_probabilities: bool,
    /// A merge is "clearly better" than the runner-up when its score exceeds
    /// `score_ratio` times the runner-up's score; otherwise the active
    /// learner asks for more data first.
    pub score_ratio: f64,
    /// Upper bound on hypothesis rounds of the active learner.
    pub max_runs: usize,
    /// Upper bound on the number of red states before a run aborts with the
    /// best hypothesis so far.
    pub max_red_states: usize,
    /// Ranking mode for competing refinements.
    pub tie_break: TieBreak,
    /// Whether low-information states are treated as sinks and kept out of
    /// the merge frontier.
    pub use_sinks: bool,
    /// States with fewer observations than this count as sinks.
    pub sink_count: u32,
    /// Keep per-node tail lists. Required for attribute splits.
    pub store_tails: bool,
    /// During counterexample processing, query the teacher for every prefix
    /// past the fringe before inserting the counterexample itself.
    pub complete_path_cex: bool,
    /// After inserting a counterexample, re-complete every state along its
    /// path.
    pub explore_outside_cex: bool,
    /// Depth bound for oracle search strategies.
    pub max_search_depth: usize,
    /// Sample bound for the random search strategy.
    pub max_samples: usize,
    /// Probability distance above which the sampling oracle reports a
    /// counterexample.
    pub max_distance: f64,
    /// Seed for the random search strategy.
    pub seed: u64,
    /// Number of traces consumed per batch in streaming mode.
    pub batch_size: usize,
    /// Display flags for dot output.
    pub display: DisplayFlags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            evaluation: "counts".to_string(),
            mu: 0.35,
            final_probabilities: true,
            score_ratio: 2.0,
            max_runs: 100,
            max_red_states: 2500,
            tie_break: TieBreak::default(),
            use_sinks: false,
            sink_count: 10,
            store_tails: true,
            complete_path_cex: true,
            explore_outside_cex: true,
            max_search_depth: 10,
            max_samples: 2000,
            max_distance: 0.1,
            seed: 0x5eed,
            batch_size: 250,
            display: DisplayFlags::default(),
        }
    }
}

/// Errors arising from an invalid configuration record.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no evaluation strategy registered under name `{0}`")]
    UnknownEvaluation(String),
}
