//! # traceline-analyze
//!
//! Analyzer framework: the [`Analyzer`] plugin trait, the staged-mutation
//! [`Event`] handle, the [`AnalyzerRegistry`] with dependency-ordered
//! pipelines, and the built-in analyzers (sessionizers, the SSH brute
//! force detector, the similarity scorer, and the chain linker).
//!
//! Analyzers stream events through the [`traceline_core::EventBackend`]
//! seam and stage their annotations on [`Event`] handles; nothing reaches
//! the backend until commit, and the bulk buffer is flushed after every
//! analyzer run.

pub mod chain;
pub mod evtx_sessionizer;
pub mod interface;
pub mod manager;
pub mod sequence_sessionizer;
pub mod sessionizer;
pub mod similarity;
pub mod similarity_scorer;
pub mod ssh_bruteforce;
pub mod ssh_sessionizer;

#[cfg(test)]
pub(crate) mod testutil;

pub use chain::{ChainAnalyzer, ChainPlugin, WinPrefetchChainPlugin};
pub use evtx_sessionizer::{EvtxSessionConfig, LogonSessionizer, UnlockSessionizer};
pub use interface::{
    Analyzer, AnalyzerContext, Event, EventStream, EventStreamSpec, COMMENT_LABEL, EMOJI_FIELD,
    STAR_LABEL,
};
pub use manager::{AnalyzerInfo, AnalyzerRegistry};
pub use sequence_sessionizer::{PsexecSessionizer, SequenceConfig, SequenceSessionizer};
pub use sessionizer::{Sessionizer, MAX_TIME_DIFF_MICROS};
pub use similarity::{jaccard_estimate, shingles, LshIndex, MinHasher};
pub use similarity_scorer::{ScorerConfig, SimilarityScorer};
pub use ssh_bruteforce::SshBruteForceAnalyzer;
pub use ssh_sessionizer::SshSessionizer;
