//! Similarity scorer: annotate every event of one data type with how much
//! of the timeline looks like it.
//!
//! Noisy, machine-generated events (service restarts, scheduled tasks)
//! score high; the interesting outliers score near zero, which makes the
//! attribute a useful sort key during triage.

use serde_json::{json, Map};

use traceline_core::TracelineResult;

use crate::interface::{Analyzer, AnalyzerContext, EventStreamSpec};
use crate::similarity::{jaccard_estimate, shingles, LshIndex, MinHasher};

/// Per-data-type scorer settings.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Source field to compare.
    pub field: String,
    /// Shingle delimiters.
    pub delimiters: Vec<char>,
    /// Similarity threshold for counting a neighbour.
    pub threshold: f64,
    /// MinHash permutations.
    pub num_perm: usize,
    /// Query selecting the events to score.
    pub query_string: String,
}

impl ScorerConfig {
    /// Settings for one data type. Known data types get tuned settings;
    /// everything else gets the message-field defaults.
    #[must_use]
    pub fn for_data_type(data_type: &str) -> Self {
        match data_type {
            // EVTX messages embed rendered field values; hyphen and slash
            // splitting keeps GUIDs and paths from dominating the shingle
            // set.
            "windows:evtx:record" => Self::defaults(data_type),
            _ => Self::defaults(data_type),
        }
    }

    fn defaults(data_type: &str) -> Self {
        Self {
            field: "message".to_owned(),
            delimiters: vec![' ', '-', '/'],
            threshold: 0.5,
            num_perm: 128,
            query_string: format!("data_type:\"{data_type}\""),
        }
    }
}

/// Scores events of one data type by text similarity.
pub struct SimilarityScorer {
    data_type: Option<String>,
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self::new("windows:evtx:record")
    }
}

impl SimilarityScorer {
    /// Scorer over one data type.
    #[must_use]
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: Some(data_type.into()),
        }
    }

    /// Scorer with no data type; runs report and do nothing.
    #[must_use]
    pub fn unconfigured() -> Self {
        Self { data_type: None }
    }
}

impl Analyzer for SimilarityScorer {
    fn name(&self) -> &'static str {
        "similarity_scorer"
    }

    fn display_name(&self) -> &'static str {
        "Similarity scorer"
    }

    fn description(&self) -> &'static str {
        "Scores events by how similar their text is to the rest of the timeline"
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        let Some(data_type) = self.data_type.clone() else {
            return Ok("No data_type specified.".to_owned());
        };
        let config = ScorerConfig::for_data_type(&data_type);

        let stream = ctx.event_stream(
            self.name(),
            EventStreamSpec::query(config.query_string.clone())
                .with_return_fields(&[config.field.as_str()]),
        )?;

        let hasher = MinHasher::new(config.num_perm);
        let mut index = LshIndex::new(config.num_perm, config.threshold);
        let mut events = Vec::new();
        let mut signatures = Vec::new();

        for event in stream {
            let event = event?;
            let text = event.attribute_str(&config.field).unwrap_or_default();
            let signature = hasher.signature(&shingles(text, &config.delimiters));
            index.insert(signatures.len(), &signature);
            signatures.push(signature);
            events.push(event);
        }

        let total = events.len();
        for (position, mut event) in events.into_iter().enumerate() {
            let neighbours = index
                .query(&signatures[position])
                .into_iter()
                .filter(|&candidate| {
                    candidate != position
                        && jaccard_estimate(&signatures[position], &signatures[candidate])
                            >= config.threshold
                })
                .count();
            let score = if total > 1 {
                neighbours as f64 / (total - 1) as f64
            } else {
                0.0
            };

            let mut staged = Map::new();
            staged.insert("similarity_score".to_owned(), json!(score));
            event.add_attributes(staged);
            event.commit()?;
        }

        Ok(format!(
            "Similarity scorer processed {total} events for data_type {data_type}"
        ))
    }
}
