//! Query filter model: pagination, sort order, and UI filter chips.
//!
//! A [`QueryFilter`] travels with every search request. Chips are the typed
//! filter fragments users stack on a query; the query builder compiles them
//! into bool-query clauses (see [`crate::query`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::SortOrder;

/// Kind of a filter chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipKind {
    /// Filter on a sketch-scoped label name.
    Label,
    /// Exact phrase match on one field.
    Term,
    /// Absolute `start,end` datetime range.
    DatetimeRange,
    /// `"<timestamp> -N[smhd] +N[smhd]"` interval around a timestamp.
    DatetimeInterval,
}

/// How a chip combines with the rest of the query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipOperator {
    /// The chip must match.
    #[default]
    Must,
    /// The chip must not match.
    MustNot,
    /// The chip must match but does not contribute to scoring.
    Filter,
    /// The chip may match; matching events score higher.
    Should,
}

fn default_active() -> bool {
    true
}

/// One filter chip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    /// Field the chip applies to; empty for label and datetime chips.
    #[serde(default)]
    pub field: String,
    /// Chip value. Terms may be non-string; everything else is a string.
    pub value: Value,
    /// Chip kind.
    #[serde(rename = "type")]
    pub kind: ChipKind,
    /// Combination operator.
    #[serde(default)]
    pub operator: ChipOperator,
    /// Disabled chips are kept in the filter but skipped at build time.
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Chip {
    /// A label chip.
    #[must_use]
    pub fn label(value: impl Into<String>) -> Self {
        Self {
            field: String::new(),
            value: Value::String(value.into()),
            kind: ChipKind::Label,
            operator: ChipOperator::Must,
            active: true,
        }
    }

    /// A term chip matching `field` against `value`.
    #[must_use]
    pub fn term(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
            kind: ChipKind::Term,
            operator: ChipOperator::Must,
            active: true,
        }
    }

    /// An absolute datetime-range chip (`"start,end"`).
    #[must_use]
    pub fn datetime_range(value: impl Into<String>) -> Self {
        Self {
            field: String::new(),
            value: Value::String(value.into()),
            kind: ChipKind::DatetimeRange,
            operator: ChipOperator::Must,
            active: true,
        }
    }

    /// An interval chip (`"<timestamp> -N[smhd] +N[smhd]"`).
    #[must_use]
    pub fn datetime_interval(value: impl Into<String>) -> Self {
        Self {
            field: String::new(),
            value: Value::String(value.into()),
            kind: ChipKind::DatetimeInterval,
            operator: ChipOperator::Must,
            active: true,
        }
    }

    /// Flip the operator to `must_not`.
    #[must_use]
    pub fn negated(mut self) -> Self {
        self.operator = ChipOperator::MustNot;
        self
    }

    /// The chip value as a string slice, when it is one.
    #[must_use]
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Reference to a specific event inside an index, used by event-id filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    /// Document id.
    pub event_id: String,
    /// Index holding the document.
    pub index: String,
}

/// Pagination, ordering, and chip filters for a search request.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Pagination offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<u64>,
    /// Number of events to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Per-shard early-termination threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate_after: Option<u64>,
    /// Sort direction on `datetime`.
    #[serde(default)]
    pub order: SortOrder,
    /// Filter chips.
    #[serde(default)]
    pub chips: Vec<Chip>,
    /// Specific events to fetch; takes precedence over the query string.
    #[serde(default)]
    pub events: Vec<EventRef>,
}

impl QueryFilter {
    /// Filter with only a size limit set.
    #[must_use]
    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }
}
