//! Feedback records — append-only observations about tasks and responses.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of feedback observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Like,
    Dislike,
    Rating,
    Correction,
    Improvement,
    Comment,
    Selected,
    Rejected,
}

impl FeedbackKind {
    /// LIKE and SELECTED count toward a target's positive tally.
    pub fn is_positive(&self) -> bool {
        matches!(self, FeedbackKind::Like | FeedbackKind::Selected)
    }

    /// DISLIKE and REJECTED count toward a target's negative tally.
    pub fn is_negative(&self) -> bool {
        matches!(self, FeedbackKind::Dislike | FeedbackKind::Rejected)
    }
}

/// Where a feedback entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackSource {
    User,
    System,
    Agent,
    Metric,
}

/// An append-only feedback record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub id: String,
    pub kind: FeedbackKind,
    pub source: FeedbackSource,
    /// Numeric, string, or structured content.
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Id of the target (task, response, …).
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl FeedbackEntry {
    pub fn new(kind: FeedbackKind, content: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source: FeedbackSource::User,
            content,
            context: HashMap::new(),
            target_id: None,
            target_type: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_source(mut self, source: FeedbackSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_target(mut self, target_id: &str, target_type: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self.target_type = Some(target_type.to_string());
        self
    }

    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Rolling aggregate of feedback for a single target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub target_id: String,
    pub target_type: String,
    pub count: u32,
    pub positive_count: u32,
    pub negative_count: u32,
    /// Number of RATING entries folded into `average_rating`.
    #[serde(default)]
    pub rating_count: u32,
    #[serde(default)]
    pub average_rating: Option<f64>,
    /// Most recent entry for this target.
    #[serde(default)]
    pub latest_feedback_id: Option<String>,
    #[serde(default)]
    pub feedback_ids: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl FeedbackSummary {
    pub fn new(target_id: &str, target_type: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            target_type: target_type.to_string(),
            count: 0,
            positive_count: 0,
            negative_count: 0,
            rating_count: 0,
            average_rating: None,
            latest_feedback_id: None,
            feedback_ids: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Fold one entry into the aggregate. Ratings update a running mean over
    /// rating entries only.
    pub fn absorb(&mut self, entry: &FeedbackEntry) {
        self.count += 1;
        self.feedback_ids.push(entry.id.clone());
        self.latest_feedback_id = Some(entry.id.clone());

        if entry.kind.is_positive() {
            self.positive_count += 1;
        } else if entry.kind.is_negative() {
            self.negative_count += 1;
        }

        if entry.kind == FeedbackKind::Rating
            && let Some(rating) = entry.content.as_f64()
        {
            self.rating_count += 1;
            let mean = self.average_rating.unwrap_or(0.0);
            self.average_rating = Some(mean + (rating - mean) / self.rating_count as f64);
        }
    }
}
