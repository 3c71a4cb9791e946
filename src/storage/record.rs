//! Job record model stored in a capped collection.

use crate::core::{QueueError, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned position of a record. Strictly increasing, never reused.
pub type Position = u64;

/// Cursor value that precedes every record a collection will ever hold.
pub const START_POSITION: Position = 0;

/// Byte budget of the error field when none is configured.
pub const DEFAULT_ERROR_CAPACITY: usize = 100;

const PAD: char = ' ';

// ============================================================================
// Error field
// ============================================================================

/// Fixed-width error text.
///
/// The byte length is chosen when the record is first written and never
/// changes afterwards, so a record keeps its stored size across status
/// updates. Longer messages are truncated on a char boundary, shorter ones
/// are padded with spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorField(String);

impl ErrorField {
    /// Blank field reserving `capacity` bytes.
    pub fn blank(capacity: usize) -> Self {
        Self(PAD.to_string().repeat(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.0.len()
    }

    /// Overwrites the text, keeping the original byte budget.
    pub fn set(&mut self, message: &str) {
        self.0 = fit_to_width(message, self.capacity());
    }

    /// Message without the padding.
    pub fn message(&self) -> &str {
        self.0.trim_end_matches(PAD)
    }

    pub fn is_set(&self) -> bool {
        !self.0.trim().is_empty()
    }

    /// Raw stored text including padding.
    pub fn as_stored(&self) -> &str {
        &self.0
    }
}

fn fit_to_width(text: &str, width: usize) -> String {
    let mut end = text.len().min(width);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut fitted = String::with_capacity(width);
    fitted.push_str(&text[..end]);
    while fitted.len() < width {
        fitted.push(PAD);
    }
    fitted
}

// ============================================================================
// Status
// ============================================================================

/// The only part of a record that may change after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStatus {
    pub is_complete: bool,
    error: ErrorField,
}

impl RecordStatus {
    pub fn pending(error_capacity: usize) -> Self {
        Self {
            is_complete: false,
            error: ErrorField::blank(error_capacity),
        }
    }

    pub fn mark_complete(&mut self) {
        self.is_complete = true;
    }

    pub fn set_error(&mut self, message: &str) {
        self.error.set(message);
    }

    pub fn error(&self) -> &ErrorField {
        &self.error
    }

    /// Resolved records are never dispatched again.
    pub fn is_resolved(&self) -> bool {
        self.is_complete || self.error.is_set()
    }

    pub fn state(&self) -> JobState {
        if self.is_complete {
            JobState::Complete
        } else if self.error.is_set() {
            JobState::Failed
        } else {
            JobState::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Complete,
    Failed,
}

// ============================================================================
// Job record
// ============================================================================

/// A queued command together with its execution context and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub position: Position,
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    pub context: serde_json::Value,
    pub command: serde_json::Value,
    pub status: RecordStatus,
}

impl JobRecord {
    /// Builds an unpositioned record; the collection assigns the position on append.
    pub fn new(
        name: impl Into<String>,
        command: serde_json::Value,
        context: serde_json::Value,
        error_capacity: usize,
    ) -> Self {
        Self {
            position: START_POSITION,
            name: name.into(),
            enqueued_at: Utc::now().trunc_subsecs(3),
            context,
            command,
            status: RecordStatus::pending(error_capacity),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_complete
    }

    pub fn error(&self) -> &ErrorField {
        self.status.error()
    }

    pub fn state(&self) -> JobState {
        self.status.state()
    }

    /// Encoded size used against the collection's byte bound.
    pub fn stored_size(&self) -> Result<usize> {
        rmp_serde::to_vec(self)
            .map(|bytes| bytes.len())
            .map_err(|e| QueueError::Serialization(format!("Failed to encode job record: {}", e)))
    }
}
