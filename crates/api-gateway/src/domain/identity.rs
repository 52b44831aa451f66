//! Caller identity derived from a verified credential.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Metadata key the subject id travels under on backend calls
pub const USER_ID_KEY: &str = "x-user-id";

/// Verified caller. Lives only in request scope and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub subject_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.into(),
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
