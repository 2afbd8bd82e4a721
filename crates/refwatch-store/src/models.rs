use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A referral we have seen upstream at least once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequestRecord {
    /// Upstream `ServiceRequestId`, stable across polls
    pub id: String,
    pub status: Option<String>,
    pub patient_id: Option<String>,
    pub patient_name: String,
    pub provider_type: Option<String>,
    pub referral_type: Option<String>,

    // Business units involved
    pub referred_by_unit: Option<String>,
    pub referred_to_unit: Option<String>,

    // Lifecycle timestamps
    pub created_on: Option<DateTime<Utc>>,
    pub referral_sent_at: Option<DateTime<Utc>>,
    pub response_received_at: Option<DateTime<Utc>>,

    // Who asked for the service
    pub requested_by_name: Option<String>,
    pub requested_by_email: Option<String>,
    pub requested_by_phone: Option<String>,

    /// Set once, when the record has been broadcast
    pub notified_at: Option<DateTime<Utc>>,
}

impl ServiceRequestRecord {
    /// Bare record with only the id and display name filled in
    pub fn new(id: impl Into<String>, patient_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: None,
            patient_id: None,
            patient_name: patient_name.into(),
            provider_type: None,
            referral_type: None,
            referred_by_unit: None,
            referred_to_unit: None,
            created_on: None,
            referral_sent_at: None,
            response_received_at: None,
            requested_by_name: None,
            requested_by_email: None,
            requested_by_phone: None,
            notified_at: None,
        }
    }

    pub fn is_notified(&self) -> bool {
        self.notified_at.is_some()
    }
}

/// Access/refresh credential pair obtained from an interactive sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TokenPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Upstream-wide counters refreshed every poll cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMetadata {
    pub total_records_seen_upstream: u64,
    pub updated_at: DateTime<Utc>,
}
