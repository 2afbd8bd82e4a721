use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use refwatch_api::{ReferralPage, ServiceRequestDto};
use refwatch_store::{RecordStore, ServiceRequestRecord};
use tracing::{debug, info, warn};

use crate::Result;

/// Persists referrals we have not seen before and reports exactly those
pub struct DedupIngestor {
    store: Arc<dyn RecordStore>,
}

impl DedupIngestor {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Store the unseen records of `page` and return them.
    ///
    /// The upstream total is recorded on every call, even when nothing is new.
    pub fn ingest(&self, page: &ReferralPage) -> Result<Vec<ServiceRequestRecord>> {
        let mut known = self.store.find_all_ids()?;

        let mut fresh = Vec::new();
        for dto in &page.data {
            if dto.service_request_id.trim().is_empty() {
                warn!("skipping referral without a ServiceRequestId");
                continue;
            }
            // `insert` also drops duplicates within the page
            if known.insert(dto.service_request_id.clone()) {
                fresh.push(record_from_dto(dto));
            }
        }

        if !fresh.is_empty() {
            let created: HashSet<String> = self.store.bulk_create(&fresh)?.into_iter().collect();
            if created.len() != fresh.len() {
                warn!(
                    expected = fresh.len(),
                    created = created.len(),
                    "store skipped records it already had"
                );
                // Someone else stored those; they are not ours to announce
                fresh.retain(|record| created.contains(&record.id));
            }
        }

        let metadata = self.store.upsert_metadata(page.total_records)?;

        if fresh.is_empty() {
            debug!(
                fetched = page.data_length,
                total_records = metadata.total_records_seen_upstream,
                "no new referrals"
            );
        } else {
            info!(
                new = fresh.len(),
                fetched = page.data_length,
                total_records = metadata.total_records_seen_upstream,
                "ingested new referrals"
            );
        }

        Ok(fresh)
    }

    pub fn known_ids(&self) -> Result<HashSet<String>> {
        Ok(self.store.find_all_ids()?)
    }
}

/// Project the upstream DTO onto the columns we keep
pub fn record_from_dto(dto: &ServiceRequestDto) -> ServiceRequestRecord {
    let mut record = ServiceRequestRecord::new(dto.service_request_id.clone(), patient_name(dto));

    record.status = non_blank(&dto.status);
    record.patient_id = non_blank(&dto.patient_id);
    record.provider_type = non_blank(&dto.provider_type);
    record.referral_type = non_blank(&dto.referral_type);
    record.referred_by_unit = non_blank(&dto.referred_by_businessunit_name);
    record.referred_to_unit = dto
        .referral_response
        .as_ref()
        .and_then(|r| non_blank(&r.referred_to_businessunit_name));

    record.created_on = parse_upstream_date(dto.created_on.as_deref());
    record.referral_sent_at = parse_upstream_date(dto.referral_sent_at.as_deref());
    record.response_received_at =
        parse_upstream_date(dto.referral_response_received_at.as_deref());

    record.requested_by_name = non_blank(&dto.service_requested_by);
    if let Some(contact) = &dto.service_requested_by_contact_info {
        record.requested_by_email = non_blank(&contact.email_id);
        record.requested_by_phone = non_blank(&contact.phone_number);
    }

    record
}

/// "First Last", skipping whichever half is missing
fn patient_name(dto: &ServiceRequestDto) -> String {
    let Some(detail) = &dto.patient_detail else {
        return String::new();
    };

    [&detail.first_name, &detail.last_name]
        .into_iter()
        .filter_map(|part| part.as_deref().map(str::trim))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Upstream mixes RFC 3339 stamps with offset-less ones; the latter are taken as UTC.
/// Anything unparseable is treated as absent.
pub fn parse_upstream_date(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    debug!(value = raw, "unparseable upstream date");
    None
}
