use std::collections::BTreeMap;

use reqwest::{header, Method, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{RetryingHttpClient, TransportError};

pub const REFERRALS_ENDPOINT: &str = "https://api.rovicare.com/api/v2/Referral/GetReferrals";
pub const DEFAULT_BUSINESS_UNIT_ID: &str = "89f490ec-f840-42cf-8a8d-305aabf9fe22";
pub const DEFAULT_PAGE_SIZE: u32 = 25;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("upstream answered with status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// What one call to the referrals endpoint produced
#[derive(Debug)]
pub enum ReferralOutcome {
    Page(ReferralPage),
    /// The bearer token was rejected; the caller decides what to do about it
    Unauthorized,
}

/// Client for the upstream referral search endpoint
pub struct ReferralApiClient {
    http: RetryingHttpClient,
    endpoint: String,
    body: Value,
}

impl ReferralApiClient {
    pub fn new(http: RetryingHttpClient) -> Self {
        Self::with_endpoint(
            http,
            REFERRALS_ENDPOINT.to_string(),
            DEFAULT_BUSINESS_UNIT_ID,
            DEFAULT_PAGE_SIZE,
        )
    }

    pub fn with_endpoint(
        http: RetryingHttpClient,
        endpoint: String,
        business_unit_id: &str,
        page_size: u32,
    ) -> Self {
        Self {
            http,
            endpoint,
            body: referrals_request_body(business_unit_id, page_size),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the current page of referrals using `access_token` as bearer credential
    pub async fn fetch_referrals(&self, access_token: &str) -> Result<ReferralOutcome> {
        let request = self
            .http
            .request(Method::POST, &self.endpoint)
            .header(header::ACCEPT, "application/json")
            .bearer_auth(access_token)
            .json(&self.body);

        let response = self.http.execute(request).await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            warn!(endpoint = %self.endpoint, "upstream rejected the access token");
            return Ok(ReferralOutcome::Unauthorized);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(ApiError::Body)?;
        let page = ReferralPage::parse(&bytes)?;
        debug!(
            data_length = page.data_length,
            total_records = page.total_records,
            "parsed referrals page"
        );

        Ok(ReferralOutcome::Page(page))
    }
}

/// The filter and output-field payload the referral search expects.
///
/// This mirrors what the web app sends; it is an external contract, so keep it
/// byte-for-byte stable unless upstream changes.
pub fn referrals_request_body(business_unit_id: &str, page_size: u32) -> Value {
    json!({
        "Filters": {
            "ReferredByBusinessunitIds": [],
            "ReferredToBusinessunitIds": [],
            "PatientNameSearch": "",
            "DeliveryMode": "All",
            "ProviderTypeIds": [],
            "ReferralType": ["Provider", "CareTransition", "RecordedReferral"],
            "IsEnabled": true,
            "ReferralStatus": [
                "Accepted",
                "Dates Received",
                "Referral Sent",
                "Pending",
                "Open",
                "Confirmed",
                "Transport Scheduled",
                "Transport Completed",
                "In Review",
                "Rejected",
                "Cancelled",
                "Suspended"
            ],
            "RemoveReferralStatus": [],
            "ReferralMode": "",
            "InsuranceStatus": "",
            "RemoveSuspendedReferral": true,
            "FromDate": null,
            "ToDate": null,
            "NoOfItems": page_size,
            "SkippedItems": 0,
            "IsActivePatient": null,
            "HasReceivedRequest": null,
            "ApplyLastDurationOfRecordsSetting": false,
            "ApplyLastConfirmReferralDateSetting": false,
            "DefaultConfirmReferralVisibilityInHrs": 0,
            "TrackedBy": "All",
            "TagNames": [],
            "HospitalName": []
        },
        "OrganizationIds": [],
        "OutputFields": {
            "ReferredByBusinessunitName": true,
            "IsChildBusinessunitPatient": true,
            "ReferralSentAt": true,
            "ReferralResponseReceivedAt": true,
            "ServiceRequestedBy": true,
            "ServiceRequestedByContactInfo": true,
            "ReferralResponses": {
                "ServiceResponseId": true,
                "ReferredToBusinessunitId": true,
                "ReferredToBusinessunitName": true,
                "ReferredToBusinessunitLocationDetail": true,
                "DeliveryMode": true,
                "RequestReceivedOn": true,
                "RequestRespondedOn": true,
                "HasRespondedRequest": true,
                "IsViewed": true,
                "IsOrphanReferral": true,
                "PreferenceOrder": true,
                "Status": true,
                "InsuranceStatus": true,
                "EstimatedArrivalAtDestination": true,
                "ActualArrivalAtDestination": true,
                "ServiceExpirationTimeWithoutResponse": true,
                "ConfirmedOn": true,
                "TransportScheduledAt": true,
                "Notes": true,
                "ServiceRespondedBy": true,
                "ServiceRespondedByContactInfo": true,
                "NoteCount": true,
                "LastUpdatedOn": true,
                "IsMemberAssigned": true,
                "IsInsuranceAuthorizationApproved": true
            },
            "IsTwoStepReferral": true,
            "PatientDetail": {
                "PatientName": true,
                "SecureLink": true,
                "Address": true,
                "ContactInfo": true,
                "Diagnosis": true
            },
            "ProviderType": true,
            "ServiceNeeded": true,
            "SpecialPrograms": true,
            "IsPreAuthorizationRequired": true,
            "TransportScheduledAt": true,
            "GetMultipleReferralResponse": false,
            "UnreadMessageCount": true,
            "IsResourceJson": true
        },
        "ReferralLevel": "ServiceResponse",
        "CurrentBusinessunitId": business_unit_id
    })
}

/// Response envelope of the referral search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReferralPage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<ServiceRequestDto>,
    /// Computed locally from `data`, never trusted from the wire
    #[serde(default)]
    pub data_length: usize,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_records: u64,
    #[serde(default)]
    pub fhir_response: Option<Value>,
}

impl ReferralPage {
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        let mut page: ReferralPage = serde_json::from_slice(bytes)?;
        page.data_length = page.data.len();
        Ok(page)
    }
}

/// A single service request as the upstream reports it.
///
/// Only the fields we project are typed; everything else is kept verbatim in
/// `extra` so archived pages stay complete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRequestDto {
    /// Empty when upstream omits it or sends null
    #[serde(default, deserialize_with = "null_as_default")]
    pub service_request_id: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub referral_type: Option<String>,
    #[serde(default)]
    pub provider_type: Option<String>,
    #[serde(default)]
    pub created_on: Option<String>,
    #[serde(default)]
    pub referred_by_businessunit_name: Option<String>,
    #[serde(default)]
    pub referral_sent_at: Option<String>,
    #[serde(default)]
    pub referral_response_received_at: Option<String>,
    #[serde(default)]
    pub service_requested_by: Option<String>,
    #[serde(default)]
    pub service_requested_by_contact_info: Option<ContactInfoDto>,
    #[serde(default)]
    pub patient_detail: Option<PatientDetailDto>,
    #[serde(default)]
    pub referral_response: Option<ReferralResponseDto>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContactInfoDto {
    #[serde(default)]
    pub email_id: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PatientDetailDto {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReferralResponseDto {
    #[serde(default)]
    pub referred_to_businessunit_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
