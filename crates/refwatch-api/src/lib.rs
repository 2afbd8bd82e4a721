// HTTP plumbing for the upstream referral API
pub mod referrals;
pub mod retry;

// Re-export common types
pub use referrals::{
    ApiError, ReferralApiClient, ReferralOutcome, ReferralPage, ServiceRequestDto,
};
pub use retry::{
    with_retry, ErrorKind, FailureCause, RetryConfig, RetryingHttpClient, TransportError,
};
