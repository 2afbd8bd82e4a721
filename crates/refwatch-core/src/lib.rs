// Polling, sign-in, dedup and notification logic
pub mod archive;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod ingest;
pub mod login;
pub mod notify;
pub mod poll;
pub mod services;
pub mod token_store;

pub use archive::ResponseArchive;
pub use config::Config;
pub use error::{AuthStep, Error};
pub use fetcher::{ReferralFetcher, ReferralSource};
pub use ingest::DedupIngestor;
pub use login::{BrowserCredentialAcquirer, CredentialAcquirer};
pub use notify::{Broadcaster, Delivery, MarkPolicy, NotificationCoordinator};
pub use poll::{CycleReport, PollLoop};
pub use services::{Services, StatusReport};
pub use token_store::TokenStore;

/// Result type alias because typing Result<T, Error> everywhere is tedious
pub type Result<T> = std::result::Result<T, Error>;
