// Authenticated fetch of the referral page, renewing the session when upstream rejects it
use std::sync::Arc;

use async_trait::async_trait;
use refwatch_api::{ReferralApiClient, ReferralOutcome, ReferralPage};
use refwatch_store::TokenPair;
use tracing::{debug, info, warn};

use crate::archive::ResponseArchive;
use crate::error::AuthStep;
use crate::login::CredentialAcquirer;
use crate::token_store::TokenStore;
use crate::{Error, Result};

/// How many 401s in a row we tolerate before giving up on the cycle
const MAX_UNAUTHORIZED: u32 = 2;

/// Where referral pages come from - the upstream API in production, fakes in tests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReferralSource: Send + Sync {
    async fn fetch_page(&self, access_token: &str) -> Result<ReferralOutcome>;
}

#[async_trait]
impl ReferralSource for ReferralApiClient {
    async fn fetch_page(&self, access_token: &str) -> Result<ReferralOutcome> {
        Ok(self.fetch_referrals(access_token).await?)
    }
}

pub struct ReferralFetcher {
    tokens: TokenStore,
    acquirer: Arc<dyn CredentialAcquirer>,
    source: Arc<dyn ReferralSource>,
    archive: Option<ResponseArchive>,
}

impl ReferralFetcher {
    pub fn new(
        tokens: TokenStore,
        acquirer: Arc<dyn CredentialAcquirer>,
        source: Arc<dyn ReferralSource>,
    ) -> Self {
        Self {
            tokens,
            acquirer,
            source,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Fetch the current referral page.
    ///
    /// A 401 invalidates the token in use and triggers one fresh sign-in; a
    /// second 401 in a row ends the cycle with an auth error.
    pub async fn fetch(&self) -> Result<ReferralPage> {
        let mut unauthorized = 0;

        loop {
            let token = self.current_token().await?;

            match self.source.fetch_page(&token.access_token).await? {
                ReferralOutcome::Page(page) => {
                    info!(
                        fetched = page.data_length,
                        total_records = page.total_records,
                        "fetched referrals"
                    );
                    self.archive_page(&page);
                    return Ok(page);
                }
                ReferralOutcome::Unauthorized => {
                    unauthorized += 1;
                    self.tokens.invalidate(&token.access_token)?;

                    if unauthorized >= MAX_UNAUTHORIZED {
                        return Err(Error::auth(
                            AuthStep::RepeatedUnauthorized,
                            format!("upstream returned 401 {} times in a row", unauthorized),
                        ));
                    }
                    warn!(token_id = %token.id, "access token rejected, signing in again");
                }
            }
        }
    }

    async fn current_token(&self) -> Result<TokenPair> {
        if let Some(pair) = self.tokens.current_valid()? {
            debug!(token_id = %pair.id, "reusing stored session token");
            return Ok(pair);
        }

        info!("no valid session token, signing in");
        let pair = self.acquirer.acquire().await?;
        self.tokens.store(pair)
    }

    fn archive_page(&self, page: &ReferralPage) {
        if let Some(archive) = &self.archive {
            match archive.write(page) {
                Ok(path) => debug!(path = %path.display(), "archived referrals page"),
                Err(e) => warn!(error = %e, "failed to archive referrals page"),
            }
        }
    }
}
