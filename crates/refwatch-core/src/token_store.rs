use std::sync::Arc;

use chrono::{DateTime, Utc};
use refwatch_store::{TokenPair, TokenRepository};
use tracing::{debug, info};

use crate::Result;

/// Decides whether the stored session can be reused or must be renewed.
///
/// Only the newest pair that was not invalidated is ever a candidate, and it
/// is handed out only while `now < expires_at`.
#[derive(Clone)]
pub struct TokenStore {
    repo: Arc<dyn TokenRepository>,
}

impl TokenStore {
    pub fn new(repo: Arc<dyn TokenRepository>) -> Self {
        Self { repo }
    }

    /// The current pair, if there is one that is still usable
    pub fn current_valid(&self) -> Result<Option<TokenPair>> {
        self.current_valid_at(Utc::now())
    }

    pub fn current_valid_at(&self, now: DateTime<Utc>) -> Result<Option<TokenPair>> {
        match self.repo.latest_active_token()? {
            Some(pair) if !pair.is_expired_at(now) => Ok(Some(pair)),
            Some(pair) => {
                debug!(token_id = %pair.id, expires_at = %pair.expires_at, "stored token expired");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Persist a freshly acquired pair; it becomes the current one
    pub fn store(&self, pair: TokenPair) -> Result<TokenPair> {
        self.repo.insert_token(&pair)?;
        info!(token_id = %pair.id, expires_at = %pair.expires_at, "stored new session token");
        Ok(pair)
    }

    /// Drop the pair holding `access_token` from consideration
    pub fn invalidate(&self, access_token: &str) -> Result<()> {
        let changed = self.repo.invalidate_token(access_token, Utc::now())?;
        info!(changed, "invalidated session token");
        Ok(())
    }
}
