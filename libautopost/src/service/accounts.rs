//! Account linking

use std::sync::Arc;

use secrecy::SecretString;

use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::types::{Credential, Platform};

/// Tokens obtained by the caller's OAuth flow
pub struct AccountTokens {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Unix seconds; `None` if the token does not expire
    pub expires_at: Option<i64>,
}

#[derive(Clone)]
pub struct AccountService {
    credentials: Arc<CredentialStore>,
}

impl AccountService {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Link (or re-link) `user`'s account on `platform`.
    ///
    /// Re-linking an invalidated account makes it usable again.
    pub async fn link_account(
        &self,
        user: &str,
        platform: Platform,
        account: &str,
        tokens: AccountTokens,
    ) -> Result<Credential> {
        self.credentials
            .link(
                user,
                platform,
                account,
                tokens.access_token,
                tokens.refresh_token,
                tokens.expires_at,
            )
            .await
    }

    /// Unlink an account; waiting targets on it fail permanently.
    ///
    /// Returns the ids of the affected posts.
    pub async fn unlink_account(&self, user: &str, platform: Platform) -> Result<Vec<String>> {
        self.credentials.unlink(user, platform).await
    }
}
