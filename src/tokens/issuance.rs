use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::expiration::{ExpirationDirective, ExpirationInput};
use super::generator::{Candidate, TokenGenerator};
use crate::errors::AppError;
use crate::models::token::NewToken;
use crate::store::{StoreError, TokenStore};
use crate::vault::crypto::TokenCrypto;

/// Longest caller-chosen token accepted.
pub const MAX_CUSTOM_TOKEN_LEN: usize = 128;

static CUSTOM_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]+$").unwrap());

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueRequest {
    #[serde(default, alias = "client", alias = "username", alias = "owner_label")]
    pub owner: Option<String>,
    #[serde(default, alias = "customToken")]
    pub custom_token: Option<String>,
    #[serde(default, alias = "expirate_date", alias = "expires")]
    pub expiration: Option<ExpirationInput>,
}

/// Returned once at issuance. The plaintext is not retrievable through the
/// normal API afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub id: Uuid,
    pub token: String,
    pub owner: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub custom: bool,
}

pub struct TokenIssuer {
    store: Arc<dyn TokenStore>,
    crypto: Arc<TokenCrypto>,
    generator: TokenGenerator,
    default_expiry_days: Option<u32>,
}

impl TokenIssuer {
    pub fn new(
        store: Arc<dyn TokenStore>,
        crypto: Arc<TokenCrypto>,
        generator: TokenGenerator,
        default_expiry_days: Option<u32>,
    ) -> Self {
        Self {
            store,
            crypto,
            generator,
            default_expiry_days,
        }
    }

    pub async fn issue(&self, req: IssueRequest) -> Result<IssuedToken, AppError> {
        self.issue_at(req, Utc::now()).await
    }

    /// Validates everything up front; nothing is stored until an insert
    /// succeeds.
    pub async fn issue_at(
        &self,
        req: IssueRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AppError> {
        let owner = req
            .owner
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .ok_or(AppError::InvalidInput("owner"))?
            .to_owned();

        let custom = match req.custom_token.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) if value.len() <= MAX_CUSTOM_TOKEN_LEN && CUSTOM_TOKEN_RE.is_match(value) => {
                Some(value)
            }
            Some(_) => return Err(AppError::InvalidInput("token")),
        };

        let directive = match req.expiration.as_ref() {
            Some(input) => ExpirationDirective::parse(input)?,
            None => None,
        };
        let directive = directive.unwrap_or(match self.default_expiry_days {
            Some(days) => ExpirationDirective::InDays(days),
            None => ExpirationDirective::Never,
        });
        let expires_at = directive.resolve(now)?;

        let mut spent = 0;
        let (id, plaintext) = loop {
            let Candidate {
                plaintext,
                hashed_value,
            } = match custom {
                Some(value) => self.generator.claim_custom(value, self.store.as_ref()).await?,
                None => self.generator.generate(self.store.as_ref(), &mut spent).await?,
            };

            let sealed = self.crypto.encrypt(&plaintext)?;
            let new_token = NewToken {
                hashed_value,
                encrypted_value: sealed.ciphertext,
                encryption_nonce: sealed.nonce,
                owner_label: owner.clone(),
                expires_at,
            };

            // A concurrent issuer may have taken the value since the check.
            // The unique constraint catches it: a caller-chosen value is a
            // duplicate, a generated one is simply redrawn.
            match self.store.insert(&new_token).await {
                Ok(id) => break (id, plaintext),
                Err(StoreError::Duplicate) if custom.is_none() => {
                    tracing::warn!(attempt = spent, "generated token was taken before insert, redrawing");
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(
            token_id = %id,
            owner = %owner,
            custom = custom.is_some(),
            expires_at = ?expires_at,
            "token issued"
        );

        Ok(IssuedToken {
            id,
            token: plaintext,
            owner,
            expires_at,
            custom: custom.is_some(),
        })
    }
}
