//! Devicelock: device-bound access tokens.
//!
//! Library crate shared by the `devicelock` binary and the integration tests
//! in `tests/`.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod store;
pub mod tokens;
pub mod vault;
pub mod version;

use store::TokenStore;
use tokens::generator::TokenGenerator;
use tokens::issuance::TokenIssuer;
use tokens::validator::DeviceBindingValidator;
use vault::crypto::TokenCrypto;

/// Shared application state passed to handlers.
pub struct AppState {
    pub store: Arc<dyn TokenStore>,
    pub crypto: Arc<TokenCrypto>,
    pub issuer: TokenIssuer,
    pub validator: DeviceBindingValidator,
    pub metrics: metrics::ServiceMetrics,
    pub config: config::Config,
}

impl AppState {
    pub fn new(config: config::Config, store: Arc<dyn TokenStore>) -> anyhow::Result<Self> {
        let crypto = Arc::new(TokenCrypto::new(&config.master_key)?);
        let issuer = TokenIssuer::new(
            store.clone(),
            crypto.clone(),
            TokenGenerator::new(config.token_length, config.max_generation_attempts),
            config.default_expiry_days,
        );
        let validator = DeviceBindingValidator::new(store.clone(), config.tx_timeout());

        Ok(Self {
            store,
            crypto,
            issuer,
            validator,
            metrics: metrics::ServiceMetrics::new()?,
            config,
        })
    }
}
