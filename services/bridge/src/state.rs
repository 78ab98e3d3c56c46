//! Shared gateway state handed to every handler.

use fb_bus::BusAdapter;
use fb_core::auth::TokenVerifier;
use fb_core::config::{AuthAlgorithm, AuthConfig, BridgeConfig, GatewayConfig};
use fb_core::limiter::RateLimiter;
use fb_core::validate::Validator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::metrics::GatewayMetrics;
use crate::outbound::OutboundBuffers;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub buffers: Arc<OutboundBuffers>,
    pub limiter: Arc<RateLimiter>,
    pub verifier: Arc<TokenVerifier>,
    pub validator: Validator,
    pub bus: Arc<BusAdapter>,
    pub gateway: Arc<GatewayConfig>,
    pub metrics: Arc<GatewayMetrics>,
    /// Root scope; cancelled by the supervisor at shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &BridgeConfig, bus: Arc<BusAdapter>) -> Result<Self, fb_core::auth::AuthFailure> {
        let verifier = build_verifier(&config.auth)?;
        Ok(AppState {
            registry: Arc::new(ConnectionRegistry::new()),
            buffers: Arc::new(OutboundBuffers::new()),
            limiter: Arc::new(RateLimiter::new(
                config.gateway.message_rate_limit_per_second,
            )),
            verifier: Arc::new(verifier),
            validator: Validator::new(config.gateway.max_message_size),
            bus,
            gateway: Arc::new(config.gateway.clone()),
            metrics: Arc::new(GatewayMetrics::new()),
            shutdown: CancellationToken::new(),
        })
    }
}

fn build_verifier(auth: &AuthConfig) -> Result<TokenVerifier, fb_core::auth::AuthFailure> {
    match auth.algorithm {
        AuthAlgorithm::Hs256 => Ok(TokenVerifier::hs256(
            &auth.key_material,
            auth.issuer.as_deref(),
            auth.audience.as_deref(),
            auth.leeway_seconds,
        )),
        AuthAlgorithm::Rs256 => TokenVerifier::rs256_pem(
            &auth.key_material,
            auth.issuer.as_deref(),
            auth.audience.as_deref(),
            auth.leeway_seconds,
        ),
    }
}
