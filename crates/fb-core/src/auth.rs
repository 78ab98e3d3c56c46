//! Bearer-token verification.
//!
//! The gateway stores no users or tokens; it verifies a signed token from the
//! external identity provider and extracts the session's identity, role and
//! subject allow-lists.  Verification is a pure function of key material plus
//! token bytes.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::subject;

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("token is not a well-formed JWT")]
    Malformed,
    #[error("token signature verification failed")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("token is missing required claim `{0}`")]
    MissingClaim(&'static str),
}

impl AuthFailure {
    /// The wire error code the session sends before closing with 1008.
    pub fn wire_code(&self) -> &'static str {
        match self {
            AuthFailure::Expired => fb_protocol::error_codes::TOKEN_EXPIRED,
            _ => fb_protocol::error_codes::TOKEN_INVALID,
        }
    }
}

/// Immutable per-connection identity, created at authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientContext {
    pub client_id: String,
    pub role: String,
    pub allow_publish: Vec<String>,
    pub allow_subscribe: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

impl ClientContext {
    pub fn expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn can_publish(&self, concrete_subject: &str) -> bool {
        subject::allowed(&self.allow_publish, concrete_subject)
    }

    /// Subscribe authorization: the requested pattern must be covered by one
    /// of the allow-list patterns.  A concrete pattern is covered when it
    /// matches; a wildcard pattern is covered when it equals an allow-list
    /// entry or narrows one (checked segment-wise).
    pub fn can_subscribe(&self, pattern: &str) -> bool {
        self.allow_subscribe
            .iter()
            .any(|allowed| pattern_covered(allowed, pattern))
    }
}

/// True when every subject matched by `requested` is also matched by
/// `granted`.
fn pattern_covered(granted: &str, requested: &str) -> bool {
    if !subject::valid_pattern(granted) || !subject::valid_pattern(requested) {
        return false;
    }
    let g: Vec<&str> = granted.split('.').collect();
    let r: Vec<&str> = requested.split('.').collect();
    for (i, gseg) in g.iter().enumerate() {
        match *gseg {
            ">" => return r.len() > i,
            "*" => {
                match r.get(i) {
                    // `>` here could span several segments, exceeding `*`.
                    None | Some(&">") => return false,
                    Some(_) => {}
                }
            }
            literal => {
                if r.get(i) != Some(&literal) {
                    return false;
                }
            }
        }
    }
    g.len() == r.len()
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    role: Option<String>,
    #[serde(rename = "pub", default)]
    allow_publish: Option<Vec<String>>,
    #[serde(rename = "subscribe", default)]
    allow_subscribe: Option<Vec<String>>,
    exp: Option<i64>,
}

/// Verifies signed bearer tokens with a configured key.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Symmetric HS256 verifier.
    pub fn hs256(
        secret: &[u8],
        issuer: Option<&str>,
        audience: Option<&str>,
        leeway_seconds: u64,
    ) -> Self {
        Self::with_key(
            DecodingKey::from_secret(secret),
            Algorithm::HS256,
            issuer,
            audience,
            leeway_seconds,
        )
    }

    /// Asymmetric RS256 verifier from a PEM public key.
    pub fn rs256_pem(
        public_key_pem: &[u8],
        issuer: Option<&str>,
        audience: Option<&str>,
        leeway_seconds: u64,
    ) -> Result<Self, AuthFailure> {
        let key = DecodingKey::from_rsa_pem(public_key_pem).map_err(|_| AuthFailure::Malformed)?;
        Ok(Self::with_key(key, Algorithm::RS256, issuer, audience, leeway_seconds))
    }

    fn with_key(
        key: DecodingKey,
        alg: Algorithm,
        issuer: Option<&str>,
        audience: Option<&str>,
        leeway_seconds: u64,
    ) -> Self {
        let mut validation = Validation::new(alg);
        validation.leeway = leeway_seconds;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }
        TokenVerifier { key, validation }
    }

    /// Verify a token and build the session context.
    pub fn verify(&self, token: &str) -> Result<ClientContext, AuthFailure> {
        let data = decode::<RawClaims>(token, &self.key, &self.validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthFailure::Expired,
                ErrorKind::ImmatureSignature => AuthFailure::NotYetValid,
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAudience => AuthFailure::BadSignature,
                ErrorKind::MissingRequiredClaim(_) => AuthFailure::MissingClaim("exp"),
                _ => AuthFailure::Malformed,
            }
        })?;

        let claims = data.claims;
        let client_id = claims.sub.ok_or(AuthFailure::MissingClaim("sub"))?;
        let role = claims.role.ok_or(AuthFailure::MissingClaim("role"))?;
        let exp = claims.exp.ok_or(AuthFailure::MissingClaim("exp"))?;
        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or(AuthFailure::Malformed)?;

        Ok(ClientContext {
            client_id,
            role,
            allow_publish: claims.allow_publish.unwrap_or_default(),
            allow_subscribe: claims.allow_subscribe.unwrap_or_default(),
            expires_at,
            connected_at: Utc::now(),
        })
    }
}

/// Strip the `Bearer ` prefix from an Authorization header value.
pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}
