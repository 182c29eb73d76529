//! JWT token management
//!
//! [`TokenFactory`] issues and validates access, refresh and recovery tokens.
//! It is built once at startup from the `token.*` settings and shared read-only.

use crate::config::{parse_duration, TokenSettings};
use crate::error::{AppError, BootstrapError};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Signing methods usable with a shared secret key
const SUPPORTED_METHODS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    /// Subject (user record id)
    pub sub: String,
    /// Issuer
    pub iss: String,
    /// Role names granted to the subject
    #[serde(default)]
    pub roles: Vec<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Not before (Unix timestamp)
    pub nbf: i64,
    /// Token id, the handle used for revocation
    pub jti: Uuid,
    /// Token type
    pub typ: TokenType,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
    Recovery,
}

/// Token pair response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// Issues and validates signed tokens
pub struct TokenFactory {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    access_lifetime: Duration,
    refresh_lifetime: Duration,
}

impl std::fmt::Debug for TokenFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenFactory")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("access_lifetime", &self.access_lifetime)
            .field("refresh_lifetime", &self.refresh_lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenFactory {
    pub fn new(
        key: &str,
        method: &str,
        issuer: &str,
        access_lifetime: Duration,
        refresh_lifetime: Duration,
    ) -> Result<Self, BootstrapError> {
        if key.trim().is_empty() {
            return Err(BootstrapError::Token("signing key must not be empty".to_string()));
        }
        if issuer.trim().is_empty() {
            return Err(BootstrapError::Token("issuer must not be empty".to_string()));
        }
        if access_lifetime.is_zero() || refresh_lifetime.is_zero() {
            return Err(BootstrapError::Token(
                "token lifetimes must be positive durations".to_string(),
            ));
        }

        let algorithm = method
            .trim()
            .to_uppercase()
            .parse::<Algorithm>()
            .ok()
            .filter(|alg| SUPPORTED_METHODS.contains(alg))
            .ok_or_else(|| {
                BootstrapError::Token(format!(
                    "unsupported signing method {}. allowed values are HS256, HS384 or HS512",
                    method
                ))
            })?;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(key.as_bytes()),
            decoding_key: DecodingKey::from_secret(key.as_bytes()),
            algorithm,
            issuer: issuer.to_string(),
            access_lifetime,
            refresh_lifetime,
        })
    }

    /// Build the factory from `token.*` settings, parsing both lifetimes
    pub fn from_settings(settings: &TokenSettings) -> Result<Self, BootstrapError> {
        let access = parse_duration("token.access.duration", &settings.access_duration)?;
        let refresh = parse_duration("token.refresh.duration", &settings.refresh_duration)?;

        let factory = Self::new(
            &settings.crypt_key,
            &settings.crypt_method,
            &settings.issuer,
            access,
            refresh,
        )?;

        info!(
            "Token factory ready: method={:?} issuer={} access={} refresh={}",
            factory.algorithm,
            factory.issuer,
            humantime::format_duration(access),
            humantime::format_duration(refresh)
        );

        Ok(factory)
    }

    #[cfg(test)]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[cfg(test)]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[cfg(test)]
    pub fn access_lifetime(&self) -> Duration {
        self.access_lifetime
    }

    #[cfg(test)]
    pub fn refresh_lifetime(&self) -> Duration {
        self.refresh_lifetime
    }

    fn lifetime_of(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::Access | TokenType::Recovery => self.access_lifetime,
            TokenType::Refresh => self.refresh_lifetime,
        }
    }

    /// Sign a single token of `token_type` for `subject`
    pub fn issue(
        &self,
        subject: &str,
        roles: Vec<String>,
        token_type: TokenType,
    ) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let lifetime = i64::try_from(self.lifetime_of(token_type).as_secs())
            .map_err(|_| AppError::Internal("token lifetime out of range".to_string()))?;

        let claims = Claims {
            sub: subject.to_string(),
            iss: self.issuer.clone(),
            roles,
            exp: now.saturating_add(lifetime),
            iat: now,
            nbf: now,
            jti: Uuid::new_v4(),
            typ: token_type,
        };

        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to create {:?} token: {}", token_type, e)))
    }

    /// Create access and refresh tokens for a subject
    pub fn issue_pair(&self, subject: &str, roles: Vec<String>) -> Result<TokenPair, AppError> {
        let access_token = self.issue(subject, roles.clone(), TokenType::Access)?;
        let refresh_token = self.issue(subject, roles, TokenType::Refresh)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_lifetime.as_secs(),
        })
    }

    /// Decode and validate a token: signature, method, issuer and expiry
    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.validate_nbf = true;

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AppError::Unauthorized("Token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                    AppError::Unauthorized("Token issuer mismatch".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidToken => {
                    AppError::Unauthorized("Invalid token".to_string())
                }
                _ => AppError::Unauthorized(format!("Token validation failed: {}", e)),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Validate a token and require it to be of `expected` type
    pub fn validate_as(&self, token: &str, expected: TokenType) -> Result<Claims, AppError> {
        let claims = self.validate(token)?;
        if claims.typ != expected {
            return Err(AppError::Unauthorized(format!(
                "Invalid token type, expected {:?}",
                expected
            )));
        }
        Ok(claims)
    }
}
