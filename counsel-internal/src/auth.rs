use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorDetails};
use crate::plan::PlanTier;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Accepted API keys, keyed by `hash_api_key(key)`
    #[serde(default)]
    pub api_keys: HashMap<String, ApiKeyConfig>,
    /// Environment variable holding the HS256 secret for session tokens.
    /// Session tokens are rejected when unset.
    pub jwt_secret_env: Option<String>,
    #[serde(default)]
    pub jwt_leeway_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    pub user_id: String,
    #[serde(default)]
    pub plan: Option<String>,
}

/// Identity handed to every stage after authentication. Credentials never travel further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    pub plan: PlanTier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub authenticated: bool,
    pub user: Option<AuthenticatedUser>,
}

impl AuthOutcome {
    pub fn unauthenticated() -> Self {
        Self {
            authenticated: false,
            user: None,
        }
    }

    pub fn authenticated(user: AuthenticatedUser) -> Self {
        Self {
            authenticated: true,
            user: Some(user),
        }
    }

    pub fn into_user(self) -> Result<AuthenticatedUser, Error> {
        match self.user {
            Some(user) if self.authenticated => Ok(user),
            _ => Err(Error::new(ErrorDetails::Unauthorized)),
        }
    }
}

/// Verifies a presented bearer token. Every failure mode collapses into `None`.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<AuthenticatedUser>;
}

// Hash API key using SHA256 with "counsel-" prefix
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"counsel-");
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    #[serde(default)]
    plan: Option<String>,
}

/// Static API keys plus optional HS256 session tokens.
#[derive(Clone)]
pub struct Auth {
    api_keys: Arc<HashMap<String, ApiKeyConfig>>,
    session_key: Option<Arc<DecodingKey>>,
    validation: Validation,
}

impl Auth {
    pub fn new(api_keys: HashMap<String, ApiKeyConfig>, jwt_secret: Option<SecretString>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            api_keys: Arc::new(api_keys),
            session_key: jwt_secret
                .map(|secret| Arc::new(DecodingKey::from_secret(secret.expose_secret().as_bytes()))),
            validation,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, Error> {
        let jwt_secret = match &config.jwt_secret_env {
            Some(var) => Some(SecretString::from(std::env::var(var).map_err(|_| {
                Error::new(ErrorDetails::Config {
                    message: format!("Environment variable `{var}` for the session token secret is not set"),
                })
            })?)),
            None => None,
        };
        let mut auth = Self::new(config.api_keys.clone(), jwt_secret);
        auth.validation.leeway = config.jwt_leeway_secs;
        if config.api_keys.is_empty() && auth.session_key.is_none() {
            tracing::warn!("No API keys or session secret configured; every request will be rejected");
        }
        Ok(auth)
    }

    fn validate_api_key(&self, api_key: &str) -> Option<AuthenticatedUser> {
        self.api_keys
            .get(&hash_api_key(api_key))
            .map(|config| AuthenticatedUser {
                id: config.user_id.clone(),
                plan: PlanTier::from_record(config.plan.as_deref()),
            })
    }

    fn validate_session_token(&self, token: &str) -> Option<AuthenticatedUser> {
        let key = self.session_key.as_ref()?;
        match decode::<SessionClaims>(token, key, &self.validation) {
            Ok(data) => Some(AuthenticatedUser {
                id: data.claims.sub,
                plan: PlanTier::from_record(data.claims.plan.as_deref()),
            }),
            Err(e) => {
                tracing::debug!("Rejected session token: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl CredentialVerifier for Auth {
    async fn verify(&self, token: &str) -> Option<AuthenticatedUser> {
        self.validate_api_key(token)
            .or_else(|| self.validate_session_token(token))
    }
}

/// Resolves the caller identity once per request.
#[derive(Clone)]
pub struct AuthResolver {
    verifier: Arc<dyn CredentialVerifier>,
}

impl AuthResolver {
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { verifier }
    }

    pub async fn resolve(&self, bearer: Option<&str>) -> AuthOutcome {
        let Some(token) = bearer else {
            return AuthOutcome::unauthenticated();
        };
        match self.verifier.verify(token).await {
            Some(user) => {
                tracing::debug!(user_id = %user.id, plan = %user.plan, "Authenticated request");
                AuthOutcome::authenticated(user)
            }
            None => AuthOutcome::unauthenticated(),
        }
    }
}
