//! Credential resolution for signed stream requests.
//!
//! Implementations must ensure credentials are refreshed on expiry; the
//! env-backed implementation here is suited to environments (containers,
//! lambdas) where the environment itself is kept refreshed by the platform.
//!
//! `Debug` on [`ResolvedCredentials`] redacts every field — never log a
//! credential value, only whether it was present.

/// Abstract source of AWS-style request-signing credentials.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self) -> ResolvedCredentials;
}

#[derive(Clone)]
pub struct ResolvedCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
}

impl std::fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("access_key", &redacted(&self.access_key))
            .field("secret_key", &redacted(&self.secret_key))
            .field("session_token", &redacted(&self.session_token))
            .finish()
    }
}

fn redacted(s: &str) -> &'static str {
    if s.is_empty() {
        "<empty>"
    } else {
        "<REDACTED>"
    }
}

/// Reads credentials from the standard AWS environment variables on every
/// call to `resolve`, so a refreshed environment is always reflected.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialSource;

impl CredentialSource for EnvCredentialSource {
    fn resolve(&self) -> ResolvedCredentials {
        ResolvedCredentials {
            access_key: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            session_token: std::env::var("AWS_SESSION_TOKEN").unwrap_or_default(),
        }
    }
}
