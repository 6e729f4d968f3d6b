//! Caller identity resolution.
//!
//! Authentication proper happens upstream; this module only maps an inbound
//! request to the stable identifier that owns a quota.

use axum::body::Body;
use axum::http::{HeaderName, Request};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a request could not be attributed to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing caller identity header '{0}'")]
    Missing(String),
    #[error("caller identity header '{0}' is not valid UTF-8")]
    Malformed(String),
    #[error("caller identity must not be empty")]
    Empty,
}

/// Opaque, non-empty identifier of the caller a quota belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps a request to its caller.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, request: &Request<Body>) -> Result<CallerIdentity, IdentityError>;
}

/// What to do with requests that carry no identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AnonymousPolicy {
    /// Reject as unauthenticated
    #[default]
    Reject,
    /// Account every anonymous request against one shared identity
    SharedBucket { identity: String },
}

/// Resolves the caller from a request header.
#[derive(Debug, Clone)]
pub struct HeaderIdentityResolver {
    header: HeaderName,
    anonymous: Option<CallerIdentity>,
}

impl HeaderIdentityResolver {
    pub fn new(header: HeaderName, anonymous: &AnonymousPolicy) -> Result<Self, IdentityError> {
        let anonymous = match anonymous {
            AnonymousPolicy::Reject => None,
            AnonymousPolicy::SharedBucket { identity } => Some(CallerIdentity::new(identity.clone())?),
        };
        Ok(Self { header, anonymous })
    }

    fn anonymous_or(&self, err: IdentityError) -> Result<CallerIdentity, IdentityError> {
        self.anonymous.clone().ok_or(err)
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn resolve(&self, request: &Request<Body>) -> Result<CallerIdentity, IdentityError> {
        let Some(value) = request.headers().get(&self.header) else {
            return self.anonymous_or(IdentityError::Missing(self.header.to_string()));
        };

        // A present but unreadable header is a client error, never anonymous.
        // Any UTF-8 is accepted, not only the visible ASCII `to_str` allows.
        let value = std::str::from_utf8(value.as_bytes())
            .map_err(|_| IdentityError::Malformed(self.header.to_string()))?;

        match CallerIdentity::new(value.trim()) {
            Ok(caller) => Ok(caller),
            Err(_) => self.anonymous_or(IdentityError::Missing(self.header.to_string())),
        }
    }
}
