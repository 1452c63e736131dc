//! Mapping caller credentials to tenants.
//!
//! The engine itself never authenticates, it trusts the [`TenantId`] it is handed. Transport
//! layers resolve a credential through an [`AuthProvider`] first and reject the request on
//! [`Unauthorized`].
use async_trait::async_trait;
use fxhash::FxHashMap;
use thiserror::Error;

use crate::job::TenantId;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unauthorized")]
pub struct Unauthorized;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<TenantId, Unauthorized>;
}

/// A fixed token to tenant map.
///
/// # Example
///
/// ```
/// # use jobqueue::auth::{AuthProvider, StaticTokens, Unauthorized};
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let tokens = StaticTokens::parse("tok-alice:alice, tok-bob:bob").unwrap();
///
/// assert_eq!(tokens.resolve("tok-alice").await, Ok("alice".into()));
/// assert_eq!(tokens.resolve("tok-eve").await, Err(Unauthorized));
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: FxHashMap<String, TenantId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid token entry '{0}', expected 'token:tenant'")]
pub struct InvalidTokenEntry(pub String);

impl StaticTokens {
    pub fn new<T, U>(pairs: impl IntoIterator<Item = (T, U)>) -> Self
    where
        T: Into<String>,
        U: Into<TenantId>,
    {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(token, tenant)| (token.into(), tenant.into()))
                .collect(),
        }
    }

    /// Parses a comma separated list of `token:tenant` entries.
    pub fn parse(entries: &str) -> Result<Self, InvalidTokenEntry> {
        entries.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once(':') {
                Some((token, tenant)) if !token.trim().is_empty() && !tenant.trim().is_empty() => {
                    Ok((token.trim().to_owned(), TenantId::from(tenant.trim())))
                }
                _ => Err(InvalidTokenEntry(entry.to_owned())),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }
}

#[async_trait]
impl AuthProvider for StaticTokens {
    async fn resolve(&self, credential: &str) -> Result<TenantId, Unauthorized> {
        let credential = credential.strip_prefix("Bearer ").unwrap_or(credential);
        self.tokens.get(credential).cloned().ok_or(Unauthorized)
    }
}
