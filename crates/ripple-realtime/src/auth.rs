//! Credentials presented when a transport connects.
//!
//! Token acquisition lives outside this crate; the engine only asks an
//! [`AuthProvider`] for the parameters to send, forcing a fresh token after
//! the server rejects the current one.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ErrorInfo;

/// Connect query parameters produced by an auth provider.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthParams(BTreeMap<String, String>);

impl AuthParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        self.0.get("access_token").map(String::as_str)
    }

    pub fn key(&self) -> Option<&str> {
        self.0.get("key").map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl std::fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Parameters for the next connect. `force_new_token` is set after the
    /// server rejected the previous token.
    async fn auth_params(&self, force_new_token: bool) -> Result<AuthParams, ErrorInfo>;

    /// HTTP headers for request/response calls made alongside the realtime
    /// connection.
    async fn auth_headers(&self, force_new_token: bool) -> Result<Vec<(String, String)>, ErrorInfo> {
        let params = self.auth_params(force_new_token).await?;
        Ok(match (params.access_token(), params.key()) {
            (Some(token), _) => vec![("Authorization".into(), format!("Bearer {token}"))],
            (None, Some(key)) => vec![("X-Ripple-Key".into(), key.to_string())],
            (None, None) => Vec::new(),
        })
    }
}

/// Fixed credentials: an API key or a pre-issued token.
#[derive(Clone)]
pub struct StaticAuth {
    params: AuthParams,
}

impl StaticAuth {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            params: AuthParams::new().with("key", key),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            params: AuthParams::new().with("access_token", token),
        }
    }
}

impl std::fmt::Debug for StaticAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAuth")
            .field("params", &self.params)
            .finish()
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn auth_params(&self, _force_new_token: bool) -> Result<AuthParams, ErrorInfo> {
        Ok(self.params.clone())
    }
}
