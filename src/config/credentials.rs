//! Repository credentials
//!
//! Tokens are read from the environment once, at startup, and passed into
//! client constructors. Nothing below this layer reads the environment, so
//! tests build `Credentials` directly.

use std::fmt;

use crate::repository::Backend;

use super::ConfigError;

pub const ZENODO_TOKEN_ENV: &str = "ZENODO_TOKEN";
pub const FIGSHARE_TOKEN_ENV: &str = "FIGSHARE_TOKEN";
/// Set to `1`/`true` to target the Zenodo sandbox.
pub const ZENODO_SANDBOX_ENV: &str = "ZENODO_SANDBOX";

/// Bearer tokens per backend. `Debug` never prints token values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    zenodo: Option<String>,
    figshare: Option<String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all backend tokens from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read tokens through an arbitrary lookup (environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            zenodo: clean(lookup(ZENODO_TOKEN_ENV)),
            figshare: clean(lookup(FIGSHARE_TOKEN_ENV)),
        }
    }

    pub fn with_token(mut self, backend: Backend, token: impl Into<String>) -> Self {
        let token = Some(token.into());
        match backend {
            Backend::Zenodo => self.zenodo = token,
            Backend::Figshare => self.figshare = token,
        }
        self
    }

    pub fn token(&self, backend: Backend) -> Option<&str> {
        match backend {
            Backend::Zenodo => self.zenodo.as_deref(),
            Backend::Figshare => self.figshare.as_deref(),
        }
    }

    /// The token for `backend`, or an error naming the variable to set.
    pub fn require(&self, backend: Backend) -> Result<&str, ConfigError> {
        self.token(backend).ok_or_else(|| {
            ConfigError::MissingCredential(format!(
                "{} is not set (required for {})",
                backend.token_env_var(),
                backend
            ))
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |t: &Option<String>| if t.is_some() { "[REDACTED]" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("zenodo", &mark(&self.zenodo))
            .field("figshare", &mark(&self.figshare))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [(ZENODO_TOKEN_ENV, " abc "), (FIGSHARE_TOKEN_ENV, "")]
            .into_iter()
            .collect();
        let creds = Credentials::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(creds.token(Backend::Zenodo), Some("abc"));
        assert_eq!(creds.token(Backend::Figshare), None);
    }

    #[test]
    fn test_require_names_variable() {
        let creds = Credentials::new().with_token(Backend::Zenodo, "z");
        assert_eq!(creds.require(Backend::Zenodo).unwrap(), "z");

        let err = creds.require(Backend::Figshare).unwrap_err();
        assert!(err.to_string().contains(FIGSHARE_TOKEN_ENV));
    }

    #[test]
    fn test_debug_redacts() {
        let creds = Credentials::new().with_token(Backend::Figshare, "secret-token");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }
}
