//! Ingestion credentials.
//!
//! The ingestion server accepts either a bearer token or an HTTP basic-auth pair. The
//! resolver picks at most one:
//!
//! 1. A non-empty auth token always wins.
//! 2. Otherwise basic auth is used, but only when both username and password are
//!    non-empty. A username without a password (or the reverse) is ignored.
//! 3. Otherwise the agent uploads unauthenticated.
//!
//! Secrets never appear in `Debug` output or in serialized diagnostics.

use std::fmt;

use serde::{Serialize, Serializer};

const REDACTED: &str = "<redacted>";

#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    None,
    /// Bearer token sent as `Authorization: Bearer <token>`.
    Token(String),
    /// HTTP basic authentication.
    Basic { username: String, password: String },
}

impl Credentials {
    /// Picks credentials from the optional raw inputs. Whitespace-only values count as
    /// empty.
    #[must_use]
    pub fn from_parts(
        auth_token: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        fn non_empty(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|v| !v.is_empty())
        }

        if let Some(token) = non_empty(auth_token) {
            return Credentials::Token(token.to_string());
        }

        match (non_empty(username), non_empty(password)) {
            (Some(username), Some(password)) => Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            },
            _ => Credentials::None,
        }
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Credentials::None)
    }

    /// Short name of the scheme in use, safe to log.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Credentials::None => "none",
            Credentials::Token(_) => "token",
            Credentials::Basic { .. } => "basic",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Token(_) => f.debug_tuple("Token").field(&REDACTED).finish(),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &REDACTED)
                .finish(),
        }
    }
}

impl Serialize for Credentials {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.scheme())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_wins_over_basic() {
        let creds = Credentials::from_parts(Some("tok"), Some("user"), Some("pass"));
        assert_eq!(creds, Credentials::Token("tok".to_string()));
    }

    #[test]
    fn test_basic_requires_both_parts() {
        assert_eq!(
            Credentials::from_parts(None, Some("user"), None),
            Credentials::None
        );
        assert_eq!(
            Credentials::from_parts(Some(""), Some("user"), Some("  ")),
            Credentials::None
        );
        assert_eq!(
            Credentials::from_parts(Some(""), Some("user"), Some("pass")),
            Credentials::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            }
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let token = format!("{:?}", Credentials::Token("s3cr3t".to_string()));
        assert!(!token.contains("s3cr3t"));

        let basic = format!(
            "{:?}",
            Credentials::Basic {
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            }
        );
        assert!(basic.contains("admin"));
        assert!(!basic.contains("hunter2"));
    }

    #[test]
    fn test_serialize_scheme_only() {
        let json = serde_json::to_string(&Credentials::Token("abc".to_string()))
            .expect("Failed to serialize");
        assert_eq!(json, "\"token\"");
    }
}
