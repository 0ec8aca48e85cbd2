//! The replicated identity record.

use std::sync::OnceLock;

use fleetcast_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Za-z0-9_-]+$").expect("valid pattern"))
}

/// External OIDC tenant coordinates.
///
/// A tenant is identified by its `(domain, audience)` pair; the client id
/// only selects which application of the tenant an identity logs in with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcTenant {
    /// Tenant domain, e.g. `example.eu.auth0.com`.
    pub domain: String,
    /// Expected audience of presented tokens.
    pub audience: String,
    /// Client id of the application.
    pub client_id: String,
}

impl OidcTenant {
    /// Returns the map key identifying this tenant.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{}", self.domain, self.audience)
    }

    /// Returns the token issuer of this tenant.
    #[must_use]
    pub fn issuer(&self) -> String {
        format!("https://{}/", self.domain)
    }
}

/// Password credential with an enable flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuthPassword {
    /// Whether this method is enabled.
    pub enable: bool,
    /// The password.
    pub password: String,
}

/// External OIDC credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuthOidc {
    /// Whether this method is enabled.
    pub enable: bool,
    /// Subject (`sub` claim) of the external user.
    pub user: String,
    /// Tenant the tokens come from.
    pub tenant: OidcTenant,
}

/// API credentials of an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuthApi {
    /// Local password login.
    pub userpass: UserAuthPassword,
    /// External OIDC login.
    pub oidc: UserAuthOidc,
}

/// Service credentials of an identity (media endpoints, not the API).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuthServices {
    /// Basic auth password.
    pub basic: UserAuthPassword,
    /// Zero or more bearer tokens.
    #[serde(default)]
    pub token: Vec<String>,
}

/// The full auth bundle of an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuth {
    /// API credentials.
    pub api: UserAuthApi,
    /// Service credentials.
    pub services: UserAuthServices,
}

/// An identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique name, `[A-Za-z0-9_-]+`.
    pub name: String,
    /// Whether the identity bypasses policy checks.
    #[serde(default)]
    pub superuser: bool,
    /// Credentials.
    #[serde(default)]
    pub auth: UserAuth,
}

impl User {
    /// Validates the identity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the name is empty or carries
    /// characters outside `[A-Za-z0-9_-]`, or if an enabled credential is
    /// missing its secret.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("the name is required"));
        }

        if !name_pattern().is_match(&self.name) {
            return Err(Error::invalid_argument("the name can only contain [A-Za-z0-9_-]"));
        }

        if self.auth.api.userpass.enable && self.auth.api.userpass.password.is_empty() {
            return Err(Error::invalid_argument("a password for API login is required"));
        }

        if self.auth.api.oidc.enable && self.auth.api.oidc.user.is_empty() {
            return Err(Error::invalid_argument("a user for OIDC login is required"));
        }

        if self.auth.services.basic.enable && self.auth.services.basic.password.is_empty() {
            return Err(Error::invalid_argument(
                "a password for service basic auth is required",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        let mut user = User { name: "alice_2-x".to_string(), ..Default::default() };
        user.validate().unwrap();

        user.name = String::new();
        assert!(user.validate().is_err());

        user.name = "no spaces".to_string();
        assert!(user.validate().is_err());

        // the anonymous principal is not a valid identity name
        user.name = crate::ANONYMOUS.to_string();
        assert!(user.validate().is_err());
    }

    #[test]
    fn test_validate_enabled_credentials_need_secrets() {
        let mut user = User { name: "alice".to_string(), ..Default::default() };

        user.auth.api.userpass.enable = true;
        assert!(user.validate().is_err());
        user.auth.api.userpass.password = "pw".to_string();
        user.validate().unwrap();

        user.auth.api.oidc.enable = true;
        assert!(user.validate().is_err());
        user.auth.api.oidc.user = "oidc|123".to_string();
        user.validate().unwrap();

        user.auth.services.basic.enable = true;
        assert!(user.validate().is_err());
        user.auth.services.basic.password = "pw".to_string();
        user.validate().unwrap();
    }

    #[test]
    fn test_tenant_key_and_issuer() {
        let tenant = OidcTenant {
            domain: "example.eu.auth0.com".to_string(),
            audience: "https://api".to_string(),
            client_id: "abc".to_string(),
        };
        assert_eq!(tenant.key(), "example.eu.auth0.comhttps://api");
        assert_eq!(tenant.issuer(), "https://example.eu.auth0.com/");
    }
}
