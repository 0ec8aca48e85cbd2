//! Per-identity credential verification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use fleetcast_core::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::jwks::Jwks;
use crate::token;
use crate::user::{OidcTenant, User};

fn forbidden(what: impl Into<String>) -> Error {
    Error::new(ErrorKind::Forbidden, what)
}

/// Runtime of one external OIDC tenant: the issuer coordinates, the set
/// of client ids referring to it, and the cached key set.
pub struct Tenant {
    /// Tenant domain.
    pub domain: String,
    /// Token issuer derived from the domain.
    pub issuer: String,
    /// Expected audience.
    pub audience: String,
    client_ids: Mutex<Vec<String>>,
    certs: Jwks,
}

impl Tenant {
    /// Creates the runtime for the given tenant coordinates.
    #[must_use]
    pub fn new(tenant: &OidcTenant) -> Self {
        let issuer = tenant.issuer();
        let certs = Jwks::new(format!("{issuer}.well-known/jwks.json"));

        Self {
            domain: tenant.domain.clone(),
            issuer,
            audience: tenant.audience.clone(),
            client_ids: Mutex::new(vec![tenant.client_id.clone()]),
            certs,
        }
    }

    /// Returns the map key of this tenant.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{}", self.domain, self.audience)
    }

    /// Stops the key fetcher.
    pub fn cancel(&self) {
        self.certs.cancel();
    }

    /// Registers a client id with this tenant.
    pub fn add_client_id(&self, client_id: &str) {
        let mut ids = self.client_ids.lock();
        if !ids.iter().any(|id| id == client_id) {
            ids.push(client_id.to_string());
        }
    }

    /// Removes a client id from this tenant.
    pub fn remove_client_id(&self, client_id: &str) {
        self.client_ids.lock().retain(|id| id != client_id);
    }

    /// Returns the registered client ids.
    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        self.client_ids.lock().clone()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verifies credentials presented for one identity.
///
/// A verifier stays handed out to callers after its identity was removed;
/// removal flips the `valid` flag so stale handles fail closed.
pub struct IdentityVerifier {
    user: User,
    tenant: Option<Arc<Tenant>>,
    jwt_realm: String,
    jwt_secret: Vec<u8>,
    valid: AtomicBool,
}

impl IdentityVerifier {
    pub(crate) fn new(
        user: User,
        tenant: Option<Arc<Tenant>>,
        jwt_realm: String,
        jwt_secret: Vec<u8>,
    ) -> Self {
        Self { user, tenant, jwt_realm, jwt_secret, valid: AtomicBool::new(true) }
    }

    /// Returns the identity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.user.name
    }

    /// Returns the identity record.
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Returns `true` if the identity bypasses policy checks.
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.user.superuser
    }

    pub(crate) fn tenant(&self) -> Option<&Arc<Tenant>> {
        self.tenant.as_ref()
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn check_valid(&self) -> Result<()> {
        if self.valid.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(forbidden("invalid identity"))
        }
    }

    /// Verifies the API password.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the method is disabled or the identity was
    /// removed.
    pub fn verify_api_password(&self, password: &str) -> Result<bool> {
        self.check_valid()?;

        if !self.user.auth.api.userpass.enable {
            return Err(forbidden("authentication method disabled"));
        }

        Ok(constant_time_eq(
            self.user.auth.api.userpass.password.as_bytes(),
            password.as_bytes(),
        ))
    }

    /// Verifies an external OIDC token.
    ///
    /// The token is parsed unverified first to check the subject and
    /// issuer, then parsed again with signature verification against the
    /// tenant's key set, selecting the key by the `kid` header and
    /// requiring a matching algorithm.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` on any verification failure.
    pub async fn verify_api_oidc(&self, jwt: &str) -> Result<bool> {
        self.check_valid()?;

        if !self.user.auth.api.oidc.enable {
            return Err(forbidden("authentication method disabled"));
        }

        let Some(tenant) = self.tenant.as_ref() else {
            return Err(forbidden("no tenant for this identity"));
        };

        let claims = token::decode_unverified(jwt)?;

        if claims["sub"].as_str() != Some(self.user.auth.api.oidc.user.as_str()) {
            return Err(forbidden("wrong subject"));
        }
        if claims["iss"].as_str() != Some(tenant.issuer.as_str()) {
            return Err(forbidden("wrong issuer"));
        }

        let header =
            jsonwebtoken::decode_header(jwt).map_err(|e| forbidden(format!("bad header: {e}")))?;
        let kid = header.kid.as_deref().ok_or_else(|| forbidden("kid not found"))?;

        let key = tenant.certs.key(kid).await?;

        let key_alg = key
            .common
            .key_algorithm
            .map(|a| format!("{a:?}"))
            .ok_or_else(|| forbidden("key has no algorithm"))?;
        if key_alg != format!("{:?}", header.alg) {
            return Err(forbidden("signing method doesn't match"));
        }

        let decoding_key = jsonwebtoken::DecodingKey::from_jwk(&key)
            .map_err(|e| forbidden(format!("invalid public key: {e}")))?;

        let mut validation = jsonwebtoken::Validation::new(header.alg);
        validation.set_audience(&[tenant.audience.clone()]);
        validation.set_issuer(&[tenant.issuer.clone()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        jsonwebtoken::decode::<serde_json::Value>(jwt, &decoding_key, &validation)
            .map_err(|e| forbidden(format!("invalid token: {e}")))?;

        Ok(true)
    }

    /// Verifies a locally issued HS256 token.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` on any verification failure.
    pub fn verify_jwt(&self, jwt: &str) -> Result<bool> {
        self.check_valid()?;

        let claims = token::decode_unverified(jwt)?;
        if claims["sub"].as_str() != Some(self.user.name.as_str()) {
            return Err(forbidden("wrong subject"));
        }
        if claims["iss"].as_str() != Some(self.jwt_realm.as_str()) {
            return Err(forbidden("wrong issuer"));
        }

        let verified = token::verify(jwt, &self.jwt_secret, Utc::now())?;
        debug!(sub = %verified.sub, "verified local token");

        Ok(true)
    }

    /// Verifies the service basic auth password.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the method is disabled or the identity was
    /// removed.
    pub fn verify_service_basic_auth(&self, password: &str) -> Result<bool> {
        self.check_valid()?;

        if !self.user.auth.services.basic.enable {
            return Err(forbidden("authentication method disabled"));
        }

        Ok(constant_time_eq(
            self.user.auth.services.basic.password.as_bytes(),
            password.as_bytes(),
        ))
    }

    /// Verifies a service bearer token.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the identity was removed.
    pub fn verify_service_token(&self, presented: &str) -> Result<bool> {
        self.check_valid()?;

        Ok(self.user.auth.services.token.iter().any(|t| t == presented))
    }

    /// Returns the service basic auth password, if enabled.
    #[must_use]
    pub fn service_basic_auth(&self) -> Option<String> {
        if !self.valid.load(Ordering::Acquire) || !self.user.auth.services.basic.enable {
            return None;
        }
        Some(self.user.auth.services.basic.password.clone())
    }

    /// Returns `name:token` for the first service token, if any.
    #[must_use]
    pub fn service_token(&self) -> Option<String> {
        if !self.valid.load(Ordering::Acquire) {
            return None;
        }
        let token = self.user.auth.services.token.first()?;
        Some(format!("{}:{}", self.user.name, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Claims, TokenUse};
    use crate::user::{UserAuthPassword, UserAuthServices};

    fn verifier(user: User) -> IdentityVerifier {
        IdentityVerifier::new(user, None, "realm".to_string(), b"secret".to_vec())
    }

    fn user_with_password(name: &str, password: &str) -> User {
        User {
            name: name.to_string(),
            auth: crate::user::UserAuth {
                api: crate::user::UserAuthApi {
                    userpass: UserAuthPassword { enable: true, password: password.to_string() },
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_api_password() {
        let v = verifier(user_with_password("alice", "pw"));
        assert!(v.verify_api_password("pw").unwrap());
        assert!(!v.verify_api_password("wrong").unwrap());
    }

    #[test]
    fn test_api_password_disabled() {
        let v = verifier(User { name: "alice".to_string(), ..Default::default() });
        assert!(v.verify_api_password("pw").is_err());
    }

    #[test]
    fn test_invalidated_fails_closed() {
        let v = verifier(user_with_password("alice", "pw"));
        v.invalidate();
        assert!(v.verify_api_password("pw").is_err());
        assert!(v.service_token().is_none());
    }

    #[test]
    fn test_local_jwt_subject_and_issuer() {
        let v = verifier(User { name: "alice".to_string(), ..Default::default() });

        let token =
            token::sign(&Claims::new("realm", "alice", TokenUse::Access, Utc::now()), b"secret")
                .unwrap();
        assert!(v.verify_jwt(&token).unwrap());

        // wrong subject
        let token =
            token::sign(&Claims::new("realm", "bob", TokenUse::Access, Utc::now()), b"secret")
                .unwrap();
        assert!(v.verify_jwt(&token).is_err());

        // wrong issuer
        let token =
            token::sign(&Claims::new("other", "alice", TokenUse::Access, Utc::now()), b"secret")
                .unwrap();
        assert!(v.verify_jwt(&token).is_err());
    }

    #[test]
    fn test_service_tokens() {
        let user = User {
            name: "svc".to_string(),
            auth: crate::user::UserAuth {
                services: UserAuthServices {
                    basic: UserAuthPassword { enable: true, password: "pw".to_string() },
                    token: vec!["t1".to_string(), "t2".to_string()],
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let v = verifier(user);

        assert!(v.verify_service_basic_auth("pw").unwrap());
        assert!(!v.verify_service_basic_auth("no").unwrap());
        assert!(v.verify_service_token("t2").unwrap());
        assert!(!v.verify_service_token("t3").unwrap());
        assert_eq!(v.service_token().unwrap(), "svc:t1");
        assert_eq!(v.service_basic_auth().unwrap(), "pw");
    }

    #[test]
    fn test_tenant_client_ids() {
        let tenant = Tenant::new(&OidcTenant {
            domain: "example.com".to_string(),
            audience: "aud".to_string(),
            client_id: "c1".to_string(),
        });

        tenant.add_client_id("c2");
        tenant.add_client_id("c2");
        assert_eq!(tenant.client_ids(), vec!["c1".to_string(), "c2".to_string()]);

        tenant.remove_client_id("c1");
        assert_eq!(tenant.client_ids(), vec!["c2".to_string()]);
    }
}
