//! Cached JWKS fetching for external OIDC tenants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleetcast_core::{Error, ErrorKind, Result};
use jsonwebtoken::jwk::{Jwk, JwkSet};
use parking_lot::RwLock;
use tracing::debug;

/// A cancellable, caching JWKS fetcher for one key-set URL
/// (`{issuer}/.well-known/jwks.json`).
///
/// Keys are fetched lazily: a lookup serves from the cache and refetches
/// once on a `kid` miss, so key rotations are picked up without a
/// background refresh task.
pub struct Jwks {
    url: String,
    client: reqwest::Client,
    keys: RwLock<Option<JwkSet>>,
    cancelled: AtomicBool,
}

impl Jwks {
    /// Creates a fetcher for the given key-set URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");

        Self { url: url.into(), client, keys: RwLock::new(None), cancelled: AtomicBool::new(false) }
    }

    #[cfg(test)]
    pub(crate) fn from_keys(keys: JwkSet) -> Self {
        let jwks = Self::new("http://unused.invalid/jwks.json");
        *jwks.keys.write() = Some(keys);
        jwks
    }

    /// Stops this fetcher. Cached keys stay served; no further fetches
    /// happen.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn cached(&self, kid: &str) -> Option<Jwk> {
        let keys = self.keys.read();
        keys.as_ref().and_then(|set| set.find(kid).cloned())
    }

    /// Returns the key with the given `kid`.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if no such key exists, `Upstream` if the
    /// key set cannot be fetched.
    pub async fn key(&self, kid: &str) -> Result<Jwk> {
        if let Some(key) = self.cached(kid) {
            return Ok(key);
        }

        if self.cancelled.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Forbidden, "key set is cancelled"));
        }

        debug!(url = %self.url, kid, "fetching key set");

        let set: JwkSet = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Upstream, format!("fetching jwks: {e}")))?
            .json()
            .await
            .map_err(|e| Error::new(ErrorKind::Upstream, format!("decoding jwks: {e}")))?;

        *self.keys.write() = Some(set);

        self.cached(kid)
            .ok_or_else(|| Error::new(ErrorKind::Forbidden, format!("no key for kid '{kid}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> JwkSet {
        serde_json::from_value(serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": "key-1",
                "alg": "RS256",
                "use": "sig",
                "n": "u1SU1LfVLPHCozMxH2Mo4lgOEePzNm0tRgeLezV6ffAt0gunVTLw7onLRnrq0_IzW7yWR7QkrmBL7jTKEn5u-qKhbwKfBstIs-bMY2Zkp18gnTxKLxoS2tFczGkPLPgizskuemMghRniWaoLcyehkd3qqGElvW_VDL5AaWTg0nLVkjRo9z-40RQzuVaE8AkAFmxZzow3x-VJYKdjykkJ0iT9wCS0DRTXu269V264Vf_3jvredZiKRkgwlL9xNAwxXFg0x_XFw005UWVRIkdgcKWTjpBP2dPwVZ4WWC-9aGVd-Gyn1o0CLelf4rEjGoXbAAEgAqeGUxrcIlbjXfbcmw",
                "e": "AQAB"
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_cached_lookup() {
        let jwks = Jwks::from_keys(sample_set());
        let key = jwks.key("key-1").await.unwrap();
        assert_eq!(key.common.key_id.as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn test_cancelled_refuses_fetch() {
        let jwks = Jwks::from_keys(sample_set());
        jwks.cancel();

        // cached keys keep working
        assert!(jwks.key("key-1").await.is_ok());
        // a miss would need a fetch, which is refused
        assert!(jwks.key("key-2").await.is_err());
    }
}
