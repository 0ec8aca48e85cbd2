//! Locally issued bearer tokens: HS256 compact JWTs.
//!
//! Access tokens live for 10 minutes, refresh tokens for 24 hours. The
//! claims are `{iss, sub, usefor, iat, exp, exi, jti}` where `usefor` is
//! `access` or `refresh`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use fleetcast_core::{Error, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of access tokens.
pub const ACCESS_TTL_MINUTES: i64 = 10;

/// Lifetime of refresh tokens.
pub const REFRESH_TTL_HOURS: i64 = 24;

/// What a token is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    /// Short-lived API access.
    Access,
    /// Longer-lived refresh.
    Refresh,
}

/// Claims of a locally issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer: the configured realm.
    pub iss: String,
    /// Subject: the identity name.
    pub sub: String,
    /// Purpose of the token.
    pub usefor: TokenUse,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Lifetime in seconds.
    pub exi: u64,
    /// Unique token id.
    pub jti: String,
}

impl Claims {
    /// Builds the claims of a new token for `name`.
    #[must_use]
    pub fn new(realm: &str, name: &str, usefor: TokenUse, now: DateTime<Utc>) -> Self {
        let ttl = match usefor {
            TokenUse::Access => Duration::minutes(ACCESS_TTL_MINUTES),
            TokenUse::Refresh => Duration::hours(REFRESH_TTL_HOURS),
        };
        let expires = now + ttl;

        Self {
            iss: realm.to_string(),
            sub: name.to_string(),
            usefor,
            iat: now.timestamp(),
            exp: expires.timestamp(),
            exi: ttl.num_seconds().unsigned_abs(),
            jti: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

fn hmac_sign(secret: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::internal(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
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

/// Signs the claims into a compact HS256 JWT.
///
/// # Errors
///
/// Returns `Internal` on a serialization fault.
pub fn sign(claims: &Claims, secret: &[u8]) -> Result<String> {
    let header = Header { alg: "HS256".to_string(), typ: "JWT".to_string() };

    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{payload}");

    let signature = hmac_sign(secret, signing_input.as_bytes())?;
    let signature = URL_SAFE_NO_PAD.encode(signature);

    Ok(format!("{signing_input}.{signature}"))
}

/// Verifies an HS256 token and returns its claims.
///
/// Checks the algorithm, the signature and the expiry against `now`.
///
/// # Errors
///
/// Returns `Forbidden` on any verification failure.
pub fn verify(token: &str, secret: &[u8], now: DateTime<Utc>) -> Result<Claims> {
    let forbidden = |what: &str| Error::new(fleetcast_core::ErrorKind::Forbidden, what.to_string());

    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(forbidden("malformed token"));
    };

    let header_bytes =
        URL_SAFE_NO_PAD.decode(header).map_err(|_| forbidden("malformed token header"))?;
    let parsed: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| forbidden("malformed token header"))?;
    if parsed.alg != "HS256" {
        return Err(forbidden("invalid hashing algorithm"));
    }

    let signing_input = format!("{header}.{payload}");
    let expected = hmac_sign(secret, signing_input.as_bytes())?;
    let presented =
        URL_SAFE_NO_PAD.decode(signature).map_err(|_| forbidden("malformed signature"))?;
    if !constant_time_eq(&expected, &presented) {
        return Err(forbidden("invalid signature"));
    }

    let payload_bytes =
        URL_SAFE_NO_PAD.decode(payload).map_err(|_| forbidden("malformed claims"))?;
    let claims: Claims =
        serde_json::from_slice(&payload_bytes).map_err(|_| forbidden("malformed claims"))?;

    if claims.exp <= now.timestamp() {
        return Err(forbidden("token expired"));
    }

    Ok(claims)
}

/// Decodes the claims of a JWT without verifying the signature.
///
/// Used for the subject/issuer precheck of external OIDC tokens before
/// the verified parse.
///
/// # Errors
///
/// Returns `Forbidden` if the token is not a decodable JWT.
pub fn decode_unverified(token: &str) -> Result<serde_json::Value> {
    let forbidden = |what: &str| Error::new(fleetcast_core::ErrorKind::Forbidden, what.to_string());

    let payload = token.split('.').nth(1).ok_or_else(|| forbidden("malformed token"))?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| forbidden("malformed claims"))?;
    serde_json::from_slice(&bytes).map_err(|_| forbidden("malformed claims"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn test_sign_verify_round_trip() {
        let now = Utc::now();
        let claims = Claims::new("fleetcast", "alice", TokenUse::Access, now);

        let token = sign(&claims, SECRET).unwrap();
        let verified = verify(&token, SECRET, now).unwrap();

        assert_eq!(verified.sub, "alice");
        assert_eq!(verified.iss, "fleetcast");
        assert_eq!(verified.usefor, TokenUse::Access);
        assert_eq!(verified.exi, 600);
    }

    #[test]
    fn test_refresh_ttl() {
        let now = Utc::now();
        let claims = Claims::new("fleetcast", "alice", TokenUse::Refresh, now);
        assert_eq!(claims.exi, 24 * 3600);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = Utc::now();
        let claims = Claims::new("fleetcast", "alice", TokenUse::Access, now);
        let token = sign(&claims, SECRET).unwrap();

        assert!(verify(&token, b"other-secret", now).is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let now = Utc::now();
        let claims = Claims::new("fleetcast", "alice", TokenUse::Access, now);
        let token = sign(&claims, SECRET).unwrap();

        let later = now + Duration::minutes(11);
        assert!(verify(&token, SECRET, later).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = Utc::now();
        let claims = Claims::new("fleetcast", "alice", TokenUse::Access, now);
        let token = sign(&claims, SECRET).unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims::new("fleetcast", "root", TokenUse::Access, now)).unwrap(),
        );
        parts[1] = &forged;
        let forged_token = parts.join(".");

        assert!(verify(&forged_token, SECRET, now).is_err());
    }

    #[test]
    fn test_decode_unverified() {
        let now = Utc::now();
        let claims = Claims::new("realm", "bob", TokenUse::Access, now);
        let token = sign(&claims, SECRET).unwrap();

        let value = decode_unverified(&token).unwrap();
        assert_eq!(value["sub"], "bob");
        assert_eq!(value["iss"], "realm");
    }
}
