//! Server-side credential checks: Argon2id password hashes and HMAC-signed
//! session tokens.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// How long a login stays valid, in hours.
pub const SESSION_TTL_HOURS: i64 = 12;

/// Domain appended to bare usernames.
pub const LOGIN_DOMAIN: &str = "iothub.local";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("session secret rejected")]
    Key,
    #[error("malformed session token")]
    Malformed,
    #[error("session token signature mismatch")]
    BadSignature,
    #[error("session expired")]
    Expired,
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

/// `false` for a wrong password and for an unparseable stored hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// `bob` → `bob@iothub.local`; anything containing `@` is kept.
pub fn normalize_login(login: &str) -> String {
    let login = login.trim();
    if login.contains('@') {
        login.to_owned()
    } else {
        format!("{login}@{LOGIN_DOMAIN}")
    }
}

/// Issues and checks `<user_id>.<expires_unix>.<nonce>.<signature>` tokens.
#[derive(Clone)]
pub struct SessionSigner {
    keyed: HmacSha256,
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner").finish_non_exhaustive()
    }
}

impl SessionSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, AuthError> {
        let keyed = HmacSha256::new_from_slice(secret.as_ref()).map_err(|_| AuthError::Key)?;
        Ok(Self { keyed })
    }

    pub fn issue(&self, user_id: &str, now: DateTime<Utc>) -> String {
        let expires = (now + Duration::hours(SESSION_TTL_HOURS)).timestamp();
        let nonce = Uuid::new_v4().simple().to_string();
        let payload = format!("{user_id}.{expires}.{nonce}");
        let signature = self.sign(&payload);
        format!("{payload}.{signature}")
    }

    /// Returns the user id the token was issued for.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        // User ids may contain dots, so split from the right.
        let mut parts = token.rsplitn(4, '.');
        let (Some(signature), Some(nonce), Some(expires), Some(user_id)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        let payload = format!("{user_id}.{expires}.{nonce}");
        let expected = hex::decode(signature).map_err(|_| AuthError::Malformed)?;
        self.mac(&payload)
            .verify_slice(&expected)
            .map_err(|_| AuthError::BadSignature)?;

        let expires: i64 = expires.parse().map_err(|_| AuthError::Malformed)?;
        if now.timestamp() >= expires {
            return Err(AuthError::Expired);
        }
        Ok(user_id.to_owned())
    }

    fn mac(&self, payload: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(payload.as_bytes());
        mac
    }

    fn sign(&self, payload: &str) -> String {
        hex::encode(self.mac(payload).finalize().into_bytes())
    }
}
