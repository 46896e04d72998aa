use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL_SAFE},
    Engine,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid base64 secret: {0}")]
    InvalidSecret(#[from] base64::DecodeError),

    #[error("HMAC computation failed: {0}")]
    Hmac(String),
}

/// Credentials for the CLOB L2 auth scheme.
#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

impl VenueCredentials {
    pub fn new(api_key: String, api_secret: String, passphrase: String) -> Self {
        Self {
            api_key,
            api_secret,
            passphrase,
        }
    }

    /// HMAC-SHA256 over `{timestamp}{method}{path}{body}`.
    ///
    /// Secrets are issued in URL-safe base64; the standard alphabet is tried
    /// as a fallback for older keys.
    pub fn sign(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, AuthError> {
        let secret_bytes = BASE64_URL_SAFE
            .decode(&self.api_secret)
            .or_else(|_| BASE64.decode(&self.api_secret))?;

        let message = format!("{timestamp}{method}{path}{body}");

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| AuthError::Hmac(e.to_string()))?;
        mac.update(message.as_bytes());

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_produces_base64_output() {
        let secret = BASE64.encode(b"test-secret-key-1234");
        let creds = VenueCredentials::new("key".into(), secret, "pass".into());

        let sig = creds.sign("1700000000", "POST", "/order", "{}").unwrap();

        assert!(BASE64.decode(&sig).is_ok());
        assert_eq!(sig.len(), 44); // 32 bytes, base64-encoded
    }

    #[test]
    fn sign_is_deterministic_per_message() {
        let secret = BASE64.encode(b"another-secret");
        let creds = VenueCredentials::new("key".into(), secret, "pass".into());

        let a = creds.sign("1700000000", "GET", "/orders", "").unwrap();
        let b = creds.sign("1700000000", "GET", "/orders", "").unwrap();
        let c = creds.sign("1700000001", "GET", "/orders", "").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
