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

/// API credentials and request signing for the exchange REST API.
///
/// The secret is decoded at construction so a malformed credential fails at
/// startup instead of on the first signed request.
#[derive(Debug, Clone)]
pub struct ApiAuth {
    pub api_key: String,
    pub passphrase: String,
    secret: Vec<u8>,
}

impl ApiAuth {
    /// Issuers hand out base64 secrets, sometimes in the URL-safe alphabet
    /// (with - and _); accept either.
    pub fn from_base64(
        api_key: String,
        api_secret: &str,
        passphrase: String,
    ) -> Result<Self, AuthError> {
        let secret = BASE64_URL_SAFE
            .decode(api_secret)
            .or_else(|_| BASE64.decode(api_secret))?;
        Ok(Self {
            api_key,
            passphrase,
            secret,
        })
    }

    /// HMAC-SHA256 over `{timestamp}{method}{path}{body}`, base64-encoded.
    pub fn sign(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthError::Hmac(e.to_string()))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}
