use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{PerpError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_API_KEY: &str = "X-API-KEY";
pub const HEADER_TIMESTAMP: &str = "X-TIMESTAMP";
pub const HEADER_SIGNATURE: &str = "X-SIGNATURE";

/// HMAC request signer for the exchange gateway
#[derive(Clone)]
pub struct RequestSigner {
    api_key: String,
    secret: Zeroizing<String>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl RequestSigner {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// Hex HMAC-SHA256 over `timestamp + METHOD + path + body`.
    pub fn sign(&self, timestamp_ms: i64, method: &str, path: &str, body: &str) -> Result<String> {
        let message = format!("{}{}{}{}", timestamp_ms, method.to_uppercase(), path, body);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| PerpError::Internal(format!("HMAC init failed: {}", e)))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Build authentication headers for a request
    pub fn headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, method, path, body)?;

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_API_KEY, header_value(&self.api_key)?);
        headers.insert(HEADER_TIMESTAMP, header_value(&timestamp.to_string())?);
        headers.insert(HEADER_SIGNATURE, header_value(&signature)?);
        Ok(headers)
    }
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw)
        .map_err(|e| PerpError::Validation(format!("invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let signer = RequestSigner::new("key", "secret");
        let a = signer.sign(1_700_000_000_000, "post", "/v1/orders", "{}").unwrap();
        let b = signer.sign(1_700_000_000_000, "POST", "/v1/orders", "{}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let c = signer.sign(1_700_000_000_001, "POST", "/v1/orders", "{}").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let signer = RequestSigner::new("key", "hunter2");
        assert!(!format!("{:?}", signer).contains("hunter2"));
    }

    #[test]
    fn test_headers_present() {
        let headers = RequestSigner::new("key", "secret")
            .headers("GET", "/v1/account", "")
            .unwrap();
        assert_eq!(headers.get(HEADER_API_KEY).unwrap(), "key");
        assert!(headers.contains_key(HEADER_SIGNATURE));
    }
}
