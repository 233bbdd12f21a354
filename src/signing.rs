use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::SignatureConfig;

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub signature_header: (String, String),
    pub timestamp_header: Option<(String, String)>,
}

/// Sign `payload` according to the project's signature settings.
///
/// `timestamp_secs` is the unix time bound into the signature when the
/// project asks for timestamped signatures.
pub fn sign_payload(
    config: &SignatureConfig,
    secret: &str,
    payload: &[u8],
    timestamp_secs: i64,
) -> SignatureHeaders {
    let timestamp = config.include_timestamp.then(|| timestamp_secs.to_string());
    let signature = compute_signature(secret.as_bytes(), payload, timestamp.as_deref());

    SignatureHeaders {
        signature_header: (config.header.clone(), signature),
        timestamp_header: timestamp.map(|ts| (config.timestamp_header.clone(), ts)),
    }
}

/// Compute HMAC-SHA256 over `timestamp || payload`, hex encoded.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    let mut mac = new_mac(secret);
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
    }
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature with optional timestamp.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature_hex: &str,
) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = new_mac(secret);
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
    }
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

fn new_mac(secret: &[u8]) -> Hmac<Sha256> {
    // HMAC accepts keys of any length, so this cannot fail.
    match Hmac::<Sha256>::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamped_signature_verifies() {
        let config = SignatureConfig::default();
        let headers = sign_payload(&config, "s3cret", b"{\"id\":1}", 1_700_000_000);

        assert_eq!(headers.signature_header.0, "X-Webhook-Signature");
        let (ts_name, ts) = headers.timestamp_header.clone().unwrap();
        assert_eq!(ts_name, "X-Webhook-Timestamp");
        assert_eq!(ts, "1700000000");

        let signature = &headers.signature_header.1;
        assert!(verify_signature(b"s3cret", b"{\"id\":1}", Some(&ts), signature));
        assert!(!verify_signature(b"other", b"{\"id\":1}", Some(&ts), signature));
        assert!(!verify_signature(b"s3cret", b"{\"id\":2}", Some(&ts), signature));
    }

    #[test]
    fn untimestamped_signature_omits_header() {
        let config = SignatureConfig {
            header: "X-Sig".into(),
            include_timestamp: false,
            ..SignatureConfig::default()
        };
        let headers = sign_payload(&config, "k", b"body", 42);
        assert!(headers.timestamp_header.is_none());
        assert_eq!(headers.signature_header.1, compute_signature(b"k", b"body", None));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        assert!(!verify_signature(b"k", b"body", None, "zz-not-hex"));
    }
}
