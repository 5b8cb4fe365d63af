//! Request signing for the store's action API.
//!
//! Every request carries the access key id, instance, timestamp and a
//! digest of its body, plus a keyed blake3 MAC over those values. The MAC
//! key is derived from the access key secret, so the secret itself never
//! leaves the process.

use chrono::{DateTime, SecondsFormat, Utc};

pub const HEADER_ACCESS_KEY_ID: &str = "x-ots-accesskeyid";
pub const HEADER_INSTANCE: &str = "x-ots-instancename";
pub const HEADER_DATE: &str = "x-ots-date";
pub const HEADER_API_VERSION: &str = "x-ots-apiversion";
pub const HEADER_CONTENT_DIGEST: &str = "x-ots-contentdigest";
pub const HEADER_SIGNATURE: &str = "x-ots-signature";

pub const API_VERSION: &str = "2015-12-31";

const KEY_CONTEXT: &str = "tablestore-nodestore 2024-01-01 request signing key";

/// Headers to attach to one signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub access_key_id: String,
    pub instance: String,
    pub date: String,
    pub content_digest: String,
    pub signature: String,
}

impl SignedHeaders {
    /// All signing headers as name/value pairs, including the static ones.
    pub fn pairs(&self) -> [(&'static str, &str); 6] {
        [
            (HEADER_ACCESS_KEY_ID, self.access_key_id.as_str()),
            (HEADER_INSTANCE, self.instance.as_str()),
            (HEADER_API_VERSION, API_VERSION),
            (HEADER_DATE, self.date.as_str()),
            (HEADER_CONTENT_DIGEST, self.content_digest.as_str()),
            (HEADER_SIGNATURE, self.signature.as_str()),
        ]
    }
}

/// Signs requests with a credential pair.
#[derive(Clone)]
pub struct RequestSigner {
    access_key_id: String,
    instance: String,
    key: [u8; 32],
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("access_key_id", &self.access_key_id)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn new(
        access_key_id: impl Into<String>,
        access_key_secret: &str,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            instance: instance.into(),
            key: blake3::derive_key(KEY_CONTEXT, access_key_secret.as_bytes()),
        }
    }

    /// Signs a request to `action` with `body`, timestamped now.
    pub fn sign(&self, action: &str, body: &[u8]) -> SignedHeaders {
        self.sign_at(action, body, Utc::now())
    }

    /// Signs a request with an explicit timestamp.
    pub fn sign_at(&self, action: &str, body: &[u8], at: DateTime<Utc>) -> SignedHeaders {
        let date = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let content_digest = blake3::hash(body).to_hex().to_string();
        let canonical = self.canonical(action, &date, &content_digest);
        let signature = hex::encode(blake3::keyed_hash(&self.key, canonical.as_bytes()).as_bytes());

        SignedHeaders {
            access_key_id: self.access_key_id.clone(),
            instance: self.instance.clone(),
            date,
            content_digest,
            signature,
        }
    }

    /// Checks that `headers` name this signer's credential and carry a
    /// valid signature. The signature comparison is constant-time.
    pub fn verify(&self, action: &str, headers: &SignedHeaders) -> bool {
        if headers.access_key_id != self.access_key_id || headers.instance != self.instance {
            return false;
        }
        let canonical = self.canonical(action, &headers.date, &headers.content_digest);
        let expected = blake3::keyed_hash(&self.key, canonical.as_bytes());

        let Ok(bytes) = hex::decode(&headers.signature) else {
            return false;
        };
        let Ok(provided) = <[u8; 32]>::try_from(bytes.as_slice()) else {
            return false;
        };
        // blake3::Hash equality is constant-time
        expected == blake3::Hash::from(provided)
    }

    fn canonical(&self, action: &str, date: &str, content_digest: &str) -> String {
        format!(
            "/{action}\n{HEADER_ACCESS_KEY_ID}:{}\n{HEADER_API_VERSION}:{API_VERSION}\n\
             {HEADER_CONTENT_DIGEST}:{content_digest}\n{HEADER_DATE}:{date}\n\
             {HEADER_INSTANCE}:{}\n",
            self.access_key_id, self.instance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signer() -> RequestSigner {
        RequestSigner::new("key-id", "secret", "sentry")
    }

    #[test]
    fn test_signature_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let a = signer().sign_at("GetRow", b"{}", at);
        let b = signer().sign_at("GetRow", b"{}", at);
        assert_eq!(a, b);
        assert_eq!(a.date, "2024-05-01T12:00:00.000Z");
        assert_eq!(a.signature.len(), 64);
    }

    #[test]
    fn test_signature_covers_action_body_and_secret() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let base = signer().sign_at("GetRow", b"{}", at);

        assert_ne!(base, signer().sign_at("PutRow", b"{}", at));
        assert_ne!(base, signer().sign_at("GetRow", b"{\"a\":1}", at));
        assert_ne!(
            base.signature,
            RequestSigner::new("key-id", "other", "sentry")
                .sign_at("GetRow", b"{}", at)
                .signature
        );
    }

    #[test]
    fn test_verify() {
        let headers = signer().sign("DeleteRow", b"body");
        assert!(signer().verify("DeleteRow", &headers));
        assert!(!signer().verify("PutRow", &headers));

        let mut tampered = headers.clone();
        tampered.signature = "00".repeat(32);
        assert!(!signer().verify("DeleteRow", &tampered));

        tampered.signature = "not hex".to_string();
        assert!(!signer().verify("DeleteRow", &tampered));

        let mut other_instance = headers.clone();
        other_instance.instance = "other".to_string();
        assert!(!signer().verify("DeleteRow", &other_instance));
    }

    #[test]
    fn test_headers_carry_credential_identity() {
        let headers = signer().sign("GetRow", b"{}");
        let pairs = headers.pairs();

        assert_eq!(pairs[0], (HEADER_ACCESS_KEY_ID, "key-id"));
        assert_eq!(pairs[1], (HEADER_INSTANCE, "sentry"));
        assert_eq!(pairs[2], (HEADER_API_VERSION, API_VERSION));
        assert_eq!(pairs[5], (HEADER_SIGNATURE, headers.signature.as_str()));
    }

    #[test]
    fn test_debug_hides_key() {
        let rendered = format!("{:?}", signer());
        assert!(rendered.contains("key-id"));
        assert!(!rendered.contains("key:"));
    }
}
