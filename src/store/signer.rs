//! HMAC-SHA256 capability URLs.
//!
//! A capability binds an operation, an object key, an optional multipart
//! upload id and part number, and an expiry. Anything else in the URL is
//! ignored by verification.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use super::{SignedUrl, StoreError, StoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Operation a capability URL grants.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreOp {
    /// PUT one part of a multipart session.
    Part,
    /// PUT a whole object.
    Object,
    /// GET a whole object.
    Read,
}

impl StoreOp {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreOp::Part => "part",
            StoreOp::Object => "object",
            StoreOp::Read => "read",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Capability<'a> {
    pub op: StoreOp,
    pub key: &'a str,
    pub upload_id: Option<&'a str>,
    pub part_number: Option<u32>,
    /// Unix seconds after which the capability is refused.
    pub expires: i64,
}

impl Capability<'_> {
    fn canonical(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.op.as_str(),
            self.key,
            self.upload_id.unwrap_or(""),
            self.part_number.map(|n| n.to_string()).unwrap_or_default(),
            self.expires
        )
    }
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    public_url: String,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("public_url", &self.public_url)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, public_url: impl Into<String>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Expiry (unix seconds) for a capability issued now with `ttl`.
    pub fn expiry_after(ttl: Duration) -> i64 {
        Utc::now().timestamp() + ttl.as_secs() as i64
    }

    fn mac(&self, cap: &Capability<'_>) -> StoreResult<HmacSha256> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| StoreError::InvalidSignature)?;
        mac.update(cap.canonical().as_bytes());
        Ok(mac)
    }

    /// Hex signature of a capability.
    pub fn sign(&self, cap: &Capability<'_>) -> StoreResult<String> {
        Ok(hex::encode(self.mac(cap)?.finalize().into_bytes()))
    }

    /// Build the full URL for a capability.
    pub fn url(&self, cap: &Capability<'_>) -> StoreResult<SignedUrl> {
        let signature = self.sign(cap)?;
        let mut query = format!("op={}", cap.op.as_str());
        if let Some(upload_id) = cap.upload_id {
            query.push_str(&format!("&uploadId={}", upload_id));
        }
        if let Some(part_number) = cap.part_number {
            query.push_str(&format!("&partNumber={}", part_number));
        }
        query.push_str(&format!("&expires={}&signature={}", cap.expires, signature));

        let expires_at: DateTime<Utc> = Utc
            .timestamp_opt(cap.expires, 0)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(SignedUrl {
            url: format!("{}/store/{}?{}", self.public_url, cap.key, query),
            expires_at,
        })
    }

    /// Check expiry and signature. `now` is unix seconds.
    pub fn verify(&self, cap: &Capability<'_>, signature: &str, now: i64) -> StoreResult<()> {
        if cap.expires < now {
            return Err(StoreError::UrlExpired);
        }
        let provided = hex::decode(signature).map_err(|_| StoreError::InvalidSignature)?;
        self.mac(cap)?
            .verify_slice(&provided)
            .map_err(|_| StoreError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part_cap(expires: i64) -> Capability<'static> {
        Capability {
            op: StoreOp::Part,
            key: "videos/alice/clip.webm",
            upload_id: Some("u-1"),
            part_number: Some(3),
            expires,
        }
    }

    #[test]
    fn signed_capability_verifies() {
        let signer = UrlSigner::new("secret", "http://localhost:3000/");
        let cap = part_cap(2_000);
        let sig = signer.sign(&cap).unwrap();
        assert!(signer.verify(&cap, &sig, 1_000).is_ok());

        let url = signer.url(&cap).unwrap().url;
        assert!(url.starts_with("http://localhost:3000/store/videos/alice/clip.webm?op=part"));
        assert!(url.contains("uploadId=u-1"));
        assert!(url.contains("partNumber=3"));
        assert!(url.contains(&format!("signature={}", sig)));
    }

    #[test]
    fn capability_is_scoped_to_one_part() {
        let signer = UrlSigner::new("secret", "http://localhost");
        let cap = part_cap(2_000);
        let sig = signer.sign(&cap).unwrap();

        let other_part = Capability {
            part_number: Some(4),
            ..cap
        };
        assert!(matches!(
            signer.verify(&other_part, &sig, 1_000),
            Err(StoreError::InvalidSignature)
        ));

        let other_op = Capability {
            op: StoreOp::Object,
            ..cap
        };
        assert!(signer.verify(&other_op, &sig, 1_000).is_err());
    }

    #[test]
    fn expired_capability_is_refused() {
        let signer = UrlSigner::new("secret", "http://localhost");
        let cap = part_cap(1_000);
        let sig = signer.sign(&cap).unwrap();
        assert!(matches!(
            signer.verify(&cap, &sig, 1_001),
            Err(StoreError::UrlExpired)
        ));
    }

    #[test]
    fn different_secret_is_refused() {
        let cap = part_cap(2_000);
        let sig = UrlSigner::new("one", "http://localhost").sign(&cap).unwrap();
        let other = UrlSigner::new("two", "http://localhost");
        assert!(other.verify(&cap, &sig, 0).is_err());
        assert!(other.verify(&cap, "not-hex", 0).is_err());
    }
}
