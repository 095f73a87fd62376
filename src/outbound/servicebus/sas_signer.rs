use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::debug;
use url::{Url, form_urlencoded};

/// How long a signed credential stays valid
pub const TOKEN_VALIDITY: Duration = Duration::seconds(3600);

/// Re-sign when the cached credential gets this close to expiry
pub const REFRESH_MARGIN: Duration = Duration::seconds(300);

type HmacSha256 = Hmac<Sha256>;

/// Error type for shared access signature construction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("Shared access key is empty")]
    EmptyKey,

    #[error("Shared access key name is empty")]
    EmptyKeyName,

    #[error("Invalid resource URI: {0}")]
    InvalidResource(String),
}

/// A shared access signature for one resource, valid until `expiry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCredential {
    pub resource: String,

    pub key_name: String,

    /// Unix seconds
    pub expiry: i64,

    /// Base64 HMAC-SHA256, not url-encoded
    pub signature: String,
}

impl SignedCredential {
    /// Value for the `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            url_encode(&self.resource),
            url_encode(&self.signature),
            self.expiry,
            self.key_name
        )
    }

    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() < self.expiry
    }
}

/// Sign `resource_uri` with the shared key, valid for [`TOKEN_VALIDITY`] from `now`.
pub fn sign(
    resource_uri: &str,
    key_name: &str,
    key_value: &str,
    now: OffsetDateTime,
) -> Result<SignedCredential, SigningError> {
    if key_name.is_empty() {
        return Err(SigningError::EmptyKeyName);
    }
    if key_value.is_empty() {
        return Err(SigningError::EmptyKey);
    }
    validate_resource(resource_uri)?;

    let expiry = now.unix_timestamp() + TOKEN_VALIDITY.whole_seconds();
    let string_to_sign = format!("{}\n{}", url_encode(resource_uri), expiry);

    Ok(SignedCredential {
        resource: resource_uri.to_string(),
        key_name: key_name.to_string(),
        expiry,
        signature: hmac_sha256_base64(key_value, &string_to_sign),
    })
}

/// Form url-encoding as the broker expects it: space as `+`, everything outside
/// `[A-Za-z0-9-_.!*()]` as upper-case `%XX`.
pub fn url_encode(value: &str) -> String {
    // form_urlencoded also escapes `!`, `(` and `)`; the signature must match
    // an encoder that leaves them as-is.
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace("%21", "!")
        .replace("%28", "(")
        .replace("%29", ")")
}

fn validate_resource(resource_uri: &str) -> Result<(), SigningError> {
    if resource_uri.trim().is_empty() {
        return Err(SigningError::InvalidResource("empty".to_string()));
    }

    let url = Url::parse(resource_uri)
        .map_err(|e| SigningError::InvalidResource(format!("{resource_uri}: {e}")))?;

    if !matches!(url.scheme(), "https" | "http") {
        return Err(SigningError::InvalidResource(format!(
            "{resource_uri}: unsupported scheme {}",
            url.scheme()
        )));
    }

    Ok(())
}

fn hmac_sha256_base64(key: &str, message: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC key can be of any size, as per crate documentation"),
    };

    mac.update(message.as_bytes());

    STANDARD.encode(mac.finalize().into_bytes())
}

/// Signs requests for one resource and caches the credential.
///
/// The credential is computed once at construction, so malformed keys fail at
/// startup. It is only recomputed when it comes within [`REFRESH_MARGIN`] of
/// expiry, which keeps long-lived consumers from presenting an expired token.
pub struct SasSigner {
    resource: String,
    key_name: String,
    key: String,
    cached: RwLock<SignedCredential>,
}

impl SasSigner {
    pub fn new(resource: &str, key_name: &str, key: &str) -> Result<Self, SigningError> {
        Self::new_at(resource, key_name, key, OffsetDateTime::now_utc())
    }

    pub fn new_at(
        resource: &str,
        key_name: &str,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<Self, SigningError> {
        let credential = sign(resource, key_name, key, now)?;

        Ok(Self {
            resource: resource.to_string(),
            key_name: key_name.to_string(),
            key: key.to_string(),
            cached: RwLock::new(credential),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current credential, re-signed if it is about to expire
    pub async fn credential(&self) -> Result<SignedCredential, SigningError> {
        self.credential_at(OffsetDateTime::now_utc()).await
    }

    pub async fn credential_at(
        &self,
        now: OffsetDateTime,
    ) -> Result<SignedCredential, SigningError> {
        {
            let cached = self.cached.read().await;
            if cached.is_valid_at(now + REFRESH_MARGIN) {
                return Ok(cached.clone());
            }
        }

        let mut cached = self.cached.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if !cached.is_valid_at(now + REFRESH_MARGIN) {
            *cached = sign(&self.resource, &self.key_name, &self.key, now)?;
            debug!(resource = %self.resource, expiry = cached.expiry, "Refreshed shared access signature");
        }

        Ok(cached.clone())
    }
}

impl std::fmt::Debug for SasSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasSigner")
            .field("resource", &self.resource)
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}
