use std::fmt;

use url::Url;

use crate::config::ConfigurationError;

const ENDPOINT: &str = "endpoint";
const KEY_NAME: &str = "sharedaccesskeyname";
const KEY: &str = "sharedaccesskey";
const ENTITY_PATH: &str = "entitypath";

/// Typed view of a brokered-queue connection string:
/// `Endpoint=sb://ns.example.net/;SharedAccessKeyName=..;SharedAccessKey=..;EntityPath=..`
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    base_address: String,
    key_name: String,
    key: String,
    entity_path: Option<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // Split on the first '=' only; base64 keys end with '=' padding.
            let Some((name, value)) = segment.split_once('=') else {
                return Err(ConfigurationError::MalformedSegment(segment.to_string()));
            };
            let name = name.trim();
            let value = value.trim();

            let slot = match name.to_ascii_lowercase().as_str() {
                ENDPOINT => &mut endpoint,
                KEY_NAME => &mut key_name,
                KEY => &mut key,
                ENTITY_PATH => &mut entity_path,
                _ => return Err(ConfigurationError::UnknownKey(name.to_string())),
            };

            if slot.is_some() {
                return Err(ConfigurationError::DuplicateKey(name.to_string()));
            }
            if value.is_empty() {
                return Err(ConfigurationError::EmptyValue(name.to_string()));
            }
            *slot = Some(value.to_string());
        }

        let endpoint = endpoint.ok_or(ConfigurationError::MissingKey("Endpoint"))?;
        let key_name = key_name.ok_or(ConfigurationError::MissingKey("SharedAccessKeyName"))?;
        let key = key.ok_or(ConfigurationError::MissingKey("SharedAccessKey"))?;

        Ok(Self {
            base_address: normalize_endpoint(&endpoint)?,
            key_name,
            key,
            entity_path,
        })
    }

    /// REST base address, always `https://` (or `http://`) and ending with `/`
    pub fn base_address(&self) -> &str {
        &self.base_address
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("base_address", &self.base_address)
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

/// Map the AMQP-style `sb://` scheme onto the REST transport.
fn normalize_endpoint(endpoint: &str) -> Result<String, ConfigurationError> {
    let candidate = match endpoint.strip_prefix("sb://") {
        Some(rest) => format!("https://{rest}"),
        None => endpoint.to_string(),
    };

    let url = Url::parse(&candidate)
        .map_err(|e| ConfigurationError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

    if !matches!(url.scheme(), "https" | "http") || url.host_str().is_none() {
        return Err(ConfigurationError::InvalidEndpoint(endpoint.to_string()));
    }

    let mut base = url.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(base)
}
