//! The known-logs list: the operator-supplied JSON file that maps log URLs to
//! public keys, in the format published by certificate-transparency.org.
//!
//! Only `key` and `url` feed the core; URLs in the standard file are
//! scheme-less and get `https://` prefixed by the client.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::MirrorError;
use crate::sth::LogPublicKey;

#[derive(Debug, Clone, Deserialize)]
pub struct KnownLog {
    #[serde(default)]
    pub description: String,
    /// Base64-encoded SubjectPublicKeyInfo.
    pub key: String,
    /// Scheme-less URL, e.g. `ct.googleapis.com/rocketeer`.
    pub url: String,
    #[serde(default)]
    pub maximum_merge_delay: u64,
}

#[derive(Debug, Deserialize)]
struct KnownLogsFile {
    logs: Vec<KnownLog>,
}

/// Load the known-logs file.
pub fn load_known_logs(path: &Path) -> Result<Vec<KnownLog>, MirrorError> {
    let raw = std::fs::read(path)?;
    let file: KnownLogsFile = serde_json::from_slice(&raw)
        .map_err(|e| MirrorError::Config(format!("known-logs file {}: {e}", path.display())))?;
    Ok(file.logs)
}

/// One log as the rest of the system sees it: resolved key, derived names,
/// and the batch hint the pipeline partitions work by.
#[derive(Debug, Clone)]
pub struct LogDescriptor {
    /// The identifier from the known-logs list, e.g.
    /// `ct.googleapis.com/rocketeer`.
    pub id: String,
    /// Fetch base, `https://` plus the identifier.
    pub base_url: String,
    /// Directory-safe name: the identifier with `/` replaced by `_`.
    pub name: String,
    pub public_key: LogPublicKey,
    /// Server-side `get-entries` cap hint.
    pub batch_hint: u64,
}

impl LogDescriptor {
    pub fn from_known(log: &KnownLog, batch_hint: u64) -> Result<Self, MirrorError> {
        let id = log.url.trim_matches('/').to_string();
        if id.is_empty() {
            return Err(MirrorError::Config("known log with empty url".into()));
        }
        let spki = BASE64
            .decode(log.key.as_bytes())
            .map_err(|e| MirrorError::Config(format!("log {id}: key is not base64: {e}")))?;
        Ok(Self {
            base_url: format!("https://{id}"),
            name: id.replace('/', "_"),
            public_key: LogPublicKey::from_spki_der(&spki)?,
            id,
            batch_hint,
        })
    }
}

/// Find the selected log in the list. The identifier matches the `url` field
/// with surrounding slashes ignored.
pub fn select_log(
    logs: &[KnownLog],
    identifier: &str,
    batch_hint: u64,
) -> Result<LogDescriptor, MirrorError> {
    let wanted = identifier.trim_matches('/');
    logs.iter()
        .find(|log| log.url.trim_matches('/') == wanted)
        .ok_or_else(|| MirrorError::UnknownLog(identifier.to_string()))
        .and_then(|log| LogDescriptor::from_known(log, batch_hint))
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;

    use super::*;

    fn spki_b64() -> String {
        let key = SigningKey::from_slice(&[0x42; 32]).unwrap();
        let der = key.verifying_key().to_public_key_der().unwrap();
        BASE64.encode(der.as_bytes())
    }

    fn known(url: &str) -> KnownLog {
        KnownLog {
            description: "test log".into(),
            key: spki_b64(),
            url: url.into(),
            maximum_merge_delay: 86400,
        }
    }

    #[test]
    fn descriptor_derives_urls_and_name() {
        let log = known("ct.googleapis.com/rocketeer/");
        let desc = LogDescriptor::from_known(&log, 1024).unwrap();
        assert_eq!(desc.id, "ct.googleapis.com/rocketeer");
        assert_eq!(desc.base_url, "https://ct.googleapis.com/rocketeer");
        assert_eq!(desc.name, "ct.googleapis.com_rocketeer");
        assert_eq!(desc.batch_hint, 1024);
    }

    #[test]
    fn select_ignores_surrounding_slashes() {
        let logs = vec![known("ct.example.net/log")];
        assert!(select_log(&logs, "ct.example.net/log/", 256).is_ok());
        assert!(matches!(
            select_log(&logs, "ct.example.net/other", 256),
            Err(MirrorError::UnknownLog(_))
        ));
    }

    #[test]
    fn bad_key_is_a_config_error() {
        let mut log = known("ct.example.net/log");
        log.key = "!!not-base64!!".into();
        assert!(matches!(
            LogDescriptor::from_known(&log, 256),
            Err(MirrorError::Config(_))
        ));
    }

    #[test]
    fn known_logs_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log_list.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"logs":[{{"description":"d","key":"{}","url":"ct.example.net/log","maximum_merge_delay":86400}}]}}"#,
                spki_b64()
            ),
        )
        .unwrap();
        let logs = load_known_logs(&path).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].url, "ct.example.net/log");
    }
}
