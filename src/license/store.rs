//! Encrypted at-rest license storage and the license record model.

use crate::errors::LicenseError;
use crate::license::crypto::{self, EncryptedBlob};
use chrono::{DateTime, Months, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Licensed term length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LicenseDuration {
    #[serde(rename = "1m")]
    OneMonth,
    #[serde(rename = "3m")]
    ThreeMonths,
    #[serde(rename = "6m")]
    SixMonths,
    #[serde(rename = "1y")]
    OneYear,
    #[serde(rename = "lifetime")]
    Lifetime,
}

impl LicenseDuration {
    /// Extend a point in time by this duration. Lifetime terms are
    /// represented as a far-future expiry.
    pub fn extend(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        let months = match self {
            Self::OneMonth => 1,
            Self::ThreeMonths => 3,
            Self::SixMonths => 6,
            Self::OneYear => 12,
            Self::Lifetime => 1200,
        };
        base.checked_add_months(Months::new(months)).unwrap_or(base)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMonth => "1m",
            Self::ThreeMonths => "3m",
            Self::SixMonths => "6m",
            Self::OneYear => "1y",
            Self::Lifetime => "lifetime",
        }
    }
}

/// Derived license health, reported to UI consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Active,
    Expired,
    Critical,
    Warning,
    Revoked,
}

/// Shape of a license key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// One-time scratch card, `ISX-XXXX-XXXX-XXXX-XXXX`. Its term is
    /// decided by the issuer at activation.
    Scratch,
    /// Term key, `ISX{1M|3M|6M|1Y}` followed by an alphanumeric body.
    Term(LicenseDuration),
}

/// Parse and validate a license key's format.
pub fn parse_license_key(key: &str) -> Result<KeyKind, LicenseError> {
    let key = key.trim();
    if let Some(rest) = key.strip_prefix("ISX-") {
        let groups: Vec<&str> = rest.split('-').collect();
        let well_formed = groups.len() == 4
            && groups
                .iter()
                .all(|g| g.len() == 4 && g.chars().all(|c| c.is_ascii_alphanumeric()));
        return if well_formed {
            Ok(KeyKind::Scratch)
        } else {
            Err(LicenseError::InvalidFormat)
        };
    }
    for (prefix, duration) in [
        ("ISX1M", LicenseDuration::OneMonth),
        ("ISX3M", LicenseDuration::ThreeMonths),
        ("ISX6M", LicenseDuration::SixMonths),
        ("ISX1Y", LicenseDuration::OneYear),
    ] {
        if let Some(body) = key.strip_prefix(prefix) {
            return if !body.is_empty() && body.chars().all(|c| c.is_ascii_alphanumeric()) {
                Ok(KeyKind::Term(duration))
            } else {
                Err(LicenseError::InvalidFormat)
            };
        }
    }
    Err(LicenseError::InvalidFormat)
}

/// The decrypted license record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub license_key: String,
    pub user_email: String,
    pub issued_at: DateTime<Utc>,
    pub expiry_at: DateTime<Utc>,
    pub duration: LicenseDuration,
    pub device_fingerprint: String,
    pub status: LicenseStatus,
    pub last_checked_at: DateTime<Utc>,
}

/// Encrypted license blob on disk, guarded by an exclusive file lock so
/// concurrent activation and stacking writes serialize.
#[derive(Debug, Clone)]
pub struct LicenseStore {
    path: PathBuf,
    secret: Vec<u8>,
}

impl LicenseStore {
    pub fn new(path: impl Into<PathBuf>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            secret: secret.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<LicenseRecord, LicenseError> {
        if !self.path.exists() {
            return Err(LicenseError::NotActivated);
        }
        read_record(&self.path, &self.secret)
    }

    /// Decrypt a record from an arbitrary blob file with this store's
    /// secret, e.g. an out-of-band handoff file.
    pub fn read_record_at(&self, path: &Path) -> Result<LicenseRecord, LicenseError> {
        read_record(path, &self.secret)
    }

    pub fn save(&self, record: &LicenseRecord) -> Result<(), LicenseError> {
        let _lock = self.lock_exclusive()?;
        let plaintext =
            serde_json::to_vec(record).map_err(|e| anyhow::anyhow!("serialize license: {e}"))?;
        let blob = crypto::seal(&plaintext, &self.secret, b"")?;
        let json = serde_json::to_vec_pretty(&blob)
            .map_err(|e| anyhow::anyhow!("serialize blob: {e}"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| LicenseError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json).map_err(|source| LicenseError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| LicenseError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), LicenseError> {
        let _lock = self.lock_exclusive()?;
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|source| LicenseError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn lock_exclusive(&self) -> Result<fs::File, LicenseError> {
        let lock_path = self.path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|source| LicenseError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| LicenseError::Io {
                path: lock_path.clone(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| LicenseError::Io {
            path: lock_path,
            source,
        })?;
        Ok(file)
    }
}

/// Read and decrypt a license record from an arbitrary blob file. Used
/// for the regular store path and for out-of-band handoff files.
pub fn read_record(path: &Path, secret: &[u8]) -> Result<LicenseRecord, LicenseError> {
    let raw = fs::read(path).map_err(|source| LicenseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let blob: EncryptedBlob =
        serde_json::from_slice(&raw).map_err(|_| LicenseError::InvalidFormat)?;
    let plaintext = crypto::open(&blob, secret, b"")?;
    serde_json::from_slice(&plaintext).map_err(|_| LicenseError::IntegrityFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::fingerprint::device_fingerprint;
    use tempfile::tempdir;

    fn record() -> LicenseRecord {
        let now = Utc::now();
        LicenseRecord {
            license_key: "ISX3MABCDEF".to_string(),
            user_email: "trader@example.iq".to_string(),
            issued_at: now,
            expiry_at: LicenseDuration::ThreeMonths.extend(now),
            duration: LicenseDuration::ThreeMonths,
            device_fingerprint: device_fingerprint(),
            status: LicenseStatus::Active,
            last_checked_at: now,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("license.dat"), b"secret".to_vec());
        let rec = record();
        store.save(&rec).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.license_key, rec.license_key);
        assert_eq!(loaded.expiry_at, rec.expiry_at);
        assert_eq!(loaded.duration, LicenseDuration::ThreeMonths);
    }

    #[test]
    fn missing_file_is_not_activated() {
        let dir = tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("license.dat"), b"secret".to_vec());
        assert!(matches!(store.load(), Err(LicenseError::NotActivated)));
    }

    #[test]
    fn wrong_secret_fails_integrity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("license.dat");
        let store = LicenseStore::new(path.clone(), b"secret".to_vec());
        store.save(&record()).unwrap();

        let other = LicenseStore::new(path, b"not-the-secret".to_vec());
        assert!(matches!(other.load(), Err(LicenseError::IntegrityFailure)));
    }

    #[test]
    fn on_disk_blob_is_not_plaintext() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("license.dat");
        let store = LicenseStore::new(path.clone(), b"secret".to_vec());
        store.save(&record()).unwrap();

        let raw = std::fs::read_to_string(path).unwrap();
        assert!(!raw.contains("trader@example.iq"));
        assert!(!raw.contains("ISX3MABCDEF"));
        assert!(raw.contains("ciphertext"));
    }

    #[test]
    fn scratch_key_format() {
        assert_eq!(
            parse_license_key("ISX-AB12-CD34-EF56-GH78").unwrap(),
            KeyKind::Scratch
        );
        assert!(parse_license_key("ISX-AB12-CD34-EF56").is_err());
        assert!(parse_license_key("ISX-AB12-CD34-EF56-GH7!").is_err());
        assert!(parse_license_key("ISX-AB12-CD34-EF56-GH789").is_err());
    }

    #[test]
    fn term_key_format() {
        assert_eq!(
            parse_license_key("ISX1MABC123").unwrap(),
            KeyKind::Term(LicenseDuration::OneMonth)
        );
        assert_eq!(
            parse_license_key("ISX1YXYZ789").unwrap(),
            KeyKind::Term(LicenseDuration::OneYear)
        );
        assert!(parse_license_key("ISX1M").is_err());
        assert!(parse_license_key("ISX2MABC").is_err());
        assert!(parse_license_key("BGX1MABC").is_err());
    }

    #[test]
    fn duration_extends_from_base() {
        let base = DateTime::parse_from_rfc3339("2024-06-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let extended = LicenseDuration::SixMonths.extend(base);
        assert_eq!(extended.to_rfc3339(), "2024-12-15T00:00:00+00:00");
    }

    #[test]
    fn duration_serde_uses_short_names() {
        let json = serde_json::to_string(&LicenseDuration::OneYear).unwrap();
        assert_eq!(json, "\"1y\"");
        let back: LicenseDuration = serde_json::from_str("\"lifetime\"").unwrap();
        assert_eq!(back, LicenseDuration::Lifetime);
    }
}
