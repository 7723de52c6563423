//! License lifecycle: offline validation, activation against the remote
//! issuer, and one-time key stacking.
//!
//! The manager is the single authority on license state. The orchestrator
//! calls `validate` exactly once per operation start; the server calls it
//! on a schedule for UI refresh. A decrypted view is cached with a TTL so
//! repeated gating does not hit the disk.

use crate::errors::LicenseError;
use crate::license::crypto;
use crate::license::fingerprint::device_fingerprint;
use crate::license::store::{
    LicenseDuration, LicenseRecord, LicenseStatus, LicenseStore, parse_license_key,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Outbound activation request, encrypted on the wire with the request
/// id as associated data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub license_key: String,
    pub device_fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

/// Issuer verdict carried inside the encrypted response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Granted,
    AlreadyActivated,
    Revoked,
    Rejected,
}

/// Decrypted issuer response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationGrant {
    pub status: GrantStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_at: Option<DateTime<Utc>>,
    pub duration: LicenseDuration,
    #[serde(default)]
    pub message: String,
}

/// Request/response envelope: the request id travels in the clear so the
/// peer can bind it as associated data when opening the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub request_id: String,
    pub payload: crypto::EncryptedBlob,
}

/// Transport to the remote license issuer.
#[async_trait]
pub trait IssuerClient: Send + Sync {
    /// Submit a key for activation or stacking. The issuer consumes the
    /// key atomically; replaying a consumed key yields `AlreadyActivated`.
    async fn activate(&self, request: &ActivationRequest) -> Result<ActivationGrant, LicenseError>;
}

/// HTTPS issuer client speaking the encrypted envelope contract.
pub struct HttpIssuerClient {
    base_url: String,
    secret: Vec<u8>,
    client: reqwest::Client,
}

impl HttpIssuerClient {
    pub fn new(base_url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            base_url: base_url.into(),
            secret: secret.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IssuerClient for HttpIssuerClient {
    async fn activate(&self, request: &ActivationRequest) -> Result<ActivationGrant, LicenseError> {
        let plaintext = serde_json::to_vec(request)
            .map_err(|e| anyhow::anyhow!("serialize activation request: {e}"))?;
        let payload = crypto::seal(&plaintext, &self.secret, request.request_id.as_bytes())?;
        let envelope = WireEnvelope {
            request_id: request.request_id.clone(),
            payload,
        };

        let url = format!("{}/api/license/activate", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LicenseError::Network(format!(
                "issuer returned {}",
                response.status()
            )));
        }
        let body: WireEnvelope = response
            .json()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;

        let plain = crypto::open(&body.payload, &self.secret, request.request_id.as_bytes())?;
        serde_json::from_slice(&plain).map_err(|_| LicenseError::IntegrityFailure)
    }
}

/// Read-only license projection for UI consumers. Never carries the full
/// key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseInfo {
    pub license_key_masked: String,
    pub user_email: String,
    pub issued_at: DateTime<Utc>,
    pub expiry_at: DateTime<Utc>,
    pub duration: LicenseDuration,
    pub status: LicenseStatus,
    pub last_checked_at: DateTime<Utc>,
    pub days_remaining: i64,
    pub in_grace: bool,
}

/// Result of a validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<LicenseInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LicenseValidation {
    fn invalid(reason: impl Into<String>, info: Option<LicenseInfo>) -> Self {
        Self {
            valid: false,
            info,
            reason: Some(reason.into()),
        }
    }
}

struct CachedRecord {
    record: LicenseRecord,
    fetched_at: Instant,
}

/// Default offline grace window after expiry.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(72 * 60 * 60);
/// Default TTL of the cached decrypted record.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub struct LicenseManager {
    store: LicenseStore,
    issuer: std::sync::Arc<dyn IssuerClient>,
    grace: chrono::Duration,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedRecord>>,
    /// Out-of-band handoff record, honored for the process lifetime.
    handoff: RwLock<Option<LicenseRecord>>,
}

impl LicenseManager {
    pub fn new(store: LicenseStore, issuer: std::sync::Arc<dyn IssuerClient>) -> Self {
        Self::with_policy(store, issuer, DEFAULT_GRACE, DEFAULT_CACHE_TTL)
    }

    pub fn with_policy(
        store: LicenseStore,
        issuer: std::sync::Arc<dyn IssuerClient>,
        grace: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            issuer,
            grace: chrono::Duration::from_std(grace)
                .unwrap_or_else(|_| chrono::Duration::hours(72)),
            cache_ttl,
            cache: RwLock::new(None),
            handoff: RwLock::new(None),
        }
    }

    /// Check the license against this machine and the clock.
    ///
    /// Valid iff the blob decrypts, the fingerprint matches this host,
    /// and `now < expiry + grace`. Status thresholds: `Critical` within
    /// 7 days of expiry, `Warning` within 14.
    pub async fn validate(&self) -> LicenseValidation {
        let record = match self.current_record().await {
            Ok(record) => record,
            Err(err) => return LicenseValidation::invalid(err.to_string(), None),
        };
        let now = Utc::now();

        if record.device_fingerprint != device_fingerprint() {
            return LicenseValidation::invalid(
                LicenseError::FingerprintMismatch.to_string(),
                None,
            );
        }
        if record.status == LicenseStatus::Revoked {
            return LicenseValidation::invalid(LicenseError::Revoked.to_string(), None);
        }

        let status = derive_status(&record, now);
        let info = project(&record, status, now, self.grace);
        let within_grace = now < record.expiry_at + self.grace;
        let valid = record.duration == LicenseDuration::Lifetime || within_grace;
        if valid {
            LicenseValidation {
                valid: true,
                info: Some(info),
                reason: None,
            }
        } else {
            LicenseValidation::invalid(
                LicenseError::Expired(record.expiry_at).to_string(),
                Some(info),
            )
        }
    }

    /// Accept an out-of-band handoff blob. On success the record is
    /// honored as the active license for the rest of the process.
    pub async fn validate_state_file(&self, path: &Path) -> Result<LicenseInfo, LicenseError> {
        let record = self.store.read_record_at(path)?;
        let now = Utc::now();
        if record.device_fingerprint != device_fingerprint() {
            return Err(LicenseError::FingerprintMismatch);
        }
        if record.duration != LicenseDuration::Lifetime && now >= record.expiry_at + self.grace {
            return Err(LicenseError::Expired(record.expiry_at));
        }
        let status = derive_status(&record, now);
        let info = project(&record, status, now, self.grace);
        info!(expiry = %record.expiry_at, "license handoff accepted");
        *self.handoff.write().await = Some(record);
        Ok(info)
    }

    /// Activate a key against the remote issuer and persist the result.
    pub async fn activate(
        &self,
        key: &str,
        email: Option<&str>,
    ) -> Result<LicenseInfo, LicenseError> {
        parse_license_key(key)?;
        let fingerprint = device_fingerprint();
        let grant = self.submit(key, &fingerprint).await?;

        let now = Utc::now();
        let expiry_at = grant
            .expiry_at
            .unwrap_or_else(|| grant.duration.extend(now));
        let record = LicenseRecord {
            license_key: key.to_string(),
            user_email: email.unwrap_or_default().to_string(),
            issued_at: now,
            expiry_at,
            duration: grant.duration,
            device_fingerprint: fingerprint,
            status: LicenseStatus::Active,
            last_checked_at: now,
        };
        self.persist(record.clone()).await?;
        info!(expiry = %expiry_at, duration = grant.duration.as_str(), "license activated");
        Ok(project(&record, derive_status(&record, now), now, self.grace))
    }

    /// Stack a new key onto the current license.
    ///
    /// While the current license is unexpired the new term is appended to
    /// its expiry; once past expiry (grace included) the new term runs
    /// from now. The issuer consumes the key atomically, so replaying a
    /// stack with the same key cannot extend twice.
    pub async fn stack(&self, key: &str) -> Result<LicenseInfo, LicenseError> {
        parse_license_key(key)?;
        let current = match self.current_record().await {
            Ok(record) => Some(record),
            Err(LicenseError::NotActivated) => None,
            Err(err) => return Err(err),
        };
        let fingerprint = device_fingerprint();
        if let Some(record) = &current
            && record.device_fingerprint != fingerprint
        {
            return Err(LicenseError::FingerprintMismatch);
        }

        let grant = self.submit(key, &fingerprint).await?;
        let now = Utc::now();
        let (base, issued_at, user_email) = match &current {
            Some(record) if record.expiry_at > now => {
                (record.expiry_at, record.issued_at, record.user_email.clone())
            }
            Some(record) => (now, now, record.user_email.clone()),
            None => (now, now, String::new()),
        };
        let expiry_at = grant.duration.extend(base);
        let record = LicenseRecord {
            license_key: key.to_string(),
            user_email,
            issued_at,
            expiry_at,
            duration: grant.duration,
            device_fingerprint: fingerprint,
            status: LicenseStatus::Active,
            last_checked_at: now,
        };
        self.persist(record.clone()).await?;
        info!(expiry = %expiry_at, duration = grant.duration.as_str(), "license stacked");
        Ok(project(&record, derive_status(&record, now), now, self.grace))
    }

    /// Read-only projection for UI consumers.
    pub async fn info(&self) -> Result<LicenseInfo, LicenseError> {
        let record = self.current_record().await?;
        let now = Utc::now();
        Ok(project(&record, derive_status(&record, now), now, self.grace))
    }

    async fn submit(&self, key: &str, fingerprint: &str) -> Result<ActivationGrant, LicenseError> {
        let request = ActivationRequest {
            license_key: key.to_string(),
            device_fingerprint: fingerprint.to_string(),
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
        };
        let grant = self.issuer.activate(&request).await?;
        match grant.status {
            GrantStatus::Granted => Ok(grant),
            GrantStatus::AlreadyActivated => {
                warn!("issuer reports key already consumed");
                Err(LicenseError::AlreadyActivated)
            }
            GrantStatus::Revoked => Err(LicenseError::Revoked),
            GrantStatus::Rejected => Err(LicenseError::InvalidFormat),
        }
    }

    async fn persist(&self, record: LicenseRecord) -> Result<(), LicenseError> {
        self.store.save(&record)?;
        *self.cache.write().await = Some(CachedRecord {
            record,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    async fn current_record(&self) -> Result<LicenseRecord, LicenseError> {
        if let Some(record) = self.handoff.read().await.clone() {
            return Ok(record);
        }
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.cache_ttl
            {
                return Ok(cached.record.clone());
            }
        }
        let mut record = self.store.load()?;
        record.last_checked_at = Utc::now();
        *self.cache.write().await = Some(CachedRecord {
            record: record.clone(),
            fetched_at: Instant::now(),
        });
        Ok(record)
    }
}

fn derive_status(record: &LicenseRecord, now: DateTime<Utc>) -> LicenseStatus {
    if record.status == LicenseStatus::Revoked {
        return LicenseStatus::Revoked;
    }
    if record.duration == LicenseDuration::Lifetime {
        return LicenseStatus::Active;
    }
    let remaining = record.expiry_at - now;
    if remaining <= chrono::Duration::zero() {
        LicenseStatus::Expired
    } else if remaining <= chrono::Duration::days(7) {
        LicenseStatus::Critical
    } else if remaining <= chrono::Duration::days(14) {
        LicenseStatus::Warning
    } else {
        LicenseStatus::Active
    }
}

fn project(
    record: &LicenseRecord,
    status: LicenseStatus,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> LicenseInfo {
    let in_grace = status == LicenseStatus::Expired && now < record.expiry_at + grace;
    LicenseInfo {
        license_key_masked: mask_key(&record.license_key),
        user_email: record.user_email.clone(),
        issued_at: record.issued_at,
        expiry_at: record.expiry_at,
        duration: record.duration,
        status,
        last_checked_at: record.last_checked_at,
        days_remaining: (record.expiry_at - now).num_days(),
        in_grace,
    }
}

fn mask_key(key: &str) -> String {
    if key.len() >= 8 && key.is_ascii() {
        format!("{}****{}", &key[..3], &key[key.len() - 4..])
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const SECRET: &[u8] = b"test-manager-secret";

    /// In-memory issuer: every key grants the configured duration once,
    /// then reports `AlreadyActivated`.
    pub(crate) struct StaticIssuer {
        duration: LicenseDuration,
        consumed: Mutex<HashSet<String>>,
    }

    impl StaticIssuer {
        pub(crate) fn new(duration: LicenseDuration) -> Arc<Self> {
            Arc::new(Self {
                duration,
                consumed: Mutex::new(HashSet::new()),
            })
        }
    }

    #[async_trait]
    impl IssuerClient for StaticIssuer {
        async fn activate(
            &self,
            request: &ActivationRequest,
        ) -> Result<ActivationGrant, LicenseError> {
            let mut consumed = self.consumed.lock().unwrap();
            if !consumed.insert(request.license_key.clone()) {
                return Ok(ActivationGrant {
                    status: GrantStatus::AlreadyActivated,
                    expiry_at: None,
                    duration: self.duration,
                    message: "key already consumed".to_string(),
                });
            }
            Ok(ActivationGrant {
                status: GrantStatus::Granted,
                expiry_at: None,
                duration: self.duration,
                message: String::new(),
            })
        }
    }

    fn manager_at(dir: &Path, duration: LicenseDuration) -> LicenseManager {
        let store = LicenseStore::new(dir.join("license.dat"), SECRET.to_vec());
        LicenseManager::with_policy(
            store,
            StaticIssuer::new(duration),
            Duration::from_secs(72 * 3600),
            Duration::from_millis(0),
        )
    }

    fn record_expiring_in(days: i64) -> LicenseRecord {
        let now = Utc::now();
        LicenseRecord {
            license_key: "ISX3MSEED01".to_string(),
            user_email: "ops@example.iq".to_string(),
            issued_at: now - chrono::Duration::days(30),
            expiry_at: now + chrono::Duration::days(days),
            duration: LicenseDuration::ThreeMonths,
            device_fingerprint: device_fingerprint(),
            status: LicenseStatus::Active,
            last_checked_at: now,
        }
    }

    #[tokio::test]
    async fn validate_without_license_is_invalid() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);
        let validation = manager.validate().await;
        assert!(!validation.valid);
        assert!(validation.reason.unwrap().contains("No license"));
    }

    #[tokio::test]
    async fn validate_active_license() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);
        manager.store.save(&record_expiring_in(60)).unwrap();

        let validation = manager.validate().await;
        assert!(validation.valid);
        let info = validation.info.unwrap();
        assert_eq!(info.status, LicenseStatus::Active);
        assert!(!info.license_key_masked.contains("SEED"));
    }

    #[tokio::test]
    async fn status_thresholds() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);

        manager.store.save(&record_expiring_in(5)).unwrap();
        assert_eq!(
            manager.validate().await.info.unwrap().status,
            LicenseStatus::Critical
        );

        manager.store.save(&record_expiring_in(10)).unwrap();
        assert_eq!(
            manager.validate().await.info.unwrap().status,
            LicenseStatus::Warning
        );

        manager.store.save(&record_expiring_in(30)).unwrap();
        assert_eq!(
            manager.validate().await.info.unwrap().status,
            LicenseStatus::Active
        );
    }

    #[tokio::test]
    async fn expired_within_grace_is_still_valid() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);
        let mut record = record_expiring_in(0);
        record.expiry_at = Utc::now() - chrono::Duration::hours(10);
        manager.store.save(&record).unwrap();

        let validation = manager.validate().await;
        assert!(validation.valid);
        let info = validation.info.unwrap();
        assert_eq!(info.status, LicenseStatus::Expired);
        assert!(info.in_grace);
    }

    #[tokio::test]
    async fn expired_beyond_grace_is_invalid() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);
        let mut record = record_expiring_in(0);
        record.expiry_at = Utc::now() - chrono::Duration::days(10);
        manager.store.save(&record).unwrap();

        let validation = manager.validate().await;
        assert!(!validation.valid);
        assert!(validation.reason.unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn foreign_fingerprint_is_invalid() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);
        let mut record = record_expiring_in(60);
        record.device_fingerprint = "feedfacefeedfacefeedfacefeedface".to_string();
        manager.store.save(&record).unwrap();

        let validation = manager.validate().await;
        assert!(!validation.valid);
        assert!(validation.reason.unwrap().contains("different machine"));
    }

    #[tokio::test]
    async fn activate_persists_a_record() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::ThreeMonths);
        let info = manager
            .activate("ISX3MNEWKEY01", Some("ops@example.iq"))
            .await
            .unwrap();
        assert_eq!(info.duration, LicenseDuration::ThreeMonths);
        assert_eq!(info.user_email, "ops@example.iq");

        let validation = manager.validate().await;
        assert!(validation.valid);
    }

    #[tokio::test]
    async fn activate_rejects_malformed_keys() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);
        assert!(matches!(
            manager.activate("BOGUS-KEY", None).await,
            Err(LicenseError::InvalidFormat)
        ));
    }

    #[tokio::test]
    async fn stack_extends_active_expiry() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::ThreeMonths);
        let record = record_expiring_in(20);
        let original_expiry = record.expiry_at;
        manager.store.save(&record).unwrap();

        let info = manager.stack("ISX3MSTACK01").await.unwrap();
        assert_eq!(info.expiry_at, LicenseDuration::ThreeMonths.extend(original_expiry));
    }

    #[tokio::test]
    async fn stack_on_expired_replaces_from_now() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::SixMonths);
        let mut record = record_expiring_in(0);
        record.expiry_at = Utc::now() - chrono::Duration::days(30);
        manager.store.save(&record).unwrap();

        let before = Utc::now();
        let info = manager.stack("ISX6MSTACK02").await.unwrap();
        let floor = LicenseDuration::SixMonths.extend(before);
        assert!(info.expiry_at >= floor - chrono::Duration::seconds(5));
        assert!(info.expiry_at <= LicenseDuration::SixMonths.extend(Utc::now()));
    }

    #[tokio::test]
    async fn replayed_stack_key_does_not_double_extend() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::ThreeMonths);
        manager.store.save(&record_expiring_in(20)).unwrap();

        let first = manager.stack("ISX3MREPLAY1").await.unwrap();
        let err = manager.stack("ISX3MREPLAY1").await.unwrap_err();
        assert!(matches!(err, LicenseError::AlreadyActivated));

        let info = manager.info().await.unwrap();
        assert_eq!(info.expiry_at, first.expiry_at);
    }

    #[tokio::test]
    async fn handoff_file_is_honored_for_process_lifetime() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);
        // no regular license on disk
        assert!(!manager.validate().await.valid);

        let handoff_store =
            LicenseStore::new(dir.path().join("handoff.dat"), SECRET.to_vec());
        handoff_store.save(&record_expiring_in(45)).unwrap();
        let info = manager
            .validate_state_file(&dir.path().join("handoff.dat"))
            .await
            .unwrap();
        assert_eq!(info.status, LicenseStatus::Active);
        assert!(manager.validate().await.valid);
    }

    #[tokio::test]
    async fn handoff_rejects_foreign_fingerprint() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), LicenseDuration::OneMonth);
        let mut record = record_expiring_in(45);
        record.device_fingerprint = "0000000000000000".to_string();
        let handoff_store =
            LicenseStore::new(dir.path().join("handoff.dat"), SECRET.to_vec());
        handoff_store.save(&record).unwrap();

        assert!(matches!(
            manager
                .validate_state_file(&dir.path().join("handoff.dat"))
                .await,
            Err(LicenseError::FingerprintMismatch)
        ));
    }

    #[test]
    fn mask_key_hides_the_body() {
        assert_eq!(mask_key("ISX-AB12-CD34-EF56-GH78"), "ISX****GH78");
        assert_eq!(mask_key("short"), "****");
    }

    #[test]
    fn wire_round_trip_with_aad() {
        let request = ActivationRequest {
            license_key: "ISX1MABCDEF".to_string(),
            device_fingerprint: device_fingerprint(),
            timestamp: Utc::now(),
            request_id: "req-42".to_string(),
        };
        let plaintext = serde_json::to_vec(&request).unwrap();
        let payload = crypto::seal(&plaintext, SECRET, b"req-42").unwrap();

        let opened = crypto::open(&payload, SECRET, b"req-42").unwrap();
        let back: ActivationRequest = serde_json::from_slice(&opened).unwrap();
        assert_eq!(back.license_key, request.license_key);

        // a different request id must not open the payload
        assert!(crypto::open(&payload, SECRET, b"req-43").is_err());
    }
}
