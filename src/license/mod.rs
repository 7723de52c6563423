//! Hardware-bound license subsystem.
//!
//! The store owns the encrypted at-rest blob; the manager owns the
//! lifecycle (validate, activate, stack) and a cached decrypted view.
//! Everything sensitive stays inside this module; consumers only see
//! [`LicenseInfo`] projections and [`LicenseValidation`] verdicts.

pub mod crypto;
mod fingerprint;
mod manager;
mod store;

pub use fingerprint::device_fingerprint;
pub use manager::{
    ActivationGrant, ActivationRequest, GrantStatus, HttpIssuerClient, IssuerClient, LicenseInfo,
    LicenseManager, LicenseValidation, WireEnvelope, DEFAULT_CACHE_TTL, DEFAULT_GRACE,
};
pub use store::{
    KeyKind, LicenseDuration, LicenseRecord, LicenseStatus, LicenseStore, parse_license_key,
};
