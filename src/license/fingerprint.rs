//! Device fingerprint derived from stable host attributes.

use sha2::{Digest, Sha256};

/// Deterministic fingerprint binding a license to this machine. Built
/// from the hostname, OS family, and CPU architecture, so it survives
/// reboots and process restarts but changes across machines.
pub fn device_fingerprint() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    fingerprint_of(&host, std::env::consts::OS, std::env::consts::ARCH)
}

fn fingerprint_of(host: &str, os: &str, arch: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b"|");
    hasher.update(os.as_bytes());
    hasher.update(b"|");
    hasher.update(arch.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(device_fingerprint(), device_fingerprint());
    }

    #[test]
    fn fingerprint_is_hex_and_compact() {
        let fp = device_fingerprint();
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_hosts_diverge() {
        let a = fingerprint_of("trader-01", "linux", "x86_64");
        let b = fingerprint_of("trader-02", "linux", "x86_64");
        assert_ne!(a, b);
    }
}
