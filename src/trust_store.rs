//! OS trust-store port.
//!
//! The proxy only needs two operations against the user's root certificate
//! store: "is a certificate with this subject present?" and "add this
//! certificate". [`NativeTrustStore`] drives the platform tooling where one
//! exists (the `security` CLI on macOS, `certutil` on Windows); on headless
//! platforms the query conservatively reports `false` and installation fails
//! with [`CaError::TrustStoreUnsupported`]. [`MemoryTrustStore`] is the
//! in-memory fake for tests.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::error::CaError;

pub trait TrustStore: Send + Sync {
    /// Whether the current user's root store contains a certificate whose
    /// subject common name is `common_name`.
    fn contains_subject(&self, common_name: &str) -> Result<bool, CaError>;

    /// Add `cert_pem` to the current user's root store. Must tolerate the
    /// certificate already being present.
    fn add_certificate(&self, cert_pem: &str, common_name: &str) -> Result<(), CaError>;
}

/// Trust store backed by the platform's certificate tooling.
pub struct NativeTrustStore;

#[cfg(target_os = "macos")]
impl TrustStore for NativeTrustStore {
    fn contains_subject(&self, common_name: &str) -> Result<bool, CaError> {
        let output = std::process::Command::new("security")
            .args(["find-certificate", "-c", common_name])
            .output()
            .map_err(|e| CaError::TrustStore(format!("running security: {e}")))?;
        Ok(output.status.success())
    }

    fn add_certificate(&self, cert_pem: &str, common_name: &str) -> Result<(), CaError> {
        if self.contains_subject(common_name)? {
            return Ok(());
        }
        let pem_path = std::env::temp_dir().join(format!("{common_name}.pem"));
        std::fs::write(&pem_path, cert_pem)
            .map_err(|e| CaError::TrustStore(format!("writing temp PEM: {e}")))?;
        let status = std::process::Command::new("security")
            .args(["add-trusted-cert", "-r", "trustRoot", "-k"])
            .arg(login_keychain()?)
            .arg(&pem_path)
            .status()
            .map_err(|e| CaError::TrustStore(format!("running security: {e}")))?;
        let _ = std::fs::remove_file(&pem_path);
        if !status.success() {
            return Err(CaError::TrustStore(format!(
                "security add-trusted-cert exited with {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn login_keychain() -> Result<std::path::PathBuf, CaError> {
    let home = dirs::home_dir()
        .ok_or_else(|| CaError::TrustStore("cannot locate home directory".to_string()))?;
    Ok(home.join("Library/Keychains/login.keychain-db"))
}

#[cfg(target_os = "windows")]
impl TrustStore for NativeTrustStore {
    fn contains_subject(&self, common_name: &str) -> Result<bool, CaError> {
        let output = std::process::Command::new("certutil")
            .args(["-user", "-verifystore", "Root", common_name])
            .output()
            .map_err(|e| CaError::TrustStore(format!("running certutil: {e}")))?;
        Ok(output.status.success())
    }

    fn add_certificate(&self, cert_pem: &str, common_name: &str) -> Result<(), CaError> {
        if self.contains_subject(common_name)? {
            return Ok(());
        }
        let pem_path = std::env::temp_dir().join(format!("{common_name}.pem"));
        std::fs::write(&pem_path, cert_pem)
            .map_err(|e| CaError::TrustStore(format!("writing temp PEM: {e}")))?;
        let status = std::process::Command::new("certutil")
            .args(["-user", "-addstore", "Root"])
            .arg(&pem_path)
            .status()
            .map_err(|e| CaError::TrustStore(format!("running certutil: {e}")))?;
        let _ = std::fs::remove_file(&pem_path);
        if !status.success() {
            return Err(CaError::TrustStore(format!(
                "certutil -addstore exited with {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
impl TrustStore for NativeTrustStore {
    fn contains_subject(&self, _common_name: &str) -> Result<bool, CaError> {
        // No per-user root store to query; report untrusted so embedders
        // fall back to manual installation.
        Ok(false)
    }

    fn add_certificate(&self, _cert_pem: &str, _common_name: &str) -> Result<(), CaError> {
        Err(CaError::TrustStoreUnsupported)
    }
}

/// In-memory trust store recording subjects only.
#[derive(Default)]
pub struct MemoryTrustStore {
    subjects: RwLock<HashSet<String>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn contains_subject(&self, common_name: &str) -> Result<bool, CaError> {
        Ok(self
            .subjects
            .read()
            .map_err(|_| CaError::TrustStore("lock poisoned".to_string()))?
            .contains(common_name))
    }

    fn add_certificate(&self, _cert_pem: &str, common_name: &str) -> Result<(), CaError> {
        self.subjects
            .write()
            .map_err(|_| CaError::TrustStore("lock poisoned".to_string()))?
            .insert(common_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_query_and_add() {
        let store = MemoryTrustStore::new();
        assert!(!store.contains_subject("MITMProxy CA").unwrap());
        store.add_certificate("PEM", "MITMProxy CA").unwrap();
        assert!(store.contains_subject("MITMProxy CA").unwrap());
        // Adding twice is fine.
        store.add_certificate("PEM", "MITMProxy CA").unwrap();
        assert!(store.contains_subject("MITMProxy CA").unwrap());
    }
}
