//! Process-wide registry of exported devices.
//!
//! A busid may be claimed by at most one session at a time; the claim is an
//! RAII guard so the registry cannot leak entries when a session dies on an
//! error path. Constructed explicitly at startup and shared by handle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ExportRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `busid` for one session. Returns `None` when another session
    /// already holds it.
    pub fn claim(&self, busid: &str) -> Option<ExportClaim> {
        let mut exported = self.inner.lock().unwrap();
        if !exported.insert(busid.to_string()) {
            return None;
        }
        debug!(busid, "busid claimed for export");
        Some(ExportClaim {
            inner: Arc::clone(&self.inner),
            busid: busid.to_string(),
        })
    }

    pub fn is_exported(&self, busid: &str) -> bool {
        self.inner.lock().unwrap().contains(busid)
    }
}

/// Held by the session that exported the device; releases on drop.
#[derive(Debug)]
pub struct ExportClaim {
    inner: Arc<Mutex<HashSet<String>>>,
    busid: String,
}

impl Drop for ExportClaim {
    fn drop(&mut self) {
        self.inner.lock().unwrap().remove(&self.busid);
        debug!(busid = %self.busid, "busid released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        let registry = ExportRegistry::new();

        let claim = registry.claim("1-2").unwrap();
        assert!(registry.is_exported("1-2"));
        assert!(registry.claim("1-2").is_none());

        // Another busid is unaffected.
        assert!(registry.claim("1-3").is_some());

        drop(claim);
        assert!(!registry.is_exported("1-2"));
        assert!(registry.claim("1-2").is_some());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ExportRegistry::new();
        let other = registry.clone();

        let _claim = registry.claim("2-1").unwrap();
        assert!(other.claim("2-1").is_none());
    }
}
