use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Best-effort descriptor of the machine a worker runs on. Appears in
/// blacklists and result records so submitters can see who did what.
///
/// The location fields exist for operators who enrich them out of band;
/// nothing here performs a network lookup, and every field except the
/// process nonce may be empty without consequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub hostname: String,
    pub executable: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub ip: Option<String>,
    /// Distinguishes daemons sharing one host.
    pub nonce: Uuid,
}

impl WorkerIdentity {
    pub fn detect() -> Self {
        let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|s| s.trim().to_string())
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let executable = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self {
            hostname,
            executable,
            country: None,
            city: None,
            latitude: None,
            longitude: None,
            ip: None,
            nonce: Uuid::new_v4(),
        }
    }

    /// Stable string id used in job blacklists and result records.
    pub fn id(&self) -> String {
        format!("{}:{}", self.hostname, &self.nonce.simple().to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_id_is_stable_and_distinct() {
        let a = WorkerIdentity::detect();
        let b = WorkerIdentity::detect();
        assert_eq!(a.id(), a.id());
        assert_ne!(a.id(), b.id(), "two daemons on one host must differ");
        assert!(!a.hostname.is_empty());
    }
}
