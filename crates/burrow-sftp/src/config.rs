//! Per-session mount configuration.

use serde::Deserialize;

use crate::idmap::IdMappings;

/// Configuration of one exported mount.
///
/// Immutable for the lifetime of the session.
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    /// Host-side directory exported to the guest (absolute, normalized).
    pub source: String,

    /// Guest-side mount point.
    pub target: String,

    /// Command line that launches the user-space mount helper in the guest.
    /// The bridge appends the quoted source and target arguments.
    #[serde(default = "default_mount_command")]
    pub mount_command: String,

    /// Ordered `(host_uid, guest_uid)` pairs.
    #[serde(default)]
    pub uid_mappings: IdMappings,

    /// Ordered `(host_gid, guest_gid)` pairs.
    #[serde(default)]
    pub gid_mappings: IdMappings,

    /// Uid reported when a mapping resolves to the server default.
    #[serde(default = "default_id_fallback")]
    pub default_uid: i64,

    /// Gid reported when a mapping resolves to the server default.
    #[serde(default = "default_id_fallback")]
    pub default_gid: i64,

    /// Force append mode on opens whose flag mask is exactly WRITE.
    /// Works around mount helpers (sshfs before 3.2) that drop O_APPEND.
    #[serde(default = "default_write_append_workaround")]
    pub write_append_workaround: bool,
}

impl MountConfig {
    /// Construct a configuration for `source` exported at `target` with
    /// everything else defaulted.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mount_command: default_mount_command(),
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            default_uid: default_id_fallback(),
            default_gid: default_id_fallback(),
            write_append_workaround: default_write_append_workaround(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.source.is_empty() {
            return Err(crate::Error::Config(
                "source directory must not be empty".to_string(),
            ));
        }

        if self.target.is_empty() {
            return Err(crate::Error::Config(
                "target mount point must not be empty".to_string(),
            ));
        }

        if self.mount_command.is_empty() {
            return Err(crate::Error::Config(
                "mount helper command must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_mount_command() -> String {
    "sshfs -o slave -o transform_symlinks -o allow_other".to_string()
}

fn default_id_fallback() -> i64 {
    crate::idmap::DEFAULT_ID
}

fn default_write_append_workaround() -> bool {
    true
}
