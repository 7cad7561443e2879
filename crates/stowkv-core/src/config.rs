//! Configuration management for StowKV
//!
//! Provides presets for different deployment classes and validation for
//! hand-built configurations.

use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Longest a lock request may wait before failing with `LockTimeout`
    pub lock_timeout: Duration,
    /// WAL file rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// Durably sync the WAL on every commit. When false, commits reach the
    /// OS page cache only and survive process crashes but not power loss.
    pub sync_on_commit: bool,
}

impl Config {
    /// Server-class: large records, durable commits, generous lock waits
    pub fn server() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            wal_rotation_size_bytes: 100 * 1024 * 1024,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
            sync_on_commit: true,
        }
    }

    /// Embedded-class: small footprint, durable commits
    pub fn embedded() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            wal_rotation_size_bytes: 16 * 1024 * 1024,
            max_key_size: 512,
            max_value_size: 4 * 1024 * 1024,
            sync_on_commit: true,
        }
    }

    /// Test-class: no fsync per commit, short lock waits
    pub fn testing() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            wal_rotation_size_bytes: 4 * 1024 * 1024,
            max_key_size: 1024,
            max_value_size: 1024 * 1024,
            sync_on_commit: false,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.lock_timeout.is_zero() {
            return Err("lock_timeout must be > 0".into());
        }
        if self.wal_rotation_size_bytes < 1024 * 1024 {
            return Err("wal_rotation_size_bytes must be >= 1MB".into());
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err("max_key_size must be in [1, 65535]".into());
        }
        if self.max_value_size == 0 || self.max_value_size > 128 * 1024 * 1024 {
            return Err("max_value_size must be in [1, 128MB]".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::server().validate().is_ok());
        assert!(Config::embedded().validate().is_ok());
        assert!(Config::testing().validate().is_ok());
    }

    #[test]
    fn test_preset_ordering() {
        let s = Config::server();
        let e = Config::embedded();
        assert!(s.max_value_size > e.max_value_size);
        assert!(s.lock_timeout > e.lock_timeout);
        assert!(!Config::testing().sync_on_commit);
    }

    #[test]
    fn test_rejects_zero_lock_timeout() {
        let mut config = Config::testing();
        config.lock_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_key_size_beyond_wire_limit() {
        let mut config = Config::server();
        config.max_key_size = 70_000;
        assert!(config.validate().is_err());
    }
}
