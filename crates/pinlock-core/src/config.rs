use crate::digest::DigestScheme;
use crate::error::{PinlockError, PinlockResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lockout thresholds applied by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyCfg {
    /// Consecutive failures tolerated before a lockout window is armed.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Length of the lockout window, in seconds.
    #[serde(default = "default_failure_delay_secs")]
    pub failure_delay_secs: u64,

    /// How long a successful unlock stays fresh, in seconds.
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: Option<u64>,
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_failure_delay_secs() -> u64 {
    60
}

fn default_freshness_window_secs() -> Option<u64> {
    Some(crate::policy::DEFAULT_FRESHNESS_WINDOW.as_secs())
}

impl Default for PolicyCfg {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            failure_delay_secs: default_failure_delay_secs(),
            freshness_window_secs: default_freshness_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreCfg {
    /// Directory holding one JSON document per scope.
    #[serde(default = "default_store_dir")]
    pub dir: String,

    /// Storage scope name; the document is `<dir>/<scope>.json`.
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_store_dir() -> String {
    "/var/lib/pinlock".to_string()
}

fn default_scope() -> String {
    crate::store::DEFAULT_SCOPE.to_string()
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            scope: default_scope(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DigestCfg {
    #[serde(default)]
    pub scheme: DigestScheme,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PinlockConfig {
    #[serde(default)]
    pub policy: PolicyCfg,

    #[serde(default)]
    pub store: StoreCfg,

    #[serde(default)]
    pub digest: DigestCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl PinlockConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> PinlockResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(PinlockError::InvalidConfig(issues.join("; ")));
        }

        Ok(cfg)
    }

    /// Collect every semantic problem with the configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.policy.max_retry_count == 0 {
            issues.push("policy.max_retry_count must be at least 1".to_string());
        }
        if self.policy.failure_delay_secs == 0 {
            issues.push("policy.failure_delay_secs must be at least 1".to_string());
        }
        if self.policy.freshness_window_secs == Some(0) {
            issues.push("policy.freshness_window_secs must be at least 1 when set".to_string());
        }
        if self.store.dir.trim().is_empty() {
            issues.push("store.dir must not be empty".to_string());
        }
        if self.store.scope.trim().is_empty() || self.store.scope.contains('/') {
            issues.push("store.scope must be a non-empty name without '/'".to_string());
        }
        issues
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            max_retry_count: self.policy.max_retry_count,
            failure_delay: Duration::from_secs(self.policy.failure_delay_secs),
        }
    }

    pub fn freshness_window(&self) -> Option<Duration> {
        self.policy.freshness_window_secs.map(Duration::from_secs)
    }

    pub fn store_path(&self) -> PathBuf {
        Path::new(&self.store.dir).join(format!("{}.json", self.store.scope))
    }
}

/// Retry threshold and lockout length, detached from on-disk config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub max_retry_count: u32,
    pub failure_delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            failure_delay: Duration::from_secs(default_failure_delay_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_toml_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pinlock.toml");
        fs::write(&path, "[policy]\nmax_retry_count = 5\n").unwrap();

        let cfg = PinlockConfig::load(&path).unwrap();
        assert_eq!(cfg.policy.max_retry_count, 5);
        assert_eq!(cfg.policy.failure_delay_secs, 60);
        assert_eq!(cfg.digest.scheme, DigestScheme::Sha1Legacy);
        assert_eq!(
            cfg.store_path(),
            PathBuf::from("/var/lib/pinlock/pin__preferences.json")
        );
        assert_eq!(cfg.path, path);
    }

    #[test]
    fn load_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pinlock.yaml");
        fs::write(
            &path,
            "policy:\n  failure_delay_secs: 120\ndigest:\n  scheme: sha256\nstore:\n  dir: /tmp/pins\n  scope: work\n",
        )
        .unwrap();

        let cfg = PinlockConfig::load(&path).unwrap();
        assert_eq!(cfg.lock_policy().failure_delay, Duration::from_secs(120));
        assert_eq!(cfg.digest.scheme, DigestScheme::Sha256);
        assert_eq!(cfg.store_path(), PathBuf::from("/tmp/pins/work.json"));
    }

    #[test]
    fn load_rejects_zero_retry_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pinlock.toml");
        fs::write(&path, "[policy]\nmax_retry_count = 0\n").unwrap();

        let err = PinlockConfig::load(&path).unwrap_err();
        assert!(matches!(err, PinlockError::InvalidConfig(_)));
    }

    #[test]
    fn validate_reports_every_issue() {
        let mut cfg = PinlockConfig::default();
        cfg.policy.failure_delay_secs = 0;
        cfg.policy.freshness_window_secs = Some(0);
        cfg.store.dir = "  ".into();
        assert_eq!(cfg.validate().len(), 3);
    }

    #[test]
    fn default_lock_policy_matches_config_defaults() {
        assert_eq!(PinlockConfig::default().lock_policy(), LockPolicy::default());
    }
}
