//! Supervisor configuration, loaded entirely from the environment. File and
//! flag-based configuration loading is a concern owned by whatever embeds
//! this crate, not by the core itself.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
const DEFAULT_NAMESPACE: &str = "joblet";
const DEFAULT_STOP_GRACE_MS: u64 = 10_000;
const DEFAULT_MAX_LOG_MEMORY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub cgroup_root: PathBuf,
    pub namespace: String,
    pub cgroup_version: CgroupVersionSetting,
    pub stop_grace: Duration,
    pub max_log_memory_bytes: usize,
    pub log_spill_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersionSetting {
    Auto,
    ForceV1,
    ForceV2,
}

impl Config {
    pub fn from_env() -> Self {
        let cgroup_root = std::env::var("JOBLET_CGROUP_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CGROUP_ROOT));

        let namespace =
            std::env::var("JOBLET_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());

        let cgroup_version = match std::env::var("JOBLET_CGROUP_VERSION").as_deref() {
            Ok("v1") => CgroupVersionSetting::ForceV1,
            Ok("v2") => CgroupVersionSetting::ForceV2,
            Ok("auto") | Err(_) => CgroupVersionSetting::Auto,
            Ok(other) => {
                tracing::warn!(value = other, "unrecognized JOBLET_CGROUP_VERSION, using auto");
                CgroupVersionSetting::Auto
            }
        };

        let stop_grace = std::env::var("JOBLET_STOP_GRACE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| {
                Duration::from_millis(DEFAULT_STOP_GRACE_MS)
            });

        let max_log_memory_bytes = std::env::var("JOBLET_MAX_LOG_MEMORY_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_LOG_MEMORY_BYTES);

        let log_spill_dir = std::env::var("JOBLET_LOG_SPILL_DIR").ok().map(PathBuf::from);

        Config {
            cgroup_root,
            namespace,
            cgroup_version,
            stop_grace,
            max_log_memory_bytes,
            log_spill_dir,
        }
    }

    /// Resolves `cgroup_version` against the filesystem when set to `Auto`.
    pub fn resolved_cgroup_version(&self) -> crate::cgroup::CgroupVersion {
        match self.cgroup_version {
            CgroupVersionSetting::ForceV1 => crate::cgroup::CgroupVersion::V1,
            CgroupVersionSetting::ForceV2 => crate::cgroup::CgroupVersion::V2,
            CgroupVersionSetting::Auto => {
                if crate::cgroup::cgroups_v2_available(&self.cgroup_root) {
                    crate::cgroup::CgroupVersion::V2
                } else {
                    crate::cgroup::CgroupVersion::V1
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_unset() {
        // SAFETY: tests run single-threaded within this process for env
        // manipulation; scoped to variables this module owns.
        for var in [
            "JOBLET_CGROUP_ROOT",
            "JOBLET_NAMESPACE",
            "JOBLET_CGROUP_VERSION",
            "JOBLET_STOP_GRACE_MS",
            "JOBLET_MAX_LOG_MEMORY_BYTES",
            "JOBLET_LOG_SPILL_DIR",
        ] {
            unsafe { std::env::remove_var(var) };
        }
        let config = Config::from_env();
        assert_eq!(config.cgroup_root, PathBuf::from(DEFAULT_CGROUP_ROOT));
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.cgroup_version, CgroupVersionSetting::Auto);
        assert_eq!(config.stop_grace, Duration::from_millis(DEFAULT_STOP_GRACE_MS));
        assert_eq!(config.max_log_memory_bytes, DEFAULT_MAX_LOG_MEMORY_BYTES);
        assert!(config.log_spill_dir.is_none());
    }
}
