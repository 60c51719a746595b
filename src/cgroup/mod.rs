//! Cgroup Controller: creates, configures, and tears down a per-job cgroup
//! and attaches the job's process group to it.
//!
//! Supports both cgroup v1 (separate `cpu`, `memory`, `blkio` hierarchies)
//! and v2 (unified hierarchy), auto-detected from the presence of
//! `cgroup.controllers` at the configured base path. The base path is
//! configurable so tests can point it at a `tempfile::TempDir` standing in
//! for `/sys/fs/cgroup`.

mod v1;
mod v2;

use std::path::{Path, PathBuf};

use crate::error::CgroupError;
use crate::limits::ResourceLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

#[derive(Debug, Clone)]
pub struct CgroupController {
    base: PathBuf,
    namespace: String,
    version: CgroupVersion,
}

impl CgroupController {
    /// Detects the cgroup version available under `base` and builds a
    /// controller scoped to `base/namespace/`.
    pub fn detect(base: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        let base = base.into();
        let version = if cgroups_v2_available(&base) {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        };
        CgroupController {
            base,
            namespace: namespace.into(),
            version,
        }
    }

    pub fn with_version(
        base: impl Into<PathBuf>,
        namespace: impl Into<String>,
        version: CgroupVersion,
    ) -> Self {
        CgroupController {
            base: base.into(),
            namespace: namespace.into(),
            version,
        }
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Creates the cgroup directory (and, for v1, one per controller) for
    /// `job_id`. Idempotent: succeeds if the directory already exists.
    pub fn create(&self, job_id: uuid::Uuid) -> Result<CgroupHandle, CgroupError> {
        match self.version {
            CgroupVersion::V2 => {
                let path = self.base.join(&self.namespace).join(job_id.to_string());
                v2::create(&path)?;
            }
            CgroupVersion::V1 => v1::create(&self.base, &self.namespace, &job_id)?,
        }
        Ok(CgroupHandle {
            job_id,
            version: self.version,
            base: self.base.clone(),
            namespace: self.namespace.clone(),
        })
    }
}

/// An owned, created cgroup for one job. Dropped cgroups are not
/// automatically removed from disk (removal can fail while processes are
/// still attached); callers call [`CgroupHandle::remove`] once the job's
/// process group has fully exited.
pub struct CgroupHandle {
    job_id: uuid::Uuid,
    version: CgroupVersion,
    base: PathBuf,
    namespace: String,
}

impl CgroupHandle {
    /// The primary path for this job's cgroup. For v1 this is the `memory`
    /// controller's subtree, chosen as the representative path since every
    /// controller mirrors the same job-id leaf.
    pub fn path(&self) -> PathBuf {
        match self.version {
            CgroupVersion::V2 => self.base.join(&self.namespace).join(self.job_id.to_string()),
            CgroupVersion::V1 => self
                .base
                .join("memory")
                .join(&self.namespace)
                .join(self.job_id.to_string()),
        }
    }

    /// Applies `limits`, writing only the fields that are set. Must be
    /// called before any process is attached for the limits to take effect
    /// from process start (the spec's "applied before first instruction
    /// runs" invariant); the supervisor enforces that ordering.
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<(), CgroupError> {
        match self.version {
            CgroupVersion::V2 => v2::apply_limits(&self.path(), limits),
            CgroupVersion::V1 => {
                v1::apply_limits(&self.base, &self.namespace, self.job_id, limits)
            }
        }
    }

    /// Attaches `pid` (the job's leader process) to this cgroup.
    pub fn attach(&self, pid: i32) -> Result<(), CgroupError> {
        match self.version {
            CgroupVersion::V2 => v2::attach(&self.path(), pid),
            CgroupVersion::V1 => v1::attach(&self.base, &self.namespace, self.job_id, pid),
        }
    }

    /// Removes the cgroup directory. Call only after the process group has
    /// exited; the kernel refuses to rmdir a cgroup with live members.
    ///
    /// Idempotent (a directory that is already gone is success) and retries
    /// up to [`REMOVE_MAX_ATTEMPTS`] times with linear backoff on `EBUSY`,
    /// since a just-exited process group can still be draining from the
    /// cgroup for a short window after `waitpid` returns.
    pub fn remove(&self) -> Result<(), CgroupError> {
        let mut last_err = None;
        for attempt in 0..REMOVE_MAX_ATTEMPTS {
            let result = match self.version {
                CgroupVersion::V2 => v2::remove_raw(&self.path()),
                CgroupVersion::V1 => v1::remove_raw(&self.base, &self.namespace, self.job_id),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt + 1 < REMOVE_MAX_ATTEMPTS => {
                    std::thread::sleep(REMOVE_RETRY_BACKOFF * (attempt + 1));
                    last_err = Some(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        Err(CgroupError::Remove(format!(
            "{}: {}",
            self.path().display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

const REMOVE_MAX_ATTEMPTS: u32 = 5;
const REMOVE_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(20);

/// True if `base/cgroup.controllers` exists, the unified-hierarchy marker
/// file that only appears under cgroup v2.
pub fn cgroups_v2_available(base: &Path) -> bool {
    base.join("cgroup.controllers").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{DeviceId, IoLimit};

    fn fake_v2_root(dir: &Path) {
        std::fs::write(dir.join("cgroup.controllers"), "cpu memory io pids\n").unwrap();
        std::fs::write(dir.join("cgroup.subtree_control"), "").unwrap();
    }

    #[test]
    fn detects_v2_from_controllers_file() {
        let tmp = tempfile::tempdir().unwrap();
        fake_v2_root(tmp.path());
        let ctl = CgroupController::detect(tmp.path(), "joblet");
        assert_eq!(ctl.version(), CgroupVersion::V2);
    }

    #[test]
    fn detects_v1_when_controllers_file_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let ctl = CgroupController::detect(tmp.path(), "joblet");
        assert_eq!(ctl.version(), CgroupVersion::V1);
    }

    #[test]
    fn v2_create_apply_and_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        fake_v2_root(tmp.path());
        std::fs::create_dir_all(tmp.path().join("joblet")).unwrap();
        std::fs::write(tmp.path().join("joblet").join("cgroup.subtree_control"), "").unwrap();

        let ctl = CgroupController::with_version(tmp.path(), "joblet", CgroupVersion::V2);
        let job_id = uuid::Uuid::new_v4();
        let handle = ctl.create(job_id).unwrap();
        assert!(handle.path().join("cgroup.procs").exists());

        let mut limits = ResourceLimits::unlimited();
        limits.cpu_percent_hundredths = Some(15000);
        limits.memory_bytes = Some(256 * 1024 * 1024);
        limits.io_limits.push(IoLimit {
            device: Some(DeviceId { major: 8, minor: 0 }),
            bytes_per_sec: 1024 * 1024,
        });
        handle.apply_limits(&limits).unwrap();

        let cpu_max = std::fs::read_to_string(handle.path().join("cpu.max")).unwrap();
        assert_eq!(cpu_max.trim(), "150000 100000");

        let mem_max = std::fs::read_to_string(handle.path().join("memory.max")).unwrap();
        assert_eq!(mem_max.trim(), (256 * 1024 * 1024).to_string());

        handle.remove().unwrap();
        assert!(!handle.path().exists());
    }

    #[test]
    fn v1_create_apply_and_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        for controller in ["cpu", "memory", "blkio"] {
            std::fs::create_dir_all(tmp.path().join(controller)).unwrap();
        }

        let ctl = CgroupController::with_version(tmp.path(), "joblet", CgroupVersion::V1);
        let job_id = uuid::Uuid::new_v4();
        let handle = ctl.create(job_id).unwrap();

        let mut limits = ResourceLimits::unlimited();
        limits.memory_bytes = Some(128 * 1024 * 1024);
        handle.apply_limits(&limits).unwrap();

        let mem_limit = std::fs::read_to_string(
            tmp.path()
                .join("memory")
                .join("joblet")
                .join(job_id.to_string())
                .join("memory.limit_in_bytes"),
        )
        .unwrap();
        assert_eq!(mem_limit.trim(), (128 * 1024 * 1024).to_string());

        handle.remove().unwrap();
    }
}
