//! cgroup v1 backend: one subtree per controller (`cpu`, `memory`, `blkio`).

use std::path::{Path, PathBuf};

use crate::error::CgroupError;
use crate::limits::ResourceLimits;

fn controller_path(base: &Path, controller: &str, namespace: &str, job_id: uuid::Uuid) -> PathBuf {
    base.join(controller).join(namespace).join(job_id.to_string())
}

fn write_file(path: &Path, contents: &str) -> Result<(), CgroupError> {
    std::fs::write(path, contents).map_err(|source| CgroupError::Write {
        file: path.display().to_string(),
        source,
    })
}

pub fn create(base: &Path, namespace: &str, job_id: &uuid::Uuid) -> Result<(), CgroupError> {
    for controller in ["cpu", "memory", "blkio"] {
        let path = controller_path(base, controller, namespace, *job_id);
        if let Err(e) = std::fs::create_dir_all(&path).map_err(|source| CgroupError::Create {
            path: path.display().to_string(),
            source,
        }) {
            // A prior controller's subtree may already be on disk; don't
            // leave it behind just because a later one failed.
            let _ = remove_raw(base, namespace, *job_id);
            return Err(e);
        }
        let procs = path.join("cgroup.procs");
        if !procs.exists() {
            if let Err(e) = write_file(&procs, "") {
                let _ = remove_raw(base, namespace, *job_id);
                return Err(e);
            }
        }
    }
    Ok(())
}

pub fn apply_limits(
    base: &Path,
    namespace: &str,
    job_id: uuid::Uuid,
    limits: &ResourceLimits,
) -> Result<(), CgroupError> {
    if let Some(quota) = limits.cpu_quota_us() {
        let cpu = controller_path(base, "cpu", namespace, job_id);
        write_file(
            &cpu.join("cpu.cfs_period_us"),
            &format!("{}\n", limits.cpu_period_us),
        )?;
        write_file(&cpu.join("cpu.cfs_quota_us"), &format!("{quota}\n"))?;
    }

    if let Some(mem) = limits.memory_bytes {
        let memory = controller_path(base, "memory", namespace, job_id);
        write_file(&memory.join("memory.limit_in_bytes"), &format!("{mem}\n"))?;
    }

    if !limits.io_limits.is_empty() {
        let blkio = controller_path(base, "blkio", namespace, job_id);
        for io in &limits.io_limits {
            let Some(device) = io.device else {
                continue;
            };
            let line = format!("{}:{} {}\n", device.major, device.minor, io.bytes_per_sec);
            write_file(&blkio.join("blkio.throttle.write_bps_device"), &line)?;
            write_file(&blkio.join("blkio.throttle.read_bps_device"), &line)?;
        }
    }

    Ok(())
}

pub fn attach(base: &Path, namespace: &str, job_id: uuid::Uuid, pid: i32) -> Result<(), CgroupError> {
    for controller in ["cpu", "memory", "blkio"] {
        let path = controller_path(base, controller, namespace, job_id).join("cgroup.procs");
        std::fs::write(&path, pid.to_string()).map_err(|source| CgroupError::Attach { pid, source })?;
    }
    Ok(())
}

/// Removes every controller's subtree for this job. Returns the raw I/O
/// error (rather than `CgroupError`) so the caller can distinguish `EBUSY`
/// (processes still exiting) from a genuine failure and retry accordingly.
pub fn remove_raw(base: &Path, namespace: &str, job_id: uuid::Uuid) -> std::io::Result<()> {
    for controller in ["cpu", "memory", "blkio"] {
        let path = controller_path(base, controller, namespace, job_id);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(_) if !path.exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
