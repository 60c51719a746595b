//! Job Supervisor: orchestrates a job's full lifecycle — parse limits,
//! create and configure its cgroup, spawn it held at the fork/exec gate,
//! attach its pid, release it, then hand it to a dedicated reaper task
//! that waits on exactly that pid and never touches any other job.

use std::time::SystemTime;

use uuid::Uuid;

use crate::auth::{self, Operation, Role};
use crate::cgroup::CgroupController;
use crate::config::Config;
use crate::error::JobError;
use crate::limits::{self, ResourceLimits};
use crate::logstore::{LogStore, LogTail};
use crate::process::{self, ChildHandle};
use crate::registry::{JobId, JobRecord, JobRegistry, JobSpec, JobState};

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub state: JobState,
    pub created_at: SystemTime,
    pub end_time: Option<SystemTime>,
}

#[derive(Clone)]
pub struct Supervisor {
    config: Config,
    cgroup_ctl: CgroupController,
    registry: JobRegistry,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let version = config.resolved_cgroup_version();
        let cgroup_ctl =
            CgroupController::with_version(config.cgroup_root.clone(), config.namespace.clone(), version);
        Supervisor {
            config,
            cgroup_ctl,
            registry: JobRegistry::new(),
        }
    }

    fn require(&self, role: Role, op: Operation) -> Result<(), JobError> {
        if auth::allowed(role, op) {
            Ok(())
        } else {
            Err(JobError::PermissionDenied {
                operation: op.as_str().to_string(),
                role: format!("{role:?}"),
            })
        }
    }

    /// Starts a new job. `limits_text` is parsed with
    /// [`crate::limits::parse`]; pass `None` or an empty string for
    /// unlimited.
    pub async fn start(
        &self,
        role: Role,
        command: String,
        args: Vec<String>,
        limits_text: Option<&str>,
    ) -> Result<JobId, JobError> {
        self.require(role, Operation::Start)?;

        let limits = match limits_text {
            Some(text) if !text.trim().is_empty() => limits::parse(text)?,
            _ => ResourceLimits::unlimited(),
        };

        let job_id = Uuid::new_v4();
        let log = LogStore::new(self.config.max_log_memory_bytes);
        if let Some(dir) = &self.config.log_spill_dir {
            log.set_spill_path(dir.join(format!("{job_id}.log"))).await;
        }

        let spec = JobSpec {
            command: command.clone(),
            args: args.clone(),
            limits: limits.clone(),
        };

        macro_rules! fail {
            ($err:expr) => {{
                let err: JobError = $err;
                self.registry
                    .insert(JobRecord {
                        job_id,
                        spec: spec.clone(),
                        state: JobState::Failed {
                            reason: err.user_message(),
                        },
                        log: log.clone(),
                        created_at: SystemTime::now(),
                        end_time: Some(SystemTime::now()),
                    })
                    .expect("fresh job_id cannot collide");
                return Err(err);
            }};
            ($err:expr, remove $handle:expr) => {{
                if let Err(e) = $handle.remove() {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to remove cgroup after start failure");
                }
                fail!($err);
            }};
        }

        let cgroup_handle = match self.cgroup_ctl.create(job_id) {
            Ok(h) => h,
            Err(e) => fail!(JobError::Cgroup(e)),
        };

        if let Err(e) = cgroup_handle.apply_limits(&limits) {
            fail!(JobError::Cgroup(e), remove cgroup_handle);
        }

        let mut child_handle: ChildHandle = match process::spawn_stopped(&command, &args) {
            Ok(h) => h,
            Err(e) => fail!(JobError::Spawn(e.to_string()), remove cgroup_handle),
        };

        if let Err(e) = cgroup_handle.attach(child_handle.pid) {
            drop(child_handle);
            fail!(JobError::Cgroup(e), remove cgroup_handle);
        }

        if let Err(e) = child_handle.release() {
            fail!(JobError::Spawn(e.to_string()), remove cgroup_handle);
        }

        let pid = child_handle.pid;
        let record_handle = self
            .registry
            .insert(JobRecord {
                job_id,
                spec,
                state: JobState::Running { pid },
                log: log.clone(),
                created_at: SystemTime::now(),
                end_time: None,
            })
            .expect("fresh job_id cannot collide");

        tracing::info!(job_id = %job_id, pid, command = %command, "job started");

        let ChildHandle { child, guard, .. } = child_handle;
        tokio::spawn(async move {
            let status = match process::pump_and_wait(child, log.clone()).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "wait failed");
                    guard.disarm();
                    log.seal().await;
                    cgroup_handle.remove().ok();
                    let mut rec = record_handle.lock().await;
                    rec.state = JobState::Exited { exit_code: -1 };
                    rec.end_time = Some(SystemTime::now());
                    return;
                }
            };
            guard.disarm();
            log.seal().await;
            if let Err(e) = cgroup_handle.remove() {
                tracing::warn!(job_id = %job_id, error = %e, "failed to remove cgroup");
            }
            let exit_code = process::exit_code_from_status(status);
            tracing::info!(job_id = %job_id, exit_code, "job exited");
            let mut rec = record_handle.lock().await;
            rec.state = JobState::Exited { exit_code };
            rec.end_time = Some(SystemTime::now());
        });

        Ok(job_id)
    }

    /// Requests termination. Sends SIGTERM immediately; if the job hasn't
    /// exited within the configured grace period, escalates to SIGKILL.
    /// Idempotent while the job is already `Stopping`.
    pub async fn stop(&self, role: Role, job_id: JobId) -> Result<(), JobError> {
        self.require(role, Operation::Stop)?;

        let record_handle = self.registry.get(job_id).ok_or(JobError::NotFound(job_id))?;
        let pid = {
            let mut rec = record_handle.lock().await;
            match rec.state {
                JobState::Running { pid } => {
                    rec.state = JobState::Stopping { pid };
                    pid
                }
                // Already stopping: a SIGTERM and its grace timer are
                // already in flight from the first call. Returning here
                // keeps this idempotent per §4.5 step 3 — at most one
                // SIGTERM and one SIGKILL are ever delivered.
                JobState::Stopping { .. } => return Ok(()),
                JobState::Exited { .. } | JobState::Failed { .. } => {
                    return Err(JobError::AlreadyExited(job_id));
                }
            }
        };

        unsafe {
            libc::kill(-pid, libc::SIGTERM);
        }
        tracing::info!(job_id = %job_id, pid, "sent SIGTERM");

        let grace = self.config.stop_grace;
        let registry = self.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(handle) = registry.get(job_id) {
                let rec = handle.lock().await;
                if matches!(rec.state, JobState::Stopping { .. }) {
                    tracing::warn!(job_id = %job_id, pid, "grace period elapsed, sending SIGKILL");
                    unsafe {
                        libc::kill(-pid, libc::SIGKILL);
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn query(&self, role: Role, job_id: JobId) -> Result<JobStatus, JobError> {
        self.require(role, Operation::Query)?;
        let handle = self.registry.get(job_id).ok_or(JobError::NotFound(job_id))?;
        let rec = handle.lock().await;
        Ok(JobStatus {
            job_id: rec.job_id,
            command: rec.spec.command.clone(),
            args: rec.spec.args.clone(),
            state: rec.state.clone(),
            created_at: rec.created_at,
            end_time: rec.end_time,
        })
    }

    /// Returns an independent tailing cursor starting at offset 0 for the
    /// job's combined stdout/stderr log.
    pub async fn stream(&self, role: Role, job_id: JobId) -> Result<LogTail, JobError> {
        self.require(role, Operation::Stream)?;
        let handle = self.registry.get(job_id).ok_or(JobError::NotFound(job_id))?;
        let rec = handle.lock().await;
        Ok(rec.log.tail())
    }

    pub fn list(&self) -> Vec<JobId> {
        self.registry.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupVersion;

    fn test_supervisor(tmp: &std::path::Path) -> Supervisor {
        std::fs::write(tmp.join("cgroup.controllers"), "cpu memory io pids\n").unwrap();
        std::fs::create_dir_all(tmp.join("joblet")).unwrap();
        std::fs::write(tmp.join("joblet").join("cgroup.subtree_control"), "").unwrap();

        let config = Config {
            cgroup_root: tmp.to_path_buf(),
            namespace: "joblet".to_string(),
            cgroup_version: crate::config::CgroupVersionSetting::ForceV2,
            stop_grace: std::time::Duration::from_millis(200),
            max_log_memory_bytes: 1024 * 1024,
            log_spill_dir: None,
        };
        assert_eq!(config.resolved_cgroup_version(), CgroupVersion::V2);
        Supervisor::new(config)
    }

    #[tokio::test]
    async fn start_query_and_read_output_of_a_short_job() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());

        let job_id = sup
            .start(
                Role::Writer,
                "/bin/echo".to_string(),
                vec!["hello".to_string()],
                None,
            )
            .await
            .unwrap();

        let mut tail = sup.stream(Role::Reader, job_id).await.unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut collected = Vec::new();
        loop {
            match tail.read_available().await {
                crate::logstore::TailRead::Data(bytes) if !bytes.is_empty() => {
                    collected.extend_from_slice(&bytes)
                }
                crate::logstore::TailRead::Eof => break,
                _ => {
                    if std::time::Instant::now() > deadline {
                        panic!("timed out waiting for job output");
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
            }
        }
        assert_eq!(collected, b"hello\n");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let status = sup.query(Role::Reader, job_id).await.unwrap();
            if let JobState::Exited { exit_code } = status.state {
                assert_eq!(exit_code, 0);
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("job never reached Exited state");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn stop_sends_sigterm_and_job_exits() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());

        let job_id = sup
            .start(
                Role::Writer,
                "/bin/sleep".to_string(),
                vec!["30".to_string()],
                None,
            )
            .await
            .unwrap();

        sup.stop(Role::Writer, job_id).await.unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let status = sup.query(Role::Reader, job_id).await.unwrap();
            if let JobState::Exited { exit_code } = status.state {
                assert_eq!(exit_code, 128 + libc::SIGTERM);
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("job never exited after stop");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn reader_cannot_start_or_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());

        let err = sup
            .start(Role::Reader, "/bin/echo".to_string(), vec![], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn query_unknown_job_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());
        let err = sup.query(Role::Reader, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn stopping_an_already_exited_job_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());

        let job_id = sup
            .start(Role::Writer, "/bin/true".to_string(), vec![], None)
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let status = sup.query(Role::Reader, job_id).await.unwrap();
            if status.state.is_terminal() {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("job never exited");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let err = sup.stop(Role::Writer, job_id).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::AlreadyExited);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_sends_exactly_one_sigterm() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());

        let job_id = sup
            .start(
                Role::Writer,
                "/bin/sleep".to_string(),
                vec!["30".to_string()],
                None,
            )
            .await
            .unwrap();

        sup.stop(Role::Writer, job_id).await.unwrap();
        // A second call while still Stopping must be a no-op, not a second
        // SIGTERM / second grace-timer spawn.
        sup.stop(Role::Writer, job_id).await.unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let status = sup.query(Role::Reader, job_id).await.unwrap();
            if let JobState::Exited { exit_code } = status.state {
                assert_eq!(exit_code, 128 + libc::SIGTERM);
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("job never exited after stop");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn cgroup_directory_is_removed_once_job_exits() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());

        let job_id = sup
            .start(Role::Writer, "/bin/true".to_string(), vec![], None)
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let status = sup.query(Role::Reader, job_id).await.unwrap();
            if status.state.is_terminal() {
                assert!(status.end_time.is_some());
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("job never exited");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        // Give the reaper's cgroup_handle.remove() a moment to run past the
        // state update it performs just before this point.
        let cgroup_path = tmp.path().join("joblet").join(job_id.to_string());
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while cgroup_path.exists() {
            if std::time::Instant::now() > deadline {
                panic!("cgroup directory was not removed after job exit");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn bad_limits_text_rejected_before_any_process_is_spawned() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());

        let err = sup
            .start(
                Role::Writer,
                "/bin/echo".to_string(),
                vec![],
                Some("cpu: not-a-percent"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn cgroup_is_not_leaked_when_spawn_fails_after_create() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(tmp.path());

        let err = sup
            .start(
                Role::Writer,
                "/nonexistent/not-a-real-binary".to_string(),
                vec![],
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);

        // Find the job the Failed record was filed under, via the one entry
        // the registry now holds, and confirm its cgroup left no directory
        // behind.
        let job_id = sup.list()[0];
        let status = sup.query(Role::Reader, job_id).await.unwrap();
        assert!(matches!(status.state, JobState::Failed { .. }));
        let cgroup_path = tmp.path().join("joblet").join(job_id.to_string());
        assert!(!cgroup_path.exists());
    }
}
