//! Thin RPC-facing adapter exposing the Supervisor's four operations as
//! callable tools. The real transport (mutually authenticated, with its own
//! wire codec) is out of scope for this crate (SPEC_FULL §1); this adapter
//! stands in for it using `rmcp`'s stdio tool-call machinery the way the
//! teacher's `SquallServer` does, and accepts the caller's role directly as
//! a request field rather than extracting it from a verified client
//! certificate.

use std::time::{Duration, Instant};

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::config::Config;
use crate::logstore::TailRead;
use crate::registry::JobState;
use crate::supervisor::Supervisor;

fn parse_role(raw: &str) -> Result<Role, McpError> {
    match raw {
        "reader" | "READER" | "Reader" => Ok(Role::Reader),
        "writer" | "WRITER" | "Writer" => Ok(Role::Writer),
        other => Err(McpError::invalid_params(
            format!("unknown role {other:?}, expected \"reader\" or \"writer\""),
            None,
        )),
    }
}

fn parse_job_id(raw: &str) -> Result<uuid::Uuid, McpError> {
    raw.parse()
        .map_err(|_| McpError::invalid_params(format!("not a valid job id: {raw}"), None))
}

fn job_error_to_mcp(err: crate::error::JobError) -> McpError {
    use crate::error::ErrorCode;
    let detail = err.user_message();
    match err.code() {
        ErrorCode::NotFound => McpError::invalid_params(detail, None),
        ErrorCode::AlreadyExited => McpError::invalid_params(detail, None),
        ErrorCode::PermissionDenied => McpError::invalid_params(detail, None),
        ErrorCode::InvalidArgument => McpError::invalid_params(detail, None),
        ErrorCode::ResourceExhausted => McpError::internal_error(detail, None),
        ErrorCode::Internal => McpError::internal_error(detail, None),
    }
}

fn json_result(value: impl Serialize) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string(&value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StartRequest {
    /// Caller role: "reader" or "writer". Starting a job requires "writer".
    pub role: String,
    /// Executable to run (absolute or on PATH), e.g. "/bin/sleep".
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Resource limit spec text (see `joblet::limits::parse`), e.g.
    /// "cpu: 50%\nmemory: 256M\n". Omit or leave empty for no limits.
    pub limits: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub job_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct JobRequest {
    /// Caller role: "reader" or "writer".
    pub role: String,
    /// Job id returned by `start`.
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub exited: bool,
    pub state: &'static str,
    pub start_time_unix_secs: u64,
    pub end_time_unix_secs: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StreamRequest {
    /// Caller role: "reader" or "writer".
    pub role: String,
    /// Job id returned by `start`.
    pub job_id: String,
    /// How long to wait for output before returning whatever is buffered, in
    /// milliseconds (default 1000). Mirrors the core's "block until more
    /// data or EOF" contract within a single request/response round trip,
    /// since this adapter has no open streaming connection to a client.
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StreamResponse {
    /// Output collected from offset 0, decoded lossily as UTF-8. The
    /// underlying log is raw bytes; `output_lossy` is a display
    /// convenience for this text-oriented adapter.
    pub output_lossy: String,
    /// True once the job has exited and every byte it ever wrote has been
    /// returned.
    pub eof: bool,
}

fn unix_secs(t: std::time::SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct JobletServer {
    supervisor: Supervisor,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl JobletServer {
    pub fn new(config: Config) -> Self {
        JobletServer {
            supervisor: Supervisor::new(config),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "start",
        description = "Start a new job: launches `command` with `args` under a freshly created cgroup enforcing `limits`. Requires the \"writer\" role. Returns a job_id for query/stream/stop."
    )]
    async fn start(
        &self,
        Parameters(req): Parameters<StartRequest>,
    ) -> Result<CallToolResult, McpError> {
        let role = parse_role(&req.role)?;
        let job_id = self
            .supervisor
            .start(role, req.command, req.args, req.limits.as_deref())
            .await
            .map_err(job_error_to_mcp)?;
        json_result(StartResponse {
            job_id: job_id.to_string(),
        })
    }

    #[tool(
        name = "stop",
        description = "Stop a running job: sends SIGTERM immediately, escalating to SIGKILL if the job has not exited within the configured grace period. Idempotent. Requires the \"writer\" role."
    )]
    async fn stop(&self, Parameters(req): Parameters<JobRequest>) -> Result<CallToolResult, McpError> {
        let role = parse_role(&req.role)?;
        let job_id = parse_job_id(&req.job_id)?;
        self.supervisor
            .stop(role, job_id)
            .await
            .map_err(job_error_to_mcp)?;
        json_result(serde_json::json!({}))
    }

    #[tool(
        name = "query",
        description = "Query a job's current lifecycle state: pid, exit code (if exited), and timestamps. Available to any role.",
        annotations(read_only_hint = true)
    )]
    async fn query(&self, Parameters(req): Parameters<JobRequest>) -> Result<CallToolResult, McpError> {
        let role = parse_role(&req.role)?;
        let job_id = parse_job_id(&req.job_id)?;
        let status = self
            .supervisor
            .query(role, job_id)
            .await
            .map_err(job_error_to_mcp)?;

        let (pid, exit_code, exited, state_name) = match &status.state {
            JobState::Running { pid } => (Some(*pid), None, false, "running"),
            JobState::Stopping { pid } => (Some(*pid), None, false, "stopping"),
            JobState::Exited { exit_code } => (None, Some(*exit_code), true, "exited"),
            JobState::Failed { .. } => (None, None, true, "failed"),
        };

        json_result(QueryResponse {
            pid,
            exit_code,
            exited,
            state: state_name,
            start_time_unix_secs: unix_secs(status.created_at),
            end_time_unix_secs: status.end_time.map(unix_secs),
        })
    }

    #[tool(
        name = "stream",
        description = "Read a job's combined stdout/stderr from offset 0. Waits up to `wait_ms` for output to arrive if none is buffered yet. Call repeatedly (each call starts a fresh read from offset 0) until `eof` is true. Available to any role.",
        annotations(read_only_hint = true)
    )]
    async fn stream(
        &self,
        Parameters(req): Parameters<StreamRequest>,
    ) -> Result<CallToolResult, McpError> {
        let role = parse_role(&req.role)?;
        let job_id = parse_job_id(&req.job_id)?;
        let mut tail = self
            .supervisor
            .stream(role, job_id)
            .await
            .map_err(job_error_to_mcp)?;

        let wait = Duration::from_millis(req.wait_ms.unwrap_or(1000));
        let deadline = Instant::now() + wait;
        let mut collected = Vec::new();
        let mut eof = false;
        loop {
            match tail.read_available().await {
                TailRead::Data(bytes) if !bytes.is_empty() => collected.extend_from_slice(&bytes),
                TailRead::Eof => {
                    eof = true;
                    break;
                }
                _ => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }

        json_result(StreamResponse {
            output_lossy: String::from_utf8_lossy(&collected).into_owned(),
            eof,
        })
    }
}

#[tool_handler]
impl ServerHandler for JobletServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "joblet".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "joblet: remote job-worker core.\n\n\
                 Tools:\n\
                 - `start`: launch a command under a resource-limited cgroup (\"writer\" role).\n\
                 - `stop`: request termination of a running job (\"writer\" role).\n\
                 - `query`: read a job's lifecycle state and exit code.\n\
                 - `stream`: read a job's captured stdout/stderr from offset 0.\n\n\
                 Every tool takes `role` (\"reader\" or \"writer\") standing in for the \
                 identity/role a real mTLS transport would extract from the caller's \
                 certificate."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_role_accepts_case_variants() {
        assert_eq!(parse_role("reader").unwrap(), Role::Reader);
        assert_eq!(parse_role("WRITER").unwrap(), Role::Writer);
        assert!(parse_role("admin").is_err());
    }

    #[test]
    fn parse_job_id_rejects_garbage() {
        assert!(parse_job_id("not-a-uuid").is_err());
    }
}
