//! MCP server: tool definitions exposing the session core over `rmcp`.
//!
//! The tool set is built around persistent, stateful shell sessions --
//! create one, run commands against it, answer prompts interactively, and
//! close it when done -- rather than one-off command execution.

use crate::manager::{SessionManager, SessionSummary};
use crate::pty::remote::{Auth, RemoteTarget};
use crate::session::ExecResult;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CreateSessionParams {
    /// Initial working directory. Defaults to the server's cwd.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CreateRemoteSessionParams {
    pub host: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Password to authenticate with. Mutually exclusive with `key_path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to a private key to authenticate with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SessionIdParams {
    pub id: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ExecParams {
    pub id: String,
    /// The shell command to execute.
    pub command: String,
    /// Maximum execution time in seconds. Defaults to the session manager's
    /// configured ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ProvideInputParams {
    pub id: String,
    /// Text to send in response to a detected password or confirmation
    /// prompt.
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SendRawParams {
    pub id: String,
    /// Text to write verbatim (with `\n \r \t \\ \e \xNN \NNN` escape
    /// interpretation), with no marker framing.
    pub text: String,
    /// How long to wait, after the last meaningful change, before
    /// returning whatever has accumulated. Defaults to 2 seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_seconds: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ControlExecParams {
    /// Host the control session is scoped to, or "local".
    #[serde(default = "default_control_host")]
    pub host: String,
    pub command: String,
}

fn default_control_host() -> String {
    "local".to_string()
}

// ---------------------------------------------------------------------------
// Result structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ExecResponse {
    pub id: String,
    pub state: crate::session::State,
    pub stdout: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_seconds: f64,
    pub awaiting: Option<crate::session::AwaitingKind>,
}

fn exec_response(id: &str, result: ExecResult) -> ExecResponse {
    ExecResponse {
        id: id.to_string(),
        state: result.state,
        stdout: result.stdout,
        exit_code: result.exit_code,
        timed_out: result.timed_out,
        duration_seconds: result.duration_seconds,
        awaiting: result.awaiting,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendRawResponse {
    pub id: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvResponse {
    pub id: String,
    pub vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlExecResponse {
    pub host: String,
    pub stdout: String,
    pub exit_code: i32,
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The shell session MCP server: one [`SessionManager`] per server
/// instance, shared across every tool call via `Clone` (the manager itself
/// is internally `Arc`-backed).
#[derive(Clone)]
pub struct ShellSessionServer {
    sessions: SessionManager,
    tool_router: ToolRouter<ShellSessionServer>,
}

impl ShellSessionServer {
    #[must_use]
    pub fn new(config: crate::config::Config) -> Self {
        Self {
            sessions: SessionManager::new(config),
            tool_router: Self::tool_router(),
        }
    }
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn err_result(msg: impl std::fmt::Display) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.to_string())]))
}

#[tool_router]
impl ShellSessionServer {
    #[tool(
        description = "Create a persistent local shell session (a long-lived bash process attached to a real PTY). Working directory, env vars, shell functions, and aliases persist across exec calls. Set working_directory to start in a specific project."
    )]
    async fn create_session(
        &self,
        Parameters(params): Parameters<CreateSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.sessions.create_local(params.working_directory).await {
            Ok(summary) => {
                tracing::info!(id = %summary.id, "create_session");
                json_content(&summary)
            }
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Create a persistent session on a remote host over SSH, attached to a real PTY there. Provide exactly one of password or key_path for authentication. First-connect host key prompts are handled automatically."
    )]
    async fn create_remote_session(
        &self,
        Parameters(params): Parameters<CreateRemoteSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let auth = match (params.password, params.key_path) {
            (Some(password), None) => Auth::Password(password),
            (None, Some(key_path)) => Auth::KeyPath(std::path::PathBuf::from(key_path)),
            _ => {
                return err_result(
                    "exactly one of password or key_path must be provided for remote sessions",
                )
            }
        };
        let target = RemoteTarget {
            host: params.host,
            port: params.port.unwrap_or(22),
            user: params.user,
            auth,
        };

        let host = target.host.clone();
        match self.sessions.create_remote(target).await {
            Ok(summary) => {
                tracing::info!(id = %summary.id, host = %host, "create_remote_session");
                json_content(&summary)
            }
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Execute a command in a session. Working directory, env vars, functions, and aliases persist across calls. If the command presents a password or confirmation prompt, the session moves to the awaiting_input state -- use provide_input to answer it. Increase timeout_seconds for long-running commands (builds, tests)."
    )]
    async fn exec(
        &self,
        Parameters(params): Parameters<ExecParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.id, command = %params.command, "exec");
        match self
            .sessions
            .exec(&params.id, &params.command, params.timeout_seconds)
            .await
        {
            Ok(result) => json_content(&exec_response(&params.id, result)),
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Answer a prompt from a session currently in the awaiting_input state (e.g. a sudo password or a yes/no confirmation). Resumes reading the in-flight command's output."
    )]
    async fn provide_input(
        &self,
        Parameters(params): Parameters<ProvideInputParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.id, "provide_input");
        match self
            .sessions
            .provide_input(&params.id, &params.text, params.timeout_seconds)
            .await
        {
            Ok(result) => json_content(&exec_response(&params.id, result)),
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Write raw keystrokes to a session's terminal with no command framing, then return whatever output accumulates once it settles. Supports \\n \\r \\t \\\\ \\e \\xNN \\NNN escapes. For driving interactive, full-screen programs that exec's marker protocol can't bound."
    )]
    async fn send_raw(
        &self,
        Parameters(params): Parameters<SendRawParams>,
    ) -> Result<CallToolResult, McpError> {
        let idle_timeout = params.idle_timeout_seconds.unwrap_or(2);
        match self
            .sessions
            .send_raw(&params.id, &params.text, idle_timeout)
            .await
        {
            Ok(lines) => json_content(&SendRawResponse {
                id: params.id,
                lines,
            }),
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Send Ctrl-C to the foreground process in a session that is running or awaiting input. Returns the session to idle once the shell settles."
    )]
    async fn interrupt(
        &self,
        Parameters(params): Parameters<SessionIdParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.id, "interrupt");
        match self.sessions.interrupt(&params.id).await {
            Ok(result) => json_content(&exec_response(&params.id, result)),
            Err(e) => err_result(e),
        }
    }

    #[tool(description = "Get a session's current state (idle/running/awaiting_input/closed), whether it's remote, and how long it has been idle.")]
    async fn status(
        &self,
        Parameters(params): Parameters<SessionIdParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.sessions.status(&params.id).await {
            Ok(summary) => json_content(&summary),
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Capture the session's current environment variables (runs `env` through the session). Also used internally before a remote reconnect to know what to re-export."
    )]
    async fn capture_env(
        &self,
        Parameters(params): Parameters<SessionIdParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.sessions.capture_env(&params.id).await {
            Ok(vars) => json_content(&EnvResponse {
                id: params.id,
                vars,
            }),
            Err(e) => err_result(e),
        }
    }

    #[tool(description = "Capture the session's current shell aliases (runs `alias` through the session).")]
    async fn capture_aliases(
        &self,
        Parameters(params): Parameters<SessionIdParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.sessions.capture_aliases(&params.id).await {
            Ok(vars) => json_content(&EnvResponse {
                id: params.id,
                vars,
            }),
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Run a command on the shared control session for a host, outside any individual session's own shell state. Used for diagnostics like listing the processes attached to a session's tty."
    )]
    async fn control_exec(
        &self,
        Parameters(params): Parameters<ControlExecParams>,
    ) -> Result<CallToolResult, McpError> {
        let control = match self.sessions.control_session_for(&params.host).await {
            Ok(control) => control,
            Err(e) => return err_result(e),
        };
        match control.exec(&params.command).await {
            Ok(output) => json_content(&ControlExecResponse {
                host: params.host,
                stdout: output.stdout,
                exit_code: output.exit_code,
            }),
            Err(e) => err_result(e),
        }
    }

    #[tool(description = "List all active sessions with their state, transport, and idle time.")]
    async fn list_sessions(&self) -> Result<CallToolResult, McpError> {
        let sessions: Vec<SessionSummary> = self.sessions.list().await;
        json_content(&sessions)
    }

    #[tool(
        description = "List all active sessions with their full connection metadata (host, port, user, working directory) in addition to state and idle time."
    )]
    async fn list_sessions_detailed(&self) -> Result<CallToolResult, McpError> {
        let sessions = self.sessions.list_detailed().await;
        json_content(&sessions)
    }

    #[tool(
        description = "Look up a session by id, reviving it from the durable session store (a fresh shell at its last known state) if it isn't currently live in this process."
    )]
    async fn get_session(
        &self,
        Parameters(params): Parameters<SessionIdParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.sessions.get(&params.id).await {
            Ok(summary) => json_content(&summary),
            Err(e) => err_result(e),
        }
    }

    #[tool(description = "Close a session and terminate its shell process.")]
    async fn close_session(
        &self,
        Parameters(params): Parameters<SessionIdParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(id = %params.id, "close_session");
        match self.sessions.close(&params.id).await {
            Ok(()) => json_content(&serde_json::json!({"id": params.id, "closed": true})),
            Err(e) => err_result(e),
        }
    }

    #[tool(description = "Close every active session, terminating their shell processes.")]
    async fn close_all_sessions(&self) -> Result<CallToolResult, McpError> {
        tracing::info!("close_all_sessions");
        let results = self.sessions.close_all().await;
        let summary: Vec<serde_json::Value> = results
            .into_iter()
            .map(|(id, result)| match result {
                Ok(()) => serde_json::json!({"id": id, "closed": true}),
                Err(e) => serde_json::json!({"id": id, "closed": false, "error": e.to_string()}),
            })
            .collect();
        json_content(&summary)
    }
}

#[tool_handler]
impl ServerHandler for ShellSessionServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "shellcore-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "shellcore-mcp exposes persistent, interactive shell sessions over a real PTY.\n\n\
                 Use create_session (or create_remote_session for SSH) to start one, then exec to \
                 run commands. Working directory, env vars, shell functions, and aliases persist \
                 across calls. If a command prompts for a password or a yes/no confirmation, exec \
                 returns state=awaiting_input -- answer it with provide_input. For interactive, \
                 full-screen programs, use send_raw to type keystrokes directly. interrupt sends \
                 Ctrl-C; status reports the session's current state; close_session terminates it. \
                 Session ids are always server-generated; get_session can revive a session this \
                 process restarted without from its durable store entry."
                    .to_string(),
            ),
        }
    }
}
