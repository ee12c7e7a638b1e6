//! MCP session transports.
//!
//! A session lives for exactly one discovery or tool call: open, handshake,
//! request, close. Three transports are supported:
//! - **Stdio**: spawn a child process, newline-delimited JSON-RPC.
//! - **Streamable HTTP**: JSON-RPC POSTs; the server answers with a JSON
//!   body or a short-lived SSE body carrying the response.
//! - **SSE**: long-lived GET stream that announces a POST endpoint, with
//!   responses delivered on the stream.

use std::collections::HashMap;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;

use crate::endpoint::SessionSpec;
use crate::protocol::{
    self, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::McpError;

/// Per-request deadline inside an open session.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Non-JSON stdout lines tolerated before declaring a stdio server broken.
const MAX_SKIP_LINES: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One live MCP session, already past the `initialize` handshake.
pub enum McpSession {
    Stdio(StdioSession),
    Http(HttpSession),
    Sse(SseSession),
}

impl McpSession {
    /// Open the transport and run the MCP handshake.
    pub async fn open(spec: &SessionSpec) -> Result<Self, McpError> {
        let mut session = match spec {
            SessionSpec::Stdio { command, args, env } => {
                Self::Stdio(StdioSession::spawn(command, args, env)?)
            }
            SessionSpec::Http { url, headers } => {
                Self::Http(HttpSession::new(url.clone(), headers.clone())?)
            }
            SessionSpec::Sse { url, headers } => {
                Self::Sse(SseSession::connect(url.clone(), headers.clone()).await?)
            }
        };

        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| McpError::Protocol(format!("initialize params: {e}")))?;
        session.request("initialize", Some(params)).await?;
        session.notify("notifications/initialized").await?;
        Ok(session)
    }

    pub async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        match self {
            Self::Stdio(s) => s.request(method, params).await,
            Self::Http(s) => s.request(method, params).await,
            Self::Sse(s) => s.request(method, params).await,
        }
    }

    pub async fn notify(&mut self, method: &str) -> Result<(), McpError> {
        match self {
            Self::Stdio(s) => s.notify(method).await,
            Self::Http(s) => s.notify(method).await,
            Self::Sse(s) => s.notify(method).await,
        }
    }

    /// Tear the session down. Best-effort: close failures are logged, not
    /// surfaced.
    pub async fn close(self) {
        match self {
            Self::Stdio(s) => s.close().await,
            Self::Http(_) | Self::Sse(_) => {}
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Child process speaking newline-delimited JSON-RPC on stdin/stdout.
pub struct StdioSession {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    child: Child,
    next_id: u64,
}

impl StdioSession {
    fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Transport(format!("spawn {command}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture child stdout".into()))?;

        Ok(Self {
            stdin,
            stdout: BufReader::new(stdout),
            child,
            next_id: 1,
        })
    }

    async fn write_line(&mut self, json: &str) -> Result<(), McpError> {
        self.stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("stdio write: {e}")))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| McpError::Transport(format!("stdio write: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("stdio flush: {e}")))?;
        Ok(())
    }

    /// Read stdout lines until a JSON object appears, skipping any logging
    /// a misconfigured server writes to stdout.
    async fn read_json_line(&mut self) -> Result<String, McpError> {
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let n = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| McpError::Transport(format!("stdio read: {e}")))?;
            if n == 0 {
                return Err(McpError::Transport("MCP server process exited".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                return Err(McpError::Protocol(
                    "MCP server produced too many non-JSON stdout lines".into(),
                ));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON stdout line from MCP server");
        }
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)
            .map_err(|e| McpError::Protocol(format!("encode request: {e}")))?;

        tracing::debug!(id, method, "mcp stdio request");
        self.write_line(&json).await?;

        let result = tokio::time::timeout(REQUEST_TIMEOUT, async {
            // Skip notifications and mismatched ids; MCP servers may emit
            // progress messages between request and response.
            loop {
                let line = self.read_json_line().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return resp
                            .into_result()
                            .map_err(|e| McpError::Remote(e.to_string()));
                    }
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(McpError::Timeout(REQUEST_TIMEOUT)),
        }
    }

    async fn notify(&mut self, method: &str) -> Result<(), McpError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method))
            .map_err(|e| McpError::Protocol(format!("encode notification: {e}")))?;
        self.write_line(&json).await
    }

    async fn close(mut self) {
        if let Err(e) = self.stdin.shutdown().await {
            tracing::debug!(error = %e, "error closing MCP server stdin");
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "MCP server process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for MCP server process"),
            Err(_) => {
                tracing::warn!("MCP server did not exit in time, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streamable HTTP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streamable HTTP session. Stateless per request apart from the
/// `Mcp-Session-Id` the server may assign during `initialize`.
pub struct HttpSession {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: Option<String>,
    next_id: u64,
}

impl HttpSession {
    fn new(url: String, headers: HashMap<String, String>) -> Result<Self, McpError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| McpError::Transport(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url,
            headers,
            session_id: None,
            next_id: 1,
        })
    }

    fn post(&self) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Some(session_id) = &self.session_id {
            builder = builder.header("Mcp-Session-Id", session_id);
        }
        builder
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        let req = JsonRpcRequest::new(id, method, params);

        tracing::debug!(id, method, url = %self.url, "mcp http request");
        let resp = self
            .post()
            .json(&req)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("http post: {e}")))?;

        if let Some(session_id) = resp
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!(
                "mcp server returned HTTP {status}"
            )));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let response = if content_type.starts_with("text/event-stream") {
            read_response_from_sse(resp, id).await?
        } else {
            resp.json::<JsonRpcResponse>()
                .await
                .map_err(|e| McpError::Protocol(format!("decode response: {e}")))?
        };

        if response.id != id {
            return Err(McpError::Protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        response
            .into_result()
            .map_err(|e| McpError::Remote(e.to_string()))
    }

    async fn notify(&mut self, method: &str) -> Result<(), McpError> {
        let notif = JsonRpcNotification::new(method);
        let resp = self
            .post()
            .json(&notif)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("http post: {e}")))?;
        // Servers acknowledge notifications with 202; any 2xx is fine.
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "notification rejected with HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Scan an SSE response body for the JSON-RPC response matching `id`.
async fn read_response_from_sse(
    resp: reqwest::Response,
    id: u64,
) -> Result<JsonRpcResponse, McpError> {
    let mut stream = resp.bytes_stream().eventsource();
    let deadline = tokio::time::Instant::now() + REQUEST_TIMEOUT;
    loop {
        let next = tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| McpError::Timeout(REQUEST_TIMEOUT))?;
        let Some(event) = next else {
            return Err(McpError::Protocol(
                "SSE body ended without a matching response".into(),
            ));
        };
        let event = event.map_err(|e| McpError::Transport(format!("sse read: {e}")))?;
        if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
            if response.id == id {
                return Ok(response);
            }
        }
        // Progress notifications and unrelated messages are skipped.
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classic HTTP+SSE session: a GET stream announces the message endpoint
/// via an `endpoint` event, requests are POSTed there, and responses come
/// back on the stream.
pub struct SseSession {
    client: reqwest::Client,
    endpoint_url: String,
    headers: HashMap<String, String>,
    incoming: mpsc::UnboundedReceiver<JsonRpcResponse>,
    reader: tokio::task::JoinHandle<()>,
    next_id: u64,
}

impl SseSession {
    async fn connect(url: String, headers: HashMap<String, String>) -> Result<Self, McpError> {
        let client = reqwest::Client::new();

        let mut builder = client.get(&url).header("Accept", "text/event-stream");
        for (key, value) in &headers {
            builder = builder.header(key, value);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("sse connect: {e}")))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "sse endpoint returned HTTP {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream().eventsource();

        // The server's first event names the POST endpoint.
        let endpoint_url = tokio::time::timeout(REQUEST_TIMEOUT, async {
            while let Some(event) = stream.next().await {
                let event =
                    event.map_err(|e| McpError::Transport(format!("sse read: {e}")))?;
                if event.event == "endpoint" {
                    return Ok(join_url(&url, event.data.trim()));
                }
            }
            Err(McpError::Protocol(
                "SSE stream closed before announcing an endpoint".into(),
            ))
        })
        .await
        .map_err(|_| McpError::Timeout(REQUEST_TIMEOUT))??;

        let (tx, incoming) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Ok(event) = event else { break };
                if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    if tx.send(response).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client,
            endpoint_url,
            headers,
            incoming,
            reader,
            next_id: 1,
        })
    }

    async fn post_message(&self, body: &Value) -> Result<(), McpError> {
        let mut builder = self
            .client
            .post(&self.endpoint_url)
            .header("Content-Type", "application/json");
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        let resp = builder
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("sse post: {e}")))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "sse message endpoint returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        let req = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| McpError::Protocol(format!("encode request: {e}")))?;
        self.post_message(&req).await?;

        let deadline = tokio::time::Instant::now() + REQUEST_TIMEOUT;
        loop {
            let next = tokio::time::timeout_at(deadline, self.incoming.recv())
                .await
                .map_err(|_| McpError::Timeout(REQUEST_TIMEOUT))?;
            let Some(response) = next else {
                return Err(McpError::Transport("SSE stream closed".into()));
            };
            if response.id == id {
                return response
                    .into_result()
                    .map_err(|e| McpError::Remote(e.to_string()));
            }
        }
    }

    async fn notify(&mut self, method: &str) -> Result<(), McpError> {
        let notif = serde_json::to_value(JsonRpcNotification::new(method))
            .map_err(|e| McpError::Protocol(format!("encode notification: {e}")))?;
        self.post_message(&notif).await
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Resolve an endpoint reference against the SSE base URL. Absolute URLs
/// pass through; absolute paths attach to the origin; anything else is
/// resolved against the base's directory.
fn join_url(base: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference.to_string();
    }
    if let Some(path) = reference.strip_prefix('/') {
        let origin_end = base
            .find("://")
            .map(|scheme| {
                base[scheme + 3..]
                    .find('/')
                    .map(|p| scheme + 3 + p)
                    .unwrap_or(base.len())
            })
            .unwrap_or(base.len());
        return format!("{}/{}", &base[..origin_end], path);
    }
    match base.rfind('/') {
        Some(pos) if pos > base.find("://").map(|p| p + 2).unwrap_or(0) => {
            format!("{}/{}", &base[..pos], reference)
        }
        _ => format!("{}/{}", base.trim_end_matches('/'), reference),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_variants() {
        assert_eq!(
            join_url("https://host/sse", "https://other/messages"),
            "https://other/messages"
        );
        assert_eq!(
            join_url("https://host:8080/sse", "/messages?sid=1"),
            "https://host:8080/messages?sid=1"
        );
        assert_eq!(
            join_url("https://host/mcp/sse", "messages"),
            "https://host/mcp/messages"
        );
        assert_eq!(join_url("https://host", "/messages"), "https://host/messages");
    }
}
