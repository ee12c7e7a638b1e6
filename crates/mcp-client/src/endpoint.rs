//! Per-transport endpoint resolution.
//!
//! Each transport variant resolves to either an HTTP/SSE endpoint with
//! headers or a subprocess spec; the common session layer drives the rest.
//! Hosted providers (Composio, Pipedream) resolve through small token
//! services with TTL caching so repeated invocations within a run don't
//! re-authenticate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use skein_domain::mcp::{McpServerConfig, McpTransportConfig};

use crate::McpError;

/// Fixed Pipedream remote MCP endpoint.
const PIPEDREAM_MCP_URL: &str = "https://remote.mcp.pipedream.net";

/// What a resolved config connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSpec {
    /// Streamable HTTP: JSON-RPC POSTs, optionally answered over SSE.
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    /// Classic HTTP+SSE: GET stream plus a POST message endpoint.
    Sse {
        url: String,
        headers: HashMap<String, String>,
    },
    /// Local subprocess on stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hosted-provider token services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolves a Composio profile id to a signed server URL.
#[async_trait]
pub trait ComposioProfileService: Send + Sync {
    async fn mcp_url(&self, profile_id: &str) -> Result<String, McpError>;
}

/// Issues short-lived OAuth bearer tokens for Pipedream's remote endpoint.
#[async_trait]
pub trait PipedreamTokenService: Send + Sync {
    async fn access_token(&self) -> Result<String, McpError>;

    fn project_id(&self) -> &str;

    fn environment(&self) -> &str;
}

/// HTTP-backed Composio profile service with a TTL cache on resolved URLs.
pub struct HttpComposioProfileService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl HttpComposioProfileService {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            cache: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(10 * 60),
        }
    }
}

#[async_trait]
impl ComposioProfileService for HttpComposioProfileService {
    async fn mcp_url(&self, profile_id: &str) -> Result<String, McpError> {
        if let Some((url, fetched)) = self.cache.lock().get(profile_id) {
            if fetched.elapsed() < self.ttl {
                return Ok(url.clone());
            }
        }

        let endpoint = format!(
            "{}/api/v3/mcp/profiles/{profile_id}/server-url",
            self.base_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .get(&endpoint)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("composio profile lookup: {e}")))?;
        if !resp.status().is_success() {
            return Err(McpError::Protocol(format!(
                "composio profile lookup returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| McpError::Protocol(format!("composio profile body: {e}")))?;
        let url = body
            .get("mcp_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McpError::Protocol("composio response missing mcp_url".into()))?
            .to_string();

        self.cache
            .lock()
            .insert(profile_id.to_string(), (url.clone(), Instant::now()));
        Ok(url)
    }
}

/// OAuth client-credentials token service for Pipedream, with TTL caching.
pub struct HttpPipedreamTokenService {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    project_id: String,
    environment: String,
    cached: Mutex<Option<(String, Instant)>>,
    ttl: Duration,
}

impl HttpPipedreamTokenService {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        project_id: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: "https://api.pipedream.com/v1/oauth/token".into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            project_id: project_id.into(),
            environment: environment.into(),
            cached: Mutex::new(None),
            ttl: Duration::from_secs(50 * 60),
        }
    }
}

#[async_trait]
impl PipedreamTokenService for HttpPipedreamTokenService {
    async fn access_token(&self) -> Result<String, McpError> {
        if let Some((token, fetched)) = self.cached.lock().as_ref() {
            if fetched.elapsed() < self.ttl {
                return Ok(token.clone());
            }
        }

        let resp = self
            .client
            .post(&self.token_url)
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": self.client_id,
                "client_secret": self.client_secret,
            }))
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("pipedream token: {e}")))?;
        if !resp.status().is_success() {
            return Err(McpError::Protocol(format!(
                "pipedream token endpoint returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| McpError::Protocol(format!("pipedream token body: {e}")))?;
        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McpError::Protocol("pipedream response missing access_token".into()))?
            .to_string();

        *self.cached.lock() = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn environment(&self) -> &str {
        &self.environment
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turns transport configs into connectable [`SessionSpec`]s.
pub struct EndpointResolver {
    composio: Option<Arc<dyn ComposioProfileService>>,
    pipedream: Option<Arc<dyn PipedreamTokenService>>,
}

impl EndpointResolver {
    pub fn new(
        composio: Option<Arc<dyn ComposioProfileService>>,
        pipedream: Option<Arc<dyn PipedreamTokenService>>,
    ) -> Self {
        Self { composio, pipedream }
    }

    /// Resolver for setups with no hosted-provider credentials.
    pub fn direct_only() -> Self {
        Self::new(None, None)
    }

    pub async fn resolve(&self, config: &McpServerConfig) -> Result<SessionSpec, McpError> {
        match &config.transport {
            McpTransportConfig::StreamableHttp { url, headers } => Ok(SessionSpec::Http {
                url: url.clone(),
                headers: headers.clone(),
            }),

            McpTransportConfig::Sse { url, headers } => Ok(SessionSpec::Sse {
                url: url.clone(),
                headers: headers.clone(),
            }),

            McpTransportConfig::Stdio { command, args, env } => Ok(SessionSpec::Stdio {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
            }),

            McpTransportConfig::Composio { profile_id } => {
                let service = self.composio.as_ref().ok_or_else(|| {
                    McpError::Protocol("composio transport configured without credentials".into())
                })?;
                let url = service.mcp_url(profile_id).await?;
                Ok(SessionSpec::Http {
                    url,
                    headers: HashMap::new(),
                })
            }

            McpTransportConfig::Pipedream {
                app_slug,
                profile_id,
                external_user_id,
                oauth_app_id,
            } => {
                let service = self.pipedream.as_ref().ok_or_else(|| {
                    McpError::Protocol("pipedream transport configured without credentials".into())
                })?;
                let token = service.access_token().await?;

                let mut headers = HashMap::new();
                headers.insert("Authorization".into(), format!("Bearer {token}"));
                headers.insert("x-pd-project-id".into(), service.project_id().to_string());
                headers.insert("x-pd-environment".into(), service.environment().to_string());
                headers.insert("x-pd-app-slug".into(), app_slug.clone());
                let user = external_user_id
                    .clone()
                    .or_else(|| profile_id.clone())
                    .or_else(|| config.external_user_id.clone())
                    .ok_or_else(|| {
                        McpError::Protocol(
                            "pipedream transport requires profile_id or external_user_id".into(),
                        )
                    })?;
                headers.insert("x-pd-external-user-id".into(), user);
                if let Some(oauth_app_id) = oauth_app_id {
                    headers.insert("x-pd-oauth-app-id".into(), oauth_app_id.clone());
                }

                Ok(SessionSpec::Http {
                    url: PIPEDREAM_MCP_URL.into(),
                    headers,
                })
            }
        }
    }
}
