use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use paceforge_core::{env, Authority};

use crate::error::EngineError;
use crate::throttle::{ThrottleConfig, ThrottleController};
use crate::util::lock_unpoisoned;

/// Default per-request HTTP timeout, overridable via `MORPH_TIMEOUT`.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Boxed future returned by custom fetch commands.
pub type CustomFetchFuture =
    Pin<Box<dyn Future<Output = Result<FetchPayload, EngineError>> + Send>>;

/// A caller-supplied fetch routine; receives a clone of the agent's
/// HTTP client and runs on the worker's I/O task.
pub type CustomFetch = Arc<dyn Fn(reqwest::Client) -> CustomFetchFuture + Send + Sync>;

/// A typed request command, dispatched on the worker's I/O task.
#[derive(Clone)]
pub enum AgentCommand {
    /// Fetch a URL.
    Get(Url),
    /// Submit a form by POST.
    Post {
        /// Form action URL.
        url: Url,
        /// Form fields, in submission order.
        form: Vec<(String, String)>,
    },
    /// Run an arbitrary fetch routine against the agent's client.
    Custom(CustomFetch),
}

impl fmt::Debug for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentCommand::Get(url) => f.debug_tuple("Get").field(url).finish(),
            AgentCommand::Post { url, form } => f
                .debug_struct("Post")
                .field("url", url)
                .field("fields", &form.len())
                .finish(),
            AgentCommand::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// What a completed fetch hands back to the task body.
#[derive(Debug, Clone)]
pub struct FetchPayload {
    /// HTTP status code.
    pub status: u16,
    /// URL after redirects.
    pub final_url: Url,
    /// `Content-Type` header, when present.
    pub content_type: Option<String>,
    /// Response body, decoded as text.
    pub body: String,
}

impl FetchPayload {
    /// A payload carrying only a body; used by custom fetches and tests.
    pub fn of_body(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            final_url: Url::parse("about:blank").expect("about:blank is a valid URL"),
            content_type: None,
            body: body.into(),
        }
    }
}

/// How an agent's HTTP client is built.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Proxy for geo-locked sites, when configured.
    pub proxy: Option<Url>,
    /// Politeness settings for this agent.
    pub throttle: ThrottleConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("paceforge/{}", env!("CARGO_PKG_VERSION")),
            timeout: DEFAULT_HTTP_TIMEOUT,
            proxy: None,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `MORPH_TIMEOUT` (seconds). When `use_proxy`
    /// is set, `MORPH_AUSTRALIAN_PROXY` supplies the proxy URL.
    pub fn from_env(use_proxy: bool) -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env::parse::<u64>("MORPH_TIMEOUT") {
            cfg.timeout = Duration::from_secs(secs);
        }
        if use_proxy {
            cfg.proxy = env::non_empty("MORPH_AUSTRALIAN_PROXY")
                .and_then(|raw| Url::parse(&raw).ok());
        }
        cfg
    }
}

/// An HTTP client wrapper that paces its own requests.
///
/// After every request the agent computes the next instant it is allowed
/// to run and records it; before the next request the worker machinery
/// reads that deadline and converts any remaining wait into a schedulable
/// delay, so other workers run during it. The agent itself never sleeps
/// on the scheduler's context.
pub struct PoliteAgent {
    authority: Authority,
    client: reqwest::Client,
    throttle: ThrottleController,
    next_allowed: Mutex<Option<Instant>>,
}

impl PoliteAgent {
    /// Builds the agent and its HTTP client.
    pub fn new(authority: Authority, config: AgentConfig) -> Result<Self, EngineError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout);
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|err| EngineError::Build(format!("proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| EngineError::Build(err.to_string()))?;

        Ok(Self {
            authority,
            client,
            throttle: ThrottleController::new(config.throttle),
            next_allowed: Mutex::new(None),
        })
    }

    /// The authority this agent fetches for.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// The instant before which this agent must not issue a request, if a
    /// request has completed already.
    pub fn next_allowed_at(&self) -> Option<Instant> {
        *lock_unpoisoned(&self.next_allowed)
    }

    /// Runs one command, measures it, and computes the next-allowed
    /// instant. Returns the outcome together with that deadline so the
    /// response can carry it explicitly.
    pub(crate) async fn perform(
        &self,
        command: AgentCommand,
    ) -> (Result<FetchPayload, EngineError>, Option<Instant>) {
        let started = Instant::now();
        let result = self.run_command(command).await;
        let finished = Instant::now();

        let next = self.throttle.next_allowed_after(finished, finished - started);
        *lock_unpoisoned(&self.next_allowed) = Some(next);
        (result, Some(next))
    }

    async fn run_command(&self, command: AgentCommand) -> Result<FetchPayload, EngineError> {
        match command {
            AgentCommand::Get(url) => self.fetch(self.client.get(url)).await,
            AgentCommand::Post { url, form } => {
                self.fetch(self.client.post(url).form(&form)).await
            }
            AgentCommand::Custom(fetch) => fetch(self.client.clone()).await,
        }
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<FetchPayload, EngineError> {
        let response = request.send().await.map_err(|err| self.transport(&err))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|err| self.transport(&err))?;

        Ok(FetchPayload {
            status,
            final_url,
            content_type,
            body,
        })
    }

    fn transport(&self, err: &reqwest::Error) -> EngineError {
        EngineError::Transport {
            authority: self.authority.clone(),
            message: err.to_string(),
        }
    }
}

impl fmt::Debug for PoliteAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoliteAgent")
            .field("authority", &self.authority)
            .field("next_allowed", &self.next_allowed_at())
            .finish()
    }
}
