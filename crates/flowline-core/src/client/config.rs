use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RUNNER: &str = "default";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the Backend API and the local state directory.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, e.g. `https://workflows.example.com/api/v1`
    pub base_url: String,
    /// Sent as `Authorization: UserKey <key>`
    pub api_key: Option<String>,
    /// Runner used when neither the caller nor the definition names one
    pub default_runner: String,
    /// Bound on establishing the connection; the stream itself is unbounded
    pub connect_timeout: Duration,
    /// Overrides the per-user state directory
    pub state_dir: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            default_runner: DEFAULT_RUNNER.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            state_dir: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_default_runner(mut self, runner: impl Into<String>) -> Self {
        self.default_runner = runner.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }
}
