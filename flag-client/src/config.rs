use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

pub const DEFAULT_API_URL: &str = "https://edge.api.flagsmith.com/api/v1/";
pub const DEFAULT_REALTIME_API_URL: &str = "https://realtime.flagsmith.com/";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "FLAGSMITH_ENVIRONMENT_KEY", default = "")]
    pub environment_key: String,

    #[envconfig(from = "FLAGSMITH_API_URL", default = "https://edge.api.flagsmith.com/api/v1/")]
    pub api_url: String,

    #[envconfig(from = "FLAGSMITH_REQUEST_TIMEOUT", default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "FLAGSMITH_ENABLE_LOCAL_EVALUATION", default = "false")]
    pub enable_local_evaluation: bool,

    #[envconfig(from = "FLAGSMITH_ENVIRONMENT_REFRESH_INTERVAL", default = "60000")]
    pub environment_refresh_interval: EnvMsDuration,

    // consecutive refresh failures tolerated before polling gives up
    #[envconfig(from = "FLAGSMITH_POLLING_MANAGER_FAILURE_LIMIT", default = "10")]
    pub polling_manager_failure_limit: u32,

    #[envconfig(from = "FLAGSMITH_ENABLE_ANALYTICS", default = "false")]
    pub enable_analytics: bool,

    #[envconfig(from = "FLAGSMITH_ANALYTICS_FLUSH_INTERVAL", default = "10000")]
    pub analytics_flush_interval: EnvMsDuration,

    #[envconfig(
        from = "FLAGSMITH_REALTIME_API_URL",
        default = "https://realtime.flagsmith.com/"
    )]
    pub realtime_api_url: String,

    #[envconfig(from = "FLAGSMITH_ENABLE_REALTIME_UPDATES", default = "false")]
    pub enable_realtime_updates: bool,

    #[envconfig(from = "FLAGSMITH_REALTIME_RETRY_INTERVAL", default = "500")]
    pub realtime_retry_interval: EnvMsDuration,

    #[envconfig(from = "FLAGSMITH_OFFLINE_MODE", default = "false")]
    pub offline_mode: bool,

    /// Environment document to serve flags from when offline, or to fall back to.
    #[envconfig(from = "FLAGSMITH_OFFLINE_FILE_PATH")]
    pub offline_file_path: Option<String>,
}

impl Config {
    pub fn default_test_config() -> Self {
        Self {
            environment_key: "test-environment-key".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: EnvMsDuration(time::Duration::from_secs(10)),
            enable_local_evaluation: false,
            environment_refresh_interval: EnvMsDuration(time::Duration::from_secs(60)),
            polling_manager_failure_limit: 10,
            enable_analytics: false,
            analytics_flush_interval: EnvMsDuration(time::Duration::from_secs(10)),
            realtime_api_url: DEFAULT_REALTIME_API_URL.to_string(),
            enable_realtime_updates: false,
            realtime_retry_interval: EnvMsDuration(time::Duration::from_millis(500)),
            offline_mode: false,
            offline_file_path: None,
        }
    }

    pub fn with_environment_key(environment_key: &str) -> Self {
        Self {
            environment_key: environment_key.to_string(),
            ..Self::default_test_config()
        }
    }

    /// Realtime url with a guaranteed trailing slash, so paths can be appended to it.
    pub fn realtime_base_url(&self) -> String {
        with_trailing_slash(&self.realtime_api_url)
    }

    pub fn api_base_url(&self) -> String {
        with_trailing_slash(&self.api_url)
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
