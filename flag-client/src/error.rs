use flag_engine::EngineError;
use thiserror::Error;

/// Misconfiguration or misuse of the client. Fatal to the operation that triggered it.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("The enable_realtime_updates config param requires a matching enable_local_evaluation param.")]
    RealtimeRequiresLocalEvaluation,
    #[error("The offline_mode config param requires a matching offline_handler.")]
    OfflineModeRequiresHandler,
    #[error("Cannot use offline_handler and default_flag_handler at the same time.")]
    ConflictingHandlers,
    #[error("Local evaluation required to obtain identity segments.")]
    LocalEvaluationRequired,
}

/// Failures talking to the flags API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid api url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid header {0}")]
    InvalidHeader(String),
    #[error("failed to build http client: {0}")]
    ClientBuild(reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to decode response from {url}: {source}")]
    Decode { url: String, source: reqwest::Error },
}

impl ApiError {
    /// Whether the failure happened while connecting, as opposed to a bad response.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ApiError::Request { source, .. } => source.is_connect() || source.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to read offline environment: {0}")]
    OfflineFile(#[from] std::io::Error),
}
