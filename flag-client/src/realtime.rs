use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::USER_AGENT;
use crate::config::Config;
use crate::error::ApiError;
use crate::polling::EnvironmentSynchronizer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Error, Debug)]
enum StreamError {
    #[error("no environment loaded yet")]
    NoEnvironment,
    #[error("connection failed: {0}")]
    Connection(#[from] reqwest::Error),
    #[error("stream responded with status {0}")]
    Status(u16),
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] serde_json::Error),
    #[error("event line longer than {0} bytes")]
    LineTooLong(usize),
}

impl StreamError {
    fn is_transient(&self) -> bool {
        matches!(self, StreamError::NoEnvironment | StreamError::Connection(_))
    }
}

#[derive(Deserialize)]
struct RealtimeEvent {
    updated_at: f64,
}

/// Listens to the server-sent update stream of the environment and asks the synchronizer for a
/// refresh whenever the environment has changed since the last update it saw.
pub struct RealtimeListener {
    client: reqwest::Client,
    base_url: String,
    retry_interval: Duration,
    max_attempts: Option<u32>,
    synchronizer: Arc<EnvironmentSynchronizer>,
}

impl RealtimeListener {
    pub fn new(
        config: &Config,
        synchronizer: Arc<EnvironmentSynchronizer>,
    ) -> Result<Self, ApiError> {
        // no request timeout, the stream stays open for as long as the server allows
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ApiError::ClientBuild)?;

        Ok(RealtimeListener {
            client,
            base_url: config.realtime_base_url(),
            retry_interval: config.realtime_retry_interval.0,
            max_attempts: None,
            synchronizer,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// The stream url, keyed by the api key of the environment currently loaded.
    pub fn endpoint(&self) -> Option<String> {
        self.synchronizer.environment().map(|snapshot| {
            format!(
                "{}sse/environments/{}/stream",
                self.base_url, snapshot.environment.api_key
            )
        })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut last_updated_at = 0.0;
        let mut remaining_attempts = self.max_attempts;

        loop {
            match remaining_attempts.as_mut() {
                Some(0) => return,
                Some(remaining) => *remaining -= 1,
                None => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.retry_interval) => {},
            }

            debug!("connecting to realtime stream");
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.listen(&mut last_updated_at) => result,
            };

            match result {
                Ok(()) => debug!("realtime stream closed"),
                Err(e) if e.is_transient() => warn!(
                    error = %e,
                    retry_interval = ?self.retry_interval,
                    "realtime connection failed, retrying"
                ),
                Err(e) => error!(
                    error = %e,
                    retry_interval = ?self.retry_interval,
                    "realtime stream failed, retrying"
                ),
            }
        }
    }

    async fn listen(&self, last_updated_at: &mut f64) -> Result<(), StreamError> {
        let endpoint = self.endpoint().ok_or(StreamError::NoEnvironment)?;
        let response = self.client.get(&endpoint).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }

        consume_events(response.bytes_stream(), last_updated_at, || {
            self.synchronizer.request_refresh()
        })
        .await
    }
}

async fn consume_events<S>(
    stream: S,
    last_updated_at: &mut f64,
    mut on_update: impl FnMut(),
) -> Result<(), StreamError>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer: Vec<u8> = Vec::new();

    let mut handle_line = |line: &[u8]| -> Result<(), StreamError> {
        if let Some(updated_at) = parse_event_line(&String::from_utf8_lossy(line))? {
            if updated_at > *last_updated_at {
                info!(
                    from = *last_updated_at,
                    to = updated_at,
                    "realtime update, refreshing environment"
                );
                *last_updated_at = updated_at;
                on_update();
            }
        }
        Ok(())
    };

    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=end).collect();
            handle_line(&line)?;
        }
        if buffer.len() > MAX_LINE_LENGTH {
            return Err(StreamError::LineTooLong(MAX_LINE_LENGTH));
        }
    }

    if !buffer.is_empty() {
        handle_line(&buffer)?;
    }
    Ok(())
}

/// Returns the `updated_at` of a `data:` line. Blank lines, comments and other fields yield
/// nothing.
fn parse_event_line(line: &str) -> Result<Option<f64>, serde_json::Error> {
    let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
    if line.trim().is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let Some(data) = line.strip_prefix("data: ") else {
        return Ok(None);
    };

    let event: RealtimeEvent = serde_json::from_str(data.trim())?;
    Ok(Some(event.updated_at))
}
