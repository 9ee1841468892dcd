#![allow(dead_code)]

use std::time::Duration;

use httpmock::prelude::*;
use httpmock::Mock;
use once_cell::sync::Lazy;

use flag_client::config::Config;
use flag_client::test_utils::environment_document;
use flag_client::{ClientOptions, FlagClient};

pub const ENVIRONMENT_KEY: &str = "B62qaMZNwfiqT76p38ggrQ";

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    environment_key: ENVIRONMENT_KEY.to_string(),
    // nothing listens here, tests that talk to the API point this at a mock server
    api_url: "http://127.0.0.1:1/api/v1/".to_string(),
    ..Config::default_test_config()
});

pub fn config_for(server: &MockServer) -> Config {
    Config {
        api_url: server.url("/api/v1/"),
        ..DEFAULT_CONFIG.clone()
    }
}

pub async fn client_for(config: Config) -> FlagClient {
    FlagClient::new(config, ClientOptions::default())
        .await
        .expect("failed to build client")
}

pub fn mock_environment_document(server: &MockServer) -> Mock<'_> {
    server.mock(|when, then| {
        when.method(GET)
            .path("/api/v1/environment-document/")
            .header("X-Environment-Key", ENVIRONMENT_KEY);
        then.status(200).json_body(environment_document());
    })
}

/// Polls `condition` until it holds, for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
