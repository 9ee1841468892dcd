use std::collections::HashMap;

use async_trait::async_trait;
use flag_engine::environments::Environment;
use flag_engine::identities::Trait;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use url::Url;

use crate::config::Config;
use crate::error::ApiError;

pub const ENVIRONMENT_DOCUMENT_PATH: &str = "environment-document/";
pub const ENVIRONMENT_FLAGS_PATH: &str = "flags/";
pub const IDENTITIES_PATH: &str = "identities/";
pub const ANALYTICS_PATH: &str = "analytics/flags/";

pub const ENVIRONMENT_KEY_HEADER: &str = "X-Environment-Key";
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiFeature {
    pub id: u32,
    pub name: String,
}

/// A flag as evaluated by the API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiFlag {
    pub feature: ApiFeature,
    pub enabled: bool,
    #[serde(alias = "value", default)]
    pub feature_state_value: Value,
    // only set on segment overrides, which the environment flags endpoint may include
    #[serde(default)]
    pub feature_segment: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityResponse {
    #[serde(default)]
    pub flags: Vec<ApiFlag>,
    #[serde(default)]
    pub traits: Vec<Trait>,
}

#[derive(Debug, Serialize)]
struct IdentityRequest<'a> {
    identifier: &'a str,
    traits: &'a [Trait],
}

#[async_trait]
pub trait FlagsApi: Send + Sync {
    async fn get_environment_document(&self) -> Result<Environment, ApiError>;

    async fn get_environment_flags(&self) -> Result<Vec<ApiFlag>, ApiError>;

    /// Evaluates flags for the identity remotely, upserting its traits on the way.
    async fn get_identity_flags(
        &self,
        identifier: &str,
        traits: &[Trait],
    ) -> Result<IdentityResponse, ApiError>;

    async fn post_analytics(&self, counts: &HashMap<String, u32>) -> Result<(), ApiError>;
}

pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpApiClient {
    pub fn new(config: &Config, custom_headers: &HashMap<String, String>) -> Result<Self, ApiError> {
        let base_url = Url::parse(&config.api_base_url())?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            HeaderName::from_static("x-environment-key"),
            HeaderValue::from_str(&config.environment_key)
                .map_err(|_| ApiError::InvalidHeader(ENVIRONMENT_KEY_HEADER.to_string()))?,
        );
        for (name, value) in custom_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ApiError::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| ApiError::InvalidHeader(name.clone()))?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout.0)
            .build()
            .map_err(ApiError::ClientBuild)?;

        Ok(HttpApiClient { client, base_url })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.send(self.client.get(url.clone()), &url).await?;
        decode(response, &url).await
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(reqwest::Response, Url), ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.send(self.client.post(url.clone()).json(body), &url).await?;
        Ok((response, url))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url,
    ) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(|source| ApiError::Request {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, url: &Url) -> Result<T, ApiError> {
    response.json::<T>().await.map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })
}

#[async_trait]
impl FlagsApi for HttpApiClient {
    #[instrument(skip_all)]
    async fn get_environment_document(&self) -> Result<Environment, ApiError> {
        self.get_json(ENVIRONMENT_DOCUMENT_PATH).await
    }

    #[instrument(skip_all)]
    async fn get_environment_flags(&self) -> Result<Vec<ApiFlag>, ApiError> {
        self.get_json(ENVIRONMENT_FLAGS_PATH).await
    }

    #[instrument(skip_all, fields(identifier = %identifier))]
    async fn get_identity_flags(
        &self,
        identifier: &str,
        traits: &[Trait],
    ) -> Result<IdentityResponse, ApiError> {
        let body = IdentityRequest { identifier, traits };
        let (response, url) = self.post_json(IDENTITIES_PATH, &body).await?;
        decode(response, &url).await
    }

    #[instrument(skip_all)]
    async fn post_analytics(&self, counts: &HashMap<String, u32>) -> Result<(), ApiError> {
        self.post_json(ANALYTICS_PATH, counts).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::environment_document;
    use flag_engine::identities::TraitValue;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer) -> HttpApiClient {
        let config = Config {
            api_url: server.url("/api/v1/"),
            ..Config::with_environment_key("env-key")
        };
        HttpApiClient::new(&config, &HashMap::new()).unwrap()
    }

    #[tokio::test]
    async fn test_get_environment_document() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/environment-document/")
                .header(ENVIRONMENT_KEY_HEADER, "env-key");
            then.status(200).json_body(environment_document());
        });

        let environment = client_for(&server)
            .get_environment_document()
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(environment.api_key, "B62qaMZNwfiqT76p38ggrQ");
        assert!(!environment.feature_states.is_empty());
    }

    #[tokio::test]
    async fn test_get_environment_flags() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/flags/");
            then.status(200).json_body(json!([
                {
                    "feature": {"id": 1, "name": "some_feature"},
                    "enabled": true,
                    "feature_state_value": "some-value",
                    "feature_segment": null
                },
                {
                    "feature": {"id": 1, "name": "some_feature"},
                    "enabled": false,
                    "feature_state_value": "segment-value",
                    "feature_segment": {"id": 1, "segment": 1, "priority": 0}
                }
            ]));
        });

        let flags = client_for(&server).get_environment_flags().await.unwrap();

        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].feature.name, "some_feature");
        assert_eq!(flags[0].feature_state_value, json!("some-value"));
        assert!(flags[0].feature_segment.is_none());
        assert!(flags[1].feature_segment.is_some());
    }

    #[tokio::test]
    async fn test_get_identity_flags_posts_identifier_and_traits() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/v1/identities/").json_body(json!({
                "identifier": "user-1",
                "traits": [
                    {"trait_key": "age", "trait_value": 30},
                    {"trait_key": "plan", "trait_value": null}
                ]
            }));
            then.status(200).json_body(json!({
                "flags": [{
                    "feature": {"id": 2, "name": "other_feature"},
                    "enabled": false,
                    "feature_state_value": 12
                }],
                "traits": [{"trait_key": "age", "trait_value": 30}]
            }));
        });

        let traits = vec![
            Trait::new("age", 30),
            Trait::new("plan", TraitValue::Null),
        ];
        let response = client_for(&server)
            .get_identity_flags("user-1", &traits)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.flags.len(), 1);
        assert_eq!(response.flags[0].feature_state_value, json!(12));
        assert_eq!(response.traits.len(), 1);
    }

    #[tokio::test]
    async fn test_post_analytics() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/analytics/flags/")
                .header(ENVIRONMENT_KEY_HEADER, "env-key")
                .json_body(json!({"some_feature": 3}));
            then.status(200);
        });

        let counts = HashMap::from([("some_feature".to_string(), 3)]);
        client_for(&server).post_analytics(&counts).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_custom_headers_are_sent() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/flags/")
                .header("x-custom", "custom-value");
            then.status(200).json_body(json!([]));
        });

        let config = Config {
            api_url: server.url("/api/v1"),
            ..Config::with_environment_key("env-key")
        };
        let headers = HashMap::from([("x-custom".to_string(), "custom-value".to_string())]);
        let client = HttpApiClient::new(&config, &headers).unwrap();

        assert!(client.get_environment_flags().await.unwrap().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/flags/");
            then.status(500);
        });

        match client_for(&server).get_environment_flags().await {
            Err(error @ ApiError::Status { status: 500, .. }) => {
                assert!(!error.is_connection_error())
            }
            other => panic!("Expected a status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/environment-document/");
            then.status(200).body("not json");
        });

        let result = client_for(&server).get_environment_document().await;
        assert!(matches!(result, Err(ApiError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_connection_error() {
        let config = Config {
            api_url: "http://127.0.0.1:1/api/v1/".to_string(),
            ..Config::with_environment_key("env-key")
        };
        let client = HttpApiClient::new(&config, &HashMap::new()).unwrap();

        let error = client.get_environment_flags().await.unwrap_err();
        assert!(error.is_connection_error());
    }

    #[test]
    fn test_invalid_custom_header() {
        let headers = HashMap::from([("bad header".to_string(), "value".to_string())]);
        let result = HttpApiClient::new(&Config::default_test_config(), &headers);
        assert!(matches!(result, Err(ApiError::InvalidHeader(_))));
    }
}
