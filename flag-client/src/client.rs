use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use flag_engine::engine::{evaluate_identity_feature_states, get_environment_feature_states};
use flag_engine::identities::{Identity, Trait};
use flag_engine::segments::evaluator::get_identity_segments;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::analytics::AnalyticsProcessor;
use crate::api::{FlagsApi, HttpApiClient};
use crate::config::Config;
use crate::error::{ApiError, ClientError, FlagError};
use crate::flags::{DefaultFlagHandler, Flags, FlagsContext};
use crate::offline::{LocalFileHandler, OfflineHandler};
use crate::polling::{EnvironmentSnapshot, EnvironmentSynchronizer};
use crate::realtime::RealtimeListener;

/// Everything the client can be given that doesn't come from the environment.
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub default_flag_handler: Option<DefaultFlagHandler>,
    pub offline_handler: Option<Arc<dyn OfflineHandler>>,
    /// Extra headers sent with every API request.
    pub custom_headers: HashMap<String, String>,
    /// Replaces the HTTP client, mostly useful for tests.
    pub api: Option<Arc<dyn FlagsApi>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySegment {
    pub id: u32,
    pub name: String,
}

pub struct FlagClient {
    api: Arc<dyn FlagsApi>,
    synchronizer: Option<Arc<EnvironmentSynchronizer>>,
    analytics: Option<Arc<AnalyticsProcessor>>,
    default_flag_handler: Option<DefaultFlagHandler>,
    offline_environment: Option<Arc<EnvironmentSnapshot>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FlagClient {
    /// Builds the client and starts its background tasks: environment polling and realtime
    /// updates with local evaluation, analytics flushing when analytics are enabled.
    ///
    /// With local evaluation the environment is fetched once before returning. A failure there
    /// is logged and left to the poller to recover from.
    pub async fn new(config: Config, options: ClientOptions) -> Result<Self, FlagError> {
        let offline_handler: Option<Arc<dyn OfflineHandler>> =
            match (options.offline_handler, &config.offline_file_path) {
                (Some(handler), _) => Some(handler),
                (None, Some(path)) => Some(Arc::new(LocalFileHandler::new(path)?)),
                (None, None) => None,
            };

        if config.enable_realtime_updates && !config.enable_local_evaluation {
            return Err(ClientError::RealtimeRequiresLocalEvaluation.into());
        }
        if config.offline_mode && offline_handler.is_none() {
            return Err(ClientError::OfflineModeRequiresHandler.into());
        }
        if offline_handler.is_some() && options.default_flag_handler.is_some() {
            return Err(ClientError::ConflictingHandlers.into());
        }

        let api: Arc<dyn FlagsApi> = match options.api {
            Some(api) => api,
            None => Arc::new(HttpApiClient::new(&config, &options.custom_headers)?),
        };

        let offline_environment = offline_handler
            .map(|handler| Arc::new(EnvironmentSnapshot::new(handler.environment().clone())));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let synchronizer = if config.offline_mode {
            offline_environment.as_ref().map(|snapshot| {
                Arc::new(EnvironmentSynchronizer::offline(
                    snapshot.environment.clone(),
                ))
            })
        } else if config.enable_local_evaluation {
            let synchronizer = Arc::new(EnvironmentSynchronizer::new(
                api.clone(),
                config.environment_refresh_interval.0,
                config.polling_manager_failure_limit,
            ));

            if let Err(e) = synchronizer.update_environment().await {
                error!(error = %e, "failed to load the environment for local evaluation");
            }

            let poller = synchronizer.clone();
            let poller_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = poller.run(poller_cancel).await {
                    error!(error = %e, "environment polling stopped after repeated failures");
                }
            }));

            if config.enable_realtime_updates {
                let listener = RealtimeListener::new(&config, synchronizer.clone())?;
                let listener_cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    listener.run(listener_cancel).await;
                }));
            }

            Some(synchronizer)
        } else {
            None
        };

        let analytics = if config.enable_analytics && !config.offline_mode {
            let analytics = Arc::new(AnalyticsProcessor::new(
                api.clone(),
                config.analytics_flush_interval.0,
            ));
            let flusher = analytics.clone();
            let flusher_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                flusher.run(flusher_cancel).await;
            }));
            Some(analytics)
        } else {
            None
        };

        info!(
            local_evaluation = config.enable_local_evaluation,
            offline_mode = config.offline_mode,
            analytics = analytics.is_some(),
            realtime = config.enable_realtime_updates,
            "flag client started"
        );

        Ok(FlagClient {
            api,
            synchronizer,
            analytics,
            default_flag_handler: options.default_flag_handler,
            offline_environment,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    fn context(&self) -> FlagsContext {
        FlagsContext {
            analytics: self.analytics.clone(),
            default_flag_handler: self.default_flag_handler.clone(),
            offline_environment: self.offline_environment.clone(),
        }
    }

    /// The snapshot flags are evaluated against locally, if this client evaluates locally and
    /// has one.
    pub fn environment(&self) -> Option<Arc<EnvironmentSnapshot>> {
        let synchronizer = self.synchronizer.as_ref()?;
        synchronizer
            .environment()
            .or_else(|| self.offline_environment.clone())
    }

    /// Fetches the environment now instead of waiting for the next refresh.
    pub async fn update_environment(&self) -> Result<(), FlagError> {
        match &self.synchronizer {
            Some(synchronizer) => synchronizer.update_environment().await,
            None => {
                debug!("not evaluating locally, nothing to update");
                Ok(())
            }
        }
    }

    pub async fn get_environment_flags(&self) -> Result<Flags, FlagError> {
        if let Some(snapshot) = self.environment() {
            return Ok(Flags::from_feature_states(
                get_environment_feature_states(&snapshot.environment),
                self.context(),
            ));
        }

        match self.api.get_environment_flags().await {
            Ok(api_flags) => Ok(Flags::from_api_flags(
                api_flags
                    .into_iter()
                    .filter(|flag| flag.feature_segment.is_none())
                    .collect(),
                self.context(),
            )),
            Err(e) => self.fallback(e, |snapshot| {
                Flags::from_feature_states(
                    get_environment_feature_states(&snapshot.environment),
                    self.context(),
                )
            }),
        }
    }

    /// Flags for the identity. Remotely this also stores the given traits on the identity, and a
    /// trait with a null value deletes it.
    #[instrument(skip_all, fields(identifier = %identifier))]
    pub async fn get_identity_flags(
        &self,
        identifier: &str,
        traits: Vec<Trait>,
    ) -> Result<Flags, FlagError> {
        if let Some(snapshot) = self.environment() {
            return Ok(self.local_identity_flags(&snapshot, identifier, traits));
        }

        match self.api.get_identity_flags(identifier, &traits).await {
            Ok(response) => Ok(Flags::from_api_flags(response.flags, self.context())),
            Err(e) => self.fallback(e, |snapshot| {
                self.local_identity_flags(snapshot, identifier, traits)
            }),
        }
    }

    /// The segments the identity belongs to. Only available with a local environment.
    pub fn get_identity_segments(
        &self,
        identifier: &str,
        traits: Vec<Trait>,
    ) -> Result<Vec<IdentitySegment>, FlagError> {
        let Some(snapshot) = self.environment() else {
            return Err(ClientError::LocalEvaluationRequired.into());
        };

        let identity = build_identity(&snapshot, identifier, traits);
        Ok(get_identity_segments(&snapshot.environment, &identity, None)
            .into_iter()
            .map(|segment| IdentitySegment {
                id: segment.id,
                name: segment.name.clone(),
            })
            .collect())
    }

    pub async fn feature_enabled(&self, feature_name: &str, default: bool) -> Result<bool, FlagError> {
        let flags = self.get_environment_flags().await?;
        or_default(flags.is_feature_enabled(feature_name), default)
    }

    pub async fn feature_enabled_for_identity(
        &self,
        feature_name: &str,
        identifier: &str,
        default: bool,
    ) -> Result<bool, FlagError> {
        let flags = self.get_identity_flags(identifier, Vec::new()).await?;
        or_default(flags.is_feature_enabled(feature_name), default)
    }

    pub async fn get_value(&self, feature_name: &str, default: Value) -> Result<Value, FlagError> {
        let flags = self.get_environment_flags().await?;
        or_default(flags.get_feature_value(feature_name), default)
    }

    pub async fn get_value_for_identity(
        &self,
        feature_name: &str,
        identifier: &str,
        default: Value,
    ) -> Result<Value, FlagError> {
        let flags = self.get_identity_flags(identifier, Vec::new()).await?;
        or_default(flags.get_feature_value(feature_name), default)
    }

    /// Stops the background tasks, waiting for the final analytics flush.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task did not shut down cleanly");
            }
        }
    }

    fn local_identity_flags(
        &self,
        snapshot: &EnvironmentSnapshot,
        identifier: &str,
        traits: Vec<Trait>,
    ) -> Flags {
        let identity = build_identity(snapshot, identifier, traits);
        let bucketing_id = identity.bucketing_id();
        Flags::from_resolved_states(
            evaluate_identity_feature_states(&snapshot.environment, &identity, None),
            &bucketing_id,
            self.context(),
        )
    }

    /// Recovers from a failed remote evaluation, with the offline environment if there is one,
    /// else with an empty collection when a default flag handler can fill the gaps.
    fn fallback(
        &self,
        error: ApiError,
        evaluate_offline: impl FnOnce(&EnvironmentSnapshot) -> Flags,
    ) -> Result<Flags, FlagError> {
        if let Some(snapshot) = &self.offline_environment {
            warn!(error = %error, "flags API unavailable, evaluating the offline environment");
            return Ok(evaluate_offline(snapshot));
        }

        if let Some(handler) = &self.default_flag_handler {
            warn!(error = %error, "flags API unavailable, serving default flags");
            return Ok(Flags::empty(FlagsContext {
                default_flag_handler: Some(handler.clone()),
                ..FlagsContext::default()
            }));
        }

        Err(error.into())
    }
}

impl Drop for FlagClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The identity as the environment knows it, with `traits` upserted on top.
fn build_identity(snapshot: &EnvironmentSnapshot, identifier: &str, traits: Vec<Trait>) -> Identity {
    let mut identity = snapshot
        .identity_override(identifier)
        .cloned()
        .unwrap_or_else(|| {
            Identity::new(identifier, snapshot.environment.api_key.clone(), Vec::new())
        });
    identity.update_traits(traits);
    identity
}

fn or_default<T>(result: Result<T, FlagError>, default: T) -> Result<T, FlagError> {
    match result {
        Err(FlagError::NotFound(_)) => Ok(default),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flag;
    use crate::test_utils::{environment, MockApiClient};
    use flag_engine::identities::TraitValue;
    use serde_json::json;

    struct FixtureHandler;

    impl OfflineHandler for FixtureHandler {
        fn environment(&self) -> &flag_engine::environments::Environment {
            static ENVIRONMENT: std::sync::OnceLock<flag_engine::environments::Environment> =
                std::sync::OnceLock::new();
            ENVIRONMENT.get_or_init(environment)
        }
    }

    fn options(api: &MockApiClient) -> ClientOptions {
        ClientOptions {
            api: Some(Arc::new(api.clone())),
            ..ClientOptions::default()
        }
    }

    fn local_config() -> Config {
        Config {
            enable_local_evaluation: true,
            ..Config::default_test_config()
        }
    }

    #[tokio::test]
    async fn test_realtime_requires_local_evaluation() {
        let config = Config {
            enable_realtime_updates: true,
            ..Config::default_test_config()
        };

        let result = FlagClient::new(config, options(&MockApiClient::new())).await;
        assert!(matches!(
            result,
            Err(FlagError::Client(ClientError::RealtimeRequiresLocalEvaluation))
        ));
    }

    #[tokio::test]
    async fn test_offline_mode_requires_handler() {
        let config = Config {
            offline_mode: true,
            ..Config::default_test_config()
        };

        let result = FlagClient::new(config, options(&MockApiClient::new())).await;
        assert!(matches!(
            result,
            Err(FlagError::Client(ClientError::OfflineModeRequiresHandler))
        ));
    }

    #[tokio::test]
    async fn test_handlers_are_exclusive() {
        let handler: DefaultFlagHandler = Arc::new(|_: &str| Flag::default_flag(false, Value::Null));
        let options = ClientOptions {
            default_flag_handler: Some(handler),
            offline_handler: Some(Arc::new(FixtureHandler)),
            ..options(&MockApiClient::new())
        };

        let result = FlagClient::new(Config::default_test_config(), options).await;
        assert!(matches!(
            result,
            Err(FlagError::Client(ClientError::ConflictingHandlers))
        ));
    }

    #[tokio::test]
    async fn test_local_identity_flags_apply_overrides_and_segments() {
        let api = MockApiClient::new().environment_document_ret(vec![Some(environment())]);
        let client = FlagClient::new(local_config(), options(&api)).await.unwrap();

        let overridden = client.get_identity_flags("overridden-id", vec![]).await.unwrap();
        let flag = overridden.get_flag("some_feature").unwrap();
        assert!(!flag.enabled);
        assert_eq!(flag.value, json!("some-overridden-value"));
        assert_eq!(
            flag.reason.as_deref(),
            Some("TARGETING_MATCH; segment=identity_override")
        );

        let in_segment = client
            .get_identity_flags("someone", vec![Trait::new("foo", "bar")])
            .await
            .unwrap();
        let flag = in_segment.get_flag("some_feature").unwrap();
        assert_eq!(flag.value, json!("segment_override"));
        assert_eq!(
            flag.reason.as_deref(),
            Some("TARGETING_MATCH; segment=Test segment")
        );

        // evaluated locally, nothing was sent to the API
        assert!(api.identity_requests().is_empty());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_segments() {
        let api = MockApiClient::new().environment_document_ret(vec![Some(environment())]);
        let client = FlagClient::new(local_config(), options(&api)).await.unwrap();

        let segments = client
            .get_identity_segments("someone", vec![Trait::new("foo", "bar")])
            .unwrap();
        assert_eq!(
            segments,
            vec![IdentitySegment {
                id: 1,
                name: "Test segment".to_string()
            }]
        );

        let segments = client
            .get_identity_segments("someone", vec![Trait::new("foo", TraitValue::Null)])
            .unwrap();
        assert!(segments.is_empty());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_segments_need_local_environment() {
        let client = FlagClient::new(Config::default_test_config(), options(&MockApiClient::new()))
            .await
            .unwrap();

        let err = client.get_identity_segments("someone", vec![]).unwrap_err();
        assert!(matches!(
            err,
            FlagError::Client(ClientError::LocalEvaluationRequired)
        ));
        assert_eq!(
            err.to_string(),
            "Local evaluation required to obtain identity segments."
        );
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_default_handler() {
        let handler: DefaultFlagHandler = Arc::new(|_: &str| Flag::default_flag(true, "default"));
        let options = ClientOptions {
            default_flag_handler: Some(handler),
            ..options(&MockApiClient::new())
        };
        let client = FlagClient::new(Config::default_test_config(), options)
            .await
            .unwrap();

        let flags = client.get_environment_flags().await.unwrap();
        assert!(flags.is_empty());
        assert_eq!(flags.get_feature_value("anything").unwrap(), json!("default"));
    }

    #[tokio::test]
    async fn test_remote_failure_without_fallback_is_an_error() {
        let client = FlagClient::new(Config::default_test_config(), options(&MockApiClient::new()))
            .await
            .unwrap();

        assert!(matches!(
            client.get_identity_flags("someone", vec![]).await,
            Err(FlagError::Api(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_offline_environment() {
        let api = MockApiClient::new();
        let options = ClientOptions {
            offline_handler: Some(Arc::new(FixtureHandler)),
            ..options(&api)
        };
        let client = FlagClient::new(Config::default_test_config(), options)
            .await
            .unwrap();

        let flags = client
            .get_identity_flags("overridden-id", vec![])
            .await
            .unwrap();
        assert_eq!(
            flags.get_feature_value("some_feature").unwrap(),
            json!("some-overridden-value")
        );
        assert_eq!(api.identity_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_mode_never_calls_the_api() {
        let api = MockApiClient::new();
        let config = Config {
            offline_mode: true,
            enable_analytics: true,
            ..Config::default_test_config()
        };
        let options = ClientOptions {
            offline_handler: Some(Arc::new(FixtureHandler)),
            ..options(&api)
        };
        let client = FlagClient::new(config, options).await.unwrap();

        assert!(client.feature_enabled("some_feature", false).await.unwrap());
        assert!(client.feature_enabled("missing", true).await.unwrap());
        assert_eq!(
            client
                .get_value_for_identity("mv_feature", "someone", Value::Null)
                .await
                .unwrap(),
            json!("variant_a")
        );
        client.update_environment().await.unwrap();
        client.shutdown().await;

        assert_eq!(api.environment_document_calls(), 0);
        assert!(api.identity_requests().is_empty());
        assert!(api.analytics_posts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_features_use_the_given_default() {
        let api = MockApiClient::new().environment_document_ret(vec![Some(environment())]);
        let client = FlagClient::new(local_config(), options(&api)).await.unwrap();

        assert!(client.feature_enabled("missing", true).await.unwrap());
        assert!(!client
            .feature_enabled_for_identity("overridden-id_nope", "someone", false)
            .await
            .unwrap());
        assert_eq!(
            client.get_value("missing", json!(42)).await.unwrap(),
            json!(42)
        );
        assert_eq!(
            client
                .get_value_for_identity("some_feature", "overridden-id", Value::Null)
                .await
                .unwrap(),
            json!("some-overridden-value")
        );
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_analytics() {
        let api = MockApiClient::new().environment_document_ret(vec![Some(environment())]);
        let config = Config {
            enable_analytics: true,
            ..local_config()
        };
        let client = FlagClient::new(config, options(&api)).await.unwrap();

        let flags = client.get_environment_flags().await.unwrap();
        flags.is_feature_enabled("some_feature").unwrap();
        flags.get_feature_value("Some_Feature").unwrap();
        client.shutdown().await;

        assert_eq!(
            api.analytics_posts(),
            vec![HashMap::from([("some_feature".to_string(), 2)])]
        );
    }
}
