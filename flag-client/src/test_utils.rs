use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use flag_engine::environments::Environment;
use flag_engine::identities::Trait;
use serde_json::Value;

use crate::api::{ApiFlag, FlagsApi, IdentityResponse};
use crate::error::ApiError;

pub const ENVIRONMENT_FIXTURE_PATH: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/environment.json");

const ENVIRONMENT_FIXTURE: &str = include_str!("../tests/fixtures/environment.json");

pub fn environment_document() -> Value {
    serde_json::from_str(ENVIRONMENT_FIXTURE).expect("environment fixture is valid json")
}

pub fn environment() -> Environment {
    Environment::from_json(ENVIRONMENT_FIXTURE).expect("environment fixture is a valid document")
}

fn mock_failure() -> ApiError {
    ApiError::Status {
        url: "mock://flags-api".to_string(),
        status: 503,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory `FlagsApi`. Environment documents are served from a queue, where `None`
/// entries (and an exhausted queue) fail the request. Clones share their state, so a test
/// can keep one to inspect the calls made through another.
#[derive(Clone, Default)]
pub struct MockApiClient {
    environment_documents: Arc<Mutex<VecDeque<Option<Environment>>>>,
    environment_flags: Option<Vec<ApiFlag>>,
    identity_response: Option<IdentityResponse>,
    fail_analytics: bool,
    environment_document_calls: Arc<AtomicUsize>,
    identity_requests: Arc<Mutex<Vec<(String, Vec<Trait>)>>>,
    analytics_posts: Arc<Mutex<Vec<HashMap<String, u32>>>>,
}

impl MockApiClient {
    pub fn new() -> MockApiClient {
        MockApiClient::default()
    }

    pub fn environment_document_ret(self, ret: Vec<Option<Environment>>) -> Self {
        *lock(&self.environment_documents) = ret.into();
        self
    }

    pub fn environment_flags_ret(mut self, ret: Vec<ApiFlag>) -> Self {
        self.environment_flags = Some(ret);
        self
    }

    pub fn identity_flags_ret(mut self, ret: IdentityResponse) -> Self {
        self.identity_response = Some(ret);
        self
    }

    pub fn failing_analytics(mut self) -> Self {
        self.fail_analytics = true;
        self
    }

    pub fn environment_document_calls(&self) -> usize {
        self.environment_document_calls.load(Ordering::SeqCst)
    }

    pub fn identity_requests(&self) -> Vec<(String, Vec<Trait>)> {
        lock(&self.identity_requests).clone()
    }

    pub fn analytics_posts(&self) -> Vec<HashMap<String, u32>> {
        lock(&self.analytics_posts).clone()
    }
}

#[async_trait]
impl FlagsApi for MockApiClient {
    async fn get_environment_document(&self) -> Result<Environment, ApiError> {
        self.environment_document_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.environment_documents)
            .pop_front()
            .flatten()
            .ok_or_else(mock_failure)
    }

    async fn get_environment_flags(&self) -> Result<Vec<ApiFlag>, ApiError> {
        self.environment_flags.clone().ok_or_else(mock_failure)
    }

    async fn get_identity_flags(
        &self,
        identifier: &str,
        traits: &[Trait],
    ) -> Result<IdentityResponse, ApiError> {
        lock(&self.identity_requests).push((identifier.to_string(), traits.to_vec()));
        self.identity_response.clone().ok_or_else(mock_failure)
    }

    async fn post_analytics(&self, counts: &HashMap<String, u32>) -> Result<(), ApiError> {
        if self.fail_analytics {
            return Err(mock_failure());
        }
        lock(&self.analytics_posts).push(counts.clone());
        Ok(())
    }
}
