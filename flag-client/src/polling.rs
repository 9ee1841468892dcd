use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use flag_engine::environments::Environment;
use flag_engine::identities::Identity;
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::api::FlagsApi;
use crate::error::FlagError;

/// An environment document, ready to evaluate against. Never mutated once built.
#[derive(Debug)]
pub struct EnvironmentSnapshot {
    pub environment: Environment,
    identity_overrides: HashMap<String, Identity>,
}

impl EnvironmentSnapshot {
    pub fn new(environment: Environment) -> Self {
        let identity_overrides = environment
            .identity_overrides
            .iter()
            .map(|identity| (identity.identifier.clone(), identity.clone()))
            .collect();

        EnvironmentSnapshot {
            environment,
            identity_overrides,
        }
    }

    /// The identity carrying direct overrides for `identifier`, if the document has one.
    pub fn identity_override(&self, identifier: &str) -> Option<&Identity> {
        self.identity_overrides.get(identifier)
    }
}

/// Holds the current environment snapshot and keeps it fresh.
///
/// Readers get a cheap `Arc` clone of the current snapshot and never wait on the network:
/// refreshes fetch and build the new snapshot first and only take the write lock to swap it in.
pub struct EnvironmentSynchronizer {
    api: Option<Arc<dyn FlagsApi>>,
    current: RwLock<Option<Arc<EnvironmentSnapshot>>>,
    refresh_requested: Notify,
    refresh_interval: Duration,
    failure_limit: u32,
}

impl EnvironmentSynchronizer {
    pub fn new(api: Arc<dyn FlagsApi>, refresh_interval: Duration, failure_limit: u32) -> Self {
        EnvironmentSynchronizer {
            api: Some(api),
            current: RwLock::new(None),
            refresh_requested: Notify::new(),
            refresh_interval,
            failure_limit,
        }
    }

    /// A synchronizer that serves `environment` forever and never refreshes.
    pub fn offline(environment: Environment) -> Self {
        EnvironmentSynchronizer {
            api: None,
            current: RwLock::new(Some(Arc::new(EnvironmentSnapshot::new(environment)))),
            refresh_requested: Notify::new(),
            refresh_interval: Duration::ZERO,
            failure_limit: 0,
        }
    }

    pub fn environment(&self) -> Option<Arc<EnvironmentSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, snapshot: EnvironmentSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    /// Fetches the environment document and swaps it in. A no-op when offline.
    #[instrument(skip_all)]
    pub async fn update_environment(&self) -> Result<(), FlagError> {
        let Some(api) = &self.api else {
            return Ok(());
        };

        let environment = api.get_environment_document().await?;
        info!(
            environment_id = environment.id,
            feature_states = environment.feature_states.len(),
            "updated environment"
        );
        self.store(EnvironmentSnapshot::new(environment));
        Ok(())
    }

    /// Wakes the refresh loop now instead of at the next tick.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Refreshes every `refresh_interval` (first one interval after starting) and whenever a
    /// refresh is requested, until cancelled.
    ///
    /// Failures are tolerated until more than `failure_limit` of them happen in a row; that
    /// failure is returned and ends the loop. A successful refresh resets the count.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), FlagError> {
        if self.api.is_none() {
            return Ok(());
        }

        // tokio intervals can't have a zero period
        let period = self.refresh_interval.max(Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {},
                _ = self.refresh_requested.notified() => {},
            }

            match self.update_environment().await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!(
                        error = %e,
                        failures,
                        failure_limit = self.failure_limit,
                        "failed to refresh environment"
                    );
                    if failures > self.failure_limit {
                        return Err(e);
                    }
                }
            }
        }
    }
}
