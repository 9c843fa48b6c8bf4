use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};

use revalidator::{ResolveError, ResolveResult, Resolver, ResolverRegistry, ResourceCache, Snapshot};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        let config: Self =
            serde_yaml::from_reader(file).context("failed to parse workloads YAML")?;
        for (i, workload) in config.workloads.iter().enumerate() {
            workload
                .validate()
                .with_context(|| format!("invalid workload {i}"))?;
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Number of operations in flight at the same time.
    pub concurrency: usize,
    /// Number of distinct keys the operations pick from.
    #[serde(default = "default_keys")]
    pub keys: usize,
    /// Simulated latency of a single resolver call.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// Probability of a resolver call failing, between 0 and 1.
    #[serde(default)]
    pub failure_rate: f64,
    /// Every n-th operation invalidates its key before subscribing.
    #[serde(default)]
    pub invalidate_every: Option<usize>,
}

fn default_keys() -> usize {
    1
}

impl Workload {
    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("`concurrency` must be at least 1");
        }
        if self.keys == 0 {
            bail!("`keys` must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            bail!("`failure_rate` must be between 0 and 1");
        }
        if self.invalidate_every == Some(0) {
            bail!("`invalidate_every` must be at least 1");
        }
        Ok(())
    }
}

/// The value the simulated backend hands out.
#[derive(Debug)]
pub struct Payload {
    pub key: String,
    /// Number of the resolver call that produced this payload.
    pub version: usize,
}

/// A remote backend that answers after a fixed latency and fails at random.
#[derive(Clone, Debug)]
struct SimulatedBackend {
    latency: Duration,
    failure_rate: f64,
    calls: Arc<AtomicUsize>,
}

impl Resolver<Payload> for SimulatedBackend {
    fn resolve(&self, key: &str) -> BoxFuture<'static, ResolveResult<Payload>> {
        let version = self.calls.fetch_add(1, Ordering::Relaxed);
        let fail = rand::rng().random_bool(self.failure_rate);
        let latency = self.latency;
        let key = key.to_owned();

        async move {
            tokio::time::sleep(latency).await;
            if fail {
                return Err(ResolveError::FetchError("simulated failure".into()));
            }
            Ok(Payload { key, version })
        }
        .boxed()
    }
}

/// A workload bound to its own key space and backend.
pub struct PreparedWorkload {
    pub concurrency: usize,
    prefix: String,
    keys: usize,
    invalidate_every: Option<usize>,
    operations: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    /// The number of resolver calls the backend of this workload has seen.
    pub fn resolver_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn random_key(&self) -> String {
        let n = rand::rng().random_range(0..self.keys);
        format!("{}{n}", self.prefix)
    }
}

/// Registers a backend for every workload under a key prefix of its own.
pub fn prepare_workloads(
    workloads: WorkloadsConfig,
    registry: &mut ResolverRegistry<Payload>,
) -> Vec<Arc<PreparedWorkload>> {
    workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let prefix = format!("/workloads/{i}/");
            let backend = SimulatedBackend {
                latency: workload.latency,
                failure_rate: workload.failure_rate,
                calls: Arc::default(),
            };
            let calls = Arc::clone(&backend.calls);
            registry.insert_prefix(prefix.clone(), backend);

            Arc::new(PreparedWorkload {
                concurrency: workload.concurrency,
                prefix,
                keys: workload.keys,
                invalidate_every: workload.invalidate_every,
                operations: AtomicUsize::new(0),
                calls,
            })
        })
        .collect()
}

/// Runs a single operation: subscribe to a random key and wait until it settled.
pub async fn run_operation(
    cache: &ResourceCache<Payload>,
    workload: &PreparedWorkload,
) -> Result<Snapshot<Payload>> {
    let op = workload.operations.fetch_add(1, Ordering::Relaxed) + 1;
    let key = workload.random_key();

    if workload.invalidate_every.is_some_and(|n| op % n == 0) {
        cache.invalidate(&key);
    }

    let mut subscription = cache.subscribe(&key)?;
    Ok(subscription.settled().await)
}
