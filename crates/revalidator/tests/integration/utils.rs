use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use revalidator::{
    CacheConfig, ResolveError, ResolveResult, ResolverRegistry, ResourceCache, resolver_fn,
};
use revalidator_test as test;

pub use test::{CallCounter, Gate};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Organization {
    pub id: u32,
    pub name: String,
    pub visible: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    pub organizations: usize,
    pub visible: usize,
}

/// Everything the dashboard reads from its API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    Organizations(Vec<Organization>),
    Stats(Stats),
}

impl Resource {
    /// Names of the listed organizations, panics for other resources.
    #[track_caller]
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::Organizations(orgs) => orgs.iter().map(|org| org.name.as_str()).collect(),
            other => panic!("expected organizations, got {other:?}"),
        }
    }
}

/// An in-memory stand-in for the dashboard API.
///
/// Reads see the state at the time the request was made and answer after `latency`.
#[derive(Debug)]
pub struct Backend {
    organizations: Mutex<Vec<Organization>>,
    logged_in: AtomicBool,
    latency: Duration,
    pub calls: CallCounter,
}

impl Backend {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            organizations: Mutex::new(Vec::new()),
            logged_in: AtomicBool::new(true),
            latency,
            calls: CallCounter::new(),
        })
    }

    pub fn create_organization(&self, name: &str) -> u32 {
        let mut orgs = self.organizations.lock().unwrap();
        let id = orgs.iter().map(|org| org.id).max().unwrap_or(0) + 1;
        orgs.push(Organization {
            id,
            name: name.into(),
            visible: true,
        });
        id
    }

    pub fn toggle_visibility(&self, id: u32) {
        let mut orgs = self.organizations.lock().unwrap();
        if let Some(org) = orgs.iter_mut().find(|org| org.id == id) {
            org.visible = !org.visible;
        }
    }

    pub fn delete_organization(&self, id: u32) {
        self.organizations.lock().unwrap().retain(|org| org.id != id);
    }

    pub fn expire_session(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
    }

    pub fn login(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
    }

    fn read(&self, key: &str) -> ResolveResult<Resource> {
        self.calls.hit();
        if !self.logged_in.load(Ordering::SeqCst) {
            return Err(ResolveError::Unauthorized("token expired".into()));
        }

        let orgs = self.organizations.lock().unwrap();
        if key.starts_with("/organizations") {
            Ok(Resource::Organizations(orgs.clone()))
        } else if key == "/stats" {
            Ok(Resource::Stats(Stats {
                organizations: orgs.len(),
                visible: orgs.iter().filter(|org| org.visible).count(),
            }))
        } else {
            Err(ResolveError::NotFound)
        }
    }

    /// Binds the API collections to their keys, the way the dashboard does.
    pub fn resolvers(self: &Arc<Self>) -> ResolverRegistry<Resource> {
        let mut registry = ResolverRegistry::new();
        for prefix in ["/organizations", "/stats"] {
            let backend = Arc::clone(self);
            registry.insert_prefix(
                prefix,
                resolver_fn(move |key: String| {
                    let response = backend.read(&key);
                    let latency = backend.latency;
                    async move {
                        tokio::time::sleep(latency).await;
                        response
                    }
                }),
            );
        }
        registry
    }

    /// Like [`resolvers`](Self::resolvers), but every response waits for `gate`.
    pub fn gated_resolvers(self: &Arc<Self>, gate: &Gate) -> ResolverRegistry<Resource> {
        let backend = Arc::clone(self);
        let gate = gate.clone();
        ResolverRegistry::new().with_prefix(
            "/",
            resolver_fn(move |key: String| {
                let response = backend.read(&key);
                let gate = gate.clone();
                async move {
                    gate.pass().await;
                    response
                }
            }),
        )
    }
}

/// Setup tests and create a cache resolving from `resolvers`.
///
/// The `update_config` closure can modify the default configuration before the cache is
/// created.
pub fn setup_cache(
    resolvers: ResolverRegistry<Resource>,
    update_config: impl FnOnce(&mut CacheConfig),
) -> ResourceCache<Resource> {
    test::setup();

    let mut config = CacheConfig::default();
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    ResourceCache::new(config, resolvers, handle)
}

pub async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}
