use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::ResolveResult;

/// Fetches the current value of a resource identified by a key.
///
/// A resolver should be a pure function of the key: calling it twice for the same key is
/// expected to produce equivalent data, otherwise caching it makes no sense.
///
/// The returned future is spawned onto the runtime of the cache, which is why it has to
/// be `'static` and must not borrow from the resolver.
pub trait Resolver<V>: Send + Sync + 'static {
    /// Starts a fetch of the resource behind `key`.
    fn resolve(&self, key: &str) -> BoxFuture<'static, ResolveResult<V>>;
}

/// A type-erased, shareable [`Resolver`].
pub type SharedResolver<V> = Arc<dyn Resolver<V>>;

/// A [`Resolver`] backed by an async closure, see [`resolver_fn`].
#[derive(Clone)]
pub struct FnResolver<F>(F);

impl<F> fmt::Debug for FnResolver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnResolver").finish_non_exhaustive()
    }
}

impl<V, F, Fut> Resolver<V> for FnResolver<F>
where
    V: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ResolveResult<V>> + Send + 'static,
{
    fn resolve(&self, key: &str) -> BoxFuture<'static, ResolveResult<V>> {
        (self.0)(key.to_owned()).boxed()
    }
}

/// Creates a [`Resolver`] from a closure receiving the key and returning a future.
///
/// ```
/// use revalidator::{ResolveError, resolver_fn};
///
/// let resolver = resolver_fn(|key: String| async move {
///     match key.as_str() {
///         "/stats" => Ok(42u32),
///         _ => Err(ResolveError::NotFound),
///     }
/// });
/// # let _ = resolver;
/// ```
pub fn resolver_fn<F>(f: F) -> FnResolver<F> {
    FnResolver(f)
}

/// Binds resolvers to keys, either to an exact key or to every key below a prefix.
///
/// Lookups prefer an exact binding, then the longest matching prefix. This mirrors how a
/// dashboard binds one fetcher per API collection, e.g. `/organizations` for all
/// organization listings regardless of query parameters.
pub struct ResolverRegistry<V> {
    exact: HashMap<String, SharedResolver<V>>,
    prefixes: Vec<(String, SharedResolver<V>)>,
}

impl<V> ResolverRegistry<V> {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
        }
    }

    /// Binds `resolver` to exactly `key`, replacing a previous binding.
    pub fn insert(&mut self, key: impl Into<String>, resolver: impl Resolver<V>) -> &mut Self {
        self.exact.insert(key.into(), Arc::new(resolver));
        self
    }

    /// Binds `resolver` to every key starting with `prefix`, replacing a previous binding
    /// of the same prefix.
    pub fn insert_prefix(
        &mut self,
        prefix: impl Into<String>,
        resolver: impl Resolver<V>,
    ) -> &mut Self {
        let prefix = prefix.into();
        let resolver: SharedResolver<V> = Arc::new(resolver);
        match self.prefixes.iter_mut().find(|(p, _)| *p == prefix) {
            Some((_, existing)) => *existing = resolver,
            None => self.prefixes.push((prefix, resolver)),
        }
        self
    }

    /// Builder variant of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, resolver: impl Resolver<V>) -> Self {
        self.insert(key, resolver);
        self
    }

    /// Builder variant of [`insert_prefix`](Self::insert_prefix).
    pub fn with_prefix(mut self, prefix: impl Into<String>, resolver: impl Resolver<V>) -> Self {
        self.insert_prefix(prefix, resolver);
        self
    }

    /// Finds the resolver responsible for `key`.
    pub fn lookup(&self, key: &str) -> Option<SharedResolver<V>> {
        if let Some(resolver) = self.exact.get(key) {
            return Some(Arc::clone(resolver));
        }

        self.prefixes
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, resolver)| Arc::clone(resolver))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

impl<V> Default for ResolverRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for ResolverRegistry<V> {
    fn clone(&self) -> Self {
        Self {
            exact: self.exact.clone(),
            prefixes: self.prefixes.clone(),
        }
    }
}

impl<V> fmt::Debug for ResolverRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.exact.keys().collect();
        keys.sort();
        let prefixes: Vec<_> = self.prefixes.iter().map(|(p, _)| p).collect();
        f.debug_struct("ResolverRegistry")
            .field("keys", &keys)
            .field("prefixes", &prefixes)
            .finish()
    }
}
