//! A keyed stale-while-revalidate cache for remote resources.
//!
//! The [`ResourceCache`] sits between the consumers of remote data (views, reports, CLI
//! commands) and the [`Resolver`]s that actually fetch it. It is the explicit, injectable
//! counterpart of the process-wide fetch cache a dashboard frontend typically relies on.
//!
//! # Reading
//!
//! A consumer [`subscribe`](ResourceCache::subscribe)s to a key and receives a
//! [`Subscription`]. The subscription always holds the latest [`Snapshot`] of the key,
//! `{ value, error, status }`, and notifies about changes:
//!
//! - The first subscription of a key creates its entry and calls the resolver.
//! - Further subscriptions share the entry, and a resolution that is already in flight.
//! - A key that was resolved before is served from the cache right away.
//!
//! # Writing
//!
//! The cache never writes anything. Code that changes a resource remotely (create, update,
//! delete, toggle) calls [`invalidate`](ResourceCache::invalidate) with the affected key
//! once the write succeeded. This triggers a revalidation, while subscribers keep seeing
//! the previous value until the new one arrives. Invalidations that arrive while a
//! resolution is in flight are coalesced into one follow-up resolution, which guarantees
//! that the write is observed without ever running two resolver calls for a key at once.
//!
//! # Failures
//!
//! A failed resolution stores its [`ResolveError`] next to the last good value. The value
//! is only dropped when the entry is evicted. The cache performs no retries; wrap the
//! resolver for that, or invalidate the key again.
//!
//! # Ambient setup
//!
//! [`config::Config`] loads the YAML configuration, [`logging`] and [`metrics`] set up
//! `tracing` and statsd reporting for binaries embedding the cache.

#[macro_use]
pub mod metrics;

mod cache;
pub mod config;
mod entry;
mod error;
pub mod logging;
mod resolver;
mod subscription;
mod utils;

pub use cache::ResourceCache;
pub use config::CacheConfig;
pub use entry::{Snapshot, Status};
pub use error::{CacheError, FetchError, ResolveError, ResolveResult};
pub use resolver::{FnResolver, Resolver, ResolverRegistry, SharedResolver, resolver_fn};
pub use subscription::Subscription;
