use std::time::Duration;

use thiserror::Error;

/// An error produced by a [`Resolver`](crate::Resolver) while fetching a resource.
///
/// The cache stores these errors next to the last good value and hands them to every
/// subscriber of the key. It never inspects them; the variants only exist so that
/// consumers can tell failures apart, e.g. to re-authenticate on
/// [`Unauthorized`](Self::Unauthorized).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The resource does not exist at the remote end.
    #[error("not found")]
    NotFound,
    /// The remote end refused the request because of missing or expired credentials.
    ///
    /// The attached string contains the remote end's response.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The resolver did not settle in time.
    #[error("resolve timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the remote end's response.
    #[error("fetch failed: {0}")]
    FetchError(String),
    /// The resource was fetched, but its payload could not be understood.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the resolver itself.
    #[error("internal error")]
    InternalError,
}

impl ResolveError {
    /// Logs the given error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short, stable name of the variant, used for metric tags.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Timeout(_) => "timeout",
            Self::FetchError(_) => "fetch_error",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internal_error",
        }
    }
}

impl From<std::io::Error> for ResolveError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// Errors returned synchronously by the [`ResourceCache`](crate::ResourceCache) API.
///
/// These signal misuse of the cache rather than failures of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// No resolver is bound to the key, neither exactly nor through a prefix.
    #[error("no resolver configured for key `{key}`")]
    NoResolverConfigured { key: String },
    /// The entry was evicted before it settled.
    #[error("the entry for key `{key}` was evicted")]
    Evicted { key: String },
    /// The cache has been disposed and does not accept new subscriptions.
    #[error("the cache has been disposed")]
    Disposed,
}

/// The error of a one-shot [`ResourceCache::fetch`](crate::ResourceCache::fetch).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// The outcome of a single resolver call.
pub type ResolveResult<V> = Result<V, ResolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ResolveError::NotFound.to_string(), "not found");
        assert_eq!(
            ResolveError::Timeout(Duration::from_secs(15)).to_string(),
            "resolve timed out after 15s"
        );
        assert_eq!(
            CacheError::NoResolverConfigured {
                key: "/stats".into()
            }
            .to_string(),
            "no resolver configured for key `/stats`"
        );
    }

    #[test]
    fn test_fetch_error_is_transparent() {
        let err = FetchError::from(ResolveError::Unauthorized("token expired".into()));
        assert_eq!(err.to_string(), "unauthorized: token expired");

        let err = FetchError::from(CacheError::Disposed);
        assert_eq!(err.to_string(), "the cache has been disposed");
    }

    #[test]
    fn test_io_error_is_internal() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        assert_eq!(ResolveError::from(err), ResolveError::InternalError);
    }
}
