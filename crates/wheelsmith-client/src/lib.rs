//! Clients for the upstream index protocols.
//!
//! Both backends expose the same capability set (last serial, package
//! enumeration, change-log traversal, per-package release maps) behind
//! the [`IndexClient`] enum; callers dispatch on the index's backend tag.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use wheelsmith_types::{IndexBackend, UpstreamRelease};

mod devpi;
mod pypi;
mod xmlrpc;

pub use devpi::DevPIClient;
pub use pypi::PyPIClient;

/// Releases of one package, keyed by upstream version string.
pub type ReleaseMap = BTreeMap<String, Vec<UpstreamRelease>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream answered 404 for this package. Non-fatal: the caller
    /// deletes its local mirror or skips the import.
    #[error("package `{package}` was not found on the upstream index")]
    PackageNotFound { package: String },

    /// Transport failure or a non-404 error status; retried by callers.
    #[error("upstream index unavailable: {message}")]
    IndexUnavailable { message: String },

    /// The upstream answered, but with a payload we cannot make sense of.
    #[error("malformed upstream payload: {message}")]
    Protocol { message: String },
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        Self::IndexUnavailable {
            message: err.to_string(),
        }
    }
}

impl From<xmlrpc::XmlRpcError> for UpstreamError {
    fn from(err: xmlrpc::XmlRpcError) -> Self {
        Self::Protocol {
            message: err.to_string(),
        }
    }
}

/// One change-log event: the touched package (or `None` for a repeat or
/// an irrelevant event) and the serial to advance the cursor to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub package: Option<String>,
    pub serial: i64,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-request timeout on every upstream call.
    pub timeout: Duration,
    /// Transport retries for change-log event fetches.
    pub retries: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            retries: 3,
        }
    }
}

pub(crate) fn http_client(options: &ClientOptions) -> Result<reqwest::Client, UpstreamError> {
    reqwest::Client::builder()
        .user_agent("wheelsmith")
        .timeout(options.timeout)
        .build()
        .map_err(UpstreamError::from)
}

/// A client for one backing index.
#[derive(Debug, Clone)]
pub enum IndexClient {
    Pypi(PyPIClient),
    Devpi(DevPIClient),
}

impl IndexClient {
    pub fn new(
        backend: IndexBackend,
        url: &Url,
        options: ClientOptions,
    ) -> Result<Self, UpstreamError> {
        match backend {
            IndexBackend::Pypi => Ok(Self::Pypi(PyPIClient::new(url.clone(), options)?)),
            IndexBackend::Devpi => Ok(Self::Devpi(DevPIClient::new(url.clone(), options)?)),
        }
    }

    /// The upstream's current change-log serial.
    pub async fn last_serial(&self) -> Result<i64, UpstreamError> {
        match self {
            Self::Pypi(client) => client.last_serial().await,
            Self::Devpi(client) => client.last_serial().await,
        }
    }

    /// Every package name the upstream currently lists.
    pub async fn list_packages(&self) -> Result<Vec<String>, UpstreamError> {
        match self {
            Self::Pypi(client) => client.list_packages().await,
            Self::Devpi(client) => client.list_packages().await,
        }
    }

    /// The release map for one package, with unusable artifact kinds
    /// already filtered out.
    pub async fn get_package_releases(&self, package: &str) -> Result<ReleaseMap, UpstreamError> {
        match self {
            Self::Pypi(client) => client.get_package_releases(package).await,
            Self::Devpi(client) => client.get_package_releases(package).await,
        }
    }

    /// Lazily traverse the change log after `since`.
    pub fn updates_since(&self, since: i64) -> UpdateStream<'_> {
        UpdateStream::new(self, since)
    }
}

/// A pull-based traversal of the upstream change log.
///
/// Repeats of a package name within one traversal yield
/// `(None, serial)` so the caller can still advance its cursor without
/// re-importing. The traversal is bounded by the upstream's serial as
/// observed when the current batch was fetched and extends itself while
/// the upstream keeps moving.
pub struct UpdateStream<'a> {
    client: &'a IndexClient,
    buffer: std::collections::VecDeque<UpdateEvent>,
    seen: std::collections::HashSet<String>,
    cursor: i64,
    drained: bool,
}

impl<'a> UpdateStream<'a> {
    fn new(client: &'a IndexClient, since: i64) -> Self {
        Self {
            client,
            buffer: std::collections::VecDeque::new(),
            seen: std::collections::HashSet::new(),
            cursor: since,
            drained: false,
        }
    }

    /// The next event, or `None` once the change log is drained.
    pub async fn next(&mut self) -> Result<Option<UpdateEvent>, UpstreamError> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(Some(event));
            }
            if self.drained {
                return Ok(None);
            }
            let batch = match self.client {
                IndexClient::Pypi(client) => client.changelog_batch(self.cursor).await?,
                IndexClient::Devpi(client) => client.changelog_batch(self.cursor).await?,
            };
            if batch.is_empty() {
                self.drained = true;
                continue;
            }
            for (package, serial) in batch {
                self.cursor = self.cursor.max(serial);
                let deduplicated = match package {
                    Some(name) if self.seen.insert(name.clone()) => Some(name),
                    _ => None,
                };
                self.buffer.push_back(UpdateEvent {
                    package: deduplicated,
                    serial,
                });
            }
        }
    }
}

/// Drop the last `count` path segments of a URL, e.g. to go from a devpi
/// stage URL to the server root.
pub(crate) fn pop_path_segments(url: &Url, count: usize) -> Result<Url, UpstreamError> {
    let mut url = url.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|()| UpstreamError::Protocol {
            message: "index URL cannot be a base".to_string(),
        })?;
        segments.pop_if_empty();
        for _ in 0..count {
            segments.pop();
        }
    }
    Ok(url)
}

/// Append path segments to a URL.
pub(crate) fn push_path_segments(url: &Url, segments: &[&str]) -> Result<Url, UpstreamError> {
    let mut url = url.clone();
    {
        let mut parts = url.path_segments_mut().map_err(|()| UpstreamError::Protocol {
            message: "index URL cannot be a base".to_string(),
        })?;
        parts.pop_if_empty();
        for segment in segments {
            parts.extend(segment.split('/').filter(|part| !part.is_empty()));
        }
    }
    Ok(url)
}
