//! Input value types: origins, storage partitions, site keys, and navigation
//! targets.
//!
//! The surrounding navigation stack hands this crate a [`UrlInfo`] describing
//! where a document is going, with the isolation-relevant HTTP headers
//! already parsed into an [`IsolationClassification`]. The canonical per-site
//! comparison key ([`SiteKey`]) is computed by the external site-identity
//! collaborator; this module only defines the value types that cross that
//! seam.
//!
//! `BTreeMap`-friendly: everything here is `Ord` so it can serve as a
//! deterministic map key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::isolation_classification::IsolationClassification;

// ---------------------------------------------------------------------------
// OriginParseError
// ---------------------------------------------------------------------------

/// Error for malformed origin strings.
///
/// The only recoverable error in this crate: a bad origin string is input
/// data, not a broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OriginParseError {
    #[error("origin has no scheme separator: {input}")]
    MissingScheme { input: String },
    #[error("origin has an empty host: {input}")]
    EmptyHost { input: String },
    #[error("origin has an invalid port: {input}")]
    InvalidPort { input: String },
}

// ---------------------------------------------------------------------------
// Origin — scheme/host/port tuple
// ---------------------------------------------------------------------------

/// A web origin: scheme, host, and optional explicit port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Origin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl Origin {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse `scheme://host[:port]`, ignoring any path/query suffix.
    pub fn parse(input: &str) -> Result<Self, OriginParseError> {
        let (scheme, rest) =
            input
                .split_once("://")
                .ok_or_else(|| OriginParseError::MissingScheme {
                    input: input.to_string(),
                })?;
        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| OriginParseError::InvalidPort {
                        input: input.to_string(),
                    })?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        if scheme.is_empty() {
            return Err(OriginParseError::MissingScheme {
                input: input.to_string(),
            });
        }
        if host.is_empty() {
            return Err(OriginParseError::EmptyHost {
                input: input.to_string(),
            });
        }
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{port}", self.scheme, self.host),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

// ---------------------------------------------------------------------------
// StoragePartitionKey — storage-partition binding
// ---------------------------------------------------------------------------

/// Identifies the storage partition a document's data lives in.
///
/// The default partition is the empty domain/name pair. Guest views and other
/// embedders pin documents to a non-default partition.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StoragePartitionKey {
    pub partition_domain: String,
    pub partition_name: String,
}

impl StoragePartitionKey {
    pub fn new(partition_domain: impl Into<String>, partition_name: impl Into<String>) -> Self {
        Self {
            partition_domain: partition_domain.into(),
            partition_name: partition_name.into(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.partition_domain.is_empty() && self.partition_name.is_empty()
    }
}

impl fmt::Display for StoragePartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "(default)")
        } else {
            write!(f, "{}/{}", self.partition_domain, self.partition_name)
        }
    }
}

// ---------------------------------------------------------------------------
// SiteKey — canonical per-site comparison key
// ---------------------------------------------------------------------------

/// The canonical comparison key for a site, produced by the external
/// site-identity collaborator (see [`crate::identity::SiteKeyResolver`]).
///
/// Two documents require the same script-sharing identity within an isolation
/// group exactly when their site keys are equal. There is no shared-default
/// sentinel value: the key is always the concrete per-site classification,
/// and the shared-default decision is made separately by the group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteKey {
    /// Canonical site representation, e.g. `https://example.com`.
    pub site: String,
    /// Whether this site must never share the default identity.
    pub requires_dedicated_identity: bool,
    /// The storage partition derived for this site.
    pub storage_partition: StoragePartitionKey,
}

impl SiteKey {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            requires_dedicated_identity: false,
            storage_partition: StoragePartitionKey::default(),
        }
    }

    pub fn with_dedicated_identity(mut self) -> Self {
        self.requires_dedicated_identity = true;
        self
    }

    pub fn with_storage_partition(mut self, partition: StoragePartitionKey) -> Self {
        self.storage_partition = partition;
        self
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.site)
    }
}

// ---------------------------------------------------------------------------
// UrlInfo — a navigation target
// ---------------------------------------------------------------------------

/// A navigation target as seen by the process-allocation model.
///
/// `isolation` is `None` while the classification is not yet known
/// (mid-navigation, before response headers arrive); absent classifications
/// are compatible with everything, see
/// [`IsolationClassification::are_compatible`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlInfo {
    /// The target URL.
    pub url: String,
    /// Parsed cross-origin-isolation requirement, when known.
    pub isolation: Option<IsolationClassification>,
    /// Requested storage partition, when the embedder pins one.
    pub storage_partition: Option<StoragePartitionKey>,
    /// The shared restricted-opener origin, when the navigation takes part in
    /// a limited cross-group communication relationship.
    pub communication_origin: Option<Origin>,
}

impl UrlInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            isolation: None,
            storage_partition: None,
            communication_origin: None,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationClassification) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_storage_partition(mut self, partition: StoragePartitionKey) -> Self {
        self.storage_partition = Some(partition);
        self
    }

    pub fn with_communication_origin(mut self, origin: Origin) -> Self {
        self.communication_origin = Some(origin);
        self
    }
}
