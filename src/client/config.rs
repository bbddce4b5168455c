//! Configuration for the xDS client.

use std::collections::HashMap;
use std::time::Duration;

use crate::client::retry::RetryPolicy;
use crate::message::Node;

/// Default timeout for the first delivery of a subscribed resource.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for an xDS management server.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ServerConfig {
    /// URI of the management server (e.g., "https://xds.example.com:443").
    pub uri: String,

    /// When set, resources deleted by this server via state-of-the-world
    /// omission are retained (and the deletion logged) instead of being
    /// reported as removed to watchers.
    pub ignore_resource_deletion: bool,
}

impl ServerConfig {
    /// Create a new server configuration with the given URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ignore_resource_deletion: false,
        }
    }

    /// Set whether SotW deletions from this server are ignored.
    pub fn with_ignore_resource_deletion(mut self, ignore: bool) -> Self {
        self.ignore_resource_deletion = ignore;
        self
    }

    /// Stable identity of this server, used to share channels between
    /// authorities served by the same server.
    pub(crate) fn key(&self) -> &str {
        &self.uri
    }
}

/// Configuration for a federated authority.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct AuthorityConfig {
    /// Priority-ordered servers for this authority. When empty, the client's
    /// default server list is used.
    pub servers: Vec<ServerConfig>,
}

impl AuthorityConfig {
    /// Create an authority configuration with its own server list.
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self { servers }
    }
}

/// Configuration for the xDS client.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Node identification sent to the xDS server.
    pub node: Node,

    /// Retry policy for connection attempts.
    ///
    /// Controls the backoff behavior when reconnecting to the xDS server.
    pub retry_policy: RetryPolicy,

    /// Priority-ordered list of default xDS management servers.
    ///
    /// The client will attempt to connect to servers in order, falling back
    /// to the next server if the current one is unavailable. Index 0 has the
    /// highest priority.
    pub servers: Vec<ServerConfig>,

    /// Per-authority configuration for `xdstp://` resource names.
    pub authorities: HashMap<String, AuthorityConfig>,

    /// How long to wait for the server to deliver a subscribed resource
    /// before reporting it as non-existent. Default: 15 seconds.
    pub request_timeout: Duration,

    /// Whether `xdstp://` federation names are recognized. When disabled,
    /// every resource name is treated as an old-style unqualified name.
    /// Default: enabled.
    pub federation: bool,
}

impl ClientConfig {
    /// Create a new configuration with a single server.
    ///
    /// Uses the default retry policy.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_ads::{ClientConfig, Node};
    ///
    /// let node = Node::new("grpc", "1.0")
    ///     .with_id("my-node")
    ///     .with_cluster("my-cluster");
    ///
    /// let config = ClientConfig::new(node, "https://xds.example.com:443");
    /// ```
    pub fn new(node: Node, server_uri: impl Into<String>) -> Self {
        Self::with_servers(node, vec![ServerConfig::new(server_uri)])
    }

    /// Create a new configuration with multiple servers for fallback.
    ///
    /// Servers are tried in order; index 0 has the highest priority.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_ads::{ClientConfig, Node, ServerConfig};
    ///
    /// let node = Node::new("grpc", "1.0");
    /// let config = ClientConfig::with_servers(node, vec![
    ///     ServerConfig::new("https://primary.xds.example.com:443"),
    ///     ServerConfig::new("https://backup.xds.example.com:443"),
    /// ]);
    /// ```
    pub fn with_servers(node: Node, servers: Vec<ServerConfig>) -> Self {
        Self {
            node,
            retry_policy: RetryPolicy::default(),
            servers,
            authorities: HashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            federation: true,
        }
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Add a federated authority.
    ///
    /// Resources named `xdstp://<name>/...` will be served by the authority's
    /// server list, or by the default servers if the list is empty.
    pub fn with_authority(mut self, name: impl Into<String>, authority: AuthorityConfig) -> Self {
        self.authorities.insert(name.into(), authority);
        self
    }

    /// Set the resource request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable or disable `xdstp://` federation name parsing.
    pub fn with_federation(mut self, enabled: bool) -> Self {
        self.federation = enabled;
        self
    }

    /// The servers responsible for the given authority.
    ///
    /// Old-style names and authorities without their own server list use the
    /// default servers. Returns `None` for an authority missing from the
    /// configuration entirely.
    pub(crate) fn servers_for_authority(&self, authority: &str) -> Option<&[ServerConfig]> {
        if authority == crate::resource::OLD_STYLE_AUTHORITY {
            return Some(&self.servers);
        }
        let config = self.authorities.get(authority)?;
        if config.servers.is_empty() {
            Some(&self.servers)
        } else {
            Some(&config.servers)
        }
    }
}
