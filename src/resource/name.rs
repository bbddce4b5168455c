//! Parsing and formatting of xDS resource names.
//!
//! New-style names are `xdstp://<authority>/<type_url>/<id>?<params>` URIs
//! (xDS federation). Anything else is an old-style unqualified name, reported
//! under the sentinel authority [`OLD_STYLE_AUTHORITY`].

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// The authority reported for old-style (non-xdstp) resource names.
pub const OLD_STYLE_AUTHORITY: &str = "#old";

const XDSTP_SCHEME: &str = "xdstp";

/// The authority-relative part of a resource name.
///
/// Query parameters are kept sorted by name so that equivalent names
/// compare equal regardless of the order they appeared in on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    /// The resource id (the path remainder after the type URL segment).
    pub id: String,
    /// Canonically ordered query parameters.
    pub query_params: Vec<(String, String)>,
}

impl ResourceKey {
    /// Create a key for an old-style name.
    pub fn plain(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query_params: Vec::new(),
        }
    }
}

/// A fully parsed xDS resource name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceName {
    /// The authority namespace, or [`OLD_STYLE_AUTHORITY`].
    pub authority: String,
    /// The authority-relative key.
    pub key: ResourceKey,
}

impl ResourceName {
    /// Parse a resource name for a resource type identified by `type_url`.
    ///
    /// If `federation` is disabled, or the name does not start with `xdstp:`,
    /// the whole string becomes the id of an old-style name. Otherwise the
    /// name must be a valid `xdstp://` URI whose first path segment equals
    /// `type_url`.
    pub fn parse(name: &str, type_url: &str, federation: bool) -> Result<Self> {
        if !federation || !name.starts_with("xdstp:") {
            return Ok(Self {
                authority: OLD_STYLE_AUTHORITY.to_string(),
                key: ResourceKey::plain(name),
            });
        }
        let uri = name
            .parse::<http::Uri>()
            .map_err(|e| Error::Validation(format!("invalid xdstp URI: {e}")))?;
        if uri.scheme_str() != Some(XDSTP_SCHEME) {
            return Err(Error::Validation(format!(
                "invalid xdstp URI scheme: {:?}",
                uri.scheme_str()
            )));
        }
        let authority = uri.authority().map(|a| a.to_string()).unwrap_or_default();
        let path = uri.path().trim_start_matches('/');
        let (path_type, id) = path.split_once('/').unwrap_or((path, ""));
        if path_type != type_url {
            return Err(Error::Validation(
                "xdstp URI path must indicate valid xDS resource type".to_string(),
            ));
        }
        // Canonicalize order of query params.
        let mut params = BTreeMap::new();
        if let Some(query) = uri.query() {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                params.insert(name.to_string(), value.to_string());
            }
        }
        Ok(Self {
            authority,
            key: ResourceKey {
                id: id.to_string(),
                query_params: params.into_iter().collect(),
            },
        })
    }

    /// Reconstruct the full resource name for a request.
    ///
    /// The inverse of [`parse`](Self::parse): old-style names come back as
    /// the bare id, new-style names as a canonical `xdstp://` URI.
    pub fn format(&self, type_url: &str) -> String {
        format_name(&self.authority, type_url, &self.key)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.authority == OLD_STYLE_AUTHORITY {
            f.write_str(&self.key.id)
        } else {
            write!(f, "xdstp://{}/.../{}", self.authority, self.key.id)
        }
    }
}

/// Construct the full wire form of a resource name.
pub fn format_name(authority: &str, type_url: &str, key: &ResourceKey) -> String {
    if authority == OLD_STYLE_AUTHORITY {
        return key.id.clone();
    }
    let mut out = format!("xdstp://{authority}/{type_url}/{}", key.id);
    for (i, (name, value)) in key.query_params.iter().enumerate() {
        out.push(if i == 0 { '?' } else { '&' });
        out.push_str(name);
        out.push('=');
        out.push_str(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTENER: &str = "envoy.config.listener.v3.Listener";

    #[test]
    fn old_style_name() {
        let name = ResourceName::parse("server.example.com", LISTENER, true).unwrap();
        assert_eq!(name.authority, OLD_STYLE_AUTHORITY);
        assert_eq!(name.key.id, "server.example.com");
        assert!(name.key.query_params.is_empty());
        assert_eq!(name.format(LISTENER), "server.example.com");
    }

    #[test]
    fn xdstp_name() {
        let name =
            ResourceName::parse("xdstp://prod.example.com/envoy.config.listener.v3.Listener/svc/a",
                LISTENER, true)
                .unwrap();
        assert_eq!(name.authority, "prod.example.com");
        assert_eq!(name.key.id, "svc/a");
        assert_eq!(
            name.format(LISTENER),
            "xdstp://prod.example.com/envoy.config.listener.v3.Listener/svc/a"
        );
    }

    #[test]
    fn query_params_are_canonically_ordered() {
        let a = ResourceName::parse(
            "xdstp://auth/envoy.config.listener.v3.Listener/x?b=2&a=1",
            LISTENER,
            true,
        )
        .unwrap();
        let b = ResourceName::parse(
            "xdstp://auth/envoy.config.listener.v3.Listener/x?a=1&b=2",
            LISTENER,
            true,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.format(LISTENER),
            "xdstp://auth/envoy.config.listener.v3.Listener/x?a=1&b=2"
        );
    }

    #[test]
    fn wrong_type_in_path_is_rejected() {
        let result = ResourceName::parse(
            "xdstp://auth/envoy.config.cluster.v3.Cluster/x",
            LISTENER,
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn federation_disabled_treats_xdstp_as_plain() {
        let raw = "xdstp://auth/envoy.config.listener.v3.Listener/x";
        let name = ResourceName::parse(raw, LISTENER, false).unwrap();
        assert_eq!(name.authority, OLD_STYLE_AUTHORITY);
        assert_eq!(name.key.id, raw);
    }
}
