//! The runtime configuration carrier.
//!
//! A [`Url`] is an immutable bundle of a protocol discriminator, an optional
//! address, a path, and a sorted parameter map. It is the sole runtime input
//! to adaptive dispatch and extension activation: components read their
//! configuration from its parameters rather than from global state.
//!
//! Method-scoped overrides use dotted keys: `echo.timeout=200` overrides the
//! plain `timeout` parameter for calls to the `echo` method, resolved via
//! [`Url::method_parameter`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum UrlParseError {
    #[error("invalid url '{input}': {source}")]
    Invalid {
        input: String,
        #[source]
        source: url::ParseError,
    },

    #[error("url '{input}' has an empty protocol")]
    EmptyProtocol { input: String },
}

/// Immutable URL-style configuration value.
///
/// Parameters are kept sorted so that the canonical string form is stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
    protocol: String,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    parameters: BTreeMap<String, String>,
}

impl Url {
    /// Creates a URL with the given protocol and nothing else.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: None,
            port: None,
            path: String::new(),
            parameters: BTreeMap::new(),
        }
    }

    /// Parses the canonical `protocol://host:port/path?k=v` form.
    pub fn parse(input: &str) -> Result<Self, UrlParseError> {
        let raw = url::Url::parse(input).map_err(|source| UrlParseError::Invalid {
            input: input.to_string(),
            source,
        })?;
        if raw.scheme().is_empty() {
            return Err(UrlParseError::EmptyProtocol {
                input: input.to_string(),
            });
        }
        let mut parameters = BTreeMap::new();
        for (k, v) in raw.query_pairs() {
            parameters.insert(k.into_owned(), v.into_owned());
        }
        Ok(Self {
            protocol: raw.scheme().to_string(),
            host: raw.host_str().map(str::to_string),
            port: raw.port(),
            path: raw.path().trim_start_matches('/').to_string(),
            parameters,
        })
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Returns a copy carrying the given parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters<K, V>(mut self, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in entries {
            self.parameters.insert(k.into(), v.into());
        }
        self
    }

    /// Returns a copy with the given parameter removed.
    pub fn without_parameter(mut self, key: &str) -> Self {
        self.parameters.remove(key);
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, when an address is configured.
    pub fn address(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Raw parameter lookup. Empty values are returned as-is.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Parameter lookup treating missing and empty values as the default.
    pub fn parameter_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.parameter(key) {
            Some(value) if !value.is_empty() => value,
            _ => default,
        }
    }

    /// Parses a parameter value, falling back to `default` when the
    /// parameter is missing, empty, or malformed.
    pub fn parameter_parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.parameter(key) {
            Some(value) if !value.is_empty() => value.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn has_parameter(&self, key: &str) -> bool {
        self.parameter(key).is_some_and(|v| !v.is_empty())
    }

    /// Method-scoped lookup: `"{method}.{key}"` first, then the plain key.
    /// Empty values count as absent at both levels.
    pub fn method_parameter(&self, method: &str, key: &str) -> Option<&str> {
        let scoped = format!("{method}.{key}");
        match self.parameters.get(&scoped) {
            Some(value) if !value.is_empty() => Some(value.as_str()),
            _ => self.parameter(key).filter(|v| !v.is_empty()),
        }
    }

    /// Parses a method-scoped parameter with a fallback default.
    pub fn method_parameter_parsed<T: FromStr>(&self, method: &str, key: &str, default: T) -> T {
        match self.method_parameter(method, key) {
            Some(value) => value.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Service identity for per-service bookkeeping:
    /// `[group/]interface[:version]`, where the interface defaults to the
    /// URL path.
    pub fn service_key(&self) -> String {
        let interface = self.parameter_or("interface", &self.path);
        let mut key = String::new();
        if let Some(group) = self.parameter("group")
            && !group.is_empty()
        {
            key.push_str(group);
            key.push('/');
        }
        key.push_str(interface);
        if let Some(version) = self.parameter("version")
            && !version.is_empty()
        {
            key.push(':');
            key.push_str(version);
        }
        key
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if let Some(host) = &self.host {
            write!(f, "{host}")?;
            if let Some(port) = self.port {
                write!(f, ":{port}")?;
            }
        }
        write!(f, "/{}", self.path)?;
        for (i, (k, v)) in self.parameters.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{k}={v}")?;
        }
        Ok(())
    }
}

impl FromStr for Url {
    type Err = UrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Url {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Url::parse(&raw).map_err(D::Error::custom)
    }
}
