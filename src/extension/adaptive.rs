//! Adaptive dispatch: per-call selection of the concrete extension from URL
//! parameters.
//!
//! Dispatchers are written (or generated) at build time, one per extension
//! point, and installed through [`Spi::dispatcher`]. Each adaptive method
//! declares its URL keys in an [`AdaptiveMethod`] and resolves the target
//! through [`ExtensionLoader::adaptive_target`], so the key-fallback
//! algorithm lives in exactly one place:
//!
//! - keys are evaluated from last to first; each earlier key falls back to
//!   the later key's result, and the final fallback is the point's default
//!   name;
//! - the reserved key `"protocol"` reads the URL's protocol discriminator
//!   instead of a parameter;
//! - when the call carries an invocation method name, parameter lookups are
//!   method-scoped (`"{method}.{key}"` first);
//! - empty values count as absent.
//!
//! A dispatcher must hold only a [`WeakLoader`] back-reference: the loader
//! caches the dispatcher, and an owned reference would cycle.
//!
//! [`Spi::dispatcher`]: super::Spi::dispatcher
//! [`WeakLoader`]: super::loader::WeakLoader

use std::sync::Arc;

use crate::common::Url;

use super::error::ExtensionError;
use super::loader::ExtensionLoader;
use super::{interface_short, Spi};

/// Static description of one adaptive method: its name (for diagnostics)
/// and the URL keys that select the target extension.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveMethod {
    pub method: &'static str,
    /// Selection keys in priority order; empty derives a single key from
    /// the extension point's short name.
    pub keys: &'static [&'static str],
}

impl AdaptiveMethod {
    pub const fn new(method: &'static str, keys: &'static [&'static str]) -> Self {
        Self { method, keys }
    }
}

/// Derives the default URL key from an interface name: the short name with
/// a `.` inserted before each interior uppercase letter, lowercased.
/// `demo.LoadBalance` becomes `load.balance`.
pub fn derive_point_key(interface: &str) -> String {
    let short = interface_short(interface);
    let mut key = String::with_capacity(short.len() + 2);
    for (i, c) in short.chars().enumerate() {
        if c.is_uppercase() {
            if i != 0 {
                key.push('.');
            }
            key.extend(c.to_lowercase());
        } else {
            key.push(c);
        }
    }
    key
}

/// Resolves the extension name from a URL using the key-fallback chain.
pub fn resolve_adaptive_name(
    keys: &[String],
    url: &Url,
    method: Option<&str>,
    default_name: Option<&str>,
) -> Option<String> {
    let mut resolved: Option<String> = default_name
        .filter(|d| !d.is_empty())
        .map(str::to_string);
    for key in keys.iter().rev() {
        let value = if key == "protocol" {
            Some(url.protocol()).filter(|p| !p.is_empty())
        } else if let Some(method) = method {
            url.method_parameter(method, key)
        } else {
            url.parameter(key).filter(|v| !v.is_empty())
        };
        if let Some(value) = value {
            resolved = Some(value.to_string());
        }
    }
    resolved
}

impl<P: Spi + ?Sized> ExtensionLoader<P> {
    /// Resolves and returns the target extension for one adaptive call.
    ///
    /// `method_name` is the invocation's method when the call carries one,
    /// enabling method-scoped parameter lookup.
    pub fn adaptive_target(
        &self,
        method: &AdaptiveMethod,
        url: Option<&Url>,
        method_name: Option<&str>,
    ) -> Result<Arc<P>, ExtensionError> {
        let url = url.ok_or(ExtensionError::NoUrl {
            interface: P::INTERFACE,
            method: method.method,
        })?;

        let keys: Vec<String> = if method.keys.is_empty() {
            vec![derive_point_key(P::INTERFACE)]
        } else {
            method.keys.iter().map(|k| k.to_string()).collect()
        };

        let default_name = self.classes()?.default_name.clone();
        let name = resolve_adaptive_name(&keys, url, method_name, default_name.as_deref())
            .ok_or_else(|| ExtensionError::NoNameInUrl {
                interface: P::INTERFACE,
                url: url.to_string(),
                keys: keys.clone(),
            })?;
        self.get(&name)
    }
}
