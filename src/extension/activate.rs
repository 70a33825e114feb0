//! The activate selector: ordered, URL-predicated extension chains.
//!
//! Given a URL, a list of configured names, and a caller group, the
//! selector composes two phases:
//!
//! - **auto-activated** extensions whose [`Activate`] predicate matches the
//!   group and URL, sorted by their declared ordering; suppressed entirely
//!   by the pseudo-name `-default`;
//! - **explicitly configured** names, in configuration order, spliced ahead
//!   of the auto-activated phase wherever the pseudo-name `default` appears.
//!
//! A configured name prefixed with `-` removes its tail from consideration
//! in both phases.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::common::Url;

use super::error::ExtensionError;
use super::loader::ExtensionLoader;
use super::provider::Activate;
use super::Spi;

/// Pseudo-name marking the splice point of auto-activated extensions.
pub const DEFAULT_KEY: &str = "default";

/// Prefix removing a name from consideration.
pub const REMOVE_PREFIX: char = '-';

fn group_matches(caller: Option<&str>, groups: &[&str]) -> bool {
    match caller {
        None | Some("") => true,
        Some(caller) => groups.contains(&caller),
    }
}

/// An activate predicate fires when any of its keys matches a URL parameter
/// key (exactly, or as a `.`-suffix) with a non-empty value.
fn is_active(activate: &Activate, url: &Url) -> bool {
    if activate.value.is_empty() {
        return true;
    }
    activate.value.iter().any(|key| {
        url.parameters().iter().any(|(k, v)| {
            (k == key || k.ends_with(&format!(".{key}"))) && !v.is_empty()
        })
    })
}

/// Stable ordering for auto-activated extensions: `before`/`after`
/// constraints first, then the numeric order, then the name.
fn activate_order(a: &(String, Activate), b: &(String, Activate)) -> Ordering {
    if a.1.before.contains(&b.0.as_str()) || b.1.after.contains(&a.0.as_str()) {
        return Ordering::Less;
    }
    if a.1.after.contains(&b.0.as_str()) || b.1.before.contains(&a.0.as_str()) {
        return Ordering::Greater;
    }
    a.1.order.cmp(&b.1.order).then_with(|| a.0.cmp(&b.0))
}

impl<P: Spi + ?Sized> ExtensionLoader<P> {
    /// Splits the comma-separated value of `key` on the URL and delegates to
    /// [`get_activate`](Self::get_activate).
    pub fn get_activate_by_key(
        &self,
        url: &Url,
        key: &str,
        group: Option<&str>,
    ) -> Result<Vec<Arc<P>>, ExtensionError> {
        let value = url.parameter(key).unwrap_or("");
        let names: Vec<&str> = value
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();
        self.get_activate(url, &names, group)
    }

    /// Returns the ordered activation chain for `url` under `group`.
    pub fn get_activate(
        &self,
        url: &Url,
        values: &[&str],
        group: Option<&str>,
    ) -> Result<Vec<Arc<P>>, ExtensionError> {
        let names = values;
        let mut chain: Vec<Arc<P>> = Vec::new();

        let suppress_default = names.iter().any(|n| {
            n.strip_prefix(REMOVE_PREFIX) == Some(DEFAULT_KEY)
        });
        if !suppress_default {
            let loaded = self.classes()?;
            let mut matched: Vec<(String, Activate)> = Vec::new();
            for (name, activate) in &loaded.activates {
                if !group_matches(group, activate.group) {
                    continue;
                }
                let removed = format!("{REMOVE_PREFIX}{name}");
                if names.contains(&name.as_str()) || names.contains(&removed.as_str()) {
                    continue;
                }
                if !is_active(activate, url) {
                    continue;
                }
                matched.push((name.clone(), activate.clone()));
            }
            matched.sort_by(activate_order);
            for (name, _) in &matched {
                chain.push(self.get(name)?);
            }
        }

        let mut configured: Vec<Arc<P>> = Vec::new();
        for name in names {
            if name.starts_with(REMOVE_PREFIX) {
                continue;
            }
            let removed = format!("{REMOVE_PREFIX}{name}");
            if names.contains(&removed.as_str()) {
                continue;
            }
            if *name == DEFAULT_KEY {
                if !configured.is_empty() {
                    chain.splice(0..0, configured.drain(..));
                }
            } else {
                configured.push(self.get(name)?);
            }
        }
        if !configured.is_empty() {
            chain.append(&mut configured);
        }
        Ok(chain)
    }
}
