//! Provider stubs: the compile-time registration records that stand in for
//! classpath scanning.
//!
//! Every implementation of an extension point registers one
//! [`ExtensionProvider`] naming its dotted type name and declaring, up
//! front, which of the three mutually exclusive kinds it is: a *named*
//! implementation, a *wrapper* decorating the point itself, or the point's
//! single *adaptive* implementation. Resource records then bind short names
//! to these type names; a record whose type name has no stub is treated like
//! a class that failed to load.

use std::sync::Arc;

use super::Spi;
use super::error::ExtensionError;
use super::factory::BuildContext;

/// Auto-activation metadata: the predicate and ordering used by the
/// activate selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activate {
    /// Caller groups this extension enlists in; empty matches any group.
    pub group: &'static [&'static str],
    /// URL parameter keys that trigger activation; empty always triggers.
    pub value: &'static [&'static str],
    /// Sort key within the auto-activated chain.
    pub order: i32,
    /// Names this extension must precede.
    pub before: &'static [&'static str],
    /// Names this extension must follow.
    pub after: &'static [&'static str],
}

impl Activate {
    pub const fn new() -> Self {
        Self {
            group: &[],
            value: &[],
            order: 0,
            before: &[],
            after: &[],
        }
    }

    pub const fn group(mut self, group: &'static [&'static str]) -> Self {
        self.group = group;
        self
    }

    pub const fn value(mut self, value: &'static [&'static str]) -> Self {
        self.value = value;
        self
    }

    pub const fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub const fn before(mut self, before: &'static [&'static str]) -> Self {
        self.before = before;
        self
    }

    pub const fn after(mut self, after: &'static [&'static str]) -> Self {
        self.after = after;
        self
    }
}

type ConstructFn<P> =
    Box<dyn Fn(&BuildContext<'_>) -> Result<Arc<P>, ExtensionError> + Send + Sync>;
type WrapFn<P> =
    Box<dyn Fn(Arc<P>, &BuildContext<'_>) -> Result<Arc<P>, ExtensionError> + Send + Sync>;

pub(crate) enum ProviderKind<P: Spi + ?Sized> {
    Named(ConstructFn<P>),
    Wrapper(WrapFn<P>),
    Adaptive(ConstructFn<P>),
}

/// A registered implementation of the extension point `P`.
pub struct ExtensionProvider<P: Spi + ?Sized> {
    type_name: &'static str,
    legacy_name: Option<&'static str>,
    activate: Option<Activate>,
    kind: ProviderKind<P>,
}

impl<P: Spi + ?Sized> ExtensionProvider<P> {
    /// A named implementation, bound to short names by resource records.
    pub fn named(
        type_name: &'static str,
        construct: impl Fn(&BuildContext<'_>) -> Result<Arc<P>, ExtensionError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            type_name,
            legacy_name: None,
            activate: None,
            kind: ProviderKind::Named(Box::new(construct)),
        }
    }

    /// A wrapper: decorates any resolved instance of the same point.
    pub fn wrapper(
        type_name: &'static str,
        wrap: impl Fn(Arc<P>, &BuildContext<'_>) -> Result<Arc<P>, ExtensionError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            type_name,
            legacy_name: None,
            activate: None,
            kind: ProviderKind::Wrapper(Box::new(wrap)),
        }
    }

    /// The point's hand-written adaptive implementation. Its presence
    /// short-circuits dispatcher synthesis.
    pub fn adaptive(
        type_name: &'static str,
        construct: impl Fn(&BuildContext<'_>) -> Result<Arc<P>, ExtensionError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            type_name,
            legacy_name: None,
            activate: None,
            kind: ProviderKind::Adaptive(Box::new(construct)),
        }
    }

    /// Assigns the short name used when a resource record omits one,
    /// overriding derivation from the type name.
    pub fn with_legacy_name(mut self, name: &'static str) -> Self {
        self.legacy_name = Some(name);
        self
    }

    /// Enlists this provider for auto-activation.
    pub fn with_activate(mut self, activate: Activate) -> Self {
        self.activate = Some(activate);
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn activate(&self) -> Option<&Activate> {
        self.activate.as_ref()
    }

    pub(crate) fn is_adaptive(&self) -> bool {
        matches!(self.kind, ProviderKind::Adaptive(_))
    }

    pub(crate) fn is_wrapper(&self) -> bool {
        matches!(self.kind, ProviderKind::Wrapper(_))
    }

    /// Last dot-segment of the type name.
    pub(crate) fn short_name(&self) -> &'static str {
        self.type_name.rsplit('.').next().unwrap_or(self.type_name)
    }

    /// Short name for a bare resource record: the legacy name when declared,
    /// otherwise the type short name with the interface short name stripped
    /// from its end, lowercased. `None` when nothing is left to use.
    pub(crate) fn derived_name(&self, interface_short: &str) -> Option<String> {
        if let Some(name) = self.legacy_name {
            return Some(name.to_string());
        }
        let short = self.short_name();
        let stem = short.strip_suffix(interface_short).unwrap_or(short);
        if stem.is_empty() {
            None
        } else {
            Some(stem.to_lowercase())
        }
    }

    pub(crate) fn construct(&self, ctx: &BuildContext<'_>) -> Result<Arc<P>, ExtensionError> {
        match &self.kind {
            ProviderKind::Named(construct) | ProviderKind::Adaptive(construct) => construct(ctx),
            ProviderKind::Wrapper(_) => Err(ExtensionError::Instantiation {
                interface: P::INTERFACE,
                name: self.type_name.to_string(),
                reason: "wrapper providers decorate an existing instance".to_string(),
            }),
        }
    }

    pub(crate) fn wrap(
        &self,
        inner: Arc<P>,
        ctx: &BuildContext<'_>,
    ) -> Result<Arc<P>, ExtensionError> {
        match &self.kind {
            ProviderKind::Wrapper(wrap) => wrap(inner, ctx),
            _ => Err(ExtensionError::Instantiation {
                interface: P::INTERFACE,
                name: self.type_name.to_string(),
                reason: "provider is not a wrapper".to_string(),
            }),
        }
    }
}

impl<P: Spi + ?Sized> std::fmt::Debug for ExtensionProvider<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            ProviderKind::Named(_) => "named",
            ProviderKind::Wrapper(_) => "wrapper",
            ProviderKind::Adaptive(_) => "adaptive",
        };
        f.debug_struct("ExtensionProvider")
            .field("type_name", &self.type_name)
            .field("kind", &kind)
            .field("legacy_name", &self.legacy_name)
            .field("activate", &self.activate)
            .finish()
    }
}
