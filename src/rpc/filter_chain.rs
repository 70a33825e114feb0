//! Filter chain assembly and the protocol wrapper that applies it.
//!
//! [`build_filter_chain`] folds an ordered filter list into nested invokers:
//! calling the returned invoker runs `f0 → f1 → … → terminal`, each filter
//! deciding whether to propagate. Every layer answers metadata queries from
//! the innermost terminal, not from its immediate child, so the decorated
//! facade is indistinguishable from the service it fronts.

use std::sync::Arc;

use crate::common::Url;
use crate::extension::ExtensionLoader;

use super::{Exporter, Filter, Invocation, Invoker, Protocol, RpcError, RpcResult};

/// URL parameter naming provider-side filters.
pub const SERVICE_FILTER_KEY: &str = "service.filter";
/// URL parameter naming consumer-side filters.
pub const REFERENCE_FILTER_KEY: &str = "reference.filter";
/// Activation group for provider-side extensions.
pub const PROVIDER_GROUP: &str = "provider";
/// Activation group for consumer-side extensions.
pub const CONSUMER_GROUP: &str = "consumer";
/// Protocol discriminator that bypasses filter assembly entirely.
pub const REGISTRY_PROTOCOL: &str = "registry";

struct FilterInvoker {
    filter: Arc<dyn Filter>,
    next: Arc<dyn Invoker>,
    terminal: Arc<dyn Invoker>,
}

impl Invoker for FilterInvoker {
    fn interface_name(&self) -> &str {
        self.terminal.interface_name()
    }

    fn url(&self) -> &Url {
        self.terminal.url()
    }

    fn is_available(&self) -> bool {
        self.terminal.is_available()
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        self.filter.invoke(self.next.as_ref(), invocation)
    }

    fn destroy(&self) {
        self.terminal.destroy()
    }
}

/// Builds the invoker chain `f0 → f1 → … → terminal`.
///
/// Filters are folded from the tail so the head of the list is the
/// outermost layer.
pub fn build_filter_chain(
    terminal: Arc<dyn Invoker>,
    filters: &[Arc<dyn Filter>],
) -> Arc<dyn Invoker> {
    let mut last = terminal.clone();
    for filter in filters.iter().rev() {
        last = Arc::new(FilterInvoker {
            filter: filter.clone(),
            next: last,
            terminal: terminal.clone(),
        });
    }
    last
}

/// Wrapper for the protocol point: surrounds every exported or referred
/// invoker with the activation-selected filter chain.
///
/// Registry URLs pass through untouched; they address the registry itself,
/// not a service.
pub struct FilterProtocol {
    inner: Arc<dyn Protocol>,
    // non-owning: this instance is cached inside the registry itself
    filters: crate::extension::WeakLoader<dyn Filter>,
}

impl FilterProtocol {
    /// The provider stub to register under the protocol point, typically
    /// bound by a `spindle.rpc.FilterProtocol` resource record.
    pub fn provider() -> crate::extension::ExtensionProvider<dyn Protocol> {
        crate::extension::ExtensionProvider::wrapper("spindle.rpc.FilterProtocol", |inner, ctx| {
            Ok(Arc::new(FilterProtocol {
                inner,
                filters: ctx.registry().loader::<dyn Filter>().downgrade(),
            }) as Arc<dyn Protocol>)
        })
    }

    fn filter_loader(&self) -> Result<ExtensionLoader<dyn Filter>, RpcError> {
        self.filters
            .upgrade()
            .ok_or_else(|| RpcError::Unavailable("extension registry has been dropped".into()))
    }
}

impl Protocol for FilterProtocol {
    fn default_port(&self) -> Result<u16, RpcError> {
        self.inner.default_port()
    }

    fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError> {
        if invoker.url().protocol() == REGISTRY_PROTOCOL {
            return self.inner.export(invoker);
        }
        let filters = self.filter_loader()?.get_activate_by_key(
            invoker.url(),
            SERVICE_FILTER_KEY,
            Some(PROVIDER_GROUP),
        )?;
        tracing::debug!(
            "exporting {} behind {} provider filter(s)",
            invoker.interface_name(),
            filters.len()
        );
        self.inner.export(build_filter_chain(invoker, &filters))
    }

    fn refer(&self, interface: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        if url.protocol() == REGISTRY_PROTOCOL {
            return self.inner.refer(interface, url);
        }
        let invoker = self.inner.refer(interface, url)?;
        let filters =
            self.filter_loader()?
                .get_activate_by_key(url, REFERENCE_FILTER_KEY, Some(CONSUMER_GROUP))?;
        Ok(build_filter_chain(invoker, &filters))
    }

    fn destroy(&self) {
        self.inner.destroy()
    }
}
