//! RPC collaborator contracts: invocations, invokers, filters, and the
//! protocol seam.
//!
//! Concrete wire implementations live outside this crate. What lives here
//! is the shape the extension kernel composes against: the [`Invoker`]
//! facade, the [`Filter`] decorator contract, and the [`Protocol`] point
//! whose adaptive dispatcher picks the implementation from the URL's
//! protocol discriminator.

mod filter_chain;
mod tps;

pub use filter_chain::{
    build_filter_chain, FilterProtocol, CONSUMER_GROUP, PROVIDER_GROUP, REFERENCE_FILTER_KEY,
    REGISTRY_PROTOCOL, SERVICE_FILTER_KEY,
};
pub use tps::{DefaultTpsLimiter, StatItem, TpsLimitFilter, TpsLimiter};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::Url;
use crate::extension::{AdaptiveMethod, ExtensionError, ExtensionLoader, Spi, WeakLoader};

/// Per-call descriptor: the invoked method plus call-scoped attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    method_name: String,
    #[serde(default)]
    attachments: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(method_name: impl Into<String>) -> Self {
        Self {
            method_name: method_name.into(),
            attachments: BTreeMap::new(),
        }
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    pub fn attachments(&self) -> &BTreeMap<String, String> {
        &self.attachments
    }
}

/// The value side of a completed invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    value: serde_json::Value,
    #[serde(default)]
    attachments: BTreeMap<String, String>,
}

impl RpcResult {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            attachments: BTreeMap::new(),
        }
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RpcError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("call rate limited: {0}")]
    Limited(String),

    #[error("invocation of '{method}' failed: {reason}")]
    Invocation { method: String, reason: String },

    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

/// An invokable service facade carrying its own URL.
pub trait Invoker: Send + Sync {
    fn interface_name(&self) -> &str;

    fn url(&self) -> &Url;

    fn is_available(&self) -> bool {
        true
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError>;

    fn destroy(&self) {}
}

/// An interceptor around an [`Invoker`]. Propagation is explicit: a filter
/// that never calls `next.invoke` short-circuits the rest of the chain,
/// which is the intended shape for admission and auth filters.
pub trait Filter: Send + Sync {
    fn invoke(&self, next: &dyn Invoker, invocation: &Invocation) -> Result<RpcResult, RpcError>;
}

impl Spi for dyn Filter {
    const INTERFACE: &'static str = "spindle.rpc.Filter";
}

/// Handle to an exported service.
pub trait Exporter: Send + Sync {
    fn invoker(&self) -> Arc<dyn Invoker>;

    fn unexport(&self) {}
}

/// The protocol seam: exports providers and refers consumers.
///
/// `export` and `refer` are the point's adaptive methods, keyed on the
/// URL's protocol discriminator. `default_port` is not adaptive; calling it
/// on the dispatcher is an error.
pub trait Protocol: Send + Sync {
    fn default_port(&self) -> Result<u16, RpcError>;

    fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError>;

    fn refer(&self, interface: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError>;

    fn destroy(&self) {}
}

impl Spi for dyn Protocol {
    const INTERFACE: &'static str = "spindle.rpc.Protocol";

    fn dispatcher(loader: &ExtensionLoader<Self>) -> Result<Arc<Self>, ExtensionError> {
        Ok(Arc::new(AdaptiveProtocol {
            loader: loader.downgrade(),
        }))
    }
}

const EXPORT: AdaptiveMethod = AdaptiveMethod::new("export", &["protocol"]);
const REFER: AdaptiveMethod = AdaptiveMethod::new("refer", &["protocol"]);

/// Generated dispatcher for the protocol point: each call re-selects the
/// concrete protocol named by the URL.
struct AdaptiveProtocol {
    loader: WeakLoader<dyn Protocol>,
}

impl AdaptiveProtocol {
    fn loader(&self) -> Result<ExtensionLoader<dyn Protocol>, RpcError> {
        self.loader
            .upgrade()
            .ok_or_else(|| RpcError::Unavailable("extension registry has been dropped".into()))
    }
}

impl Protocol for AdaptiveProtocol {
    fn default_port(&self) -> Result<u16, RpcError> {
        Err(ExtensionError::UnsupportedMethod {
            interface: <dyn Protocol as Spi>::INTERFACE,
            method: "default_port",
        }
        .into())
    }

    fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError> {
        let url = invoker.url().clone();
        let target = self
            .loader()?
            .adaptive_target(&EXPORT, Some(&url), None)?;
        target.export(invoker)
    }

    fn refer(&self, interface: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        let target = self.loader()?.adaptive_target(&REFER, Some(url), None)?;
        target.refer(interface, url)
    }
}
