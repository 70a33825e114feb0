//! # spindle
//!
//! Extension kernel for a pluggable RPC framework.
//!
//! Spindle discovers, instantiates, composes, and dispatches named service
//! implementations ("extensions") for trait-object interfaces, driven by
//! URL-style runtime configuration:
//!
//! - **Discovery** reads per-interface resource files from a configurable
//!   search path and binds short names to registered provider stubs.
//! - **Composition** builds singletons on demand: construction, best-effort
//!   dependency injection through the extension factory, then wrapper
//!   decoration.
//! - **Adaptive dispatch** hands out one dispatcher per extension point
//!   that picks the concrete implementation per call from URL parameters.
//! - **Activation** composes ordered extension chains (request filters,
//!   most prominently) from URL-driven predicates.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use spindle::extension::{ExtensionProvider, ExtensionRegistry, Spi};
//!
//! trait Codec: Send + Sync {
//!     fn name(&self) -> &'static str;
//! }
//!
//! impl Spi for dyn Codec {
//!     const INTERFACE: &'static str = "demo.Codec";
//! }
//!
//! struct JsonCodec;
//! impl Codec for JsonCodec {
//!     fn name(&self) -> &'static str {
//!         "json"
//!     }
//! }
//!
//! let registry = ExtensionRegistry::new();
//! registry.add_embedded_resource("META-INF/dubbo", "demo.Codec", "json=demo.JsonCodec\n");
//!
//! let loader = registry.loader::<dyn Codec>();
//! loader.register_provider(ExtensionProvider::named("demo.JsonCodec", |_ctx| {
//!     Ok(Arc::new(JsonCodec))
//! }));
//!
//! let codec = loader.get("json").unwrap();
//! assert_eq!(codec.name(), "json");
//! ```

pub mod cluster;
pub mod common;
pub mod extension;
pub mod rpc;

pub use common::{Url, UrlParseError};
pub use extension::{
    extension_loader, Activate, AdaptiveMethod, BuildContext, ExtensionError, ExtensionFactory,
    ExtensionLoader, ExtensionProvider, ExtensionRegistry, ObjectContainer, Spi, WeakLoader,
};
pub use rpc::{Filter, Invocation, Invoker, Protocol, RpcError, RpcResult};

/// Error type unifying the crate's failure surfaces.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Extension(#[from] extension::ExtensionError),

    #[error(transparent)]
    Rpc(#[from] rpc::RpcError),

    #[error(transparent)]
    Url(#[from] common::UrlParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
