//! The extension kernel: discovery, composition, and dispatch of named
//! service implementations.
//!
//! An *extension point* is a `Send + Sync` trait object type carrying the
//! [`Spi`] marker. Implementations register provider stubs and are bound to
//! short names by resource files discovered on the registry's search path:
//!
//! ```text
//! <root>/
//! ├── META-INF/dubbo/internal/     # built-in bindings, probed first
//! │   └── demo.Codec
//! ├── META-INF/dubbo/              # framework bindings
//! │   └── demo.Codec
//! └── META-INF/services/           # plain SPI bindings, probed last
//!     └── demo.Codec
//! ```
//!
//! Each resource file holds `name=provider.TypeName` records. From there the
//! loader builds singletons on demand (construction, best-effort injection,
//! wrapper decoration), selects implementations per call through adaptive
//! dispatch, and composes URL-predicated activation chains.
//!
//! # Example
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
//!     const DEFAULT_NAME: Option<&'static str> = Some("json");
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
//! registry.add_embedded_resource(
//!     "META-INF/dubbo",
//!     "demo.Codec",
//!     "json=demo.JsonCodec\n",
//! );
//! let loader = registry.loader::<dyn Codec>();
//! loader.register_provider(ExtensionProvider::named("demo.JsonCodec", |_ctx| {
//!     Ok(Arc::new(JsonCodec))
//! }));
//!
//! assert_eq!(loader.get("json").unwrap().name(), "json");
//! assert_eq!(loader.get("true").unwrap().name(), "json");
//! ```

mod activate;
mod adaptive;
mod error;
mod factory;
mod loader;
mod provider;
mod registry;
mod resource;

pub use activate::{DEFAULT_KEY, REMOVE_PREFIX};
pub use adaptive::{derive_point_key, resolve_adaptive_name, AdaptiveMethod};
pub use error::{ExtensionError, LoadFailure};
pub use factory::{
    resolve_extension, AdaptiveExtensionFactory, BuildContext, ContainerExtensionFactory,
    ExtensionFactory, SpiExtensionFactory,
};
pub use loader::{ExtensionLoader, WeakLoader, TRUE_NAME};
pub use provider::{Activate, ExtensionProvider};
pub use registry::{ExtensionRegistry, ObjectContainer, EXTENSION_PATH_ENV};
pub use resource::EmbeddedResource;

use std::sync::Arc;

/// Marks a trait object type as an extension point.
///
/// Implement this for the `dyn Trait` type of a `Send + Sync` trait:
///
/// ```
/// use spindle::extension::Spi;
///
/// trait Filter: Send + Sync {}
///
/// impl Spi for dyn Filter {
///     const INTERFACE: &'static str = "demo.Filter";
/// }
/// ```
pub trait Spi: Send + Sync + 'static {
    /// The interface name: resource file name and diagnostic label.
    const INTERFACE: &'static str;

    /// The default extension name, resolved by the reserved name `"true"`.
    const DEFAULT_NAME: Option<&'static str> = None;

    /// Builds this point's generated dispatcher, the stand-in for a
    /// discovered adaptive implementation. Points without adaptive methods
    /// keep the default body, which refuses synthesis.
    fn dispatcher(loader: &ExtensionLoader<Self>) -> Result<Arc<Self>, ExtensionError> {
        let _ = loader;
        Err(ExtensionError::NoAdaptiveMethod {
            interface: Self::INTERFACE,
        })
    }
}

/// Convenience accessor for a loader on the global registry.
pub fn extension_loader<P: Spi + ?Sized>() -> ExtensionLoader<P> {
    ExtensionRegistry::global().loader::<P>()
}

/// Last dot-segment of an interface name.
pub(crate) fn interface_short(interface: &str) -> &str {
    interface.rsplit('.').next().unwrap_or(interface)
}
