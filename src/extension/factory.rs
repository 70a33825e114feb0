//! Dependency resolution: the `ExtensionFactory` capability and the
//! injection context handed to provider constructors.
//!
//! The factory is itself an extension point, SPI over itself. Two built-in
//! variants ship with every registry: `spi`, which asks the loader for the
//! dependency point's adaptive instance, and `container`, which defers to
//! the externally populated [`ObjectContainer`]. The point's adaptive
//! implementation composes all discovered factories and tries each in order.
//!
//! The circular bootstrap between the loader and the factory is broken by
//! one rule: the factory's own point injects with no factory at all.

use std::any::TypeId;
use std::sync::Arc;

use super::loader::ExtensionLoader;
use super::provider::ExtensionProvider;
use super::registry::{ExtensionRegistry, WeakRegistry};
use super::resource::INTERNAL_DIRECTORY;
use super::Spi;

/// Resolves dependencies for injection by `(extension point type, property
/// name)`. Returns the dependency boxed as `Arc<P>` of the requested point.
pub trait ExtensionFactory: Send + Sync {
    fn resolve(
        &self,
        target: TypeId,
        property: &str,
    ) -> Option<Box<dyn std::any::Any + Send + Sync>>;
}

impl Spi for dyn ExtensionFactory {
    const INTERFACE: &'static str = "spindle.extension.ExtensionFactory";
}

/// Typed convenience over [`ExtensionFactory::resolve`].
pub fn resolve_extension<D: Spi + ?Sized>(
    factory: &dyn ExtensionFactory,
    property: &str,
) -> Option<Arc<D>> {
    factory
        .resolve(TypeId::of::<D>(), property)?
        .downcast::<Arc<D>>()
        .ok()
        .map(|boxed| *boxed)
}

/// Injection context handed to provider construction closures.
///
/// Dependency resolution is best effort: a failure to resolve or apply one
/// property is logged and skipped, never failing the build.
pub struct BuildContext<'a> {
    registry: &'a ExtensionRegistry,
    factory: Option<Arc<dyn ExtensionFactory>>,
    interface: &'static str,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(
        registry: &'a ExtensionRegistry,
        factory: Option<Arc<dyn ExtensionFactory>>,
        interface: &'static str,
    ) -> Self {
        Self {
            registry,
            factory,
            interface,
        }
    }

    /// The registry this instance is being built for.
    pub fn registry(&self) -> &ExtensionRegistry {
        self.registry
    }

    /// Resolves the dependency for `property` and hands it to `set`.
    /// Unresolvable dependencies are skipped; a type mismatch from a factory
    /// is logged and skipped.
    pub fn inject<D: Spi + ?Sized>(&self, property: &str, set: impl FnOnce(Arc<D>)) {
        let Some(factory) = &self.factory else {
            return;
        };
        let Some(any) = factory.resolve(TypeId::of::<D>(), property) else {
            tracing::debug!(
                "no dependency resolved for property '{property}' of {}",
                self.interface
            );
            return;
        };
        match any.downcast::<Arc<D>>() {
            Ok(dep) => set(*dep),
            Err(_) => {
                tracing::error!(
                    "failed to inject property '{property}' of {}: factory returned a value of an unexpected type",
                    self.interface
                );
            }
        }
    }
}

/// Resolves dependencies from the extension loader: the dependency point's
/// adaptive instance, so the concrete implementation is still chosen per
/// call from the URL.
pub struct SpiExtensionFactory {
    registry: WeakRegistry,
}

impl ExtensionFactory for SpiExtensionFactory {
    fn resolve(
        &self,
        target: TypeId,
        property: &str,
    ) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        let registry = self.registry.upgrade()?;
        let point = registry.erased_point(target)?;
        match point.adaptive_any() {
            Ok(any) => Some(any),
            Err(e) => {
                tracing::debug!(
                    "no adaptive instance of {} available for property '{property}': {e}",
                    point.interface()
                );
                None
            }
        }
    }
}

/// Resolves dependencies from the registry's [`ObjectContainer`]
/// (externally managed objects).
///
/// [`ObjectContainer`]: super::registry::ObjectContainer
pub struct ContainerExtensionFactory {
    registry: WeakRegistry,
}

impl ExtensionFactory for ContainerExtensionFactory {
    fn resolve(
        &self,
        target: TypeId,
        property: &str,
    ) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        let registry = self.registry.upgrade()?;
        registry.container().resolve(target, property)
    }
}

/// The factory point's adaptive implementation: every discovered factory,
/// tried in sorted-name order until one resolves.
pub struct AdaptiveExtensionFactory {
    factories: Vec<Arc<dyn ExtensionFactory>>,
}

impl ExtensionFactory for AdaptiveExtensionFactory {
    fn resolve(
        &self,
        target: TypeId,
        property: &str,
    ) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        self.factories
            .iter()
            .find_map(|factory| factory.resolve(target, property))
    }
}

const FACTORY_RESOURCE: &str = "\
adaptive=spindle.extension.AdaptiveExtensionFactory
spi=spindle.extension.SpiExtensionFactory
container=spindle.extension.ContainerExtensionFactory
";

/// Installs the factory point into a fresh registry: the embedded resource
/// binding the built-in names plus the provider stubs behind them.
pub(crate) fn install_builtin_factories(registry: &ExtensionRegistry) {
    registry.add_embedded_resource(
        INTERNAL_DIRECTORY,
        <dyn ExtensionFactory as Spi>::INTERFACE,
        FACTORY_RESOURCE,
    );

    let loader: ExtensionLoader<dyn ExtensionFactory> = registry.loader();
    loader.register_provider(ExtensionProvider::<dyn ExtensionFactory>::adaptive(
        "spindle.extension.AdaptiveExtensionFactory",
        |ctx| {
            let loader: ExtensionLoader<dyn ExtensionFactory> = ctx.registry().loader();
            let mut factories = Vec::new();
            for name in loader.supported_extensions()? {
                factories.push(loader.get(&name)?);
            }
            Ok(Arc::new(AdaptiveExtensionFactory { factories }) as Arc<dyn ExtensionFactory>)
        },
    ));
    loader.register_provider(ExtensionProvider::<dyn ExtensionFactory>::named(
        "spindle.extension.SpiExtensionFactory",
        |ctx| {
            Ok(Arc::new(SpiExtensionFactory {
                registry: ctx.registry().downgrade(),
            }) as Arc<dyn ExtensionFactory>)
        },
    ));
    loader.register_provider(ExtensionProvider::<dyn ExtensionFactory>::named(
        "spindle.extension.ContainerExtensionFactory",
        |ctx| {
            Ok(Arc::new(ContainerExtensionFactory {
                registry: ctx.registry().downgrade(),
            }) as Arc<dyn ExtensionFactory>)
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Clockwork: Send + Sync {
        fn tick(&self) -> u64;
    }

    impl Spi for dyn Clockwork {
        const INTERFACE: &'static str = "demo.Clockwork";
    }

    struct FixedClock(u64);

    impl Clockwork for FixedClock {
        fn tick(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_factory_point_bootstraps() {
        let registry = ExtensionRegistry::new();
        let loader: ExtensionLoader<dyn ExtensionFactory> = registry.loader();
        let supported = loader.supported_extensions().unwrap();
        assert!(supported.contains("spi"));
        assert!(supported.contains("container"));
        // the adaptive implementation is not a named extension
        assert!(!supported.contains("adaptive"));
        loader.get_adaptive().unwrap();
    }

    #[test]
    fn test_adaptive_factory_is_singleton() {
        let registry = ExtensionRegistry::new();
        let loader: ExtensionLoader<dyn ExtensionFactory> = registry.loader();
        let a = loader.get_adaptive().unwrap();
        let b = loader.get_adaptive().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_container_resolution_through_adaptive() {
        let registry = ExtensionRegistry::new();
        registry
            .container()
            .put::<dyn Clockwork>("clock", Arc::new(FixedClock(7)));

        let factory = registry
            .loader::<dyn ExtensionFactory>()
            .get_adaptive()
            .unwrap();
        let clock = resolve_extension::<dyn Clockwork>(factory.as_ref(), "clock").unwrap();
        assert_eq!(clock.tick(), 7);
    }

    #[test]
    fn test_unresolvable_dependency_is_none() {
        let registry = ExtensionRegistry::new();
        let factory = registry
            .loader::<dyn ExtensionFactory>()
            .get_adaptive()
            .unwrap();
        assert!(resolve_extension::<dyn Clockwork>(factory.as_ref(), "clock").is_none());
    }
}
