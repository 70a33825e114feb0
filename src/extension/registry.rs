//! The process registry owning every extension point.
//!
//! [`ExtensionRegistry`] is an explicit, cloneable handle. Production code
//! normally works against [`ExtensionRegistry::global`]; tests construct
//! private registries so discovery state never leaks between cases.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, PoisonError, RwLock, Weak};

use super::error::ExtensionError;
use super::factory::install_builtin_factories;
use super::loader::{ExtensionLoader, PointState};
use super::resource::EmbeddedResource;
use super::Spi;

/// Environment variable seeding the global registry's search path
/// (colon-separated filesystem roots).
pub const EXTENSION_PATH_ENV: &str = "SPINDLE_EXTENSION_PATH";

static GLOBAL: LazyLock<ExtensionRegistry> = LazyLock::new(|| {
    let registry = ExtensionRegistry::new();
    if let Ok(path) = std::env::var(EXTENSION_PATH_ENV) {
        for root in path.split(':').filter(|s| !s.is_empty()) {
            registry.add_resource_root(root);
        }
    }
    registry
});

struct PointEntry {
    typed: Box<dyn Any + Send + Sync>,
    erased: Arc<dyn ErasedPoint>,
}

pub(crate) struct RegistryInner {
    points: RwLock<HashMap<TypeId, PointEntry>>,
    resource_roots: RwLock<Vec<PathBuf>>,
    embedded: RwLock<Vec<EmbeddedResource>>,
    container: ObjectContainer,
}

/// Handle to a registry of extension points.
#[derive(Clone)]
pub struct ExtensionRegistry {
    inner: Arc<RegistryInner>,
}

impl ExtensionRegistry {
    /// Creates an empty registry with the built-in factory point installed.
    pub fn new() -> Self {
        let registry = Self {
            inner: Arc::new(RegistryInner {
                points: RwLock::new(HashMap::new()),
                resource_roots: RwLock::new(Vec::new()),
                embedded: RwLock::new(Vec::new()),
                container: ObjectContainer::default(),
            }),
        };
        install_builtin_factories(&registry);
        registry
    }

    /// The process-wide registry, search path seeded from
    /// [`EXTENSION_PATH_ENV`].
    pub fn global() -> &'static ExtensionRegistry {
        &GLOBAL
    }

    /// Returns the loader for the extension point `P`, creating its state on
    /// first request.
    pub fn loader<P: Spi + ?Sized>(&self) -> ExtensionLoader<P> {
        let key = TypeId::of::<P>();
        {
            let points = self
                .inner
                .points
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = points.get(&key) {
                return ExtensionLoader::from_parts(self.clone(), Self::typed_state(entry));
            }
        }

        let mut points = self
            .inner
            .points
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = points.entry(key).or_insert_with(|| {
            let state: Arc<PointState<P>> = Arc::new(PointState::new());
            PointEntry {
                typed: Box::new(state.clone()),
                erased: Arc::new(ErasedHandle {
                    registry: self.downgrade(),
                    state,
                }),
            }
        });
        ExtensionLoader::from_parts(self.clone(), Self::typed_state(entry))
    }

    fn typed_state<P: Spi + ?Sized>(entry: &PointEntry) -> Arc<PointState<P>> {
        entry
            .typed
            .downcast_ref::<Arc<PointState<P>>>()
            .expect("point entry type matches its TypeId key")
            .clone()
    }

    /// Adds a filesystem root to the resource search path.
    pub fn add_resource_root(&self, root: impl Into<PathBuf>) {
        self.inner
            .resource_roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(root.into());
    }

    /// Builder-style variant of [`add_resource_root`](Self::add_resource_root).
    pub fn with_resource_root(self, root: impl Into<PathBuf>) -> Self {
        self.add_resource_root(root);
        self
    }

    /// Registers a compiled-in resource, the equivalent of a file shipped
    /// inside an archive on the search path.
    pub fn add_embedded_resource(
        &self,
        directory: &'static str,
        interface: impl Into<String>,
        content: impl Into<String>,
    ) {
        self.inner
            .embedded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(EmbeddedResource {
                directory,
                interface: interface.into(),
                content: content.into(),
            });
    }

    /// The object store backing the `container` extension factory.
    pub fn container(&self) -> &ObjectContainer {
        &self.inner.container
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    pub(crate) fn erased_point(&self, target: TypeId) -> Option<Arc<dyn ErasedPoint>> {
        self.inner
            .points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target)
            .map(|entry| entry.erased.clone())
    }

    pub(crate) fn resource_roots(&self) -> Vec<PathBuf> {
        self.inner
            .resource_roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn embedded_resources(&self) -> Vec<EmbeddedResource> {
        self.inner
            .embedded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let points = self
            .inner
            .points
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let interfaces: Vec<&str> = points.values().map(|e| e.erased.interface()).collect();
        f.debug_struct("ExtensionRegistry")
            .field("points", &interfaces)
            .finish()
    }
}

/// Non-owning registry handle, held by instances that live inside the
/// registry itself so no reference cycle forms.
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<ExtensionRegistry> {
        self.0.upgrade().map(|inner| ExtensionRegistry { inner })
    }
}

/// Type-erased view of one extension point, used by the factory layer to
/// resolve dependencies without knowing the point type.
pub(crate) trait ErasedPoint: Send + Sync {
    fn interface(&self) -> &'static str;

    /// The point's adaptive instance, boxed as `Arc<P>`.
    fn adaptive_any(&self) -> Result<Box<dyn Any + Send + Sync>, ExtensionError>;
}

struct ErasedHandle<P: Spi + ?Sized> {
    registry: WeakRegistry,
    state: Arc<PointState<P>>,
}

impl<P: Spi + ?Sized> ErasedPoint for ErasedHandle<P> {
    fn interface(&self) -> &'static str {
        P::INTERFACE
    }

    fn adaptive_any(&self) -> Result<Box<dyn Any + Send + Sync>, ExtensionError> {
        let registry = self.registry.upgrade().ok_or(ExtensionError::Instantiation {
            interface: P::INTERFACE,
            name: "adaptive".to_string(),
            reason: "extension registry has been dropped".to_string(),
        })?;
        let loader = ExtensionLoader::from_parts(registry, self.state.clone());
        let instance = loader.get_adaptive()?;
        Ok(Box::new(instance))
    }
}

type ProduceFn = Box<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Store of externally managed objects, resolvable by extension-point type
/// and property name. This is the "external DI container" the `container`
/// extension factory defers to.
#[derive(Default)]
pub struct ObjectContainer {
    entries: RwLock<HashMap<(TypeId, Option<String>), ProduceFn>>,
}

impl ObjectContainer {
    /// Registers an object under a property name.
    pub fn put<D: Spi + ?Sized>(&self, name: impl Into<String>, value: Arc<D>) {
        self.insert(TypeId::of::<D>(), Some(name.into()), value);
    }

    /// Registers an object resolvable by type alone.
    pub fn put_type<D: Spi + ?Sized>(&self, value: Arc<D>) {
        self.insert(TypeId::of::<D>(), None, value);
    }

    fn insert<D: Spi + ?Sized>(&self, type_id: TypeId, name: Option<String>, value: Arc<D>) {
        let produce: ProduceFn = Box::new(move || Box::new(value.clone()));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((type_id, name), produce);
    }

    /// Typed lookup by property name, then by type alone.
    pub fn get<D: Spi + ?Sized>(&self, name: &str) -> Option<Arc<D>> {
        self.resolve(TypeId::of::<D>(), name)
            .and_then(|any| any.downcast::<Arc<D>>().ok())
            .map(|boxed| *boxed)
    }

    pub(crate) fn resolve(
        &self,
        target: TypeId,
        property: &str,
    ) -> Option<Box<dyn Any + Send + Sync>> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&(target, Some(property.to_string())))
            .or_else(|| entries.get(&(target, None)))
            .map(|produce| produce())
    }
}

impl std::fmt::Debug for ObjectContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ObjectContainer")
            .field("entries", &entries.len())
            .finish()
    }
}
