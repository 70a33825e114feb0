//! Per-point state and the public loader surface: lazy class discovery,
//! singleton instance building, wrapper decoration, and the adaptive cell.

use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use super::error::{ExtensionError, LoadFailure};
use super::factory::{BuildContext, ExtensionFactory};
use super::provider::{Activate, ExtensionProvider};
use super::registry::{ExtensionRegistry, WeakRegistry};
use super::resource::{parse_records, ResourceReader, SEARCH_DIRECTORIES};
use super::{interface_short, Spi};

/// Reserved name resolving to the configured default extension.
pub const TRUE_NAME: &str = "true";

type InstanceCell<P> = Arc<Mutex<Option<Arc<P>>>>;

/// The classified view of every discovered implementation, published once
/// per point and replaced wholesale by the test-only mutation API.
pub(crate) struct LoadedClasses<P: Spi + ?Sized> {
    pub(crate) names: BTreeMap<String, Arc<ExtensionProvider<P>>>,
    /// First bound name per provider type.
    pub(crate) name_of: HashMap<&'static str, String>,
    /// Wrappers in application order (sorted by type name).
    pub(crate) wrappers: Vec<Arc<ExtensionProvider<P>>>,
    pub(crate) adaptive: Option<Arc<ExtensionProvider<P>>>,
    /// `(first name, metadata)` per activate-tagged provider, in discovery
    /// order.
    pub(crate) activates: Vec<(String, Activate)>,
    pub(crate) default_name: Option<String>,
    pub(crate) failures: Vec<LoadFailure>,
}

impl<P: Spi + ?Sized> Clone for LoadedClasses<P> {
    fn clone(&self) -> Self {
        Self {
            names: self.names.clone(),
            name_of: self.name_of.clone(),
            wrappers: self.wrappers.clone(),
            adaptive: self.adaptive.clone(),
            activates: self.activates.clone(),
            default_name: self.default_name.clone(),
            failures: self.failures.clone(),
        }
    }
}

struct AdaptiveCell<P: Spi + ?Sized> {
    instance: Option<Arc<P>>,
    /// First creation failure, re-raised verbatim on every later call.
    error: Option<Arc<ExtensionError>>,
}

pub(crate) struct PointState<P: Spi + ?Sized> {
    providers: RwLock<HashMap<&'static str, Arc<ExtensionProvider<P>>>>,
    loaded: RwLock<Option<Arc<LoadedClasses<P>>>>,
    load_lock: Mutex<()>,
    instances: RwLock<HashMap<String, InstanceCell<P>>>,
    raws: RwLock<HashMap<&'static str, InstanceCell<P>>>,
    adaptive: Mutex<AdaptiveCell<P>>,
}

impl<P: Spi + ?Sized> PointState<P> {
    pub(crate) fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            loaded: RwLock::new(None),
            load_lock: Mutex::new(()),
            instances: RwLock::new(HashMap::new()),
            raws: RwLock::new(HashMap::new()),
            adaptive: Mutex::new(AdaptiveCell {
                instance: None,
                error: None,
            }),
        }
    }
}

/// Loader handle for one extension point.
///
/// Handles are cheap to clone and all share the point's state: repeated
/// lookups of the same name observe one instance, process-wide.
pub struct ExtensionLoader<P: Spi + ?Sized> {
    registry: ExtensionRegistry,
    state: Arc<PointState<P>>,
}

impl<P: Spi + ?Sized> Clone for ExtensionLoader<P> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            state: self.state.clone(),
        }
    }
}

impl<P: Spi + ?Sized> std::fmt::Debug for ExtensionLoader<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionLoader")
            .field("interface", &P::INTERFACE)
            .finish()
    }
}

impl<P: Spi + ?Sized> ExtensionLoader<P> {
    pub(crate) fn from_parts(registry: ExtensionRegistry, state: Arc<PointState<P>>) -> Self {
        Self { registry, state }
    }

    /// The registry this loader belongs to.
    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Downgrades to a non-owning handle, for dispatchers and other
    /// instances cached inside the point itself.
    pub fn downgrade(&self) -> WeakLoader<P> {
        WeakLoader {
            registry: self.registry.downgrade(),
            state: Arc::downgrade(&self.state),
        }
    }

    #[cfg(test)]
    pub(crate) fn shares_state_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Registers a provider stub in this point's catalog. Must happen before
    /// the point's classes are first loaded to be visible to discovery.
    pub fn register_provider(&self, provider: ExtensionProvider<P>) {
        let loaded = self
            .state
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if loaded {
            tracing::warn!(
                "provider {} registered after {} classes were loaded; it will not be discovered",
                provider.type_name(),
                P::INTERFACE
            );
        }
        let mut providers = self
            .state
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if providers
            .insert(provider.type_name(), Arc::new(provider))
            .is_some()
        {
            tracing::warn!("replaced an existing provider stub for {}", P::INTERFACE);
        }
    }

    /// Returns the extension bound to `name`, building it on first use.
    ///
    /// The reserved name `"true"` resolves to the configured default.
    pub fn get(&self, name: &str) -> Result<Arc<P>, ExtensionError> {
        if name.is_empty() {
            return Err(ExtensionError::EmptyName {
                interface: P::INTERFACE,
            });
        }
        if name == TRUE_NAME {
            let loaded = self.classes()?;
            return match loaded.default_name.clone() {
                Some(default) => self.get(&default),
                None => Err(ExtensionError::not_found(
                    P::INTERFACE,
                    TRUE_NAME,
                    &loaded.failures,
                )),
            };
        }

        let cell = self.instance_cell(name);
        let mut guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(instance) = &*guard {
            return Ok(instance.clone());
        }
        let instance = self.create_extension(name)?;
        *guard = Some(instance.clone());
        Ok(instance)
    }

    /// The default extension, or `None` when the point declares no default.
    pub fn get_default(&self) -> Result<Option<Arc<P>>, ExtensionError> {
        let loaded = self.classes()?;
        match loaded.default_name.clone() {
            Some(default) => self.get(&default).map(Some),
            None => Ok(None),
        }
    }

    /// The point's adaptive instance: a discovered adaptive implementation
    /// when one exists, otherwise the point's generated dispatcher.
    ///
    /// Creation failure is sticky. The first error is remembered and every
    /// later call re-raises it with the original cause, so broken dispatcher
    /// construction is not re-run.
    pub fn get_adaptive(&self) -> Result<Arc<P>, ExtensionError> {
        let mut cell = self
            .state
            .adaptive
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(instance) = &cell.instance {
            return Ok(instance.clone());
        }
        if let Some(source) = &cell.error {
            return Err(ExtensionError::AdaptiveCreation {
                interface: P::INTERFACE,
                source: source.clone(),
            });
        }
        match self.create_adaptive() {
            Ok(instance) => {
                cell.instance = Some(instance.clone());
                Ok(instance)
            }
            Err(e) => {
                let source = Arc::new(e);
                cell.error = Some(source.clone());
                Err(ExtensionError::AdaptiveCreation {
                    interface: P::INTERFACE,
                    source,
                })
            }
        }
    }

    /// Whether `name` is bound for this point. Never triggers instance
    /// construction; a failed load reads as absent.
    pub fn has_extension(&self, name: &str) -> bool {
        self.classes()
            .map(|loaded| loaded.names.contains_key(name))
            .unwrap_or(false)
    }

    /// All bound names, sorted.
    pub fn supported_extensions(&self) -> Result<BTreeSet<String>, ExtensionError> {
        Ok(self.classes()?.names.keys().cloned().collect())
    }

    /// Names whose instances have already been built, sorted. Never triggers
    /// loading or construction.
    pub fn loaded_extensions(&self) -> BTreeSet<String> {
        let snapshot: Vec<(String, InstanceCell<P>)> = {
            let instances = self
                .state
                .instances
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            instances
                .iter()
                .map(|(name, cell)| (name.clone(), cell.clone()))
                .collect()
        };
        snapshot
            .into_iter()
            .filter(|(_, cell)| {
                cell.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
            })
            .map(|(name, _)| name)
            .collect()
    }

    /// The already-built instance for `name`, if any. Never triggers
    /// construction.
    pub fn get_loaded(&self, name: &str) -> Option<Arc<P>> {
        let cell = {
            let instances = self
                .state
                .instances
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            instances.get(name)?.clone()
        };
        let guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    /// The configured default name, if any.
    pub fn default_extension_name(&self) -> Result<Option<String>, ExtensionError> {
        Ok(self.classes()?.default_name.clone())
    }

    /// The first short name bound to a provider type, if discovered.
    pub fn extension_name(&self, type_name: &str) -> Option<String> {
        self.classes().ok()?.name_of.get(type_name).cloned()
    }

    /// Binds a new extension after discovery. Intended for tests.
    pub fn add_extension(
        &self,
        name: &str,
        provider: ExtensionProvider<P>,
    ) -> Result<(), ExtensionError> {
        let loaded = self.classes()?;
        let provider = Arc::new(provider);
        let mut updated = (*loaded).clone();

        if provider.is_adaptive() {
            if let Some(existing) = &loaded.adaptive {
                return Err(ExtensionError::AmbiguousAdaptive {
                    interface: P::INTERFACE,
                    first: existing.type_name().to_string(),
                    second: provider.type_name().to_string(),
                });
            }
            updated.adaptive = Some(provider.clone());
        } else if provider.is_wrapper() {
            updated.wrappers.push(provider.clone());
            updated.wrappers.sort_by_key(|w| w.type_name());
        } else {
            if name.is_empty() {
                return Err(ExtensionError::EmptyName {
                    interface: P::INTERFACE,
                });
            }
            if loaded.names.contains_key(name) {
                return Err(ExtensionError::AlreadyRegistered {
                    interface: P::INTERFACE,
                    name: name.to_string(),
                });
            }
            if let Some(activate) = provider.activate() {
                updated.activates.push((name.to_string(), activate.clone()));
            }
            updated
                .name_of
                .entry(provider.type_name())
                .or_insert_with(|| name.to_string());
            updated.names.insert(name.to_string(), provider.clone());
        }

        self.register_catalog(provider);
        self.publish(updated);
        Ok(())
    }

    /// Replaces an existing binding and drops its cached instance. Intended
    /// for tests.
    pub fn replace_extension(
        &self,
        name: &str,
        provider: ExtensionProvider<P>,
    ) -> Result<(), ExtensionError> {
        let loaded = self.classes()?;
        let provider = Arc::new(provider);
        let mut updated = (*loaded).clone();

        if provider.is_adaptive() {
            if loaded.adaptive.is_none() {
                return Err(ExtensionError::NotRegistered {
                    interface: P::INTERFACE,
                    name: "adaptive".to_string(),
                });
            }
            updated.adaptive = Some(provider.clone());
            self.register_catalog(provider);
            self.publish(updated);
            let mut cell = self
                .state
                .adaptive
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cell.instance = None;
            cell.error = None;
        } else if provider.is_wrapper() {
            let slot = updated
                .wrappers
                .iter()
                .position(|w| w.type_name() == provider.type_name())
                .ok_or_else(|| ExtensionError::NotRegistered {
                    interface: P::INTERFACE,
                    name: provider.type_name().to_string(),
                })?;
            updated.wrappers[slot] = provider.clone();
            self.register_catalog(provider);
            self.publish(updated);
        } else {
            if name.is_empty() {
                return Err(ExtensionError::EmptyName {
                    interface: P::INTERFACE,
                });
            }
            if !loaded.names.contains_key(name) {
                return Err(ExtensionError::NotRegistered {
                    interface: P::INTERFACE,
                    name: name.to_string(),
                });
            }
            updated.names.insert(name.to_string(), provider.clone());
            updated
                .name_of
                .insert(provider.type_name(), name.to_string());
            self.register_catalog(provider);
            self.publish(updated);
            self.state
                .instances
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
        }
        Ok(())
    }

    fn register_catalog(&self, provider: Arc<ExtensionProvider<P>>) {
        self.state
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider.type_name(), provider);
    }

    fn publish(&self, updated: LoadedClasses<P>) {
        *self
            .state
            .loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(updated));
    }

    /// Double-checked lazy load of the point's classified classes.
    pub(crate) fn classes(&self) -> Result<Arc<LoadedClasses<P>>, ExtensionError> {
        if let Some(loaded) = &*self
            .state
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Ok(loaded.clone());
        }
        let _guard = self
            .state
            .load_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(loaded) = &*self
            .state
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Ok(loaded.clone());
        }
        let loaded = Arc::new(self.load_classes()?);
        *self
            .state
            .loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(loaded.clone());
        Ok(loaded)
    }

    fn load_classes(&self) -> Result<LoadedClasses<P>, ExtensionError> {
        let default_name = match P::DEFAULT_NAME {
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.contains(',') {
                    return Err(ExtensionError::MultipleDefaults {
                        interface: P::INTERFACE,
                        names: trimmed.to_string(),
                    });
                }
                if trimmed.is_empty() || trimmed == TRUE_NAME {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            None => None,
        };

        let mut loaded = LoadedClasses {
            names: BTreeMap::new(),
            name_of: HashMap::new(),
            wrappers: Vec::new(),
            adaptive: None,
            activates: Vec::new(),
            default_name,
            failures: Vec::new(),
        };

        let short = interface_short(P::INTERFACE);
        let catalog: HashMap<&'static str, Arc<ExtensionProvider<P>>> = self
            .state
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let reader = ResourceReader::new(
            self.registry.resource_roots(),
            self.registry.embedded_resources(),
        );

        for directory in SEARCH_DIRECTORIES {
            for (origin, content) in reader.resources(directory, P::INTERFACE) {
                for record in parse_records(&content) {
                    let Some(provider) = catalog.get(record.type_name.as_str()) else {
                        tracing::debug!(
                            "unresolvable extension record '{}' for {} in {origin}",
                            record.line,
                            P::INTERFACE
                        );
                        loaded.failures.push(LoadFailure {
                            line: record.line.clone(),
                            message: format!(
                                "extension provider '{}' is not registered (from {origin})",
                                record.type_name
                            ),
                        });
                        continue;
                    };
                    self.classify(provider, &record, short, &origin, &mut loaded)?;
                }
            }
        }

        loaded.wrappers.sort_by_key(|w| w.type_name());
        Ok(loaded)
    }

    fn classify(
        &self,
        provider: &Arc<ExtensionProvider<P>>,
        record: &super::resource::RawRecord,
        interface_short: &str,
        origin: &str,
        loaded: &mut LoadedClasses<P>,
    ) -> Result<(), ExtensionError> {
        if provider.is_adaptive() {
            if let Some(existing) = &loaded.adaptive
                && existing.type_name() != provider.type_name()
            {
                return Err(ExtensionError::AmbiguousAdaptive {
                    interface: P::INTERFACE,
                    first: existing.type_name().to_string(),
                    second: provider.type_name().to_string(),
                });
            }
            loaded.adaptive = Some(provider.clone());
            return Ok(());
        }

        if provider.is_wrapper() {
            if !loaded
                .wrappers
                .iter()
                .any(|w| w.type_name() == provider.type_name())
            {
                loaded.wrappers.push(provider.clone());
            }
            return Ok(());
        }

        let names: Vec<String> = if record.names.is_empty() {
            match provider.derived_name(interface_short) {
                Some(name) => vec![name],
                None => {
                    loaded.failures.push(LoadFailure {
                        line: record.line.clone(),
                        message: format!(
                            "no extension name for provider '{}' (from {origin}) and none could be derived",
                            provider.type_name()
                        ),
                    });
                    return Ok(());
                }
            }
        } else {
            record.names.clone()
        };

        if let Some(activate) = provider.activate()
            && !loaded.activates.iter().any(|(n, _)| n == &names[0])
        {
            loaded.activates.push((names[0].clone(), activate.clone()));
        }
        loaded
            .name_of
            .entry(provider.type_name())
            .or_insert_with(|| names[0].clone());

        for name in names {
            match loaded.names.get(&name) {
                Some(existing) if existing.type_name() != provider.type_name() => {
                    return Err(ExtensionError::DuplicateName {
                        interface: P::INTERFACE,
                        name,
                        first: existing.type_name().to_string(),
                        second: provider.type_name().to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    loaded.names.insert(name, provider.clone());
                }
            }
        }
        Ok(())
    }

    fn instance_cell(&self, name: &str) -> InstanceCell<P> {
        {
            let instances = self
                .state
                .instances
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(cell) = instances.get(name) {
                return cell.clone();
            }
        }
        self.state
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn create_extension(&self, name: &str) -> Result<Arc<P>, ExtensionError> {
        let loaded = self.classes()?;
        let provider = loaded
            .names
            .get(name)
            .ok_or_else(|| ExtensionError::not_found(P::INTERFACE, name, &loaded.failures))?;

        let ctx = self.build_context()?;
        let raw = self
            .raw_instance(provider, &ctx)
            .map_err(|e| self.instantiation(name, e))?;

        let mut instance = raw;
        for wrapper in &loaded.wrappers {
            instance = wrapper
                .wrap(instance, &ctx)
                .map_err(|e| self.instantiation(name, e))?;
        }
        Ok(instance)
    }

    fn instantiation(&self, name: &str, cause: ExtensionError) -> ExtensionError {
        ExtensionError::Instantiation {
            interface: P::INTERFACE,
            name: name.to_string(),
            reason: cause.to_string(),
        }
    }

    /// One raw (pre-wrapping) instance per provider type, shared across all
    /// of its names.
    fn raw_instance(
        &self,
        provider: &Arc<ExtensionProvider<P>>,
        ctx: &BuildContext<'_>,
    ) -> Result<Arc<P>, ExtensionError> {
        let cell = {
            let raws = self
                .state
                .raws
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            raws.get(provider.type_name()).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => self
                .state
                .raws
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(provider.type_name())
                .or_default()
                .clone(),
        };

        let mut guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(raw) = &*guard {
            return Ok(raw.clone());
        }
        let raw = provider.construct(ctx)?;
        *guard = Some(raw.clone());
        Ok(raw)
    }

    fn create_adaptive(&self) -> Result<Arc<P>, ExtensionError> {
        let loaded = self.classes()?;
        if let Some(provider) = &loaded.adaptive {
            let ctx = self.build_context()?;
            return provider.construct(&ctx);
        }
        P::dispatcher(self)
    }

    pub(crate) fn build_context(&self) -> Result<BuildContext<'_>, ExtensionError> {
        let factory = if TypeId::of::<P>() == TypeId::of::<dyn ExtensionFactory>() {
            None
        } else {
            Some(
                self.registry
                    .loader::<dyn ExtensionFactory>()
                    .get_adaptive()?,
            )
        };
        Ok(BuildContext::new(&self.registry, factory, P::INTERFACE))
    }
}

/// Non-owning loader handle. Dispatchers cached inside a point hold one of
/// these so the registry never owns a cycle through its own instances.
pub struct WeakLoader<P: Spi + ?Sized> {
    registry: WeakRegistry,
    state: Weak<PointState<P>>,
}

impl<P: Spi + ?Sized> Clone for WeakLoader<P> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            state: self.state.clone(),
        }
    }
}

impl<P: Spi + ?Sized> WeakLoader<P> {
    pub fn upgrade(&self) -> Option<ExtensionLoader<P>> {
        Some(ExtensionLoader {
            registry: self.registry.upgrade()?,
            state: self.state.upgrade()?,
        })
    }
}
