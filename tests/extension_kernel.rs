//! End-to-end coverage of the extension kernel: discovery through adaptive
//! dispatch, activation, injection, and filter assembly working together.

use std::sync::Arc;
use std::sync::Mutex;

use spindle::cluster::{calculate_warmup_weight, effective_weight, TIMESTAMP_KEY, WEIGHT_KEY};
use spindle::extension::{
    Activate, AdaptiveMethod, ExtensionError, ExtensionLoader, ExtensionProvider,
    ExtensionRegistry, Spi, WeakLoader,
};
use spindle::rpc::{
    build_filter_chain, Exporter, Filter, FilterProtocol, Invocation, Invoker, Protocol, RpcError,
    RpcResult, TpsLimitFilter, SERVICE_FILTER_KEY,
};
use spindle::Url;

// ---------------------------------------------------------------------------
// A cache point with a generated dispatcher, used to exercise adaptive
// dispatch and injection.

trait Cache: Send + Sync {
    fn label(&self, url: &Url) -> Result<String, ExtensionError>;
}

impl Spi for dyn Cache {
    const INTERFACE: &'static str = "it.Cache";
    const DEFAULT_NAME: Option<&'static str> = Some("lru");

    fn dispatcher(loader: &ExtensionLoader<Self>) -> Result<Arc<Self>, ExtensionError> {
        Ok(Arc::new(AdaptiveCache {
            loader: loader.downgrade(),
        }))
    }
}

const LABEL: AdaptiveMethod = AdaptiveMethod::new("label", &["cache"]);

struct AdaptiveCache {
    loader: WeakLoader<dyn Cache>,
}

impl Cache for AdaptiveCache {
    fn label(&self, url: &Url) -> Result<String, ExtensionError> {
        let loader = self.loader.upgrade().expect("registry alive");
        loader.adaptive_target(&LABEL, Some(url), None)?.label(url)
    }
}

struct LruCache;

impl Cache for LruCache {
    fn label(&self, _url: &Url) -> Result<String, ExtensionError> {
        Ok("lru".to_string())
    }
}

struct FifoCache;

impl Cache for FifoCache {
    fn label(&self, _url: &Url) -> Result<String, ExtensionError> {
        Ok("fifo".to_string())
    }
}

fn install_cache_point(registry: &ExtensionRegistry) {
    registry.add_embedded_resource(
        "META-INF/dubbo",
        "it.Cache",
        "lru=it.LruCache\nfifo=it.FifoCache\n",
    );
    let loader = registry.loader::<dyn Cache>();
    loader.register_provider(ExtensionProvider::named("it.LruCache", |_ctx| {
        Ok(Arc::new(LruCache) as Arc<dyn Cache>)
    }));
    loader.register_provider(ExtensionProvider::named("it.FifoCache", |_ctx| {
        Ok(Arc::new(FifoCache) as Arc<dyn Cache>)
    }));
}

#[test]
fn adaptive_dispatch_routes_and_defaults() {
    let registry = ExtensionRegistry::new();
    install_cache_point(&registry);
    let loader = registry.loader::<dyn Cache>();
    let cache = loader.get_adaptive().unwrap();

    let fifo = Url::new("test").with_parameter("cache", "fifo");
    assert_eq!(cache.label(&fifo).unwrap(), "fifo");

    // absent key falls back to the point default
    assert_eq!(cache.label(&Url::new("test")).unwrap(), "lru");

    // an unknown name surfaces the not-found diagnostics
    let unknown = Url::new("test").with_parameter("cache", "arc");
    let err = cache.label(&unknown).unwrap_err();
    assert!(err.to_string().contains("no such extension 'arc'"));
}

#[test]
fn adaptive_singleton_across_threads() {
    let registry = ExtensionRegistry::new();
    install_cache_point(&registry);
    let loader = registry.loader::<dyn Cache>();

    let instances: Vec<Arc<dyn Cache>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let loader = loader.clone();
                scope.spawn(move || loader.get_adaptive().unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for instance in &instances[1..] {
        assert!(Arc::ptr_eq(&instances[0], instance));
    }
}

#[test]
fn per_method_key_consults_scoped_parameter_first() {
    let registry = ExtensionRegistry::new();
    install_cache_point(&registry);
    let loader = registry.loader::<dyn Cache>();

    let url = Url::new("test")
        .with_parameter("cache", "lru")
        .with_parameter("evict.cache", "fifo");

    let scoped = loader
        .adaptive_target(&LABEL, Some(&url), Some("evict"))
        .unwrap();
    assert_eq!(scoped.label(&url).unwrap(), "fifo");

    let plain = loader
        .adaptive_target(&LABEL, Some(&url), Some("insert"))
        .unwrap();
    assert_eq!(plain.label(&url).unwrap(), "lru");
}

#[test]
fn fallback_chain_across_two_keys() {
    let registry = ExtensionRegistry::new();
    install_cache_point(&registry);
    let loader = registry.loader::<dyn Cache>();
    let label = AdaptiveMethod::new("label", &["cache.primary", "cache"]);

    let both = Url::new("test")
        .with_parameter("cache.primary", "fifo")
        .with_parameter("cache", "lru");
    let target = loader.adaptive_target(&label, Some(&both), None).unwrap();
    assert_eq!(target.label(&both).unwrap(), "fifo");

    let later_only = Url::new("test").with_parameter("cache", "fifo");
    let target = loader
        .adaptive_target(&label, Some(&later_only), None)
        .unwrap();
    assert_eq!(target.label(&later_only).unwrap(), "fifo");

    let neither = Url::new("test");
    let target = loader.adaptive_target(&label, Some(&neither), None).unwrap();
    assert_eq!(target.label(&neither).unwrap(), "lru");
}

// ---------------------------------------------------------------------------
// Injection: a repository point whose implementation receives the cache
// point's adaptive instance through the extension factory.

trait Repository: Send + Sync {
    fn describe(&self, url: &Url) -> String;
}

impl Spi for dyn Repository {
    const INTERFACE: &'static str = "it.Repository";
}

struct DbRepository {
    cache: Option<Arc<dyn Cache>>,
}

impl Repository for DbRepository {
    fn describe(&self, url: &Url) -> String {
        match &self.cache {
            Some(cache) => format!("db+{}", cache.label(url).unwrap_or_else(|e| e.to_string())),
            None => "db".to_string(),
        }
    }
}

#[test]
fn injection_resolves_the_dependency_points_adaptive() {
    let registry = ExtensionRegistry::new();
    install_cache_point(&registry);
    registry.add_embedded_resource("META-INF/dubbo", "it.Repository", "db=it.DbRepository\n");
    let loader = registry.loader::<dyn Repository>();
    loader.register_provider(ExtensionProvider::named("it.DbRepository", |ctx| {
        let mut repo = DbRepository { cache: None };
        ctx.inject::<dyn Cache>("cache", |cache| repo.cache = Some(cache));
        Ok(Arc::new(repo) as Arc<dyn Repository>)
    }));

    let repo = loader.get("db").unwrap();
    // the injected instance is the adaptive dispatcher: selection still
    // happens per call, from the URL
    let url = Url::new("test").with_parameter("cache", "fifo");
    assert_eq!(repo.describe(&url), "db+fifo");
    assert_eq!(repo.describe(&Url::new("test")), "db+lru");
}

#[test]
fn injection_is_best_effort() {
    let registry = ExtensionRegistry::new();
    registry.add_embedded_resource("META-INF/dubbo", "it.Repository", "db=it.DbRepository\n");
    let loader = registry.loader::<dyn Repository>();
    loader.register_provider(ExtensionProvider::named("it.DbRepository", |ctx| {
        let mut repo = DbRepository { cache: None };
        // the cache point was never installed in this registry; the
        // dependency silently stays unset
        ctx.inject::<dyn Cache>("cache", |cache| repo.cache = Some(cache));
        Ok(Arc::new(repo) as Arc<dyn Repository>)
    }));

    let repo = loader.get("db").unwrap();
    assert_eq!(repo.describe(&Url::new("test")), "db");
}

// ---------------------------------------------------------------------------
// Protocol wrapping: the filter protocol composes activation-selected
// chains around exported invokers.

struct MockExporter {
    invoker: Arc<dyn Invoker>,
}

impl Exporter for MockExporter {
    fn invoker(&self) -> Arc<dyn Invoker> {
        self.invoker.clone()
    }
}

struct MockProtocol;

impl Protocol for MockProtocol {
    fn default_port(&self) -> Result<u16, RpcError> {
        Ok(9000)
    }

    fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError> {
        Ok(Arc::new(MockExporter { invoker }))
    }

    fn refer(&self, _interface: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(EchoInvoker { url: url.clone() }))
    }
}

struct EchoInvoker {
    url: Url,
}

impl Invoker for EchoInvoker {
    fn interface_name(&self) -> &str {
        "it.EchoService"
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        Ok(RpcResult::new(serde_json::json!(invocation.method_name())))
    }
}

struct MarkFilter {
    tag: &'static str,
    trace: Arc<Mutex<Vec<&'static str>>>,
}

impl Filter for MarkFilter {
    fn invoke(&self, next: &dyn Invoker, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        self.trace.lock().unwrap().push(self.tag);
        next.invoke(invocation)
    }
}

fn install_protocol_point(registry: &ExtensionRegistry, trace: &Arc<Mutex<Vec<&'static str>>>) {
    registry.add_embedded_resource(
        "META-INF/dubbo/internal",
        "spindle.rpc.Protocol",
        "mock=it.MockProtocol\nspindle.rpc.FilterProtocol\n",
    );
    registry.add_embedded_resource(
        "META-INF/dubbo/internal",
        "spindle.rpc.Filter",
        "audit=it.AuditFilter\ntps=spindle.rpc.TpsLimitFilter\n",
    );

    let protocols = registry.loader::<dyn Protocol>();
    protocols.register_provider(ExtensionProvider::named("it.MockProtocol", |_ctx| {
        Ok(Arc::new(MockProtocol) as Arc<dyn Protocol>)
    }));
    protocols.register_provider(FilterProtocol::provider());

    let filters = registry.loader::<dyn Filter>();
    let audit_trace = trace.clone();
    filters.register_provider(
        ExtensionProvider::named("it.AuditFilter", move |_ctx| {
            Ok(Arc::new(MarkFilter {
                tag: "audit",
                trace: audit_trace.clone(),
            }) as Arc<dyn Filter>)
        })
        .with_activate(Activate::new().group(&["provider"]).order(1)),
    );
    filters.register_provider(TpsLimitFilter::provider());
}

#[test]
fn exported_invoker_runs_the_activated_chain() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let registry = ExtensionRegistry::new();
    install_protocol_point(&registry, &trace);

    let url = Url::new("mock").with_path("it.EchoService");
    let protocol = registry.loader::<dyn Protocol>().get_adaptive().unwrap();
    let exporter = protocol
        .export(Arc::new(EchoInvoker { url: url.clone() }))
        .unwrap();

    let result = exporter.invoker().invoke(&Invocation::new("ping")).unwrap();
    assert_eq!(result.value(), &serde_json::json!("ping"));
    assert_eq!(*trace.lock().unwrap(), vec!["audit"]);
}

#[test]
fn tps_filter_activates_only_with_a_rate() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let registry = ExtensionRegistry::new();
    install_protocol_point(&registry, &trace);
    let protocol = registry.loader::<dyn Protocol>().get_adaptive().unwrap();

    let limited = Url::new("mock")
        .with_path("it.EchoService")
        .with_parameter("tps", "1");
    let exporter = protocol
        .export(Arc::new(EchoInvoker { url: limited }))
        .unwrap();
    let invoker = exporter.invoker();

    assert!(invoker.invoke(&Invocation::new("ping")).is_ok());
    let err = invoker.invoke(&Invocation::new("ping")).unwrap_err();
    assert!(matches!(err, RpcError::Limited(_)));
    // the admission filter sorts ahead of audit and short-circuits the
    // denied call before audit sees it
    assert_eq!(*trace.lock().unwrap(), vec!["audit"]);
}

#[test]
fn explicit_filter_names_extend_the_chain() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let registry = ExtensionRegistry::new();
    install_protocol_point(&registry, &trace);

    let extra_trace = trace.clone();
    registry
        .loader::<dyn Filter>()
        .add_extension(
            "extra",
            ExtensionProvider::named("it.ExtraFilter", move |_ctx| {
                Ok(Arc::new(MarkFilter {
                    tag: "extra",
                    trace: extra_trace.clone(),
                }) as Arc<dyn Filter>)
            }),
        )
        .unwrap();

    let url = Url::new("mock")
        .with_path("it.EchoService")
        .with_parameter(SERVICE_FILTER_KEY, "default,extra");
    let protocol = registry.loader::<dyn Protocol>().get_adaptive().unwrap();
    let exporter = protocol.export(Arc::new(EchoInvoker { url })).unwrap();

    exporter.invoker().invoke(&Invocation::new("ping")).unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["audit", "extra"]);
}

#[test]
fn suppressing_default_drops_auto_activated_filters() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let registry = ExtensionRegistry::new();
    install_protocol_point(&registry, &trace);

    let url = Url::new("mock")
        .with_path("it.EchoService")
        .with_parameter(SERVICE_FILTER_KEY, "-default");
    let protocol = registry.loader::<dyn Protocol>().get_adaptive().unwrap();
    let exporter = protocol.export(Arc::new(EchoInvoker { url })).unwrap();

    exporter.invoker().invoke(&Invocation::new("ping")).unwrap();
    assert!(trace.lock().unwrap().is_empty());
}

#[test]
fn registry_urls_bypass_filter_assembly() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let registry = ExtensionRegistry::new();
    install_protocol_point(&registry, &trace);

    let url = Url::new("registry").with_path("it.EchoService");
    let loader = registry.loader::<dyn Protocol>();
    // route to the concrete protocol through the wrapper stack directly
    let exporter = loader
        .get("mock")
        .unwrap()
        .export(Arc::new(EchoInvoker { url }))
        .unwrap();

    exporter.invoker().invoke(&Invocation::new("ping")).unwrap();
    assert!(trace.lock().unwrap().is_empty());
}

#[test]
fn wrapper_classification_applies_to_every_name() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let registry = ExtensionRegistry::new();
    install_protocol_point(&registry, &trace);

    let loader = registry.loader::<dyn Protocol>();
    // `mock` resolves to the wrapper-decorated stack, not the raw protocol
    let supported: Vec<String> = loader.supported_extensions().unwrap().into_iter().collect();
    assert_eq!(supported, vec!["mock"]);
    assert_eq!(loader.get("mock").unwrap().default_port().unwrap(), 9000);
}

// ---------------------------------------------------------------------------
// Filesystem discovery end to end, across all three directories.

#[test]
fn directories_supplement_each_other() {
    let dir = tempfile::tempdir().unwrap();
    for (subdir, content) in [
        ("META-INF/dubbo/internal", "lru=it.LruCache\n"),
        ("META-INF/services", "fifo=it.FifoCache\n"),
    ] {
        let path = dir.path().join(subdir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("it.Cache"), content).unwrap();
    }

    let registry = ExtensionRegistry::new().with_resource_root(dir.path());
    let loader = registry.loader::<dyn Cache>();
    loader.register_provider(ExtensionProvider::named("it.LruCache", |_ctx| {
        Ok(Arc::new(LruCache) as Arc<dyn Cache>)
    }));
    loader.register_provider(ExtensionProvider::named("it.FifoCache", |_ctx| {
        Ok(Arc::new(FifoCache) as Arc<dyn Cache>)
    }));

    let supported: Vec<String> = loader.supported_extensions().unwrap().into_iter().collect();
    assert_eq!(supported, vec!["fifo", "lru"]);
}

// ---------------------------------------------------------------------------
// Collaborator formulas exercised through public surfaces.

#[test]
fn warmup_weight_shapes_effective_weight() {
    assert_eq!(calculate_warmup_weight(0, 600_000, 100), 1);
    assert_eq!(calculate_warmup_weight(600_000, 600_000, 100), 100);

    let url = Url::new("test")
        .with_parameter(WEIGHT_KEY, "100")
        .with_parameter(TIMESTAMP_KEY, "1000");
    let invocation = Invocation::new("echo");
    let quarter = effective_weight(&url, &invocation, 1_000 + 150_000);
    assert_eq!(quarter, 25);
}

#[test]
fn hand_built_chain_matches_protocol_assembly() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let a = Arc::new(MarkFilter {
        tag: "a",
        trace: trace.clone(),
    });
    let b = Arc::new(MarkFilter {
        tag: "b",
        trace: trace.clone(),
    });
    let terminal: Arc<dyn Invoker> = Arc::new(EchoInvoker {
        url: Url::new("test"),
    });

    let filters: Vec<Arc<dyn Filter>> = vec![a, b];
    let chain = build_filter_chain(terminal, &filters);
    chain.invoke(&Invocation::new("ping")).unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["a", "b"]);
}
