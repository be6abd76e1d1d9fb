//! Extension loader.
//!
//! Each extension goes through `DialectNormalize → Evaluate → Initialize →
//! Register`. Only the register step touches shared state (runtime pools,
//! hook bindings, the bank), so a failure anywhere earlier leaves the host
//! exactly as it was. A panic in any step is caught and reported as a load
//! failure for that extension alone.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rhai::AST;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bank::{ExtensionBank, LoadedExtension, ScriptPlugin, ScriptProvider};
use crate::binder::CapabilityBinder;
use crate::bridge::{CommitContext, HookBridge, HookRegistrar, StagedHandler};
use crate::config::RuntimeConfig;
use crate::descriptor::ExtensionDescriptor;
use crate::error::ExtensionError;
use crate::hooks::HookManager;
use crate::manager::RuntimeManager;
use crate::runtime::RuntimeInstance;

/// Script function a plugin may define to register its hooks.
const INIT_FUNCTION: &str = "init";

// ─── Dialect normalization ──────────────────────────────────────────────

/// Turns a non-native source dialect into plain Rhai.
pub trait SourceTranspiler: Send + Sync {
    fn transpile(&self, source: &str) -> Result<String, String>;
}

impl<F> SourceTranspiler for F
where
    F: Fn(&str) -> Result<String, String> + Send + Sync,
{
    fn transpile(&self, source: &str) -> Result<String, String> {
        self(source)
    }
}

/// Rejects every source that needs conversion.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTranspiler;

impl SourceTranspiler for NoTranspiler {
    fn transpile(&self, _source: &str) -> Result<String, String> {
        Err("no transpiler configured for typed-rhai sources".into())
    }
}

// ─── Stages and report ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    DialectNormalize,
    Evaluate,
    Initialize,
    Register,
    Loaded,
    Failed,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DialectNormalize => "dialect-normalize",
            Self::Evaluate => "evaluate",
            Self::Initialize => "initialize",
            Self::Register => "register",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a batch load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Ids that reached the bank, sorted.
    pub loaded: Vec<String>,
    /// Ids that failed with their error, sorted by id.
    pub failed: Vec<(String, ExtensionError)>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What the evaluate step hands to the later steps.
struct Evaluated {
    program: Arc<AST>,
    instance: RuntimeInstance,
    registrar: Option<HookRegistrar>,
}

// ─── Loader ─────────────────────────────────────────────────────────────

/// Drives extensions from descriptor to bank entry.
#[derive(Clone)]
pub struct ExtensionLoader {
    config: RuntimeConfig,
    manager: Arc<RuntimeManager>,
    bank: Arc<ExtensionBank>,
    hooks: Arc<HookManager>,
    bridge: HookBridge,
    transpiler: Arc<dyn SourceTranspiler>,
}

impl fmt::Debug for ExtensionLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionLoader")
            .field("config", &self.config)
            .field("extensions", &self.bank.len())
            .field("pools", &self.manager.pool_count())
            .finish_non_exhaustive()
    }
}

impl ExtensionLoader {
    pub fn new(
        config: RuntimeConfig,
        manager: Arc<RuntimeManager>,
        bank: Arc<ExtensionBank>,
        hooks: Arc<HookManager>,
    ) -> Self {
        Self {
            config,
            manager,
            bank,
            hooks,
            bridge: HookBridge::new(),
            transpiler: Arc::new(NoTranspiler),
        }
    }

    /// Use `transpiler` for `typed-rhai` sources.
    pub fn with_transpiler(mut self, transpiler: impl SourceTranspiler + 'static) -> Self {
        self.transpiler = Arc::new(transpiler);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bank(&self) -> &Arc<ExtensionBank> {
        &self.bank
    }

    pub fn manager(&self) -> &Arc<RuntimeManager> {
        &self.manager
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    pub fn bridge(&self) -> &HookBridge {
        &self.bridge
    }

    /// Load one extension.
    ///
    /// On error nothing was registered: no pool, no hook binding, no bank
    /// entry.
    pub fn load(&self, descriptor: ExtensionDescriptor) -> Result<LoadedExtension, ExtensionError> {
        let id = descriptor.id.clone();
        let descriptor = Arc::new(descriptor);

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_stages(&descriptor)))
            .unwrap_or_else(|payload| {
                Err(ExtensionError::LoadPanicked {
                    id: id.clone(),
                    message: panic_message(payload),
                })
            });

        match &outcome {
            Ok(loaded) => info!(
                extension = %id,
                kind = %loaded.extension_type(),
                version = %descriptor.version,
                stage = %LoadStage::Loaded,
                "extension loaded"
            ),
            Err(e) => warn!(extension = %id, stage = %LoadStage::Failed, "extension failed to load: {e}"),
        }
        outcome
    }

    /// Load every descriptor on its own blocking task. A failure never
    /// stops the others.
    pub async fn load_all(&self, descriptors: Vec<ExtensionDescriptor>) -> LoadReport {
        let mut tasks = JoinSet::new();
        for descriptor in descriptors {
            let loader = self.clone();
            tasks.spawn_blocking(move || {
                let id = descriptor.id.clone();
                (id, loader.load(descriptor))
            });
        }

        let mut report = LoadReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(_))) => report.loaded.push(id),
                Ok((id, Err(e))) => {
                    error!(extension = %id, "extension load failed: {e}");
                    report.failed.push((id, e));
                }
                Err(e) => error!("extension load task failed: {e}"),
            }
        }
        report.loaded.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "extension batch load finished"
        );
        report
    }

    /// Remove a loaded extension: its bank entry, its hook bindings and its
    /// runtime pool.
    ///
    /// Runs under the bank write lock, like registration, so a load of the
    /// same id never picks up the pool being torn down.
    pub fn unload(&self, id: &str) -> Result<(), ExtensionError> {
        self.bank
            .unregister(id, |removed| {
                self.release(removed);
                self.manager.remove_pool(id);
            })
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
        info!(extension = %id, "extension unloaded");
        Ok(())
    }

    /// Unload everything, tear down every pool and load `descriptors` anew.
    pub async fn reload_all(&self, descriptors: Vec<ExtensionDescriptor>) -> LoadReport {
        let previous = self.bank.drain_with(|previous| {
            for loaded in previous {
                self.release(loaded);
            }
            self.manager.teardown_all();
        });
        info!(unloaded = previous.len(), "extensions unloaded for reload");
        self.load_all(descriptors).await
    }

    fn release(&self, loaded: &LoadedExtension) {
        if let LoadedExtension::Plugin(plugin) = loaded {
            let unbound = plugin.unbind_hooks(&self.hooks);
            debug!(extension = %plugin.id(), handlers = unbound, "plugin hooks unbound");
        }
    }

    // ── State machine ───────────────────────────────────────────────────

    fn run_stages(&self, descriptor: &Arc<ExtensionDescriptor>) -> Result<LoadedExtension, ExtensionError> {
        let id = descriptor.id.as_str();
        let binder = CapabilityBinder::new(Arc::clone(descriptor), self.config.sandbox.clone());

        debug!(extension = %id, stage = %LoadStage::DialectNormalize, "load stage");
        let source = self.normalize(descriptor)?;

        debug!(extension = %id, stage = %LoadStage::Evaluate, "load stage");
        let mut evaluated = self.evaluate(descriptor, &binder, &source)?;

        let staged = match &evaluated.registrar {
            Some(registrar) => {
                debug!(extension = %id, stage = %LoadStage::Initialize, "load stage");
                self.initialize(id, &mut evaluated.instance, registrar)?
            }
            None => Vec::new(),
        };

        debug!(extension = %id, stage = %LoadStage::Register, "load stage");
        self.register(descriptor, binder, evaluated, staged)
    }

    fn normalize<'a>(&self, descriptor: &'a ExtensionDescriptor) -> Result<Cow<'a, str>, ExtensionError> {
        if !descriptor.language.requires_conversion() {
            return Ok(Cow::Borrowed(&descriptor.payload));
        }
        self.transpiler
            .transpile(&descriptor.payload)
            .map(Cow::Owned)
            .map_err(|message| ExtensionError::Conversion {
                id: descriptor.id.clone(),
                message,
            })
    }

    fn evaluate(
        &self,
        descriptor: &ExtensionDescriptor,
        binder: &CapabilityBinder,
        source: &str,
    ) -> Result<Evaluated, ExtensionError> {
        let fail = |message: String| ExtensionError::Evaluation {
            id: descriptor.id.clone(),
            message,
        };

        let mut instance = binder.instance();
        let registrar = descriptor.is_plugin().then(|| {
            let registrar = HookRegistrar::new();
            self.bridge.install(&mut instance, &registrar);
            registrar
        });

        let program = Arc::new(instance.compile(source).map_err(|e| fail(e.to_string()))?);
        instance
            .evaluate(Arc::clone(&program))
            .map_err(|e| fail(e.to_string()))?;

        if let Some(kind) = descriptor.extension_type.provider_kind() {
            let missing: Vec<String> = kind
                .required_script_functions()
                .into_iter()
                .filter(|f| !instance.has_function(f))
                .collect();
            if !missing.is_empty() {
                return Err(fail(format!(
                    "{} is missing required functions: {}",
                    descriptor.extension_type,
                    missing.join(", ")
                )));
            }
        }

        Ok(Evaluated {
            program,
            instance,
            registrar,
        })
    }

    fn initialize(
        &self,
        id: &str,
        instance: &mut RuntimeInstance,
        registrar: &HookRegistrar,
    ) -> Result<Vec<StagedHandler>, ExtensionError> {
        if !instance.has_function(INIT_FUNCTION) {
            debug!(extension = %id, "plugin has no init function");
            return Ok(Vec::new());
        }
        instance
            .call(INIT_FUNCTION, ())
            .map_err(|e| ExtensionError::Initialization {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        Ok(registrar.take())
    }

    fn register(
        &self,
        descriptor: &Arc<ExtensionDescriptor>,
        binder: CapabilityBinder,
        evaluated: Evaluated,
        staged: Vec<StagedHandler>,
    ) -> Result<LoadedExtension, ExtensionError> {
        let id = descriptor.id.as_str();
        let acquire_timeout = self.config.acquire_timeout;

        match descriptor.extension_type.provider_kind() {
            Some(kind) => self.bank.register(id, || {
                let pool = self
                    .manager
                    .get_or_create_pool(id, provider_initializer(binder, evaluated.program));
                Ok(LoadedExtension::Provider(Arc::new(ScriptProvider::new(
                    Arc::clone(descriptor),
                    kind,
                    pool,
                    acquire_timeout,
                ))))
            }),
            None => {
                let program = self
                    .bridge
                    .invocation_program(&evaluated.instance, &evaluated.program)
                    .map_err(|e| ExtensionError::Registration {
                        id: id.to_string(),
                        message: e.to_string(),
                    })?;
                let store = binder.store().cloned().unwrap_or_default();

                self.bank.register(id, || {
                    let pool_binder = binder.clone();
                    let pool = self
                        .manager
                        .get_or_create_pool(id, move || Ok(pool_binder.instance()));
                    let ctx = CommitContext {
                        extension_id: id.to_string(),
                        pool: Arc::clone(&pool),
                        program: Arc::new(program),
                        acquire_timeout,
                    };
                    let hooks = self.bridge.commit(&self.hooks, staged, &ctx);
                    Ok(LoadedExtension::Plugin(Arc::new(ScriptPlugin::new(
                        Arc::clone(descriptor),
                        pool,
                        hooks,
                        store,
                    ))))
                })
            }
        }
    }
}

/// Provider pool instances each run the top level once so their globals
/// match the evaluated program.
fn provider_initializer(
    binder: CapabilityBinder,
    program: Arc<AST>,
) -> impl Fn() -> Result<RuntimeInstance, ExtensionError> + Send + Sync + 'static {
    move || {
        let mut instance = binder.instance();
        instance.evaluate(Arc::clone(&program))?;
        Ok(instance)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ExtensionType, Language, ProviderKind};
    use crate::events::{Playlist, PlaylistCreatedEvent};
    use rhai::Dynamic;

    const MANGA: &str = r#"
        let prefix = "manga:";
        fn search(opts) { [#{ id: "1", title: opts.query }] }
        fn findChapters(id) { [] }
        fn findChapterPages(id) { [] }
    "#;

    const PLUGIN: &str = r#"
        fn init() {
            app::onPlaylistCreated(|e| {
                store::set("last", e.playlist.name);
                e.playlist.name = e.playlist.name + " (seen)";
                e
            });
        }
    "#;

    fn loader() -> ExtensionLoader {
        let config = RuntimeConfig {
            pool_size: 2,
            ..RuntimeConfig::default()
        };
        ExtensionLoader::new(
            config.clone(),
            Arc::new(RuntimeManager::new(config.pool_size)),
            Arc::new(ExtensionBank::new()),
            Arc::new(HookManager::new()),
        )
    }

    fn manga(id: &str, source: &str) -> ExtensionDescriptor {
        ExtensionDescriptor::new(id, ExtensionType::MangaProvider, Language::Rhai, source)
    }

    fn plugin(id: &str, source: &str) -> ExtensionDescriptor {
        ExtensionDescriptor::new(id, ExtensionType::Plugin, Language::Rhai, source)
    }

    fn assert_untouched(loader: &ExtensionLoader) {
        assert!(loader.bank().is_empty());
        assert_eq!(loader.manager().pool_count(), 0);
        assert!(loader.hooks().on_playlist_created(&[]).hook().is_empty());
    }

    #[test]
    fn test_load_provider() {
        let loader = loader();
        let loaded = loader.load(manga("manga", MANGA)).unwrap();
        assert!(matches!(loaded, LoadedExtension::Provider(_)));

        let provider = loader.bank().provider("manga").unwrap();
        assert_eq!(provider.kind(), ProviderKind::Manga);
        let result = provider
            .call("find_chapters", vec![Dynamic::from("x")])
            .unwrap();
        assert!(result.is_array());
        assert_eq!(loader.manager().pool_count(), 1);
    }

    #[test]
    fn test_missing_required_function() {
        let loader = loader();
        let err = loader
            .load(manga("manga", "fn search(q) { [] }"))
            .unwrap_err();
        match err {
            ExtensionError::Evaluation { id, message } => {
                assert_eq!(id, "manga");
                assert!(message.contains("findChapters"));
                assert!(message.contains("findChapterPages"));
            }
            other => panic!("expected evaluation error, got {other:?}"),
        }
        assert_untouched(&loader);
    }

    #[test]
    fn test_syntax_error_is_evaluation_failure() {
        let loader = loader();
        let err = loader.load(manga("manga", "fn search( {")).unwrap_err();
        assert!(matches!(err, ExtensionError::Evaluation { .. }));
        assert_untouched(&loader);
    }

    #[test]
    fn test_top_level_throw_is_evaluation_failure() {
        let loader = loader();
        let err = loader
            .load(manga("manga", &format!("{MANGA}\nthrow \"nope\";")))
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Evaluation { .. }));
        assert_untouched(&loader);
    }

    #[test]
    fn test_typed_source_without_transpiler() {
        let loader = loader();
        let mut descriptor = manga("typed", MANGA);
        descriptor.language = Language::TypedRhai;
        let err = loader.load(descriptor).unwrap_err();
        assert!(matches!(err, ExtensionError::Conversion { .. }));
        assert_untouched(&loader);
    }

    #[test]
    fn test_typed_source_with_transpiler() {
        let loader = loader().with_transpiler(|src: &str| -> Result<String, String> {
            Ok(src.replace(": string", ""))
        });
        let mut descriptor = manga(
            "typed",
            r#"
            fn search(q: string) { [] }
            fn findChapters(id: string) { [] }
            fn findChapterPages(id: string) { [] }
            "#,
        );
        descriptor.language = Language::TypedRhai;
        loader.load(descriptor).unwrap();
        assert!(loader.bank().contains("typed"));
    }

    #[test]
    fn test_panic_is_isolated() {
        let loader = loader().with_transpiler(|_: &str| -> Result<String, String> {
            panic!("transpiler exploded")
        });
        let mut descriptor = manga("typed", MANGA);
        descriptor.language = Language::TypedRhai;
        match loader.load(descriptor).unwrap_err() {
            ExtensionError::LoadPanicked { id, message } => {
                assert_eq!(id, "typed");
                assert!(message.contains("transpiler exploded"));
            }
            other => panic!("expected panic error, got {other:?}"),
        }
        assert_untouched(&loader);

        loader.load(manga("manga", MANGA)).unwrap();
        assert_eq!(loader.bank().ids(), ["manga"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let loader = loader();
        loader.load(manga("manga", MANGA)).unwrap();
        let err = loader.load(manga("manga", MANGA)).unwrap_err();
        assert!(matches!(err, ExtensionError::Registration { .. }));
        assert_eq!(loader.bank().len(), 1);
        assert_eq!(loader.manager().pool_count(), 1);
    }

    #[test]
    fn test_plugin_hooks_bound_on_register() {
        let loader = loader();
        loader.load(plugin("plug", PLUGIN)).unwrap();
        let plug = loader.bank().plugin("plug").unwrap();
        assert_eq!(plug.hook_count(), 1);

        let mut event = PlaylistCreatedEvent {
            playlist: Playlist {
                name: "Weekend".into(),
                ..Playlist::default()
            },
        };
        loader
            .hooks()
            .on_playlist_created(&[])
            .trigger(&mut event)
            .unwrap();
        assert_eq!(event.playlist.name, "Weekend (seen)");
        assert_eq!(
            plug.store().get("last").map(|v| v.to_string()),
            Some("Weekend".to_string())
        );
        assert_eq!(plug.stats().checked_out, 0);
    }

    #[test]
    fn test_plugin_without_init() {
        let loader = loader();
        loader.load(plugin("quiet", "let x = 1;")).unwrap();
        assert_eq!(loader.bank().plugin("quiet").unwrap().hook_count(), 0);
    }

    #[test]
    fn test_failed_init_binds_nothing() {
        let loader = loader();
        let err = loader
            .load(plugin(
                "plug",
                r#"
                fn init() {
                    app::onPlaylistCreated(|e| e);
                    throw "init failed";
                }
                "#,
            ))
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Initialization { .. }));
        assert_untouched(&loader);
    }

    #[test]
    fn test_bad_registration_fails_init() {
        let loader = loader();
        let err = loader
            .load(plugin("plug", "fn init() { app::onPlaylistCreated(1); }"))
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Initialization { .. }));
        assert_untouched(&loader);
    }

    #[test]
    fn test_unload_removes_everything() {
        let loader = loader();
        loader.load(plugin("plug", PLUGIN)).unwrap();
        loader.unload("plug").unwrap();
        assert_untouched(&loader);
        assert!(matches!(
            loader.unload("plug"),
            Err(ExtensionError::NotFound(_))
        ));
    }

    #[test]
    fn test_unload_then_load_gets_fresh_pool() {
        let loader = loader();
        loader.load(manga("manga", MANGA)).unwrap();
        let old_pool = loader.manager().pool("manga").unwrap();

        loader.unload("manga").unwrap();
        assert!(old_pool.is_closed());

        loader.load(manga("manga", MANGA)).unwrap();
        let new_pool = loader.manager().pool("manga").unwrap();
        assert!(!Arc::ptr_eq(&old_pool, &new_pool));
        assert!(!new_pool.is_closed());
        let provider = loader.bank().provider("manga").unwrap();
        assert!(provider.call("find_chapters", vec![Dynamic::from("1")]).is_ok());
    }

    #[test]
    fn test_concurrent_load_and_unload_keep_bank_and_pools_in_step() {
        let loader = loader();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let loader = loader.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let _ = loader.load(manga("manga", MANGA));
                        let _ = loader.unload("manga");
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(
            loader.bank().contains("manga"),
            loader.manager().pool("manga").is_some()
        );
        if !loader.bank().contains("manga") {
            loader.load(manga("manga", MANGA)).unwrap();
        }
        assert!(!loader.manager().pool("manga").unwrap().is_closed());
        let provider = loader.bank().provider("manga").unwrap();
        assert!(provider.call("find_chapters", vec![Dynamic::from("1")]).is_ok());
    }

    #[tokio::test]
    async fn test_load_all_isolates_failures() {
        let loader = loader();
        let report = loader
            .load_all(vec![
                manga("b-manga", MANGA),
                manga("broken", "fn search( {"),
                plugin("a-plug", PLUGIN),
            ])
            .await;
        assert_eq!(report.loaded, ["a-plug", "b-manga"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(!report.is_complete());
        assert_eq!(loader.bank().len(), 2);
    }

    #[tokio::test]
    async fn test_reload_all() {
        let loader = loader();
        loader.load(plugin("plug", PLUGIN)).unwrap();
        loader.load(manga("manga", MANGA)).unwrap();

        let report = loader.reload_all(vec![manga("manga", MANGA)]).await;
        assert_eq!(report.loaded, ["manga"]);
        assert_eq!(loader.bank().ids(), ["manga"]);
        assert_eq!(loader.manager().pool_count(), 1);
        assert!(loader.hooks().on_playlist_created(&[]).hook().is_empty());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(LoadStage::DialectNormalize.to_string(), "dialect-normalize");
        assert_eq!(LoadStage::Register.to_string(), "register");
    }
}
