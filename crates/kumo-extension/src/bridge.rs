//! Bridge between host lifecycle hooks and script handlers.
//!
//! During plugin initialization scripts call `app::onGetAnime(handler)`
//! (optionally with a tag array). Those calls only stage a registration;
//! nothing reaches the [`HookManager`] until the loader commits them in its
//! register step. Each committed handler borrows a pooled instance per
//! firing, runs the handler with the event bound as `event`, and returns
//! the instance on every path.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rhai::{Array, Dynamic, EvalAltResult, FnPtr, Map, Module, AST};
use tracing::{debug, info};

use crate::binder::{to_host_json, to_script_value};
use crate::error::ExtensionError;
use crate::events::EXCLUDED_HOOKS;
use crate::exception::{exported_host_error, HostError};
use crate::hooks::{HandlerId, HookDescriptor, HookManager, JsonHandler, HOOK_TABLE};
use crate::naming::to_script_case;
use crate::pool::{AcquireContext, Pool};
use crate::runtime::{RuntimeInstance, EVENT_BINDING};

/// Scope name of the staged handler inside the invocation program.
const HANDLER_BINDING: &str = "hook_handler";

/// Script module that carries the registration surface.
pub const APP_MODULE: &str = "app";

// ─── Staging ──────────────────────────────────────────────────────────

/// A registration made during initialization, not yet bound.
#[derive(Clone)]
pub struct StagedHandler {
    pub hook: &'static HookDescriptor,
    pub tags: Vec<String>,
    handler: Dynamic,
}

impl std::fmt::Debug for StagedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedHandler")
            .field("hook", &self.hook.name)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Collects registrations from one plugin's loader instance.
#[derive(Debug, Clone, Default)]
pub struct HookRegistrar {
    staged: Arc<Mutex<Vec<StagedHandler>>>,
}

impl HookRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    fn stage(
        &self,
        hook: &'static HookDescriptor,
        tags: Vec<String>,
        handler: Dynamic,
    ) -> Result<(), HostError> {
        let function = format!("{APP_MODULE}::{}", to_script_case(hook.name));
        if !handler.is::<FnPtr>() {
            return Err(HostError::new(
                function,
                format!("handler must be a function pointer, got {}", handler.type_name()),
            ));
        }
        self.staged.lock().push(StagedHandler { hook, tags, handler });
        Ok(())
    }

    /// Take every staged registration, leaving the registrar empty.
    pub fn take(&self) -> Vec<StagedHandler> {
        std::mem::take(&mut *self.staged.lock())
    }

    pub fn len(&self) -> usize {
        self.staged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tags_from(array: Array) -> Vec<String> {
    array
        .into_iter()
        .map(|tag| match tag.clone().into_immutable_string() {
            Ok(s) => s.to_string(),
            Err(_) => tag.to_string(),
        })
        .collect()
}

// ─── Bridge ───────────────────────────────────────────────────────────

/// A handler bound to the host hook subsystem.
#[derive(Debug, Clone, Copy)]
pub struct CommittedHook {
    pub hook: &'static HookDescriptor,
    pub id: HandlerId,
}

impl CommittedHook {
    pub fn unbind(&self, hooks: &HookManager) -> bool {
        (self.hook.unbind)(hooks, self.id)
    }
}

/// Everything an adapter needs to run one plugin's handlers.
#[derive(Debug, Clone)]
pub struct CommitContext {
    pub extension_id: String,
    pub pool: Arc<Pool>,
    pub program: Arc<AST>,
    pub acquire_timeout: Duration,
}

/// The set of host hooks scripts may bind.
#[derive(Debug, Clone)]
pub struct HookBridge {
    bindable: Vec<&'static HookDescriptor>,
}

impl Default for HookBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl HookBridge {
    /// Every hook of the static table minus the excluded ones.
    pub fn new() -> Self {
        let bindable = HOOK_TABLE
            .iter()
            .filter(|d| !EXCLUDED_HOOKS.contains(&d.name))
            .collect();
        Self { bindable }
    }

    /// Script-side names of the bindable hooks, e.g. `onGetAnime`.
    pub fn script_names(&self) -> Vec<String> {
        self.bindable.iter().map(|d| to_script_case(d.name)).collect()
    }

    pub fn is_bindable(&self, host_name: &str) -> bool {
        self.bindable.iter().any(|d| d.name == host_name)
    }

    /// Register the `app` module on a plugin's loader instance.
    pub fn install(&self, instance: &mut RuntimeInstance, registrar: &HookRegistrar) {
        let mut module = Module::new();
        for &hook in &self.bindable {
            let name = to_script_case(hook.name);

            let reg = registrar.clone();
            module.set_native_fn(
                name.as_str(),
                move |handler: Dynamic| -> Result<(), Box<EvalAltResult>> {
                    reg.stage(hook, Vec::new(), handler)
                        .map_err(HostError::into_script_error)
                },
            );
            let reg = registrar.clone();
            module.set_native_fn(
                name.as_str(),
                move |handler: Dynamic, tags: Array| -> Result<(), Box<EvalAltResult>> {
                    reg.stage(hook, tags_from(tags), handler)
                        .map_err(HostError::into_script_error)
                },
            );
        }
        instance
            .engine_mut()
            .register_static_module(APP_MODULE, module.into());
    }

    /// Build the program each firing runs: the plugin's functions plus a
    /// call of the bound handler with the event.
    pub fn invocation_program(
        &self,
        instance: &RuntimeInstance,
        plugin: &AST,
    ) -> Result<AST, ExtensionError> {
        let call = instance.compile(&format!("{HANDLER_BINDING}.call({EVENT_BINDING})"))?;
        Ok(plugin.clone_functions_only().merge(&call))
    }

    /// Bind every staged handler. Returns the bindings for later unbinding.
    pub fn commit(
        &self,
        hooks: &HookManager,
        staged: Vec<StagedHandler>,
        ctx: &CommitContext,
    ) -> Vec<CommittedHook> {
        let committed: Vec<CommittedHook> = staged
            .into_iter()
            .map(|s| {
                let adapter = ScriptHookHandler {
                    extension_id: ctx.extension_id.clone(),
                    hook: s.hook.name,
                    pool: Arc::clone(&ctx.pool),
                    program: Arc::clone(&ctx.program),
                    handler: s.handler,
                    acquire_timeout: ctx.acquire_timeout,
                };
                let id = (s.hook.bind)(hooks, &s.tags, Arc::new(adapter));
                debug!(extension = %ctx.extension_id, hook = s.hook.name, handler = %id, "hook handler bound");
                CommittedHook { hook: s.hook, id }
            })
            .collect();
        info!(extension = %ctx.extension_id, handlers = committed.len(), "plugin hooks committed");
        committed
    }
}

// ─── Adapter ──────────────────────────────────────────────────────────

struct ScriptHookHandler {
    extension_id: String,
    hook: &'static str,
    pool: Arc<Pool>,
    program: Arc<AST>,
    handler: Dynamic,
    acquire_timeout: Duration,
}

impl ScriptHookHandler {
    fn fail(&self, source: ExtensionError) -> ExtensionError {
        ExtensionError::invocation(&self.extension_id, self.hook, source)
    }
}

impl JsonHandler for ScriptHookHandler {
    fn handle(
        &self,
        event: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, ExtensionError> {
        let lease = self
            .pool
            .acquire(&AcquireContext::with_timeout(self.acquire_timeout))
            .map_err(|e| self.fail(e))?;

        let arg = to_script_value(&event).map_err(|e| self.fail(e.into()))?;
        let result = lease
            .run_bound(
                &self.program,
                vec![(HANDLER_BINDING, self.handler.clone())],
                arg,
            )
            .map_err(|e| self.fail(e))?;
        drop(lease);

        if let Some(host) = exported_host_error(&result) {
            return Err(self.fail(host.into()));
        }
        if result.is::<Map>() {
            let replaced = to_host_json(&result).map_err(|e| self.fail(e.into()))?;
            return Ok(Some(replaced));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::events::{Anime, GetAnimeEvent, MediaTitle, PlaylistCreatedEvent};

    fn loader_instance(registrar: &HookRegistrar) -> RuntimeInstance {
        let mut instance = RuntimeInstance::new("plug", &SandboxConfig::default());
        HookBridge::new().install(&mut instance, registrar);
        instance
    }

    fn run_init(source: &str) -> (HookRegistrar, Result<(), ExtensionError>, AST) {
        let registrar = HookRegistrar::new();
        let mut instance = loader_instance(&registrar);
        let ast = instance.compile(source).unwrap();
        let ast = Arc::new(ast);
        let result = instance
            .evaluate(Arc::clone(&ast))
            .and_then(|_| instance.call("init", ()).map(|_| ()));
        (registrar, result, (*ast).clone())
    }

    fn commit_ctx(program: AST) -> CommitContext {
        let pool = Arc::new(Pool::new(
            "plug",
            2,
            Box::new(|| Ok(RuntimeInstance::new("plug", &SandboxConfig::default()))),
        ));
        CommitContext {
            extension_id: "plug".into(),
            pool,
            program: Arc::new(program),
            acquire_timeout: Duration::from_secs(1),
        }
    }

    fn committed(source: &str) -> (HookManager, CommitContext, Vec<CommittedHook>) {
        let (registrar, result, ast) = run_init(source);
        result.unwrap();
        let bridge = HookBridge::new();
        let instance = RuntimeInstance::new("plug", &SandboxConfig::default());
        let program = bridge.invocation_program(&instance, &ast).unwrap();
        let ctx = commit_ctx(program);
        let hooks = HookManager::new();
        let bound = bridge.commit(&hooks, registrar.take(), &ctx);
        (hooks, ctx, bound)
    }

    #[test]
    fn test_exclusion_list_applied() {
        let bridge = HookBridge::new();
        assert!(!bridge.is_bindable("on_serve"));
        assert!(bridge.is_bindable("on_get_anime"));
        let names = bridge.script_names();
        assert!(names.contains(&"onGetAnime".to_string()));
        assert!(names.contains(&"onAutoDownloaderRuleCreated".to_string()));
        assert!(!names.contains(&"onServe".to_string()));
        assert_eq!(names.len(), HOOK_TABLE.len() - 1);
    }

    #[test]
    fn test_each_call_stages_one_registration() {
        let (registrar, result, _) = run_init(
            r#"
            fn init() {
                app::onGetAnime(|e| e);
                app::onGetAnime(|e| e, ["1", 2]);
                app::onPlaylistCreated(|e| ());
            }
            "#,
        );
        result.unwrap();
        let staged = registrar.take();
        assert_eq!(staged.len(), 3);
        assert_eq!(staged[0].hook.name, "on_get_anime");
        assert_eq!(staged[1].tags, ["1", "2"]);
        assert_eq!(staged[2].hook.name, "on_playlist_created");
        assert!(registrar.is_empty());
    }

    #[test]
    fn test_excluded_hook_not_exposed() {
        let (registrar, result, _) = run_init("fn init() { app::onServe(|e| e); }");
        assert!(result.is_err());
        assert!(registrar.is_empty());
    }

    #[test]
    fn test_non_function_handler_rejected() {
        let (_, result, _) = run_init("fn init() { app::onGetAnime(42); }");
        match result {
            Err(ExtensionError::Host(host)) => {
                assert_eq!(host.function, "app::onGetAnime");
                assert!(host.message.contains("function pointer"));
            }
            other => panic!("expected host error, got {other:?}"),
        }
    }

    #[test]
    fn test_nothing_bound_before_commit() {
        let (registrar, result, _) = run_init("fn init() { app::onGetAnime(|e| e); }");
        result.unwrap();
        assert_eq!(registrar.len(), 1);
        let hooks = HookManager::new();
        assert!(hooks.on_get_anime(&[]).hook().is_empty());
    }

    #[test]
    fn test_handler_mutates_event_through_return() {
        let (hooks, ctx, bound) = committed(
            r#"
            fn init() {
                app::onGetAnime(|e| {
                    e.anime.title.english = "Renamed";
                    e.anime.bannerImage = "banner.png";
                    e
                });
            }
            "#,
        );
        assert_eq!(bound.len(), 1);
        let mut event = GetAnimeEvent {
            anime: Anime {
                id: 1,
                title: MediaTitle {
                    english: Some("Original".into()),
                    ..MediaTitle::default()
                },
                ..Anime::default()
            },
        };
        hooks.on_get_anime(&[]).trigger(&mut event).unwrap();
        assert_eq!(event.anime.title.english.as_deref(), Some("Renamed"));
        assert_eq!(event.anime.banner_image.as_deref(), Some("banner.png"));

        let stats = ctx.pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn test_named_function_handler() {
        let (hooks, _, _) = committed(
            r#"
            fn rename(e) { e.playlist.name = "from fn"; e }
            fn init() { app::onPlaylistCreated(Fn("rename")); }
            "#,
        );
        let mut event = PlaylistCreatedEvent::default();
        hooks.on_playlist_created(&[]).trigger(&mut event).unwrap();
        assert_eq!(event.playlist.name, "from fn");
    }

    #[test]
    fn test_unit_return_leaves_event_unchanged() {
        let (hooks, _, _) = committed("fn init() { app::onPlaylistCreated(|e| { let x = 1; }); }");
        let mut event = PlaylistCreatedEvent::default();
        hooks.on_playlist_created(&[]).trigger(&mut event).unwrap();
        assert_eq!(event, PlaylistCreatedEvent::default());
    }

    #[test]
    fn test_script_error_releases_instance() {
        let (hooks, ctx, _) = committed(r#"fn init() { app::onPlaylistCreated(|e| { throw "bad"; }); }"#);
        let err = hooks
            .on_playlist_created(&[])
            .trigger(&mut PlaylistCreatedEvent::default())
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Invocation { .. }));
        assert_eq!(ctx.pool.stats().checked_out, 0);
    }

    #[test]
    fn test_tagged_registration_filters() {
        let (hooks, _, _) = committed(
            r#"fn init() { app::onGetAnime(|e| { e.anime.status = "seen"; e }, [7]); }"#,
        );
        let mut other = GetAnimeEvent {
            anime: Anime {
                id: 8,
                ..Anime::default()
            },
        };
        hooks.on_get_anime(&[]).trigger(&mut other).unwrap();
        assert!(other.anime.status.is_none());

        let mut tagged = GetAnimeEvent {
            anime: Anime {
                id: 7,
                ..Anime::default()
            },
        };
        hooks.on_get_anime(&[]).trigger(&mut tagged).unwrap();
        assert_eq!(tagged.anime.status.as_deref(), Some("seen"));
    }

    #[test]
    fn test_unbind_committed() {
        let (hooks, _, bound) = committed("fn init() { app::onGetAnime(|e| e); }");
        assert!(!hooks.on_get_anime(&[]).hook().is_empty());
        for hook in &bound {
            assert!(hook.unbind(&hooks));
        }
        assert!(hooks.on_get_anime(&[]).hook().is_empty());
    }
}
