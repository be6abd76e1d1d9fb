//! Isolated script interpreter instances.
//!
//! Each [`RuntimeInstance`] owns its own Rhai engine and global scope. An
//! instance is never shared between concurrent callers; the pool hands out
//! exclusive leases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, FuncArgs, Position, Scope, AST};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::ExtensionError;
use crate::exception::normalize_exception;

/// Name under which hook handlers see the fired event.
pub const EVENT_BINDING: &str = "event";

// ─── Interrupt ──────────────────────────────────────────────────────────

/// Cooperative interrupt flag for one instance.
///
/// The engine polls the flag on every operation and terminates the running
/// script once it is set. The pool clears it when the instance comes back.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ─── Instance ───────────────────────────────────────────────────────────

pub struct RuntimeInstance {
    id: Uuid,
    extension_id: String,
    engine: Engine,
    scope: Scope<'static>,
    program: Option<Arc<AST>>,
    interrupt: InterruptHandle,
}

impl std::fmt::Debug for RuntimeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInstance")
            .field("id", &self.id)
            .field("extension_id", &self.extension_id)
            .field("evaluated", &self.program.is_some())
            .finish_non_exhaustive()
    }
}

impl RuntimeInstance {
    /// Create a fresh sandboxed instance.
    ///
    /// Applies the configured limits, disables `eval` and module imports,
    /// forwards `print`/`debug` to tracing and installs the interrupt check.
    pub fn new(extension_id: &str, config: &SandboxConfig) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_depth);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_map_size);
        engine.disable_symbol("eval");
        engine.set_module_resolver(DummyModuleResolver::new());

        let ext = extension_id.to_string();
        engine.on_print(move |text| {
            tracing::info!(extension = %ext, "{}", text);
        });
        let ext = extension_id.to_string();
        engine.on_debug(move |text, source, pos: Position| {
            tracing::debug!(extension = %ext, source = ?source, position = %pos, "{}", text);
        });

        let interrupt = InterruptHandle::default();
        let flag = interrupt.clone();
        engine.on_progress(move |_ops| {
            if flag.is_interrupted() {
                Some(Dynamic::from("interrupted"))
            } else {
                None
            }
        });

        Self {
            id: Uuid::new_v4(),
            extension_id: extension_id.to_string(),
            engine,
            scope: Scope::new(),
            program: None,
            interrupt,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Mutable engine access, used by the capability binder.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.clear();
    }

    /// Compile source with this instance's engine (and its restrictions).
    pub fn compile(&self, source: &str) -> Result<AST, ExtensionError> {
        self.engine
            .compile(source)
            .map_err(|e| ExtensionError::Instance(format!("compile failed: {e}")))
    }

    /// Run the program's top-level statements once and keep the resulting
    /// globals for later calls.
    pub fn evaluate(&mut self, program: Arc<AST>) -> Result<(), ExtensionError> {
        self.engine
            .run_ast_with_scope(&mut self.scope, &program)
            .map_err(normalize_exception)?;
        self.program = Some(program);
        Ok(())
    }

    /// Whether the evaluated program defines a script function `name`.
    pub fn has_function(&self, name: &str) -> bool {
        self.program
            .as_ref()
            .is_some_and(|ast| ast.iter_functions().any(|f| f.name == name))
    }

    /// Call a script function of the evaluated program.
    pub fn call(&mut self, function: &str, args: impl FuncArgs) -> Result<Dynamic, ExtensionError> {
        let program = self.program.as_ref().ok_or_else(|| {
            ExtensionError::Instance(format!(
                "instance of {} has no evaluated program",
                self.extension_id
            ))
        })?;
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut self.scope, program, function, args)
            .map_err(normalize_exception)
    }

    /// Run a standalone program with `value` bound as [`EVENT_BINDING`] and
    /// any extra bindings pushed before it.
    pub fn run_bound(
        &self,
        program: &AST,
        bindings: Vec<(&'static str, Dynamic)>,
        value: Dynamic,
    ) -> Result<Dynamic, ExtensionError> {
        let mut scope = Scope::new();
        for (name, bound) in bindings {
            scope.push_dynamic(name, bound);
        }
        scope.push_dynamic(EVENT_BINDING, value);
        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, program)
            .map_err(normalize_exception)
    }
}
