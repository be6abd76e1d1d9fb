//! Loaded extensions, keyed by id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rhai::Dynamic;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::binder::{to_host_json, to_script_value, PluginStore};
use crate::bridge::CommittedHook;
use crate::descriptor::{ExtensionDescriptor, ExtensionType, ProviderKind};
use crate::error::ExtensionError;
use crate::exception::exported_host_error;
use crate::hooks::HookManager;
use crate::naming::to_script_case;
use crate::pool::{AcquireContext, CancelToken, Pool, PoolStats};

// ─── Provider ─────────────────────────────────────────────────────────

/// A content provider backed by a pool of evaluated instances.
#[derive(Debug)]
pub struct ScriptProvider {
    descriptor: Arc<ExtensionDescriptor>,
    kind: ProviderKind,
    pool: Arc<Pool>,
    acquire_timeout: Duration,
}

impl ScriptProvider {
    pub(crate) fn new(
        descriptor: Arc<ExtensionDescriptor>,
        kind: ProviderKind,
        pool: Arc<Pool>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            descriptor,
            kind,
            pool,
            acquire_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<ExtensionDescriptor> {
        &self.descriptor
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Call a provider method by its host name (`find_chapters`), waiting
    /// at most the configured acquire timeout for an instance.
    pub fn call(&self, method: &str, args: Vec<Dynamic>) -> Result<Dynamic, ExtensionError> {
        self.call_with(method, args, &AcquireContext::with_timeout(self.acquire_timeout))
    }

    /// Like [`call`](Self::call) with a caller-supplied deadline and
    /// cancellation. Cancelling also interrupts the script once it runs.
    pub fn call_with(
        &self,
        method: &str,
        args: Vec<Dynamic>,
        ctx: &AcquireContext,
    ) -> Result<Dynamic, ExtensionError> {
        let fail = |e| ExtensionError::invocation(&self.descriptor.id, method, e);
        let function = to_script_case(method);

        let mut lease = self.pool.acquire(ctx).map_err(fail)?;
        let result = lease.call(&function, args).map_err(|e| {
            if ctx.is_cancelled() {
                fail(ExtensionError::Cancelled(self.descriptor.id.clone()))
            } else {
                fail(e)
            }
        })?;
        drop(lease);

        if let Some(host) = exported_host_error(&result) {
            return Err(fail(host.into()));
        }
        Ok(result)
    }

    /// Call a method with one serde argument and decode the result.
    ///
    /// Keys are renamed to script case on the way in and back to host case
    /// on the way out.
    pub fn call_json<I, O>(&self, method: &str, input: &I) -> Result<O, ExtensionError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.call_json_with(method, input, &AcquireContext::with_timeout(self.acquire_timeout))
    }

    pub fn call_json_with<I, O>(
        &self,
        method: &str,
        input: &I,
        ctx: &AcquireContext,
    ) -> Result<O, ExtensionError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let fail = |e| ExtensionError::invocation(&self.descriptor.id, method, e);
        let arg = to_script_value(input).map_err(|e| fail(e.into()))?;
        let result = self.call_with(method, vec![arg], ctx)?;
        let json = to_host_json(&result).map_err(|e| fail(e.into()))?;
        serde_json::from_value(json).map_err(|e| fail(e.into()))
    }

    /// [`call_json`](Self::call_json) on the blocking thread pool.
    ///
    /// Dropping the returned future interrupts the script.
    pub async fn call_async<I, O>(self: &Arc<Self>, method: &str, input: I) -> Result<O, ExtensionError>
    where
        I: Serialize + Send + 'static,
        O: DeserializeOwned + Send + 'static,
    {
        let token = CancelToken::new();
        let _cancel_on_drop = CancelOnDrop(token.clone());
        let ctx = AcquireContext::with_timeout(self.acquire_timeout).cancelled_by(token);

        let provider = Arc::clone(self);
        let method = method.to_string();
        tokio::task::spawn_blocking(move || provider.call_json_with(&method, &input, &ctx))
            .await
            .map_err(|e| ExtensionError::Instance(format!("provider task failed: {e}")))?
    }
}

/// Cancels its token when dropped.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

// ─── Plugin ───────────────────────────────────────────────────────────

/// A lifecycle plugin and the hook handlers it committed.
#[derive(Debug)]
pub struct ScriptPlugin {
    descriptor: Arc<ExtensionDescriptor>,
    pool: Arc<Pool>,
    hooks: Vec<CommittedHook>,
    store: PluginStore,
}

impl ScriptPlugin {
    pub(crate) fn new(
        descriptor: Arc<ExtensionDescriptor>,
        pool: Arc<Pool>,
        hooks: Vec<CommittedHook>,
        store: PluginStore,
    ) -> Self {
        Self {
            descriptor,
            pool,
            hooks,
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<ExtensionDescriptor> {
        &self.descriptor
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Remove every committed handler from the hook subsystem.
    pub(crate) fn unbind_hooks(&self, hooks: &HookManager) -> usize {
        self.hooks.iter().filter(|h| h.unbind(hooks)).count()
    }
}

// ─── Bank ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum LoadedExtension {
    Provider(Arc<ScriptProvider>),
    Plugin(Arc<ScriptPlugin>),
}

impl LoadedExtension {
    pub fn descriptor(&self) -> &Arc<ExtensionDescriptor> {
        match self {
            Self::Provider(p) => p.descriptor(),
            Self::Plugin(p) => p.descriptor(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor().id
    }

    pub fn extension_type(&self) -> ExtensionType {
        self.descriptor().extension_type
    }
}

/// Concurrent map of successfully loaded extensions.
#[derive(Debug, Default)]
pub struct ExtensionBank {
    entries: RwLock<HashMap<String, LoadedExtension>>,
}

impl ExtensionBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the extension built by `build` unless `id` is taken.
    ///
    /// The bank stays write-locked while `build` runs, so a duplicate id
    /// fails before anything is built and two loads of the same id cannot
    /// both succeed.
    pub(crate) fn register<F>(&self, id: &str, build: F) -> Result<LoadedExtension, ExtensionError>
    where
        F: FnOnce() -> Result<LoadedExtension, ExtensionError>,
    {
        let mut entries = self.entries.write();
        if entries.contains_key(id) {
            return Err(ExtensionError::Registration {
                id: id.to_string(),
                message: "an extension with this id is already loaded".into(),
            });
        }
        let loaded = build()?;
        entries.insert(id.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub fn get(&self, id: &str) -> Option<LoadedExtension> {
        self.entries.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn provider(&self, id: &str) -> Result<Arc<ScriptProvider>, ExtensionError> {
        match self.get(id) {
            Some(LoadedExtension::Provider(p)) => Ok(p),
            Some(other) => Err(ExtensionError::TypeMismatch {
                id: id.to_string(),
                expected: "provider".into(),
                actual: other.extension_type().to_string(),
            }),
            None => Err(ExtensionError::NotFound(id.to_string())),
        }
    }

    pub fn plugin(&self, id: &str) -> Result<Arc<ScriptPlugin>, ExtensionError> {
        match self.get(id) {
            Some(LoadedExtension::Plugin(p)) => Ok(p),
            Some(other) => Err(ExtensionError::TypeMismatch {
                id: id.to_string(),
                expected: "plugin".into(),
                actual: other.extension_type().to_string(),
            }),
            None => Err(ExtensionError::NotFound(id.to_string())),
        }
    }

    /// Loaded ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `id` and run `teardown` on it before the write lock is
    /// released, so a concurrent [`register`](Self::register) of the same id
    /// only starts once the old entry's resources are gone.
    pub(crate) fn unregister<F>(&self, id: &str, teardown: F) -> Option<LoadedExtension>
    where
        F: FnOnce(&LoadedExtension),
    {
        let mut entries = self.entries.write();
        let removed = entries.remove(id)?;
        teardown(&removed);
        Some(removed)
    }

    /// Remove every entry, running `teardown` under the write lock.
    pub(crate) fn drain_with<F>(&self, teardown: F) -> Vec<LoadedExtension>
    where
        F: FnOnce(&[LoadedExtension]),
    {
        let mut entries = self.entries.write();
        let drained: Vec<LoadedExtension> = entries.drain().map(|(_, v)| v).collect();
        teardown(&drained);
        drained
    }
}
