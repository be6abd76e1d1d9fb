//! Host lifecycle hook subsystem.
//!
//! Every lifecycle event has one [`Hook`] on the [`HookManager`]. Host code
//! binds typed handlers and triggers events; the script side binds through
//! the type-erased [`HOOK_TABLE`], which is generated together with the
//! manager so the two can never drift apart.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::ExtensionError;
use crate::events::{
    AutoDownloaderRuleCreatedEvent, GetAnimeCollectionEvent, GetAnimeEvent,
    GetRawAnimeCollectionEvent, PlaylistCreatedEvent, ServeEvent,
};

/// An event payload that can flow through a hook.
pub trait HookEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Tags used to route the event to tag-filtered handlers.
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Handler that works on the JSON form of an event.
///
/// Returning `Some(value)` replaces the event with `value`.
pub trait JsonHandler: Send + Sync {
    fn handle(
        &self,
        event: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, ExtensionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

type HandlerFn<E> = Arc<dyn Fn(&mut E) -> Result<(), ExtensionError> + Send + Sync>;

struct Handler<E> {
    id: HandlerId,
    tags: Vec<String>,
    func: HandlerFn<E>,
}

// ─── Hook ────────────────────────────────────────────────────────────

/// Ordered list of handlers for one event type.
pub struct Hook<E> {
    name: &'static str,
    handlers: RwLock<Vec<Handler<E>>>,
    next_id: AtomicU64,
}

impl<E: HookEvent> Hook<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bind a handler that sees every event.
    pub fn bind_func<F>(&self, func: F) -> HandlerId
    where
        F: Fn(&mut E) -> Result<(), ExtensionError> + Send + Sync + 'static,
    {
        self.bind_with_tags(Vec::new(), Arc::new(func))
    }

    fn bind_with_tags(&self, tags: Vec<String>, func: HandlerFn<E>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push(Handler { id, tags, func });
        id
    }

    pub fn unbind(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every matching handler in registration order.
    ///
    /// A failing handler does not stop the ones after it; the first error
    /// is returned once all have run.
    pub fn trigger(&self, event: &mut E) -> Result<(), ExtensionError> {
        // Snapshot so handlers may bind/unbind without deadlocking.
        let handlers: Vec<(HandlerId, Vec<String>, HandlerFn<E>)> = self
            .handlers
            .read()
            .iter()
            .map(|h| (h.id, h.tags.clone(), Arc::clone(&h.func)))
            .collect();
        let event_tags = event.tags();

        let mut first_error = None;
        for (id, tags, func) in handlers {
            if !tags.is_empty() && !tags.iter().any(|t| event_tags.contains(t)) {
                continue;
            }
            if let Err(e) = func(event) {
                warn!(hook = self.name, handler = %id, error = %e, "hook handler failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<E> fmt::Debug for Hook<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

/// A hook viewed through a tag filter. Handlers bound through it only run
/// for events carrying one of the tags (or every event if there are none).
pub struct TaggedHook<'a, E> {
    hook: &'a Hook<E>,
    tags: Vec<String>,
}

impl<'a, E: HookEvent> TaggedHook<'a, E> {
    pub fn new(hook: &'a Hook<E>, tags: &[&str]) -> Self {
        Self {
            hook,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn bind_func<F>(&self, func: F) -> HandlerId
    where
        F: Fn(&mut E) -> Result<(), ExtensionError> + Send + Sync + 'static,
    {
        self.hook.bind_with_tags(self.tags.clone(), Arc::new(func))
    }

    pub fn unbind(&self, id: HandlerId) -> bool {
        self.hook.unbind(id)
    }

    pub fn trigger(&self, event: &mut E) -> Result<(), ExtensionError> {
        self.hook.trigger(event)
    }

    pub fn hook(&self) -> &'a Hook<E> {
        self.hook
    }
}

// ─── Type-erased binding ─────────────────────────────────────────────

/// One row of the static event table.
#[derive(Clone, Copy)]
pub struct HookDescriptor {
    /// Host name, e.g. `on_get_anime`.
    pub name: &'static str,
    pub bind: fn(&HookManager, &[String], Arc<dyn JsonHandler>) -> HandlerId,
    pub unbind: fn(&HookManager, HandlerId) -> bool,
}

impl fmt::Debug for HookDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDescriptor").field("name", &self.name).finish()
    }
}

fn bind_json<E: HookEvent>(
    hook: &Hook<E>,
    tags: &[String],
    handler: Arc<dyn JsonHandler>,
) -> HandlerId {
    let func: HandlerFn<E> = Arc::new(move |event: &mut E| -> Result<(), ExtensionError> {
        let value = serde_json::to_value(&*event)?;
        if let Some(replaced) = handler.handle(value)? {
            *event = serde_json::from_value(replaced)?;
        }
        Ok(())
    });
    hook.bind_with_tags(tags.to_vec(), func)
}

macro_rules! hook_manager {
    ($( $name:ident : $event:ty ),* $(,)?) => {
        /// One hook per lifecycle event.
        pub struct HookManager {
            $( $name: Hook<$event>, )*
        }

        impl HookManager {
            pub fn new() -> Self {
                Self {
                    $( $name: Hook::new(stringify!($name)), )*
                }
            }

            $(
                pub fn $name(&self, tags: &[&str]) -> TaggedHook<'_, $event> {
                    TaggedHook::new(&self.$name, tags)
                }
            )*
        }

        /// Every host hook, in declaration order.
        pub static HOOK_TABLE: &[HookDescriptor] = &[
            $(
                HookDescriptor {
                    name: stringify!($name),
                    bind: |manager, tags, handler| bind_json(&manager.$name, tags, handler),
                    unbind: |manager, id| manager.$name.unbind(id),
                },
            )*
        ];
    };
}

hook_manager! {
    on_get_anime: GetAnimeEvent,
    on_get_anime_collection: GetAnimeCollectionEvent,
    on_get_raw_anime_collection: GetRawAnimeCollectionEvent,
    on_auto_downloader_rule_created: AutoDownloaderRuleCreatedEvent,
    on_playlist_created: PlaylistCreatedEvent,
    on_serve: ServeEvent,
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookManager")
            .field("hooks", &HOOK_TABLE.len())
            .finish_non_exhaustive()
    }
}

/// Look up a table row by host name.
pub fn hook_descriptor(name: &str) -> Option<&'static HookDescriptor> {
    HOOK_TABLE.iter().find(|d| d.name == name)
}
