//! Kumo extension runtime
//!
//! Embedded Rhai runtime for user-supplied extensions. Content providers
//! (anime torrent, manga, online streaming) and lifecycle plugins are
//! evaluated in sandboxed engines, served from bounded per-extension
//! instance pools, and wired into the host through a capability binder and
//! a hook bridge.

pub mod bank;
pub mod binder;
pub mod bridge;
pub mod catalog;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod exception;
pub mod hooks;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod naming;
pub mod pool;
pub mod runtime;

pub use bank::{ExtensionBank, LoadedExtension, ScriptPlugin, ScriptProvider};
pub use binder::{CapabilityBinder, PluginStore};
pub use bridge::HookBridge;
pub use config::{RuntimeConfig, SandboxConfig};
pub use descriptor::{ExtensionDescriptor, ExtensionType, Language, ProviderKind};
pub use error::ExtensionError;
pub use events::{
    AutoDownloaderRuleCreatedEvent, GetAnimeCollectionEvent, GetAnimeEvent,
    GetRawAnimeCollectionEvent, PlaylistCreatedEvent, ServeEvent, EXCLUDED_HOOKS,
};
pub use exception::{normalize_exception, HostError};
pub use hooks::{HandlerId, Hook, HookEvent, HookManager, TaggedHook, HOOK_TABLE};
pub use loader::{ExtensionLoader, LoadReport, LoadStage, NoTranspiler, SourceTranspiler};
pub use manager::RuntimeManager;
pub use manifest::ExtensionManifest;
pub use pool::{AcquireContext, CancelToken, Pool, PoolStats, PooledInstance};
pub use runtime::RuntimeInstance;
