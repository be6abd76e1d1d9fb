// Shared test utilities for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use kumo_extension::{
    ExtensionBank, ExtensionDescriptor, ExtensionLoader, ExtensionType, HookManager, Language,
    RuntimeConfig, RuntimeManager,
};

pub const MANGA_PROVIDER: &str = r#"
    fn search(opts) {
        [#{ id: "op", title: opts.query, url: "https://manga.example.com/op" }]
    }

    fn findChapters(id) {
        if id == "" { throw "empty id"; }
        [#{ id: id + "-1", chapterNumber: "1" }, #{ id: id + "-2", chapterNumber: "2" }]
    }

    fn findChapterPages(id) { [] }
"#;

/// A loader with fresh, empty shared state.
pub fn loader(pool_size: usize) -> ExtensionLoader {
    let config = RuntimeConfig {
        pool_size,
        ..RuntimeConfig::default()
    };
    ExtensionLoader::new(
        config,
        Arc::new(RuntimeManager::new(pool_size)),
        Arc::new(ExtensionBank::new()),
        Arc::new(HookManager::new()),
    )
}

pub fn manga(id: &str, source: &str) -> ExtensionDescriptor {
    ExtensionDescriptor::new(id, ExtensionType::MangaProvider, Language::Rhai, source)
}

pub fn plugin(id: &str, source: &str) -> ExtensionDescriptor {
    ExtensionDescriptor::new(id, ExtensionType::Plugin, Language::Rhai, source)
}
