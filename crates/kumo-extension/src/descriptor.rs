//! Extension descriptors: what an extension is and what it must provide.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::manifest::Permissions;
use crate::naming::to_script_case;

/// Extension category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionType {
    AnimeTorrentProvider,
    MangaProvider,
    OnlinestreamProvider,
    Plugin,
}

impl ExtensionType {
    /// Provider kind, or `None` for plugins.
    pub fn provider_kind(self) -> Option<ProviderKind> {
        match self {
            Self::AnimeTorrentProvider => Some(ProviderKind::AnimeTorrent),
            Self::MangaProvider => Some(ProviderKind::Manga),
            Self::OnlinestreamProvider => Some(ProviderKind::Onlinestream),
            Self::Plugin => None,
        }
    }

    pub fn is_plugin(self) -> bool {
        self == Self::Plugin
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnimeTorrentProvider => "anime-torrent-provider",
            Self::MangaProvider => "manga-provider",
            Self::OnlinestreamProvider => "onlinestream-provider",
            Self::Plugin => "plugin",
        }
    }
}

impl fmt::Display for ExtensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three content provider kinds and their required script surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    AnimeTorrent,
    Manga,
    Onlinestream,
}

impl ProviderKind {
    /// Host-side names of the methods a provider of this kind must define.
    pub fn required_methods(self) -> &'static [&'static str] {
        match self {
            Self::AnimeTorrent => &[
                "search",
                "smart_search",
                "get_torrent_info_hash",
                "get_torrent_magnet_link",
                "get_latest",
                "get_settings",
            ],
            Self::Manga => &["search", "find_chapters", "find_chapter_pages"],
            Self::Onlinestream => &[
                "search",
                "find_episodes",
                "find_episode_server",
                "get_settings",
            ],
        }
    }

    /// The same methods as the script sees them.
    pub fn required_script_functions(self) -> Vec<String> {
        self.required_methods()
            .iter()
            .map(|m| to_script_case(m))
            .collect()
    }
}

/// Source language of an extension payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Language {
    /// Executable as is.
    #[default]
    Rhai,
    /// Must be transpiled to plain Rhai before loading.
    TypedRhai,
}

impl Language {
    pub fn requires_conversion(self) -> bool {
        matches!(self, Self::TypedRhai)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rhai => f.write_str("rhai"),
            Self::TypedRhai => f.write_str("typed-rhai"),
        }
    }
}

/// Everything the loader needs to know about one extension.
///
/// Immutable once loading starts; shared as `Arc<ExtensionDescriptor>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub extension_type: ExtensionType,
    #[serde(default)]
    pub language: Language,
    /// Raw source code.
    pub payload: String,
    #[serde(default)]
    pub manifest_uri: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
}

impl ExtensionDescriptor {
    /// Minimal descriptor; name defaults to the id and version to `0.0.0`.
    pub fn new(
        id: impl Into<String>,
        extension_type: ExtensionType,
        language: Language,
        payload: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: "0.0.0".to_string(),
            extension_type,
            language,
            payload: payload.into(),
            manifest_uri: None,
            author: None,
            description: None,
            permissions: Permissions::default(),
        }
    }

    pub fn with_http_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.http_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn is_plugin(&self) -> bool {
        self.extension_type.is_plugin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_type_serde_names() {
        let json = serde_json::to_string(&ExtensionType::AnimeTorrentProvider).unwrap();
        assert_eq!(json, "\"anime-torrent-provider\"");
        let parsed: ExtensionType = serde_json::from_str("\"onlinestream-provider\"").unwrap();
        assert_eq!(parsed, ExtensionType::OnlinestreamProvider);
        assert_eq!(ExtensionType::MangaProvider.to_string(), "manga-provider");
    }

    #[test]
    fn test_provider_kind_mapping() {
        assert_eq!(
            ExtensionType::MangaProvider.provider_kind(),
            Some(ProviderKind::Manga)
        );
        assert_eq!(ExtensionType::Plugin.provider_kind(), None);
        assert!(ExtensionType::Plugin.is_plugin());
    }

    #[test]
    fn test_required_script_functions_anime_torrent() {
        assert_eq!(
            ProviderKind::AnimeTorrent.required_script_functions(),
            [
                "search",
                "smartSearch",
                "getTorrentInfoHash",
                "getTorrentMagnetLink",
                "getLatest",
                "getSettings"
            ]
        );
    }

    #[test]
    fn test_required_script_functions_manga_and_onlinestream() {
        assert_eq!(
            ProviderKind::Manga.required_script_functions(),
            ["search", "findChapters", "findChapterPages"]
        );
        assert_eq!(
            ProviderKind::Onlinestream.required_script_functions(),
            ["search", "findEpisodes", "findEpisodeServer", "getSettings"]
        );
    }

    #[test]
    fn test_language_conversion() {
        assert!(!Language::Rhai.requires_conversion());
        assert!(Language::TypedRhai.requires_conversion());
        let parsed: Language = serde_json::from_str("\"typed-rhai\"").unwrap();
        assert_eq!(parsed, Language::TypedRhai);
    }

    #[test]
    fn test_descriptor_builder() {
        let d = ExtensionDescriptor::new("my-ext", ExtensionType::Plugin, Language::Rhai, "fn init() {}")
            .with_version("1.2.0")
            .with_http_hosts(["api.example.com"]);
        assert_eq!(d.name, "my-ext");
        assert_eq!(d.version, "1.2.0");
        assert_eq!(d.permissions.http_hosts, ["api.example.com"]);
        assert!(d.is_plugin());
    }
}
