//! Lifecycle events fired by the host application.
//!
//! Payloads are plain serde structs in host naming; the hook bridge
//! translates keys when they cross into scripts.

use serde::{Deserialize, Serialize};

use crate::hooks::HookEvent;

/// Hooks that exist on the host but are never exposed to scripts.
pub const EXCLUDED_HOOKS: &[&str] = &["on_serve"];

// ─── Domain payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaTitle {
    #[serde(default)]
    pub romaji: Option<String>,
    #[serde(default)]
    pub english: Option<String>,
    #[serde(default)]
    pub native: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuzzyDate {
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub month: Option<i32>,
    #[serde(default)]
    pub day: Option<i32>,
}

/// Anime media entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Anime {
    pub id: i64,
    #[serde(default)]
    pub id_mal: Option<i64>,
    #[serde(default)]
    pub title: MediaTitle,
    #[serde(default)]
    pub episodes: Option<i32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub banner_image: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub start_date: Option<FuzzyDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimeCollectionEntry {
    pub media: Anime,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimeCollectionList {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub entries: Vec<AnimeCollectionEntry>,
}

/// A user's anime lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimeCollection {
    #[serde(default)]
    pub lists: Vec<AnimeCollectionList>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleComparison {
    #[default]
    Contains,
    Likely,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeSelection {
    #[default]
    NextEpisodes,
    AllEpisodes,
    SelectedEpisodes,
}

/// Auto-downloader rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoDownloaderRule {
    #[serde(default)]
    pub db_id: Option<u64>,
    pub enabled: bool,
    pub media_id: i64,
    #[serde(default)]
    pub release_groups: Vec<String>,
    #[serde(default)]
    pub resolutions: Vec<String>,
    pub comparison_title: String,
    #[serde(default)]
    pub title_comparison_type: TitleComparison,
    #[serde(default)]
    pub episode_type: EpisodeSelection,
    #[serde(default)]
    pub episode_numbers: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(default)]
    pub db_id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub local_files: Vec<String>,
}

// ─── Hook events ─────────────────────────────────────────────────────

/// Fired when a single anime is fetched. Tagged with the anime id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetAnimeEvent {
    pub anime: Anime,
}

impl HookEvent for GetAnimeEvent {
    fn tags(&self) -> Vec<String> {
        vec![self.anime.id.to_string()]
    }
}

/// Fired when the user's anime collection is served.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetAnimeCollectionEvent {
    pub collection: AnimeCollection,
}

impl HookEvent for GetAnimeCollectionEvent {}

/// Fired when the unprocessed anime collection is fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetRawAnimeCollectionEvent {
    pub collection: AnimeCollection,
}

impl HookEvent for GetRawAnimeCollectionEvent {}

/// Fired after an auto-downloader rule is created. Tagged with the media id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoDownloaderRuleCreatedEvent {
    pub rule: AutoDownloaderRule,
}

impl HookEvent for AutoDownloaderRuleCreatedEvent {
    fn tags(&self) -> Vec<String> {
        vec![self.rule.media_id.to_string()]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistCreatedEvent {
    pub playlist: Playlist,
}

impl HookEvent for PlaylistCreatedEvent {}

/// Fired when the host starts serving. Host-internal only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServeEvent {
    pub address: String,
}

impl HookEvent for ServeEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_hooks() {
        assert_eq!(EXCLUDED_HOOKS, ["on_serve"]);
    }

    #[test]
    fn test_get_anime_tags() {
        let event = GetAnimeEvent {
            anime: Anime {
                id: 21,
                ..Anime::default()
            },
        };
        assert_eq!(event.tags(), ["21"]);
    }

    #[test]
    fn test_untagged_events() {
        assert!(PlaylistCreatedEvent::default().tags().is_empty());
        assert!(GetAnimeCollectionEvent::default().tags().is_empty());
    }

    #[test]
    fn test_rule_serialization() {
        let rule = AutoDownloaderRule {
            enabled: true,
            media_id: 154587,
            resolutions: vec!["1080p".into()],
            comparison_title: "Frieren".into(),
            episode_type: EpisodeSelection::SelectedEpisodes,
            episode_numbers: vec![1, 2],
            ..AutoDownloaderRule::default()
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["media_id"], 154587);
        assert_eq!(json["title_comparison_type"], "contains");
        assert_eq!(json["episode_type"], "selected_episodes");

        let back: AutoDownloaderRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
        assert_eq!(
            AutoDownloaderRuleCreatedEvent { rule: back }.tags(),
            ["154587"]
        );
    }

    #[test]
    fn test_anime_deserializes_with_missing_optionals() {
        let anime: Anime = serde_json::from_value(serde_json::json!({ "id": 1 })).unwrap();
        assert_eq!(anime.id, 1);
        assert!(anime.genres.is_empty());
        assert!(anime.title.english.is_none());
    }
}
