// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 15;
/// Chat calls also absorb the rate-limit waits the Discord client sleeps through.
pub const DEFAULT_CHAT_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_NEWS_MAX_LENGTH: u32 = 300;
pub const DEFAULT_ANNOUNCEMENT_TEMPLATE: &str =
    "@everyone PRÁVĚ BYL VYDÁN NOVÝ UPDATE ZE HRY {game}!";

/// Discord rejects embed descriptions longer than this.
pub const EMBED_DESCRIPTION_LIMIT: usize = 4096;

pub const NEWS_EMBED_COLOR: u32 = 0xE74C3C;
pub const COLOR_GOLD: u32 = 0xF1C40F;
pub const COLOR_GREEN: u32 = 0x2ECC71;
pub const COLOR_ORANGE: u32 = 0xE67E22;
pub const COLOR_RED: u32 = 0xE74C3C;

/// Steam app ids and display names posted to the update channel by default.
pub const DEFAULT_TRACKED_GAMES: [(&str, &str); 5] = [
    ("413150", "Stardew Valley"),
    ("578080", "PUBG"),
    ("271590", "GTA:V"),
    ("1245620", "Elden Ring"),
    ("244390", "Rust"),
];

/// Data-center names as reported by the game-server status endpoint.
pub const DEFAULT_DATA_CENTERS: [&str; 28] = [
    "Peru",
    "EU Germany",
    "EU Austria",
    "EU Poland",
    "Hong Kong",
    "EU Spain",
    "Chile",
    "US California",
    "US Atlanta",
    "EU Sweden",
    "Emirates",
    "US Seattle",
    "South Africa",
    "Brazil",
    "US Virginia",
    "US Chicago",
    "Japan",
    "EU Finland",
    "India Mumbai",
    "India Chennai",
    "Argentina",
    "South Korea",
    "Singapore",
    "Australia",
    "China Chengdu",
    "China Shanghai",
    "China Tianjin",
    "China Guangzhou",
];

pub type MessageId = String;
pub type ChannelId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedGame {
    pub app_id: String,
    pub name: String,
}

pub fn default_tracked_games() -> Vec<TrackedGame> {
    DEFAULT_TRACKED_GAMES
        .iter()
        .map(|(app_id, name)| TrackedGame {
            app_id: app_id.to_string(),
            name: name.to_string(),
        })
        .collect()
}

pub fn default_data_centers() -> Vec<String> {
    DEFAULT_DATA_CENTERS
        .iter()
        .map(|name| name.to_string())
        .collect()
}

/// Latest news entry for one tracked game, as fetched this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct NewsItem {
    pub game_name: String,
    pub title: String,
    pub url: String,
    pub contents: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsForAppResponse {
    #[serde(default)]
    pub appnews: Option<AppNews>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppNews {
    #[serde(default)]
    pub newsitems: Vec<NewsItemPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsItemPayload {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub contents: String,
    #[serde(default)]
    pub date: Option<i64>,
}

impl NewsForAppResponse {
    /// First news item mapped to the given game, if the feed returned any.
    pub fn into_latest(self, game_name: &str) -> Option<NewsItem> {
        let item = self.appnews?.newsitems.into_iter().next()?;
        Some(NewsItem {
            game_name: game_name.to_string(),
            title: item.title,
            url: item.url,
            contents: item.contents,
            published_at: item
                .date
                .and_then(|seconds| DateTime::from_timestamp(seconds, 0)),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameServersStatusResponse {
    #[serde(default)]
    pub result: Option<GameServersStatusResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameServersStatusResult {
    #[serde(default)]
    pub datacenters: HashMap<String, DataCenterStatus>,
}

impl GameServersStatusResponse {
    pub fn into_datacenters(self) -> HashMap<String, DataCenterStatus> {
        self.result
            .map(|result| result.datacenters)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataCenterStatus {
    #[serde(default)]
    pub capacity: Option<String>,
    #[serde(default)]
    pub load: Option<String>,
}

impl DataCenterStatus {
    pub fn capacity_label(&self) -> &str {
        self.capacity.as_deref().unwrap_or("Unknown")
    }

    pub fn load_label(&self) -> &str {
        self.load.as_deref().unwrap_or("Unknown")
    }

    pub fn capacity_class(&self) -> Capacity {
        Capacity::classify(self.capacity.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Full,
    Medium,
    Low,
    Other,
}

impl Capacity {
    /// Matching is exact; the status endpoint reports lowercase values.
    pub fn classify(value: Option<&str>) -> Self {
        match value {
            Some("full") => Self::Full,
            Some("medium") => Self::Medium,
            Some("low") => Self::Low,
            _ => Self::Other,
        }
    }

    pub fn color(self) -> u32 {
        match self {
            Self::Full => COLOR_GOLD,
            Self::Medium => COLOR_GREEN,
            Self::Low => COLOR_ORANGE,
            Self::Other => COLOR_RED,
        }
    }
}

/// Embed payload in the shape the chat API accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A message body to create or edit. `content` is only written on create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub embed: Embed,
    pub mention_everyone: bool,
}

/// A message read back from channel history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub author_id: String,
    pub content: String,
    pub embed_titles: Vec<String>,
}

impl ChatMessage {
    pub fn mentions_any<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
        names.into_iter().find(|&name| {
            self.content.contains(name)
                || self.embed_titles.iter().any(|title| title.contains(name))
        })
    }
}

pub fn render_news_embed(item: &NewsItem) -> Embed {
    Embed {
        title: Some(item.title.clone()),
        url: Some(item.url.clone()),
        description: Some(sanitize_description(&item.contents)),
        color: Some(NEWS_EMBED_COLOR),
        timestamp: item.published_at,
    }
}

pub fn render_data_center_embed(name: &str, status: &DataCenterStatus) -> Embed {
    Embed {
        title: Some(data_center_title(name)),
        url: None,
        description: Some(format!(
            "**Capacity:** {}\n**Load:** {}",
            status.capacity_label(),
            status.load_label()
        )),
        color: Some(status.capacity_class().color()),
        timestamp: None,
    }
}

pub fn data_center_title(name: &str) -> String {
    format!("{name} Data Center")
}

pub fn render_announcement(template: &str, game_name: &str) -> String {
    template.replace("{game}", game_name)
}

/// Tags the Steam announcement editor emits. Bracketed text outside this list is kept.
const STEAM_MARKUP_TAGS: &str = r"b|i|u|s|strike|spoiler|noparse|hr|url|img|video|previewyoutube|h1|h2|h3|h4|h5|h6|list|olist|\*|quote|code|table|tr|th|td|p|expand";

/// Strips HTML and Steam BBCode tags from news contents and caps the length.
pub fn sanitize_description(raw: &str) -> String {
    let tag_pattern = Regex::new(&format!(
        r"</?[a-zA-Z][^>]*>|(?i)\[/?(?:{STEAM_MARKUP_TAGS})(?:[= ][^\]]*)?\]"
    ))
    .expect("tag pattern is valid");
    let space_pattern = Regex::new(r"[ \t]+").expect("space pattern is valid");
    let blank_lines_pattern = Regex::new(r"\n{3,}").expect("blank line pattern is valid");

    let stripped = tag_pattern.replace_all(raw, "");
    let collapsed = space_pattern.replace_all(&stripped, " ");
    let collapsed = blank_lines_pattern.replace_all(&collapsed, "\n\n");
    truncate_chars(collapsed.trim(), EMBED_DESCRIPTION_LIMIT)
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(max_chars.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_classification_is_stable_and_falls_back() {
        assert_eq!(Capacity::classify(Some("full")).color(), COLOR_GOLD);
        assert_eq!(Capacity::classify(Some("full")).color(), COLOR_GOLD);
        assert_eq!(Capacity::classify(Some("medium")), Capacity::Medium);
        assert_eq!(Capacity::classify(Some("low")).color(), COLOR_ORANGE);
        assert_eq!(Capacity::classify(Some("idle")).color(), COLOR_RED);
        assert_eq!(Capacity::classify(None), Capacity::Other);
    }

    #[test]
    fn data_center_embed_renders_unknown_for_missing_fields() {
        let embed = render_data_center_embed("Peru", &DataCenterStatus::default());
        assert_eq!(embed.title.as_deref(), Some("Peru Data Center"));
        assert_eq!(
            embed.description.as_deref(),
            Some("**Capacity:** Unknown\n**Load:** Unknown")
        );
        assert_eq!(embed.color, Some(COLOR_RED));
    }

    #[test]
    fn news_response_takes_first_item_only() {
        let payload = serde_json::json!({
            "appnews": {
                "appid": 413150,
                "newsitems": [
                    {"gid": "1", "title": "Patch 1.6", "url": "https://a", "contents": "hi", "date": 1700000000},
                    {"gid": "2", "title": "Older", "url": "https://b", "contents": "old"}
                ]
            }
        });
        let response: NewsForAppResponse = serde_json::from_value(payload).unwrap();
        let item = response.into_latest("Stardew Valley").unwrap();
        assert_eq!(item.title, "Patch 1.6");
        assert_eq!(item.game_name, "Stardew Valley");
        assert_eq!(item.published_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn news_response_without_items_yields_nothing() {
        let response: NewsForAppResponse =
            serde_json::from_value(serde_json::json!({"appnews": {"newsitems": []}})).unwrap();
        assert!(response.into_latest("PUBG").is_none());

        let response: NewsForAppResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(response.into_latest("PUBG").is_none());
    }

    #[test]
    fn status_response_parses_datacenters() {
        let payload = serde_json::json!({
            "result": {
                "app": {"version": 1},
                "datacenters": {
                    "Peru": {"capacity": "full", "load": "low"},
                    "EU Germany": {"capacity": "medium"}
                }
            }
        });
        let response: GameServersStatusResponse = serde_json::from_value(payload).unwrap();
        let datacenters = response.into_datacenters();
        assert_eq!(datacenters.len(), 2);
        assert_eq!(datacenters["Peru"].capacity_class(), Capacity::Full);
        assert_eq!(datacenters["EU Germany"].load_label(), "Unknown");
    }

    #[test]
    fn sanitize_description_strips_markup_and_caps_length() {
        let raw = "<p>Hello   <b>world</b></p>[img]{STEAM_CLAN_IMAGE}/x.png[/img]\n\n\n\n[url=https://x]link[/url]";
        let clean = sanitize_description(raw);
        assert_eq!(clean, "Hello world{STEAM_CLAN_IMAGE}/x.png\n\nlink");

        let long = "a".repeat(EMBED_DESCRIPTION_LIMIT + 10);
        let capped = sanitize_description(&long);
        assert_eq!(capped.chars().count(), EMBED_DESCRIPTION_LIMIT);
        assert!(capped.ends_with("..."));
    }

    #[test]
    fn sanitize_description_keeps_bracketed_prose() {
        let raw = "[Hotfix] [EU] servers restarted [B]now[/B]\n[list][*]Fixed crash[/list] [previewyoutube=abc;full][/previewyoutube]";
        let clean = sanitize_description(raw);
        assert_eq!(clean, "[Hotfix] [EU] servers restarted now\nFixed crash");

        assert_eq!(sanitize_description("a < b and c > d"), "a < b and c > d");
    }

    #[test]
    fn chat_message_matches_content_or_embed_title() {
        let message = ChatMessage {
            id: "1".to_string(),
            author_id: "bot".to_string(),
            content: String::new(),
            embed_titles: vec!["EU Germany Data Center".to_string()],
        };
        assert_eq!(
            message.mentions_any(["Peru", "EU Germany"]),
            Some("EU Germany")
        );
        assert_eq!(message.mentions_any(["Peru"]), None);
    }

    #[test]
    fn expand_env_vars_blanks_unset_variables() {
        let expanded = expand_env_vars("key=${STEAM_STATUS_COMMON_SURELY_UNSET_VAR};");
        assert_eq!(expanded, "key=;");
    }

    #[test]
    fn announcement_template_substitutes_game_name() {
        assert_eq!(
            render_announcement(DEFAULT_ANNOUNCEMENT_TEMPLATE, "Rust"),
            "@everyone PRÁVĚ BYL VYDÁN NOVÝ UPDATE ZE HRY Rust!"
        );
    }
}
