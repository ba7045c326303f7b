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

use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serenity::{
    all::{
        ChannelId as DiscordChannelId, CreateAllowedMentions, CreateEmbed, CreateMessage,
        EditMessage, GetMessages, Message, MessageId as DiscordMessageId, Timestamp,
    },
    http::{Http, HttpBuilder},
};
use steam_status_common::{
    ChannelId, ChatMessage, DEFAULT_ANNOUNCEMENT_TEMPLATE, DEFAULT_CHAT_TIMEOUT_SECONDS,
    DEFAULT_NEWS_MAX_LENGTH, DEFAULT_POLL_INTERVAL_SECONDS, DEFAULT_REQUEST_TIMEOUT_SECONDS,
    DataCenterStatus, Embed,
    GameServersStatusResponse, MessageId, NewsForAppResponse, NewsItem, OutgoingMessage,
    TrackedGame, data_center_title, default_data_centers, default_tracked_games,
    expand_env_vars, render_announcement, render_data_center_embed, render_news_embed,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const DISCORD_HISTORY_PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_ATTEMPTS: u32 = 3;
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Settings {
    discord_token: String,
    /// Replaces `https://discord.com` in every request URL, for an HTTP proxy or a local stub.
    discord_api_proxy: Option<String>,
    steam_api_key: String,
    steam_api_base_url: String,
    update_channel_id: ChannelId,
    data_center_channel_id: ChannelId,
    poll_interval: Duration,
    request_timeout: Duration,
    chat_timeout: Duration,
    news_max_length: u32,
    announcement_template: String,
    startup_sweep_enabled: bool,
    startup_sweep_history_limit: usize,
    tracked: TrackedEntities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedEntities {
    games: Vec<TrackedGame>,
    data_centers: Vec<String>,
}

impl Default for TrackedEntities {
    fn default() -> Self {
        Self {
            games: default_tracked_games(),
            data_centers: default_data_centers(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TrackedEntitiesFile {
    #[serde(default)]
    games: Option<Vec<TrackedGame>>,
    #[serde(default)]
    data_centers: Option<Vec<String>>,
}

impl Settings {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            discord_token: required_env("DISCORD_BOT_TOKEN")?,
            discord_api_proxy: normalize_optional_string(
                std::env::var("DISCORD_API_PROXY_URL").ok(),
            ),
            steam_api_key: required_env("STEAM_API_KEY")?,
            steam_api_base_url: std::env::var("STEAM_API_BASE_URL")
                .ok()
                .unwrap_or_else(|| "https://api.steampowered.com".to_string()),
            update_channel_id: parse_channel_id(
                "UPDATE_CHANNEL_ID",
                &required_env("UPDATE_CHANNEL_ID")?,
            )?,
            data_center_channel_id: parse_channel_id(
                "DATA_CENTER_CHANNEL_ID",
                &required_env("DATA_CENTER_CHANNEL_ID")?,
            )?,
            poll_interval: Duration::from_secs(
                parse_env_u64("POLL_INTERVAL_SECONDS", DEFAULT_POLL_INTERVAL_SECONDS).max(1),
            ),
            request_timeout: Duration::from_secs(
                parse_env_u64("REQUEST_TIMEOUT_SECONDS", DEFAULT_REQUEST_TIMEOUT_SECONDS).max(1),
            ),
            chat_timeout: Duration::from_secs(
                parse_env_u64("CHAT_TIMEOUT_SECONDS", DEFAULT_CHAT_TIMEOUT_SECONDS).max(1),
            ),
            news_max_length: std::env::var("NEWS_MAX_LENGTH")
                .ok()
                .and_then(|value| value.trim().parse::<u32>().ok())
                .unwrap_or(DEFAULT_NEWS_MAX_LENGTH),
            announcement_template: normalize_optional_string(
                std::env::var("ANNOUNCEMENT_TEMPLATE").ok(),
            )
            .unwrap_or_else(|| DEFAULT_ANNOUNCEMENT_TEMPLATE.to_string()),
            startup_sweep_enabled: parse_env_bool("STARTUP_SWEEP_ENABLED", true),
            startup_sweep_history_limit: parse_env_u64("STARTUP_SWEEP_HISTORY_LIMIT", 500)
                as usize,
            tracked: load_tracked_entities(),
        })
    }

    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            update_channel_id: self.update_channel_id,
            data_center_channel_id: self.data_center_channel_id,
            games: self.tracked.games.clone(),
            data_centers: self.tracked.data_centers.clone(),
            announcement_template: self.announcement_template.clone(),
            request_timeout: self.request_timeout,
            chat_timeout: self.chat_timeout,
            startup_sweep_enabled: self.startup_sweep_enabled,
            startup_sweep_history_limit: self.startup_sweep_history_limit,
        }
    }
}

fn required_env(var_name: &str) -> anyhow::Result<String> {
    normalize_optional_string(std::env::var(var_name).ok())
        .with_context(|| format!("{var_name} must be set"))
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

fn parse_channel_id(var_name: &str, value: &str) -> anyhow::Result<ChannelId> {
    let id = value
        .trim()
        .parse::<ChannelId>()
        .with_context(|| format!("invalid {var_name}: expected a numeric channel id"))?;
    if id == 0 {
        anyhow::bail!("invalid {var_name}: channel id must not be zero");
    }
    Ok(id)
}

fn parse_env_u64(var_name: &str, default: u64) -> u64 {
    std::env::var(var_name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_env_bool(var_name: &str, default: bool) -> bool {
    std::env::var(var_name)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            if normalized.is_empty() {
                default
            } else {
                !matches!(normalized.as_str(), "0" | "false" | "no" | "off")
            }
        })
        .unwrap_or(default)
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

fn load_tracked_entities() -> TrackedEntities {
    let Some(path) = normalize_optional_string(std::env::var("TRACKED_ENTITIES_PATH").ok()) else {
        return TrackedEntities::default();
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read tracked entities file; using defaults");
            return TrackedEntities::default();
        }
    };

    match parse_tracked_entities(&expand_env_vars(&raw)) {
        Ok(tracked) => {
            info!(
                path = %path,
                game_count = tracked.games.len(),
                data_center_count = tracked.data_centers.len(),
                "loaded tracked entities"
            );
            tracked
        }
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse tracked entities yaml; using defaults");
            TrackedEntities::default()
        }
    }
}

/// Sections missing from the file keep their compiled-in defaults.
fn parse_tracked_entities(raw: &str) -> anyhow::Result<TrackedEntities> {
    if raw.trim().is_empty() {
        return Ok(TrackedEntities::default());
    }
    let parsed = serde_yaml::from_str::<Option<TrackedEntitiesFile>>(raw)
        .context("invalid tracked entities yaml")?
        .unwrap_or_default();
    let defaults = TrackedEntities::default();
    Ok(TrackedEntities {
        games: parsed.games.unwrap_or(defaults.games),
        data_centers: parsed.data_centers.unwrap_or(defaults.data_centers),
    })
}

#[async_trait]
trait SteamSource: Send + Sync {
    async fn latest_news(&self, game: &TrackedGame) -> anyhow::Result<Option<NewsItem>>;
    async fn data_center_status(&self) -> anyhow::Result<HashMap<String, DataCenterStatus>>;
}

#[derive(Clone)]
struct SteamWebApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    news_max_length: u32,
}

impl SteamWebApi {
    fn new(settings: &Settings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .context("failed to build steam http client")?;
        Ok(Self {
            client,
            base_url: settings.steam_api_base_url.clone(),
            api_key: settings.steam_api_key.clone(),
            news_max_length: settings.news_max_length,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, String)],
        what: &str,
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("failed to call steam {what}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("steam {what} returned {status}: {body}");
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("invalid steam {what} payload"))
    }
}

#[async_trait]
impl SteamSource for SteamWebApi {
    async fn latest_news(&self, game: &TrackedGame) -> anyhow::Result<Option<NewsItem>> {
        let url = self.endpoint("ISteamNews/GetNewsForApp/v0002/");
        let query = [
            ("appid", game.app_id.clone()),
            ("count", "1".to_string()),
            ("maxlength", self.news_max_length.to_string()),
            ("format", "json".to_string()),
        ];
        let response: NewsForAppResponse = self.get_json(url, &query, "news").await?;
        Ok(response.into_latest(&game.name))
    }

    async fn data_center_status(&self) -> anyhow::Result<HashMap<String, DataCenterStatus>> {
        let url = self.endpoint("ICSGOServers_730/GetGameServersStatus/v1/");
        let query = [("key", self.api_key.clone())];
        let response: GameServersStatusResponse =
            self.get_json(url, &query, "server status").await?;
        Ok(response.into_datacenters())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BotIdentity {
    id: String,
    username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditOutcome {
    Edited,
    Missing,
}

#[async_trait]
trait ChatTransport: Send + Sync {
    async fn current_user(&self) -> anyhow::Result<BotIdentity>;
    async fn channel_exists(&self, channel_id: ChannelId) -> anyhow::Result<bool>;
    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: &OutgoingMessage,
    ) -> anyhow::Result<MessageId>;
    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: &str,
        message: &OutgoingMessage,
    ) -> anyhow::Result<EditOutcome>;
    /// `false` when the platform no longer has the message.
    async fn message_exists(&self, channel_id: ChannelId, message_id: &str)
    -> anyhow::Result<bool>;
    /// Deleting a message that is already gone succeeds.
    async fn delete_message(&self, channel_id: ChannelId, message_id: &str) -> anyhow::Result<()>;
    /// Newest first, at most `limit` messages.
    async fn recent_messages(
        &self,
        channel_id: ChannelId,
        limit: usize,
    ) -> anyhow::Result<Vec<ChatMessage>>;
}

/// Discord REST transport on serenity's `Http` client.
///
/// Serenity's ratelimiter owns bucket tracking and `429` retries. It is switched off when a
/// proxy is configured, so `429`s that still surface are retried here a bounded number of times.
#[derive(Clone)]
struct DiscordTransport {
    http: Arc<Http>,
    rate_limit_backoff: Duration,
}

impl DiscordTransport {
    fn new(token: &str, proxy: Option<&str>) -> Self {
        let mut builder = HttpBuilder::new(token);
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy).ratelimiter_disabled(true);
        }
        Self {
            http: Arc::new(builder.build()),
            rate_limit_backoff: RATE_LIMIT_BACKOFF,
        }
    }

    async fn retry_rate_limited<T, F, Fut>(&self, action: &str, mut call: F) -> serenity::Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = serenity::Result<T>> + Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(error)
                    if discord_status(&error) == Some(429) && attempt < MAX_RATE_LIMIT_ATTEMPTS =>
                {
                    let wait = self.rate_limit_backoff * attempt;
                    warn!(
                        action,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "discord rate limited request"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn discord_status(error: &serenity::Error) -> Option<u16> {
    match error {
        serenity::Error::Http(http_error) => http_error.status_code().map(|code| code.as_u16()),
        _ => None,
    }
}

fn is_not_found(error: &serenity::Error) -> bool {
    discord_status(error) == Some(404)
}

fn discord_channel(channel_id: ChannelId) -> anyhow::Result<DiscordChannelId> {
    if channel_id == 0 {
        anyhow::bail!("discord channel id must not be zero");
    }
    Ok(DiscordChannelId::new(channel_id))
}

fn discord_message(message_id: &str) -> anyhow::Result<DiscordMessageId> {
    let id = message_id
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .with_context(|| format!("invalid discord message id {message_id:?}"))?;
    Ok(DiscordMessageId::new(id))
}

fn create_embed(embed: &Embed) -> CreateEmbed {
    let mut builder = CreateEmbed::new();
    if let Some(title) = &embed.title {
        builder = builder.title(title.clone());
    }
    if let Some(url) = &embed.url {
        builder = builder.url(url.clone());
    }
    if let Some(description) = &embed.description {
        builder = builder.description(description.clone());
    }
    if let Some(color) = embed.color {
        builder = builder.colour(color);
    }
    if let Some(timestamp) = embed
        .timestamp
        .and_then(|published| Timestamp::from_unix_timestamp(published.timestamp()).ok())
    {
        builder = builder.timestamp(timestamp);
    }
    builder
}

/// Only announcements may ping `@everyone`; every other message suppresses mentions.
fn create_message(message: &OutgoingMessage) -> CreateMessage {
    let mentions = if message.mention_everyone {
        CreateAllowedMentions::new().everyone(true)
    } else {
        CreateAllowedMentions::new()
    };
    let mut builder = CreateMessage::new()
        .embed(create_embed(&message.embed))
        .allowed_mentions(mentions);
    if let Some(content) = &message.content {
        builder = builder.content(content.clone());
    }
    builder
}

fn chat_message(message: Message) -> ChatMessage {
    ChatMessage {
        id: message.id.to_string(),
        author_id: message.author.id.to_string(),
        content: message.content,
        embed_titles: message
            .embeds
            .into_iter()
            .filter_map(|embed| embed.title)
            .collect(),
    }
}

#[async_trait]
impl ChatTransport for DiscordTransport {
    async fn current_user(&self) -> anyhow::Result<BotIdentity> {
        let user = self
            .retry_rate_limited("current user", || self.http.get_current_user())
            .await
            .context("failed to resolve discord current user")?;
        Ok(BotIdentity {
            id: user.id.to_string(),
            username: user.name.clone(),
        })
    }

    async fn channel_exists(&self, channel_id: ChannelId) -> anyhow::Result<bool> {
        let channel = discord_channel(channel_id)?;
        match self
            .retry_rate_limited("channel lookup", || channel.to_channel(&self.http))
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if matches!(discord_status(&error), Some(403 | 404)) => Ok(false),
            Err(error) => Err(error).context("failed to look up discord channel"),
        }
    }

    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: &OutgoingMessage,
    ) -> anyhow::Result<MessageId> {
        let channel = discord_channel(channel_id)?;
        let builder = create_message(message);
        let sent = self
            .retry_rate_limited("send message", || {
                channel.send_message(&self.http, builder.clone())
            })
            .await
            .context("failed to send discord message")?;
        Ok(sent.id.to_string())
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: &str,
        message: &OutgoingMessage,
    ) -> anyhow::Result<EditOutcome> {
        let channel = discord_channel(channel_id)?;
        let target = discord_message(message_id)?;
        let builder = EditMessage::new().embed(create_embed(&message.embed));
        match self
            .retry_rate_limited("edit message", || {
                channel.edit_message(&self.http, target, builder.clone())
            })
            .await
        {
            Ok(_) => Ok(EditOutcome::Edited),
            Err(error) if is_not_found(&error) => Ok(EditOutcome::Missing),
            Err(error) => Err(error).context("failed to edit discord message"),
        }
    }

    async fn message_exists(
        &self,
        channel_id: ChannelId,
        message_id: &str,
    ) -> anyhow::Result<bool> {
        let channel = discord_channel(channel_id)?;
        let target = discord_message(message_id)?;
        match self
            .retry_rate_limited("message lookup", || channel.message(&self.http, target))
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if is_not_found(&error) => Ok(false),
            Err(error) => Err(error).context("failed to look up discord message"),
        }
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: &str) -> anyhow::Result<()> {
        let channel = discord_channel(channel_id)?;
        let target = discord_message(message_id)?;
        match self
            .retry_rate_limited("delete message", || {
                channel.delete_message(&self.http, target)
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error).context("failed to delete discord message"),
        }
    }

    async fn recent_messages(
        &self,
        channel_id: ChannelId,
        limit: usize,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let channel = discord_channel(channel_id)?;
        let mut collected: Vec<ChatMessage> = Vec::new();
        let mut before: Option<DiscordMessageId> = None;

        while collected.len() < limit {
            let page_size = (limit - collected.len()).min(DISCORD_HISTORY_PAGE_SIZE);
            let page = self
                .retry_rate_limited("channel history", || {
                    let mut request = GetMessages::new().limit(page_size as u8);
                    if let Some(cursor) = before {
                        request = request.before(cursor);
                    }
                    channel.messages(&self.http, request)
                })
                .await
                .context("failed to read discord channel history")?;

            let fetched = page.len();
            before = page.last().map(|message| message.id);
            collected.extend(page.into_iter().map(chat_message));
            if fetched < page_size || before.is_none() {
                break;
            }
        }

        Ok(collected)
    }
}

async fn with_timeout<T, F>(limit: Duration, label: &str, future: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("{label} timed out after {limit:?}"),
    }
}

#[derive(Debug, Clone)]
struct BridgeConfig {
    update_channel_id: ChannelId,
    data_center_channel_id: ChannelId,
    games: Vec<TrackedGame>,
    /// Empty means every data center the status endpoint reports.
    data_centers: Vec<String>,
    announcement_template: String,
    /// Budget for one Steam fetch.
    request_timeout: Duration,
    /// Budget for one chat call, including any rate-limit waits inside it.
    chat_timeout: Duration,
    startup_sweep_enabled: bool,
    startup_sweep_history_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedMessage {
    message_id: MessageId,
    embed: Embed,
}

/// Last message written per entity. Owned by the scheduler's `Bridge`; never shared.
#[derive(Debug, Default)]
struct ReconciliationStore {
    games: HashMap<String, TrackedMessage>,
    data_centers: HashMap<String, TrackedMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOutcome {
    Created,
    Edited,
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
struct ChannelReport {
    created: usize,
    edited: usize,
    unchanged: usize,
    deleted: usize,
    failed: usize,
    skipped: usize,
}

impl ChannelReport {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Edited => self.edited += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct TickReport {
    tick: u64,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    games: ChannelReport,
    data_center_status_available: bool,
    data_centers: ChannelReport,
}

struct Bridge {
    steam: Arc<dyn SteamSource>,
    chat: Arc<dyn ChatTransport>,
    config: BridgeConfig,
    store: ReconciliationStore,
    bot_user_id: String,
    startup_sweep_pending: bool,
}

/// Resolves the bot identity and both channels; the update loop must not start otherwise.
async fn prepare_bridge(
    steam: Arc<dyn SteamSource>,
    chat: Arc<dyn ChatTransport>,
    config: BridgeConfig,
) -> anyhow::Result<Bridge> {
    let identity = with_timeout(config.chat_timeout, "bot identity", chat.current_user())
        .await
        .context("failed to resolve bot identity")?;
    info!(user = %identity.username, user_id = %identity.id, "logged in");

    for (label, channel_id) in [
        ("update", config.update_channel_id),
        ("data center", config.data_center_channel_id),
    ] {
        let exists = with_timeout(
            config.chat_timeout,
            "channel lookup",
            chat.channel_exists(channel_id),
        )
        .await
        .with_context(|| format!("failed to look up {label} channel {channel_id}"))?;
        if !exists {
            anyhow::bail!("{label} channel with id {channel_id} not found");
        }
    }

    Ok(Bridge {
        steam,
        chat,
        startup_sweep_pending: config.startup_sweep_enabled,
        config,
        store: ReconciliationStore::default(),
        bot_user_id: identity.id,
    })
}

impl Bridge {
    async fn run_tick(&mut self, tick: u64) -> TickReport {
        let started_at = Utc::now();
        let mut games = ChannelReport::default();
        let news = fetch_game_news(
            self.steam.as_ref(),
            &self.config.games,
            self.config.request_timeout,
        )
        .await;
        games.skipped = self.config.games.len().saturating_sub(news.len());
        for item in news {
            games.record(self.upsert_game_news(item).await);
        }

        let mut data_centers = ChannelReport::default();
        let statuses =
            fetch_data_center_status(self.steam.as_ref(), self.config.request_timeout).await;
        let data_center_status_available = !statuses.is_empty();
        if data_center_status_available {
            data_centers = self.reconcile_data_centers(statuses).await;
        } else {
            info!(tick, "no data-center status this tick; channel left unchanged");
        }

        TickReport {
            tick,
            started_at,
            finished_at: Utc::now(),
            games,
            data_center_status_available,
            data_centers,
        }
    }

    async fn upsert_game_news(&mut self, item: NewsItem) -> UpsertOutcome {
        let message = OutgoingMessage {
            content: Some(render_announcement(
                &self.config.announcement_template,
                &item.game_name,
            )),
            embed: render_news_embed(&item),
            mention_everyone: true,
        };
        upsert_message(
            self.chat.as_ref(),
            self.config.update_channel_id,
            &mut self.store.games,
            &item.game_name,
            message,
            self.config.chat_timeout,
        )
        .await
    }

    fn is_tracked_data_center(&self, name: &str) -> bool {
        self.config.data_centers.is_empty()
            || self.config.data_centers.iter().any(|tracked| tracked == name)
    }

    /// Upserts every tracked data center in `statuses` and retires messages for those missing from it.
    async fn reconcile_data_centers(
        &mut self,
        statuses: HashMap<String, DataCenterStatus>,
    ) -> ChannelReport {
        let mut report = ChannelReport::default();
        if self.startup_sweep_pending {
            report.deleted += self.sweep_orphaned_data_center_messages().await;
            self.startup_sweep_pending = false;
        }

        let retired: Vec<String> = self
            .store
            .data_centers
            .keys()
            .filter(|name| !statuses.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in retired {
            let Some(entry) = self.store.data_centers.get(&name) else {
                continue;
            };
            let message_id = entry.message_id.clone();
            match with_timeout(
                self.config.chat_timeout,
                "delete message",
                self.chat
                    .delete_message(self.config.data_center_channel_id, &message_id),
            )
            .await
            {
                Ok(()) => {
                    self.store.data_centers.remove(&name);
                    report.deleted += 1;
                    info!(data_center = %name, message_id = %message_id, "retired data-center message");
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(data_center = %name, message_id = %message_id, error = %error, "failed to retire data-center message");
                }
            }
        }

        let mut names: Vec<&String> = statuses
            .keys()
            .filter(|name| self.is_tracked_data_center(name))
            .collect();
        names.sort();
        for name in names {
            let message = OutgoingMessage {
                content: None,
                embed: render_data_center_embed(name, &statuses[name]),
                mention_everyone: false,
            };
            let outcome = upsert_message(
                self.chat.as_ref(),
                self.config.data_center_channel_id,
                &mut self.store.data_centers,
                name,
                message,
                self.config.chat_timeout,
            )
            .await;
            report.record(outcome);
        }

        report
    }

    /// One bounded pass over channel history removing data-center posts left by an earlier run.
    async fn sweep_orphaned_data_center_messages(&self) -> usize {
        let channel_id = self.config.data_center_channel_id;
        let limit = self.config.startup_sweep_history_limit;
        let pages = limit.div_ceil(DISCORD_HISTORY_PAGE_SIZE).max(1) as u32;
        let history = match with_timeout(
            self.config.chat_timeout * pages,
            "channel history",
            self.chat.recent_messages(channel_id, limit),
        )
        .await
        {
            Ok(history) => history,
            Err(error) => {
                warn!(channel_id, error = %error, "startup sweep skipped; failed to read channel history");
                return 0;
            }
        };

        let mut deleted = 0;
        for message in history
            .iter()
            .filter(|message| self.is_orphaned_data_center_message(message))
        {
            match with_timeout(
                self.config.chat_timeout,
                "delete message",
                self.chat.delete_message(channel_id, &message.id),
            )
            .await
            {
                Ok(()) => deleted += 1,
                Err(error) => {
                    warn!(channel_id, message_id = %message.id, error = %error, "failed to delete orphaned data-center message");
                }
            }
        }
        info!(
            channel_id,
            scanned = history.len(),
            deleted,
            "startup sweep finished"
        );
        deleted
    }

    fn is_orphaned_data_center_message(&self, message: &ChatMessage) -> bool {
        if message.author_id != self.bot_user_id {
            return false;
        }
        if self.config.data_centers.is_empty() {
            return message
                .embed_titles
                .iter()
                .any(|title| title.ends_with(&data_center_title("")));
        }
        message
            .mentions_any(self.config.data_centers.iter().map(String::as_str))
            .is_some()
    }
}

/// Fetches the latest news per game. A failing game never aborts the batch.
async fn fetch_game_news(
    steam: &dyn SteamSource,
    games: &[TrackedGame],
    timeout: Duration,
) -> Vec<NewsItem> {
    let mut items = Vec::with_capacity(games.len());
    for game in games {
        match with_timeout(timeout, "news fetch", steam.latest_news(game)).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {
                info!(game = %game.name, app_id = %game.app_id, "no news items returned");
            }
            Err(error) => {
                warn!(game = %game.name, app_id = %game.app_id, error = %error, "failed to retrieve news");
            }
        }
    }
    items
}

/// Empty on any failure; callers treat empty as "no update this tick".
async fn fetch_data_center_status(
    steam: &dyn SteamSource,
    timeout: Duration,
) -> HashMap<String, DataCenterStatus> {
    match with_timeout(timeout, "server status fetch", steam.data_center_status()).await {
        Ok(statuses) => statuses,
        Err(error) => {
            warn!(error = %error, "failed to fetch data center status");
            HashMap::new()
        }
    }
}

/// Edits the tracked message for `entity`, or sends a new one and records its id.
/// A tracked message that no longer exists is forgotten and replaced in the same call,
/// including when the render is unchanged and no edit would otherwise be sent.
async fn upsert_message(
    chat: &dyn ChatTransport,
    channel_id: ChannelId,
    entries: &mut HashMap<String, TrackedMessage>,
    entity: &str,
    message: OutgoingMessage,
    timeout: Duration,
) -> UpsertOutcome {
    let existing = entries
        .get(entity)
        .map(|entry| (entry.message_id.clone(), entry.embed == message.embed));

    if let Some((message_id, unchanged)) = existing {
        if unchanged {
            match with_timeout(
                timeout,
                "message lookup",
                chat.message_exists(channel_id, &message_id),
            )
            .await
            {
                Ok(true) => return UpsertOutcome::Unchanged,
                Ok(false) => {
                    warn!(entity, message_id = %message_id, channel_id, "message not found in channel; sending a replacement");
                    entries.remove(entity);
                }
                Err(error) => {
                    warn!(entity, message_id = %message_id, error = %error, "failed to confirm message");
                    return UpsertOutcome::Failed;
                }
            }
        } else {
            match with_timeout(
                timeout,
                "edit message",
                chat.edit_message(channel_id, &message_id, &message),
            )
            .await
            {
                Ok(EditOutcome::Edited) => {
                    info!(entity, message_id = %message_id, "edited message");
                    entries.insert(
                        entity.to_string(),
                        TrackedMessage {
                            message_id,
                            embed: message.embed,
                        },
                    );
                    return UpsertOutcome::Edited;
                }
                Ok(EditOutcome::Missing) => {
                    warn!(entity, message_id = %message_id, channel_id, "message not found in channel; sending a replacement");
                    entries.remove(entity);
                }
                Err(error) => {
                    warn!(entity, message_id = %message_id, error = %error, "failed to edit message");
                    return UpsertOutcome::Failed;
                }
            }
        }
    }

    match with_timeout(
        timeout,
        "send message",
        chat.send_message(channel_id, &message),
    )
    .await
    {
        Ok(message_id) => {
            info!(entity, message_id = %message_id, channel_id, "sent message");
            entries.insert(
                entity.to_string(),
                TrackedMessage {
                    message_id,
                    embed: message.embed,
                },
            );
            UpsertOutcome::Created
        }
        Err(error) => {
            warn!(entity, channel_id, error = %error, "failed to send message");
            UpsertOutcome::Failed
        }
    }
}

#[async_trait]
trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Lifecycle of the update loop as seen by `/health`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
enum LoopState {
    #[default]
    Starting,
    Running,
    NotStarted {
        reason: String,
    },
    Stopped,
}

#[derive(Debug, Clone, Default)]
struct BridgeStatus {
    loop_state: LoopState,
    last_tick: Option<TickReport>,
}

/// Runs ticks until `shutdown` flips to true. Returns the number of completed ticks.
async fn run_scheduler(
    mut bridge: Bridge,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    status: watch::Sender<BridgeStatus>,
) -> u64 {
    status.send_modify(|status| status.loop_state = LoopState::Running);
    let mut tick = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        tick += 1;
        let report = bridge.run_tick(tick).await;
        info!(
            tick,
            games_created = report.games.created,
            games_edited = report.games.edited,
            games_failed = report.games.failed,
            data_centers_created = report.data_centers.created,
            data_centers_edited = report.data_centers.edited,
            data_centers_deleted = report.data_centers.deleted,
            data_centers_failed = report.data_centers.failed,
            "tick completed"
        );
        status.send_modify(|status| status.last_tick = Some(report));

        tokio::select! {
            _ = clock.sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    status.send_modify(|status| status.loop_state = LoopState::Stopped);
    info!(ticks = tick, "scheduler stopped");
    tick
}

/// Prepares the bridge and runs the scheduler. A startup failure is published, not retried.
async fn run_update_loop(
    steam: Arc<dyn SteamSource>,
    chat: Arc<dyn ChatTransport>,
    config: BridgeConfig,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<BridgeStatus>,
) -> u64 {
    match prepare_bridge(steam, chat, config).await {
        Ok(bridge) => {
            info!(interval_seconds = interval.as_secs(), "update loop starting");
            run_scheduler(bridge, clock, interval, shutdown, status).await
        }
        Err(error) => {
            let reason = format!("{error:#}");
            error!(error = %reason, "update loop will not start");
            status.send_modify(|status| status.loop_state = LoopState::NotStarted { reason });
            0
        }
    }
}

#[derive(Clone)]
struct HealthState {
    status: watch::Receiver<BridgeStatus>,
}

fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<serde_json::Value>) {
    let status = state.status.borrow().clone();
    let ok = matches!(status.loop_state, LoopState::Starting | LoopState::Running);
    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "ok": ok,
            "service": "status-bridge-service",
            "loop": status.loop_state,
            "last_tick": status.last_tick,
        })),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "status_bridge_service=debug,tower_http=info".to_string()),
        )
        .init();

    let settings = Settings::from_env()?;
    let steam: Arc<dyn SteamSource> = Arc::new(SteamWebApi::new(&settings)?);
    let chat: Arc<dyn ChatTransport> = Arc::new(DiscordTransport::new(
        &settings.discord_token,
        settings.discord_api_proxy.as_deref(),
    ));
    let (status_tx, status_rx) = watch::channel(BridgeStatus::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr = parse_bind_addr("STATUS_BRIDGE_BIND", "0.0.0.0:8084")?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "status-bridge-service health endpoint listening");
    let app = build_router(HealthState { status: status_rx });
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            warn!(error = %error, "health endpoint stopped");
        }
    });

    let config = settings.bridge_config();
    let interval = settings.poll_interval;
    let runner = tokio::spawn(run_update_loop(
        steam,
        chat,
        config,
        Arc::new(TokioClock),
        interval,
        shutdown_rx,
        status_tx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("status-bridge-service shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(error) = runner.await {
        warn!(error = %error, "update loop task failed");
    }
    Ok(())
}
