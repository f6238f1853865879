//! Access to the platform's authoritative channel history.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use serenity::{Cache, ChannelId, ChannelType, GetMessages, GuildId, Http, MessageId, UserId};
use tracing::{debug, warn};

use crate::db::{LoggedAttachment, LoggedMessage};

/// Discord returns at most this many messages per history request.
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalAttachment {
    pub id: u64,
    pub url: String,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalMessage {
    pub id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub content: String,
    pub attachments: Vec<HistoricalAttachment>,
    /// Unix seconds.
    pub created_at: i64,
}

impl HistoricalMessage {
    pub fn to_logged(&self, guild_id: u64) -> LoggedMessage {
        LoggedMessage {
            message_id: self.id,
            guild_id,
            channel_id: self.channel_id,
            author_id: self.author_id,
            content: self.content.clone(),
            timestamp: self.created_at,
        }
    }

    pub fn logged_attachments(&self) -> Vec<LoggedAttachment> {
        self.attachments
            .iter()
            .map(|a| LoggedAttachment {
                attachment_id: a.id,
                message_id: self.id,
                url: a.url.clone(),
                is_image: a.width.is_some(),
            })
            .collect()
    }
}

impl From<&serenity::Message> for HistoricalMessage {
    fn from(message: &serenity::Message) -> Self {
        Self {
            id: message.id.get(),
            channel_id: message.channel_id.get(),
            author_id: message.author.id.get(),
            content: message.content.clone(),
            attachments: message
                .attachments
                .iter()
                .map(|a| HistoricalAttachment {
                    id: a.id.get(),
                    url: a.url.clone(),
                    width: a.width,
                })
                .collect(),
            created_at: message.timestamp.unix_timestamp(),
        }
    }
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Text channels of `guild_id` whose history the bot may read.
    async fn readable_channels(&self, guild_id: u64) -> anyhow::Result<Vec<u64>>;

    /// Up to `limit` most recent messages of a channel, newest first.
    async fn fetch_history(&self, channel_id: u64, limit: usize) -> anyhow::Result<Vec<HistoricalMessage>>;
}

pub struct DiscordHistory {
    http: Arc<Http>,
    cache: Arc<Cache>,
    bot_id: u64,
}

impl DiscordHistory {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>, bot_id: u64) -> Self {
        Self { http, cache, bot_id }
    }
}

#[async_trait]
impl HistorySource for DiscordHistory {
    async fn readable_channels(&self, guild_id: u64) -> anyhow::Result<Vec<u64>> {
        let guild = self
            .cache
            .guild(GuildId::new(guild_id))
            .ok_or_else(|| anyhow!("guild {} is not cached", guild_id))?;
        let me = guild.members.get(&UserId::new(self.bot_id));
        if me.is_none() {
            warn!("Own member missing from cache for guild {}, trying every text channel", guild_id);
        }

        let mut channels: Vec<u64> = guild
            .channels
            .values()
            .filter(|channel| channel.kind == ChannelType::Text)
            .filter(|channel| match me {
                Some(member) => {
                    let permissions = guild.user_permissions_in(channel, member);
                    permissions.view_channel() && permissions.read_message_history()
                }
                None => true,
            })
            .map(|channel| channel.id.get())
            .collect();
        channels.sort_unstable();
        Ok(channels)
    }

    async fn fetch_history(&self, channel_id: u64, limit: usize) -> anyhow::Result<Vec<HistoricalMessage>> {
        let mut messages = Vec::with_capacity(limit);
        let mut before: Option<MessageId> = None;

        while messages.len() < limit {
            let page_size = (limit - messages.len()).min(PAGE_SIZE);
            let mut request = GetMessages::new().limit(page_size as u8);
            if let Some(before) = before {
                request = request.before(before);
            }

            let page = ChannelId::new(channel_id).messages(&self.http, request).await?;
            debug!("History: fetched {} messages from channel {}", page.len(), channel_id);
            let Some(oldest) = page.last() else {
                break;
            };
            before = Some(oldest.id);
            let short_page = page.len() < page_size;
            messages.extend(page.iter().map(HistoricalMessage::from));
            if short_page {
                break;
            }
        }

        Ok(messages)
    }
}
