//! Operator and audit notifications.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use serenity::{ChannelId, CreateAttachment, CreateMessage, Http, UserId};
use tracing::{error, warn};

use crate::config::DISCORD_MESSAGE_LIMIT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn marker(&self) -> &'static str {
        match self {
            Severity::Info => "✅",
            Severity::Warning => "⚠️",
            Severity::Critical => "🚨",
        }
    }
}

/// Where a notification is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// The bot log channel (and the owner for critical notices).
    Operator,
    /// A guild's configured log channel.
    GuildLog(u64),
}

/// Structured diagnostics attached to failure notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureContext {
    pub event: Option<String>,
    pub command: Option<String>,
    pub channel: Option<u64>,
    pub sender: Option<u64>,
    pub arguments: Vec<String>,
    pub error: Option<String>,
}

impl FailureContext {
    pub fn for_event(event: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            ..Self::default()
        }
    }

    pub fn for_command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn with_channel(mut self, channel_id: u64) -> Self {
        self.channel = Some(channel_id);
        self
    }

    pub fn with_sender(mut self, user_id: u64) -> Self {
        self.sender = Some(user_id);
        self
    }

    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if let Some(event) = &self.event {
            lines.push(format!("Event: {}", event));
        }
        if let Some(command) = &self.command {
            lines.push(format!("Command: {}", command));
        }
        if let Some(channel) = self.channel {
            lines.push(format!("Channel: {}", channel));
        }
        if let Some(sender) = self.sender {
            lines.push(format!("Sender: {}", sender));
        }
        if !self.arguments.is_empty() {
            lines.push(format!("Arguments: {}", self.arguments.join(" ")));
        }
        if let Some(error) = &self.error {
            lines.push(format!("Error: {}", error));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub message: String,
    pub severity: Severity,
    pub audience: Audience,
    pub context: Option<FailureContext>,
    pub attachment: Option<PathBuf>,
}

impl Notification {
    pub fn operator(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
            audience: Audience::Operator,
            context: None,
            attachment: None,
        }
    }

    pub fn guild_log(channel_id: u64, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Info,
            audience: Audience::GuildLog(channel_id),
            context: None,
            attachment: None,
        }
    }

    pub fn with_context(mut self, context: FailureContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_attachment(mut self, path: PathBuf) -> Self {
        self.attachment = Some(path);
        self
    }

    /// Plain-text body as delivered to a channel.
    pub fn render(&self) -> String {
        let mut body = match self.audience {
            Audience::Operator => format!("{} {}", self.severity.marker(), self.message),
            Audience::GuildLog(_) => self.message.clone(),
        };
        if let Some(context) = &self.context {
            let rendered = context.render();
            if !rendered.is_empty() {
                body.push_str(&format!("\n```\n{}\n```", rendered));
            }
        }
        truncate_chars(&body, DISCORD_MESSAGE_LIMIT)
    }
}

/// Receives operator and audit notifications. Delivery is best effort, the
/// caller never observes failures.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Delivers notifications through the Discord REST API.
pub struct DiscordNotifier {
    http: Arc<Http>,
    bot_log_channel: Option<u64>,
    owner_id: Option<u64>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>, bot_log_channel: Option<u64>, owner_id: Option<u64>) -> Self {
        Self {
            http,
            bot_log_channel,
            owner_id,
        }
    }

    async fn build_message(&self, notification: &Notification) -> anyhow::Result<CreateMessage> {
        let mut builder = CreateMessage::new().content(notification.render());
        if let Some(path) = &notification.attachment {
            builder = builder.add_file(CreateAttachment::path(path).await?);
        }
        Ok(builder)
    }

    async fn send_to_channel(&self, channel_id: u64, notification: &Notification) -> anyhow::Result<()> {
        let builder = self.build_message(notification).await?;
        ChannelId::new(channel_id)
            .send_message(&self.http, builder)
            .await?;
        Ok(())
    }

    async fn message_owner(&self, owner_id: u64, notification: &Notification) -> anyhow::Result<()> {
        let dm = UserId::new(owner_id).create_dm_channel(&self.http).await?;
        let builder = self.build_message(notification).await?;
        dm.id.send_message(&self.http, builder).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for DiscordNotifier {
    async fn notify(&self, notification: Notification) {
        match notification.audience {
            Audience::GuildLog(channel_id) => {
                if let Err(e) = self.send_to_channel(channel_id, &notification).await {
                    warn!("Failed to deliver guild log notification to {}: {}", channel_id, e);
                }
            }
            Audience::Operator => {
                if notification.severity == Severity::Critical {
                    if let Some(owner_id) = self.owner_id {
                        if let Err(e) = self.message_owner(owner_id, &notification).await {
                            warn!("Failed to message owner {}: {}", owner_id, e);
                        }
                    }
                }
                match self.bot_log_channel {
                    Some(channel_id) => {
                        if let Err(e) = self.send_to_channel(channel_id, &notification).await {
                            // Nothing above us can report this, the log file is the last resort
                            error!(
                                "Failed to log to bot log channel {}: {} (message was: {})",
                                channel_id, e, notification.message
                            );
                        }
                    }
                    None => warn!("No bot log channel configured, dropping: {}", notification.message),
                }
            }
        }
    }
}
