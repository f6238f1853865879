//! Live message logging: records messages as they arrive and reports edits,
//! deletions and bulk deletions to each guild's log channel. Member joins,
//! leaves, bans and name changes go to their own configured channels.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use poise::serenity_prelude as serenity;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::config::GuildLogConfig;
use crate::db::{normalize_content, Database, LoggedAttachment, LoggedMessage, NO_CONTENT};
use crate::error::StoreError;
use crate::escalation::FailureEscalationController;
use crate::history::HistoricalMessage;
use crate::notify::{FailureContext, Notification, NotificationSink, Severity};

pub struct ModLog {
    db: Database,
    sink: Arc<dyn NotificationSink>,
    escalation: Option<Arc<FailureEscalationController>>,
    guilds: HashMap<u64, GuildLogConfig>,
    bot_id: u64,
    export_dir: PathBuf,
    /// (guild, user) pairs whose removal was already logged as a ban.
    forced_exits: Mutex<HashSet<(u64, u64)>>,
}

/// The parts of a member or user the member log reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: u64,
    pub username: String,
    pub nick: Option<String>,
    /// Unix seconds of account creation.
    pub created_at: i64,
}

impl MemberInfo {
    pub fn display_name(&self) -> &str {
        self.nick.as_deref().unwrap_or(&self.username)
    }
}

impl From<&serenity::User> for MemberInfo {
    fn from(user: &serenity::User) -> Self {
        Self {
            user_id: user.id.get(),
            username: user.name.clone(),
            nick: None,
            created_at: user.id.created_at().unix_timestamp(),
        }
    }
}

impl From<&serenity::Member> for MemberInfo {
    fn from(member: &serenity::Member) -> Self {
        Self {
            nick: member.nick.clone(),
            ..MemberInfo::from(&member.user)
        }
    }
}

impl ModLog {
    pub fn new(
        db: Database,
        sink: Arc<dyn NotificationSink>,
        escalation: Option<Arc<FailureEscalationController>>,
        guilds: &[GuildLogConfig],
        bot_id: u64,
        export_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            sink,
            escalation,
            guilds: guilds.iter().map(|g| (g.guild_id, g.clone())).collect(),
            bot_id,
            export_dir: export_dir.into(),
            forced_exits: Mutex::new(HashSet::new()),
        }
    }

    /// Log channel of a guild, `None` when logging is disabled there.
    pub fn log_channel(&self, guild_id: u64) -> Option<u64> {
        self.guilds.get(&guild_id).map(|g| g.log_channel)
    }

    pub fn is_ignored(&self, guild_id: u64, user_id: u64) -> bool {
        self.guilds
            .get(&guild_id)
            .map(|g| g.ignored_users.contains(&user_id))
            .unwrap_or(false)
    }

    fn join_log_channel(&self, guild_id: u64) -> Option<u64> {
        self.guilds.get(&guild_id).and_then(|g| g.join_log_channel)
    }

    fn mod_log_channel(&self, guild_id: u64) -> Option<u64> {
        self.guilds.get(&guild_id).and_then(|g| g.mod_log_channel)
    }

    pub fn logged_guilds(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.guilds.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn on_message(&self, guild_id: Option<u64>, message: &HistoricalMessage) {
        let Some(guild_id) = guild_id else {
            return;
        };
        if self.log_channel(guild_id).is_none() || message.author_id == self.bot_id {
            return;
        }

        let record = message.to_logged(guild_id);
        let attachments = message.logged_attachments();
        match self
            .db
            .run_blocking(move |db| db.insert_message(&record, &attachments))
            .await
        {
            Ok(()) => {}
            Err(StoreError::DuplicateKey(id)) => {
                debug!("Message {} was already logged by a reconciliation", id);
            }
            Err(e) => {
                let context = FailureContext::for_event("message_create")
                    .with_channel(message.channel_id)
                    .with_sender(message.author_id);
                self.storage_error(context, e).await;
            }
        }
    }

    /// `new_content` is `None` for edits that don't touch the content, such
    /// as embed resolution.
    pub async fn on_message_edit(&self, guild_id: Option<u64>, message_id: u64, new_content: Option<&str>) {
        let (Some(guild_id), Some(new_content)) = (guild_id, new_content) else {
            return;
        };
        let Some(log_channel) = self.log_channel(guild_id) else {
            return;
        };

        let stored = match self.db.run_blocking(move |db| db.get_message(message_id)).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                let context = FailureContext::for_event("message_edit").with_argument(message_id.to_string());
                self.storage_error(context, e).await;
                return;
            }
        };

        let after = normalize_content(new_content);
        // Pins and embed updates resend the same content
        if stored.content == after {
            return;
        }

        if !self.is_ignored(guild_id, stored.author_id) {
            self.sink
                .notify(Notification::guild_log(
                    log_channel,
                    format!(
                        "✏️ Message {} by <@{}> in <#{}> was edited.\n**Before:** {}\n**After:** {}",
                        message_id, stored.author_id, stored.channel_id, stored.content, after
                    ),
                ))
                .await;
        }

        match self
            .db
            .run_blocking(move |db| db.update_content(message_id, &after))
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(id)) => warn!("Message {} was removed before its edit was stored", id),
            Err(e) => {
                let context = FailureContext::for_event("message_edit")
                    .with_channel(stored.channel_id)
                    .with_sender(stored.author_id)
                    .with_argument(message_id.to_string());
                self.storage_error(context, e).await;
            }
        }
    }

    pub async fn on_message_delete(&self, guild_id: Option<u64>, message_id: u64) {
        let Some(guild_id) = guild_id else {
            return;
        };
        let Some(log_channel) = self.log_channel(guild_id) else {
            return;
        };

        let lookup = self
            .db
            .run_blocking(move |db| {
                let message = db.get_message(message_id)?;
                let attachments = db.attachments_for(message_id)?;
                Ok(message.map(|m| (m, attachments)))
            })
            .await;
        let (stored, attachments) = match lookup {
            Ok(Some(found)) => found,
            Ok(None) => return,
            Err(e) => {
                let context = FailureContext::for_event("message_delete").with_argument(message_id.to_string());
                self.storage_error(context, e).await;
                return;
            }
        };

        let nothing_to_show = stored.content == NO_CONTENT && attachments.is_empty();
        if nothing_to_show || self.is_ignored(guild_id, stored.author_id) {
            return;
        }

        let mut body = format!(
            "🗑️ Message {} by <@{}> in <#{}> was removed.\n**Content:** {}",
            message_id, stored.author_id, stored.channel_id, stored.content
        );
        if !attachments.is_empty() {
            body.push_str(&format!("\n**Attachments:** {}", attachment_urls(&attachments)));
        }
        self.sink.notify(Notification::guild_log(log_channel, body)).await;
    }

    /// Exports every logged message among `message_ids` to a file and sends
    /// it to the guild log. Nothing is sent when none of them were logged.
    pub async fn on_bulk_delete(&self, guild_id: Option<u64>, channel_id: u64, message_ids: &[u64]) {
        let Some(guild_id) = guild_id else {
            return;
        };
        let Some(log_channel) = self.log_channel(guild_id) else {
            return;
        };

        let ids = message_ids.to_vec();
        let lookup = self
            .db
            .run_blocking(move |db| {
                let messages = db.get_many(&ids)?;
                let mut logged = Vec::with_capacity(messages.len());
                for message in messages {
                    let attachments = db.attachments_for(message.message_id)?;
                    logged.push((message, attachments));
                }
                Ok(logged)
            })
            .await;
        let logged = match lookup {
            Ok(logged) => logged,
            Err(e) => {
                let context = FailureContext::for_event("message_delete_bulk")
                    .with_channel(channel_id)
                    .with_argument(format!("{} messages", message_ids.len()));
                self.storage_error(context, e).await;
                return;
            }
        };
        if logged.is_empty() {
            debug!("Bulk delete in channel {} touched no logged messages", channel_id);
            return;
        }

        let report = render_bulk_delete_report(&logged);
        let dir = self.export_dir.clone();
        let export = match tokio::task::spawn_blocking(move || write_export(&dir, channel_id, &report)).await {
            Ok(Ok(export)) => export,
            Ok(Err(e)) => {
                error!("Failed to write bulk delete export in {}: {}", self.export_dir.display(), e);
                let context = FailureContext::for_event("message_delete_bulk")
                    .with_channel(channel_id)
                    .with_error(&e);
                self.sink
                    .notify(
                        Notification::operator(Severity::Warning, "Bulk delete export could not be written.")
                            .with_context(context),
                    )
                    .await;
                return;
            }
            Err(e) => {
                error!("Bulk delete export task failed: {}", e);
                return;
            }
        };
        let path = export.path().to_path_buf();

        info!(
            "Exporting {} of {} bulk deleted messages in channel {}",
            logged.len(),
            message_ids.len(),
            channel_id
        );
        self.sink
            .notify(
                Notification::guild_log(
                    log_channel,
                    format!(
                        "🗑️ {} messages were bulk deleted in <#{}>, {} of them were logged.",
                        message_ids.len(),
                        channel_id,
                        logged.len()
                    ),
                )
                .with_attachment(path.clone()),
            )
            .await;

        match tokio::task::spawn_blocking(move || export.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to remove bulk delete export {}: {}", path.display(), e),
            Err(e) => warn!("Bulk delete export cleanup task failed: {}", e),
        }
    }

    pub async fn on_member_join(&self, guild_id: u64, member: &MemberInfo, now: DateTime<Utc>) {
        let Some(channel) = self.join_log_channel(guild_id) else {
            return;
        };
        let created = DateTime::from_timestamp(member.created_at, 0).unwrap_or(now);
        self.sink
            .notify(Notification::guild_log(
                channel,
                format!(
                    "📥 {} (`{}`) has joined, account created {} ago.",
                    clean_name(member.display_name()),
                    member.user_id,
                    account_age(created, now)
                ),
            ))
            .await;
    }

    pub async fn on_member_leave(&self, guild_id: u64, member: &MemberInfo) {
        if self.take_forced_exit(guild_id, member.user_id) {
            debug!("Member {} left guild {} through a logged ban", member.user_id, guild_id);
            return;
        }
        let Some(channel) = self.join_log_channel(guild_id) else {
            return;
        };
        self.sink
            .notify(Notification::guild_log(
                channel,
                format!(
                    "📤 {} (`{}`) has left the server.",
                    clean_name(member.display_name()),
                    member.user_id
                ),
            ))
            .await;
    }

    /// Logs a ban once. The member removal that comes with it is not
    /// reported as a leave.
    pub async fn on_member_ban(&self, guild_id: u64, user: &MemberInfo) {
        let Some(channel) = self.mod_log_channel(guild_id) else {
            return;
        };
        let first = self
            .forced_exits
            .lock()
            .map(|mut exits| exits.insert((guild_id, user.user_id)))
            .unwrap_or(true);
        if !first {
            return;
        }
        self.sink
            .notify(Notification::guild_log(
                channel,
                format!(
                    "🚨 {} (`{}`) has been banned from the server.",
                    clean_name(&user.username),
                    user.user_id
                ),
            ))
            .await;
    }

    pub async fn on_member_unban(&self, guild_id: u64, user: &MemberInfo) {
        let Some(channel) = self.mod_log_channel(guild_id) else {
            return;
        };
        self.sink
            .notify(Notification::guild_log(
                channel,
                format!(
                    "🚨 {} (`{}`) has been unbanned from the server.",
                    clean_name(&user.username),
                    user.user_id
                ),
            ))
            .await;
    }

    /// Reports nickname changes, or username changes when the nickname
    /// stayed the same.
    pub async fn on_member_update(&self, guild_id: u64, before: &MemberInfo, after: &MemberInfo) {
        let Some(channel) = self.log_channel(guild_id) else {
            return;
        };
        let message = if before.nick != after.nick {
            format!(
                "🏷️ {} (`{}`) has changed nickname from **`\u{200b}{}`** to **`\u{200b}{}`**.",
                clean_name(&after.username),
                after.user_id,
                clean_name(before.display_name()),
                clean_name(after.display_name())
            )
        } else if before.username != after.username {
            format!(
                "🏷️ {} (`{}`) has changed username from **`\u{200b}{}`** to **`\u{200b}{}`**.",
                clean_name(&after.username),
                after.user_id,
                clean_name(&before.username),
                clean_name(&after.username)
            )
        } else {
            return;
        };
        self.sink.notify(Notification::guild_log(channel, message)).await;
    }

    fn take_forced_exit(&self, guild_id: u64, user_id: u64) -> bool {
        self.forced_exits
            .lock()
            .map(|mut exits| exits.remove(&(guild_id, user_id)))
            .unwrap_or(false)
    }

    async fn storage_error(&self, context: FailureContext, err: StoreError) {
        let context = context.with_error(&err);
        if err.is_storage_unavailable() {
            if let Some(escalation) = &self.escalation {
                escalation.handle_storage_failure(context).await;
                return;
            }
        }
        error!("Message log failed: {}\n{}", err, context.render());
        self.sink
            .notify(
                Notification::operator(Severity::Warning, "Message log failed to process an event.")
                    .with_context(context),
            )
            .await;
    }
}

/// Writes the report to a temp file in `dir`. The file is deleted when the
/// handle drops, including on a failed write.
fn write_export(dir: &Path, channel_id: u64, report: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("bulk_delete_{}_", channel_id))
        .suffix(".txt")
        .tempfile_in(dir)?;
    file.write_all(report.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Keeps user-controlled names from pinging or breaking code spans.
fn clean_name(name: &str) -> String {
    name.replace('@', "@\u{200b}").replace('`', "ˋ")
}

fn account_age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now - created;
    if age.num_days() > 0 {
        format!("{} days", age.num_days())
    } else {
        format!("{} hours, {} mins", age.num_hours(), age.num_minutes() % 60)
    }
}

fn attachment_urls(attachments: &[LoggedAttachment]) -> String {
    attachments
        .iter()
        .map(|a| a.url.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One line per message, in the order given (ascending id from the store).
pub fn render_bulk_delete_report(logged: &[(LoggedMessage, Vec<LoggedAttachment>)]) -> String {
    let mut out = String::new();
    for (message, attachments) in logged {
        let timestamp = DateTime::from_timestamp(message.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| message.timestamp.to_string());
        let content = if message.content.is_empty() {
            NO_CONTENT
        } else {
            message.content.as_str()
        };
        out.push_str(&format!(
            "{} {} - {} - {} | {} | {} | {}\n",
            timestamp,
            message.guild_id,
            message.channel_id,
            message.message_id,
            message.author_id,
            content,
            attachment_urls(attachments)
        ));
    }
    out
}
