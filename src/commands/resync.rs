use crate::sync_queue::SyncOutcome;
use crate::{Context, Error};
use tracing::info;

/// Rebuild the message log from recent channel history
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD", guild_only)]
pub async fn resync(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;

    if ctx.data().modlog.log_channel(guild_id.get()).is_none() {
        ctx.say("❌ Message logging is not enabled for this server.").await?;
        return Ok(());
    }

    let queue = &ctx.data().sync_queue;
    let Some(done) = queue.enqueue(guild_id.get()) else {
        if queue.is_running() {
            ctx.say("⏳ A rebuild for this server is already queued.").await?;
        } else {
            ctx.say("⚠️ The bot is shutting down, try again once it is back.").await?;
        }
        return Ok(());
    };
    info!("Resync of guild {} requested by {}", guild_id, ctx.author().name);
    ctx.say("🔄 Queued a rebuild of the message log, I'll post here once it's done.")
        .await?;

    let text = match done.await {
        Ok(SyncOutcome::Completed(counts)) => format!(
            "✅ Caching complete. {} new and {} edited messages found across {} channels.",
            counts.new, counts.edited, counts.channels
        ),
        Ok(SyncOutcome::Cancelled) => "⚠️ The message log rebuild was aborted.".to_string(),
        Ok(SyncOutcome::Failed(reason)) => format!("❌ The message log rebuild failed: {}", reason),
        Err(_) => "⚠️ The message log rebuild was dropped, the bot is shutting down.".to_string(),
    };

    // Runs can outlive the interaction token, post to the channel instead
    ctx.channel_id().say(ctx.http(), text).await?;
    Ok(())
}
