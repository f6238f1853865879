use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

/// Shut down the bot (Owner only)
#[poise::command(slash_command, owners_only, hide_in_help)]
pub async fn shutdown(ctx: Context<'_>) -> Result<(), Error> {
    info!("Shutdown command received from owner: {}", ctx.author().name);
    ctx.say("👋 Shutting down...").await?;
    ctx.data().sync_queue.shutdown();
    ctx.framework().shard_manager().shutdown_all().await;
    Ok(())
}

/// Inspect or reset the database failure escalation (Owner only)
#[poise::command(slash_command, subcommands("status", "reset"), owners_only, hide_in_help)]
pub async fn escalation(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show the persisted escalation stage
#[poise::command(slash_command, owners_only)]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let escalation = &ctx.data().escalation;
    let record = escalation.record().await?;

    let (stage, since) = match record {
        Some(record) => (record.stage.to_string(), record.updated_at.to_rfc3339()),
        None => ("none".to_string(), "-".to_string()),
    };

    let embed = serenity::CreateEmbed::new()
        .title("🛠️ Escalation State")
        .field("Stage", format!("`{}`", stage), true)
        .field("Since", since, true)
        .field("State file", format!("`{}`", escalation.markers().path().display()), false)
        .color(0x5865F2);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true)).await?;
    Ok(())
}

/// Clear the escalation markers and re-arm automatic remediation
#[poise::command(slash_command, owners_only)]
pub async fn reset(ctx: Context<'_>) -> Result<(), Error> {
    let previous = ctx.data().escalation.reset().await?;
    info!("Escalation reset by {} (was {})", ctx.author().name, previous);
    ctx.say(format!("✅ Escalation state cleared (was `{}`).", previous)).await?;
    Ok(())
}
