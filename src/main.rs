use std::sync::Arc;
use std::time::Duration;

use gearlog::config::Config;
use gearlog::escalation::{
    EscalationSettings, ExitProcess, FailureEscalationController, MarkerStore,
};
use gearlog::history::{DiscordHistory, HistoricalMessage};
use gearlog::modlog::{MemberInfo, ModLog};
use gearlog::notify::{DiscordNotifier, FailureContext, NotificationSink};
use gearlog::reconcile::ReconciliationEngine;
use gearlog::remediation::DigitalOceanClient;
use gearlog::storage::{self, StorageSlot};
use gearlog::sync_queue::SyncWorkQueue;
use gearlog::{commands, Data, Error};
use poise::serenity_prelude as serenity;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

async fn event_handler(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Message { new_message } => {
            data.modlog
                .on_message(
                    new_message.guild_id.map(|id| id.get()),
                    &HistoricalMessage::from(new_message),
                )
                .await;
        }
        serenity::FullEvent::MessageUpdate { event, .. } => {
            data.modlog
                .on_message_edit(
                    event.guild_id.map(|id| id.get()),
                    event.id.get(),
                    event.content.as_deref(),
                )
                .await;
        }
        serenity::FullEvent::MessageDelete {
            deleted_message_id,
            guild_id,
            ..
        } => {
            data.modlog
                .on_message_delete(guild_id.map(|id| id.get()), deleted_message_id.get())
                .await;
        }
        serenity::FullEvent::MessageDeleteBulk {
            channel_id,
            multiple_deleted_messages_ids,
            guild_id,
        } => {
            let ids: Vec<u64> = multiple_deleted_messages_ids.iter().map(|id| id.get()).collect();
            data.modlog
                .on_bulk_delete(guild_id.map(|id| id.get()), channel_id.get(), &ids)
                .await;
        }
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            data.modlog
                .on_member_join(
                    new_member.guild_id.get(),
                    &MemberInfo::from(new_member),
                    chrono::Utc::now(),
                )
                .await;
        }
        serenity::FullEvent::GuildMemberRemoval {
            guild_id,
            user,
            member_data_if_available,
        } => {
            let member = member_data_if_available
                .as_ref()
                .map(MemberInfo::from)
                .unwrap_or_else(|| MemberInfo::from(user));
            data.modlog.on_member_leave(guild_id.get(), &member).await;
        }
        serenity::FullEvent::GuildBanAddition { guild_id, banned_user } => {
            data.modlog
                .on_member_ban(guild_id.get(), &MemberInfo::from(banned_user))
                .await;
        }
        serenity::FullEvent::GuildBanRemoval { guild_id, unbanned_user } => {
            data.modlog
                .on_member_unban(guild_id.get(), &MemberInfo::from(unbanned_user))
                .await;
        }
        serenity::FullEvent::GuildMemberUpdate {
            old_if_available: Some(old),
            new: Some(new),
            ..
        } => {
            data.modlog
                .on_member_update(new.guild_id.get(), &MemberInfo::from(old), &MemberInfo::from(new))
                .await;
        }
        serenity::FullEvent::CacheReady { guilds } => {
            if data.config.reconcile_on_startup {
                let mut queued = 0;
                for guild_id in guilds {
                    if data.modlog.log_channel(guild_id.get()).is_some()
                        && data.sync_queue.enqueue_detached(guild_id.get())
                    {
                        queued += 1;
                    }
                }
                info!("Queued {} guilds for message log reconciliation", queued);
            }
        }
        _ => {}
    }
    Ok(())
}

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Command { error, ctx, .. } => {
            let context = FailureContext::for_command(ctx.command().qualified_name.clone())
                .with_channel(ctx.channel_id().get())
                .with_sender(ctx.author().id.get())
                .with_error(&error);
            error!("Command failed\n{}", context.render());
            if let Err(e) = ctx.say("❌ Something went wrong running that command.").await {
                warn!("Failed to report command error: {}", e);
            }
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                error!("Error while handling framework error: {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let discord_token = config.discord_token.clone();
    let owners = config.owner_id.map(serenity::UserId::new).into_iter().collect();
    info!("Loaded configuration: {:?}", config);

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            owners,
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            on_error: |error| Box::pin(on_error(error)),
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                let bot_id = ready.user.id.get();

                let sink: Arc<dyn NotificationSink> = Arc::new(DiscordNotifier::new(
                    ctx.http.clone(),
                    config.bot_log_channel,
                    config.owner_id,
                ));
                let state_path = config.escalation_state_path.clone();
                let markers = Arc::new(tokio::task::spawn_blocking(move || MarkerStore::open(state_path)).await??);
                let slot = Arc::new(StorageSlot::new(config.database_url.clone()));
                let remediation = Arc::new(DigitalOceanClient::new(
                    reqwest::Client::new(),
                    config.do_api_url.clone(),
                    config.do_token.clone(),
                ));
                let escalation = Arc::new(FailureEscalationController::new(
                    slot.clone(),
                    markers,
                    remediation,
                    Arc::new(ExitProcess),
                    sink.clone(),
                    EscalationSettings::from_config(&config),
                ));

                let db = storage::open_storage(&slot, &escalation).await?;
                tokio::spawn(storage::keep_alive(
                    slot,
                    escalation.clone(),
                    Duration::from_secs(config.db_keepalive_secs.max(1)),
                ));

                let history = Arc::new(DiscordHistory::new(ctx.http.clone(), ctx.cache.clone(), bot_id));
                let engine = Arc::new(ReconciliationEngine::new(
                    db.clone(),
                    history,
                    bot_id,
                    config.reconcile_replay_limit,
                ));
                let sync_queue = Arc::new(SyncWorkQueue::new(Duration::from_secs(
                    config.sync_poll_interval_secs.max(1),
                )));
                tokio::spawn(sync_queue.clone().run(engine, sink.clone(), Some(escalation.clone())));

                let modlog = Arc::new(ModLog::new(
                    db,
                    sink,
                    Some(escalation.clone()),
                    &config.guild_logging,
                    bot_id,
                    config.export_dir.clone(),
                ));
                info!("Message logging enabled for guilds {:?}", modlog.logged_guilds());

                Ok(Data {
                    config,
                    modlog,
                    sync_queue,
                    escalation,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::GUILD_MEMBERS
        | serenity::GatewayIntents::GUILD_MODERATION;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down...");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}
