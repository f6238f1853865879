//! Repairs gaps in the message log after downtime.
//!
//! The newest stored rows of a channel are compared, by message id, against a
//! bounded replay of the channel's real history. Missing rows are inserted and
//! stale content is updated. Running it twice over the same window changes
//! nothing the second time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::db::{normalize_content, Database, LoggedMessage};
use crate::error::{ReconcileError, StoreError};
use crate::history::{HistoricalMessage, HistorySource};

/// How many stored rows are snapshotted per replayed message. Absorbs rows
/// whose messages were deleted from the platform since they were logged.
const SNAPSHOT_OVERSAMPLE: f64 = 1.5;

/// Cooperative cancellation shared between a reconciliation and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub new: usize,
    pub edited: usize,
    pub unchanged: usize,
    pub channels: usize,
}

impl ReconcileCounts {
    fn absorb(&mut self, other: ReconcileCounts) {
        self.new += other.new;
        self.edited += other.edited;
        self.unchanged += other.unchanged;
        self.channels += other.channels;
    }

    pub fn checked(&self) -> usize {
        self.new + self.edited + self.unchanged
    }
}

enum Classification {
    New,
    Edited,
    Unchanged,
}

pub fn snapshot_limit(replay_limit: usize) -> usize {
    (replay_limit as f64 * SNAPSHOT_OVERSAMPLE).ceil() as usize
}

pub struct ReconciliationEngine {
    db: Database,
    history: Arc<dyn HistorySource>,
    bot_id: u64,
    replay_limit: usize,
}

impl ReconciliationEngine {
    pub fn new(db: Database, history: Arc<dyn HistorySource>, bot_id: u64, replay_limit: usize) -> Self {
        Self {
            db,
            history,
            bot_id,
            replay_limit,
        }
    }

    /// Reconciles every readable channel of a guild.
    pub async fn reconcile_guild(
        &self,
        guild_id: u64,
        token: &CancellationToken,
    ) -> Result<ReconcileCounts, ReconcileError> {
        let started = Instant::now();
        info!("Populating modlog with missed messages during downtime for guild {}", guild_id);

        let channels = self
            .history
            .readable_channels(guild_id)
            .await
            .map_err(|e| ReconcileError::History(e.to_string()))?;

        let mut totals = ReconcileCounts::default();
        for channel_id in channels {
            if token.is_cancelled() {
                info!("Reconciliation of guild {} cancelled, discarding partial counts", guild_id);
                return Err(ReconcileError::Cancelled);
            }
            match self.reconcile_channel(guild_id, channel_id, token).await {
                Ok(counts) => totals.absorb(counts),
                Err(ReconcileError::History(e)) => {
                    warn!("Skipping channel {} of guild {}: {}", channel_id, guild_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Discovered {} new messages and {} edited in guild {} (checked {}, {} channels) in {}",
            totals.new,
            totals.edited,
            guild_id,
            totals.checked(),
            totals.channels,
            humantime::format_duration(std::time::Duration::from_millis(started.elapsed().as_millis() as u64))
        );
        Ok(totals)
    }

    pub async fn reconcile_channel(
        &self,
        guild_id: u64,
        channel_id: u64,
        token: &CancellationToken,
    ) -> Result<ReconcileCounts, ReconcileError> {
        let snapshot_size = snapshot_limit(self.replay_limit);
        let stored = self
            .db
            .run_blocking(move |db| db.list_by_channel(channel_id, snapshot_size))
            .await?;
        let known: HashMap<u64, LoggedMessage> =
            stored.into_iter().map(|m| (m.message_id, m)).collect();

        let replay = self
            .history
            .fetch_history(channel_id, self.replay_limit)
            .await
            .map_err(|e| ReconcileError::History(e.to_string()))?;

        let mut counts = ReconcileCounts {
            channels: 1,
            ..ReconcileCounts::default()
        };
        for message in replay {
            if token.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }
            if message.author_id == self.bot_id {
                continue;
            }

            match self.classify(guild_id, &message, known.get(&message.id)).await? {
                Classification::New => counts.new += 1,
                Classification::Edited => counts.edited += 1,
                Classification::Unchanged => counts.unchanged += 1,
            }
        }

        debug!(
            "Channel {}: {} new, {} edited, {} unchanged",
            channel_id, counts.new, counts.edited, counts.unchanged
        );
        Ok(counts)
    }

    async fn classify(
        &self,
        guild_id: u64,
        message: &HistoricalMessage,
        stored: Option<&LoggedMessage>,
    ) -> Result<Classification, StoreError> {
        let replayed = normalize_content(&message.content);

        if let Some(stored) = stored {
            if stored.content == replayed {
                return Ok(Classification::Unchanged);
            }
            self.update(message.id, replayed).await?;
            return Ok(Classification::Edited);
        }

        let record = message.to_logged(guild_id);
        let attachments = message.logged_attachments();
        match self
            .db
            .run_blocking(move |db| db.insert_message(&record, &attachments))
            .await
        {
            Ok(()) => Ok(Classification::New),
            Err(StoreError::DuplicateKey(id)) => {
                // A live event won the race, or the row sat outside the snapshot
                debug!("Message {} logged concurrently, comparing content", id);
                let existing = self.db.run_blocking(move |db| db.get_message(id)).await?;
                match existing {
                    Some(existing) if existing.content != replayed => {
                        self.update(id, replayed).await?;
                        Ok(Classification::Edited)
                    }
                    _ => Ok(Classification::Unchanged),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, message_id: u64, content: String) -> Result<(), StoreError> {
        match self
            .db
            .run_blocking(move |db| db.update_content(message_id, &content))
            .await
        {
            Err(StoreError::NotFound(id)) => {
                // Deleted between snapshot and replay, nothing left to repair
                warn!("Message {} vanished before its edit could be applied", id);
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory history: channel id -> messages newest first.
    #[derive(Default)]
    pub struct FakeHistory {
        pub channels: Mutex<HashMap<u64, Vec<HistoricalMessage>>>,
        pub unreadable: Vec<u64>,
        /// Cancelled once this many history fetches have been served.
        pub cancel_after_fetches: Option<(usize, CancellationToken)>,
        pub fetches: Mutex<usize>,
    }

    impl FakeHistory {
        pub fn with_channel(self, channel_id: u64, messages: Vec<HistoricalMessage>) -> Self {
            self.channels.lock().unwrap().insert(channel_id, messages);
            self
        }
    }

    #[async_trait]
    impl HistorySource for FakeHistory {
        async fn readable_channels(&self, _guild_id: u64) -> anyhow::Result<Vec<u64>> {
            let mut ids: Vec<u64> = self.channels.lock().unwrap().keys().copied().collect();
            ids.sort_unstable();
            Ok(ids)
        }

        async fn fetch_history(&self, channel_id: u64, limit: usize) -> anyhow::Result<Vec<HistoricalMessage>> {
            if self.unreadable.contains(&channel_id) {
                anyhow::bail!("Missing Access");
            }
            let mut fetches = self.fetches.lock().unwrap();
            *fetches += 1;
            if let Some((after, token)) = &self.cancel_after_fetches {
                if *fetches >= *after {
                    token.cancel();
                }
            }
            let channels = self.channels.lock().unwrap();
            Ok(channels
                .get(&channel_id)
                .map(|m| m.iter().take(limit).cloned().collect())
                .unwrap_or_default())
        }
    }

    pub fn replayed(id: u64, channel_id: u64, author_id: u64, content: &str) -> HistoricalMessage {
        HistoricalMessage {
            id,
            channel_id,
            author_id,
            content: content.to_string(),
            attachments: Vec::new(),
            created_at: 1_600_000_000 + id as i64,
        }
    }
}
