use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::escalation::FailureEscalationController;
use crate::notify::{FailureContext, Notification, NotificationSink, Severity};
use crate::reconcile::{CancellationToken, ReconcileCounts, ReconciliationEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(ReconcileCounts),
    Cancelled,
    Failed(String),
}

pub struct SyncRequest {
    pub guild_id: u64,
    pub requested_at: DateTime<Utc>,
    requester: Option<oneshot::Sender<SyncOutcome>>,
}

impl SyncRequest {
    fn complete(self, outcome: SyncOutcome) {
        if let Some(requester) = self.requester {
            if requester.send(outcome).is_err() {
                debug!("Requester for guild {} went away before completion", self.guild_id);
            }
        }
    }
}

/// Serializes reconciliation runs. One worker drains the queue one request
/// per poll, so at most one reconciliation is running at any time.
pub struct SyncWorkQueue {
    pending: Mutex<VecDeque<SyncRequest>>,
    running: AtomicBool,
    current: Mutex<Option<CancellationToken>>,
    poll_interval: Duration,
}

impl SyncWorkQueue {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            current: Mutex::new(None),
            poll_interval,
        }
    }

    /// Queues a reconciliation of `guild_id` and returns a receiver for its
    /// outcome. `None` when the guild already has a pending request or the
    /// queue was shut down.
    pub fn enqueue(&self, guild_id: u64) -> Option<oneshot::Receiver<SyncOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.push(guild_id, Some(tx)).then_some(rx)
    }

    /// Queues a reconciliation nobody waits on. Returns false when the guild
    /// is already pending.
    pub fn enqueue_detached(&self, guild_id: u64) -> bool {
        self.push(guild_id, None)
    }

    fn push(&self, guild_id: u64, requester: Option<oneshot::Sender<SyncOutcome>>) -> bool {
        if !self.is_running() {
            debug!("Sync queue is shut down, not queuing guild {}", guild_id);
            return false;
        }
        let Ok(mut pending) = self.pending.lock() else {
            error!("Sync queue lock poisoned, dropping request for guild {}", guild_id);
            return false;
        };
        if pending.iter().any(|r| r.guild_id == guild_id) {
            debug!("Guild {} already queued for reconciliation", guild_id);
            return false;
        }
        pending.push_back(SyncRequest {
            guild_id,
            requested_at: Utc::now(),
            requester,
        });
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the worker and cancels the reconciliation in flight, if any.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(current) = self.current.lock() {
            if let Some(token) = current.as_ref() {
                token.cancel();
            }
        }
    }

    fn pop(&self) -> Option<SyncRequest> {
        self.pending.lock().ok()?.pop_front()
    }

    fn drain(&self) -> Vec<SyncRequest> {
        self.pending
            .lock()
            .map(|mut pending| pending.drain(..).collect())
            .unwrap_or_default()
    }

    fn set_current(&self, token: Option<CancellationToken>) {
        if let Ok(mut current) = self.current.lock() {
            *current = token;
        }
    }

    pub async fn run(
        self: Arc<Self>,
        engine: Arc<ReconciliationEngine>,
        sink: Arc<dyn NotificationSink>,
        escalation: Option<Arc<FailureEscalationController>>,
    ) {
        info!("Started modlog background task.");
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.is_running() {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }
            let Some(request) = self.pop() else {
                continue;
            };

            let guild_id = request.guild_id;
            debug!(
                "Reconciling guild {} (queued at {})",
                guild_id, request.requested_at
            );
            let token = CancellationToken::new();
            self.set_current(Some(token.clone()));
            if !self.is_running() {
                token.cancel();
            }
            let result = engine.reconcile_guild(guild_id, &token).await;
            self.set_current(None);

            let outcome = match result {
                Ok(counts) => SyncOutcome::Completed(counts),
                Err(ReconcileError::Cancelled) => {
                    info!("Guild {} reconciliation aborted", guild_id);
                    sink.notify(Notification::operator(
                        Severity::Warning,
                        format!("Message log rebuild for guild {} was aborted.", guild_id),
                    ))
                    .await;
                    SyncOutcome::Cancelled
                }
                Err(e) => {
                    error!("Guild {} reconciliation failed: {}", guild_id, e);
                    let context = FailureContext::for_event("message_log_rebuild")
                        .with_argument(guild_id.to_string())
                        .with_error(&e);
                    sink.notify(
                        Notification::operator(
                            Severity::Warning,
                            format!("Message log rebuild for guild {} failed.", guild_id),
                        )
                        .with_context(context.clone()),
                    )
                    .await;
                    if let (ReconcileError::Storage(store_err), Some(escalation)) = (&e, &escalation) {
                        if store_err.is_storage_unavailable() {
                            escalation.handle_storage_failure(context).await;
                        }
                    }
                    SyncOutcome::Failed(e.to_string())
                }
            };
            request.complete(outcome);
        }

        let dropped = self.drain();
        if !dropped.is_empty() {
            let guilds: Vec<String> = dropped.iter().map(|r| r.guild_id.to_string()).collect();
            warn!("Sync queue stopped with {} requests still pending", dropped.len());
            sink.notify(Notification::operator(
                Severity::Warning,
                format!(
                    "Shutting down, queued message log rebuilds were aborted for guilds {}.",
                    guilds.join(", ")
                ),
            ))
            .await;
            for request in dropped {
                request.complete(SyncOutcome::Cancelled);
            }
        }
        info!("modlog background task terminated.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::notify::testing::RecordingSink;
    use crate::history::{HistoricalMessage, HistorySource};
    use crate::reconcile::testing::{replayed, FakeHistory};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn setup(history: FakeHistory) -> (Arc<SyncWorkQueue>, Arc<ReconciliationEngine>, Database) {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        let engine = Arc::new(ReconciliationEngine::new(db.clone(), Arc::new(history), 999, 250));
        (Arc::new(SyncWorkQueue::new(Duration::from_secs(1))), engine, db)
    }

    #[test]
    fn test_pending_guild_is_not_queued_twice() {
        let queue = SyncWorkQueue::new(Duration::from_secs(1));
        assert!(queue.enqueue(1).is_some());
        assert!(queue.enqueue(1).is_none());
        assert!(!queue.enqueue_detached(1));
        assert!(queue.enqueue(2).is_some());
        assert_eq!(queue.pending_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_complete_in_order() {
        let history = FakeHistory::default().with_channel(10, vec![replayed(5, 10, 42, "hello")]);
        let (queue, engine, db) = setup(history);
        let sink = Arc::new(RecordingSink::default());

        let first = queue.enqueue(1).unwrap();
        let second = queue.enqueue(2).unwrap();
        let worker = tokio::spawn(queue.clone().run(engine, sink.clone(), None));

        let first = first.await.unwrap();
        assert_eq!(
            first,
            SyncOutcome::Completed(ReconcileCounts { new: 1, edited: 0, unchanged: 0, channels: 1 })
        );
        // Same channel replayed again for the second guild request: nothing new
        let second = second.await.unwrap();
        assert_eq!(
            second,
            SyncOutcome::Completed(ReconcileCounts { new: 0, edited: 0, unchanged: 1, channels: 1 })
        );
        assert!(db.get_message(5).unwrap().is_some());
        assert_eq!(queue.pending_len(), 0);

        // Once processed the guild can be queued again
        assert!(queue.enqueue(1).is_some());

        queue.shutdown();
        worker.await.unwrap();
        assert!(sink.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_request_per_poll() {
        let (queue, engine, _db) = setup(FakeHistory::default());
        let sink = Arc::new(RecordingSink::default());
        queue.enqueue_detached(1);
        queue.enqueue_detached(2);
        queue.enqueue_detached(3);

        let worker = tokio::spawn(queue.clone().run(engine, sink, None));
        // The first tick fires immediately, later ones each poll interval
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(queue.pending_len(), 1);

        queue.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_worker() {
        let (queue, engine, _db) = setup(FakeHistory::default());
        let sink = Arc::new(RecordingSink::default());
        let worker = tokio::spawn(queue.clone().run(engine, sink, None));

        queue.shutdown();
        worker.await.unwrap();
        assert!(!queue.is_running());

        // Nothing is accepted once stopped
        assert!(queue.enqueue(7).is_none());
        assert!(!queue.enqueue_detached(7));
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_requests_are_aborted_on_shutdown() {
        let (queue, engine, _db) = setup(FakeHistory::default());
        let sink = Arc::new(RecordingSink::default());
        let rx = queue.enqueue(5).unwrap();
        queue.enqueue_detached(6);

        // Stopped before the worker ever polled
        queue.shutdown();
        let worker = tokio::spawn(queue.clone().run(engine, sink.clone(), None));
        worker.await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("requester must be completed")
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Cancelled);
        assert_eq!(queue.pending_len(), 0);

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("5, 6"));
    }

    /// Blocks every history fetch until released.
    struct GatedHistory {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl HistorySource for GatedHistory {
        async fn readable_channels(&self, _guild_id: u64) -> anyhow::Result<Vec<u64>> {
            Ok(vec![10])
        }

        async fn fetch_history(&self, channel_id: u64, _limit: usize) -> anyhow::Result<Vec<HistoricalMessage>> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(vec![replayed(5, channel_id, 42, "hello")])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_running_reconciliation() {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        let history = Arc::new(GatedHistory {
            started: Notify::new(),
            release: Notify::new(),
        });
        let engine = Arc::new(ReconciliationEngine::new(db.clone(), history.clone(), 999, 250));
        let queue = Arc::new(SyncWorkQueue::new(Duration::from_secs(1)));
        let sink = Arc::new(RecordingSink::default());

        let rx = queue.enqueue(1).unwrap();
        let worker = tokio::spawn(queue.clone().run(engine, sink.clone(), None));

        history.started.notified().await;
        queue.shutdown();
        history.release.notify_one();

        assert_eq!(rx.await.unwrap(), SyncOutcome::Cancelled);
        worker.await.unwrap();
        assert!(db.get_message(5).unwrap().is_none());
        assert!(sink.messages().iter().any(|m| m.contains("aborted")));
    }
}
