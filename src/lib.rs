use std::sync::Arc;

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod escalation;
pub mod history;
pub mod modlog;
pub mod notify;
pub mod reconcile;
pub mod remediation;
pub mod storage;
pub mod sync_queue;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub modlog: Arc<modlog::ModLog>,
    pub sync_queue: Arc<sync_queue::SyncWorkQueue>,
    pub escalation: Arc<escalation::FailureEscalationController>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
