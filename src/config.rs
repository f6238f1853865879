use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

/// Where a guild's message log goes and whose messages it leaves out.
/// Member joins and leaves go to `join_log_channel`, bans to
/// `mod_log_channel`; each is skipped when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildLogConfig {
    pub guild_id: u64,
    pub log_channel: u64,
    #[serde(default)]
    pub ignored_users: Vec<u64>,
    #[serde(default)]
    pub join_log_channel: Option<u64>,
    #[serde(default)]
    pub mod_log_channel: Option<u64>,
}

#[derive(Clone, Deserialize)]
pub struct Config {
    pub discord_token: String,
    pub owner_id: Option<u64>,
    pub bot_log_channel: Option<u64>,
    pub database_url: String,
    pub db_keepalive_secs: u64,

    // Storage failure escalation
    pub escalation_state_path: String,
    pub reconnect_backoff_secs: u64,
    pub reboot_timeout_secs: u64,
    pub reboot_cooldown_secs: u64,
    pub do_token: Option<String>,
    pub do_droplet_id: Option<String>,
    pub do_api_url: String,

    // Message log reconciliation
    pub reconcile_replay_limit: usize,
    pub sync_poll_interval_secs: u64,
    pub reconcile_on_startup: bool,
    pub export_dir: String,

    pub guild_logging: Vec<GuildLogConfig>,
}

const GUILD_LOGGING_FILE: &str = "guild_logging.toml";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            owner_id: env::var("OWNER_ID").ok().and_then(|id| id.parse().ok()),
            bot_log_channel: env::var("BOT_LOG_CHANNEL").ok().and_then(|id| id.parse().ok()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/gearlog.db".to_string()),
            db_keepalive_secs: env::var("DB_KEEPALIVE_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(3600),
            escalation_state_path: env::var("ESCALATION_STATE_PATH")
                .unwrap_or_else(|_| "data/escalation_state.json".to_string()),
            reconnect_backoff_secs: env::var("RECONNECT_BACKOFF_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .unwrap_or(15),
            reboot_timeout_secs: env::var("REBOOT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            reboot_cooldown_secs: env::var("REBOOT_COOLDOWN_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
            do_token: env::var("DO_TOKEN").ok(),
            do_droplet_id: env::var("DO_DROPLET_ID").ok(),
            do_api_url: env::var("DO_API_URL")
                .unwrap_or_else(|_| "https://api.digitalocean.com".to_string()),
            reconcile_replay_limit: env::var("RECONCILE_REPLAY_LIMIT")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .unwrap_or(250),
            sync_poll_interval_secs: env::var("SYNC_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
            reconcile_on_startup: env::var("RECONCILE_ON_STARTUP")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            export_dir: env::var("EXPORT_DIR")
                .unwrap_or_else(|_| env::temp_dir().to_string_lossy().into_owned()),
            guild_logging: Self::load_guild_logging()?,
        })
    }

    pub fn load_guild_logging() -> anyhow::Result<Vec<GuildLogConfig>> {
        if let Ok(content) = fs::read_to_string(GUILD_LOGGING_FILE) {
            return Self::parse_guild_logging(&content);
        }

        // Fallback to env variable
        if let Ok(env_guilds) = env::var("GUILD_LOGGING") {
            let guilds = serde_json::from_str(&env_guilds)
                .map_err(|e| anyhow::anyhow!("GUILD_LOGGING is not valid JSON: {}", e))?;
            return Ok(guilds);
        }

        Ok(Vec::new())
    }

    fn parse_guild_logging(content: &str) -> anyhow::Result<Vec<GuildLogConfig>> {
        #[derive(Deserialize)]
        struct GuildsWrapper {
            #[serde(default)]
            guilds: Vec<GuildLogConfig>,
        }
        let wrapper: GuildsWrapper = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", GUILD_LOGGING_FILE, e))?;
        Ok(wrapper.guilds)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("owner_id", &self.owner_id)
            .field("bot_log_channel", &self.bot_log_channel)
            .field("database_url", &self.database_url)
            .field("db_keepalive_secs", &self.db_keepalive_secs)
            .field("escalation_state_path", &self.escalation_state_path)
            .field("reconnect_backoff_secs", &self.reconnect_backoff_secs)
            .field("reboot_timeout_secs", &self.reboot_timeout_secs)
            .field("reboot_cooldown_secs", &self.reboot_cooldown_secs)
            .field("do_token", &self.do_token.as_ref().map(|_| "[REDACTED]"))
            .field("do_droplet_id", &self.do_droplet_id)
            .field("do_api_url", &self.do_api_url)
            .field("reconcile_replay_limit", &self.reconcile_replay_limit)
            .field("sync_poll_interval_secs", &self.sync_poll_interval_secs)
            .field("reconcile_on_startup", &self.reconcile_on_startup)
            .field("export_dir", &self.export_dir)
            .field("guild_logging", &self.guild_logging)
            .finish()
    }
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Test missing vars
        env::remove_var("DISCORD_TOKEN");
        let result = Config::build();
        assert!(result.is_err(), "Should fail when required vars are missing");

        // 2. Test defaults
        env::set_var("DISCORD_TOKEN", "test_token");
        let config = Config::build().unwrap();
        assert_eq!(config.discord_token, "test_token");
        assert_eq!(config.reconnect_backoff_secs, 15);
        assert_eq!(config.reboot_timeout_secs, 30);
        assert_eq!(config.reboot_cooldown_secs, 60);
        assert_eq!(config.reconcile_replay_limit, 250);
        assert_eq!(config.sync_poll_interval_secs, 1);
        assert_eq!(config.db_keepalive_secs, 3600);

        // 3. Test debug redaction
        env::set_var("DO_TOKEN", "secret_do_token");
        let config_redacted = Config::build().unwrap();
        let debug_output = format!("{:?}", config_redacted);
        assert!(!debug_output.contains("test_token"));
        assert!(!debug_output.contains("secret_do_token"));
        assert!(debug_output.contains("[REDACTED]"));

        // Cleanup
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("DO_TOKEN");
    }

    #[test]
    fn test_guild_logging_toml() {
        let guilds = Config::parse_guild_logging(
            r#"
            [[guilds]]
            guild_id = 1
            log_channel = 100
            ignored_users = [7, 8]
            join_log_channel = 101
            mod_log_channel = 102

            [[guilds]]
            guild_id = 2
            log_channel = 200
            "#,
        )
        .unwrap();
        assert_eq!(guilds.len(), 2);
        assert_eq!(guilds[0].ignored_users, vec![7, 8]);
        assert!(guilds[1].ignored_users.is_empty());
        assert_eq!(guilds[0].join_log_channel, Some(101));
        assert_eq!(guilds[0].mod_log_channel, Some(102));
        assert_eq!(guilds[1].join_log_channel, None);
        assert_eq!(guilds[1].mod_log_channel, None);

        assert!(Config::parse_guild_logging("guilds = 5").is_err());
    }
}
