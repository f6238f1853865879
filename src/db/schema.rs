/// Message log schema. Attachments carry a soft reference to their message
/// (no foreign key) because the live path may write them first.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logged_messages (
        message_id INTEGER PRIMARY KEY,
        guild_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        author_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );

    -- Reconciliation snapshots read the newest rows of one channel
    CREATE INDEX IF NOT EXISTS idx_logged_messages_channel
        ON logged_messages (channel_id, message_id DESC);

    CREATE TABLE IF NOT EXISTS logged_attachments (
        attachment_id INTEGER PRIMARY KEY,
        message_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        is_image BOOLEAN NOT NULL DEFAULT FALSE
    );
    CREATE INDEX IF NOT EXISTS idx_logged_attachments_message
        ON logged_attachments (message_id);
";
