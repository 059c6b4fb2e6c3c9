use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub const SCHEMA_VERSION: i64 = 1;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE whispers (
                id              TEXT PRIMARY KEY,
                sender_id       TEXT NOT NULL REFERENCES users(id),
                recipient_id    TEXT NOT NULL REFERENCES users(id),
                content         TEXT NOT NULL,
                image_url       TEXT,
                is_read         INTEGER NOT NULL DEFAULT 0,
                conversation_id TEXT REFERENCES conversations(id),
                created_at      TEXT NOT NULL,
                CHECK (sender_id <> recipient_id)
            );

            CREATE INDEX idx_whispers_recipient ON whispers(recipient_id, created_at);
            CREATE INDEX idx_whispers_sender ON whispers(sender_id, created_at);

            -- participant_a < participant_b; participant_key is deliberately not unique,
            -- one pair may hold several conversations grown from different whispers
            CREATE TABLE conversations (
                id                  TEXT PRIMARY KEY,
                participant_a       TEXT NOT NULL REFERENCES users(id),
                participant_b       TEXT NOT NULL REFERENCES users(id),
                participant_key     TEXT NOT NULL,
                initial_whisper_id  TEXT NOT NULL UNIQUE REFERENCES whispers(id),
                initial_sender_id   TEXT NOT NULL REFERENCES users(id),
                status              TEXT NOT NULL CHECK (status IN ('initiated', 'active', 'closed')),
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                CHECK (participant_a < participant_b)
            );

            CREATE INDEX idx_conversations_pair ON conversations(participant_key);

            CREATE TABLE conversation_participants (
                conversation_id      TEXT NOT NULL REFERENCES conversations(id),
                user_id              TEXT NOT NULL REFERENCES users(id),
                status               TEXT NOT NULL CHECK (status IN ('initiated', 'active', 'closed')),
                last_read_message_id TEXT REFERENCES messages(id),
                joined_at            TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user ON conversation_participants(user_id);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id       TEXT NOT NULL REFERENCES users(id),
                content         TEXT NOT NULL,
                image_url       TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);

            CREATE TABLE unmasking_requests (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                requester_id    TEXT NOT NULL REFERENCES users(id),
                target_id       TEXT NOT NULL REFERENCES users(id),
                status          TEXT NOT NULL CHECK (status IN
                                    ('pending', 'mutual_pending', 'accepted', 'declined', 'completed')),
                created_at      TEXT NOT NULL,
                responded_at    TEXT,
                completed_at    TEXT,
                CHECK (requester_id <> target_id)
            );

            CREATE INDEX idx_unmasking_conversation ON unmasking_requests(conversation_id);

            -- At most one in-flight request per direction
            CREATE UNIQUE INDEX idx_unmasking_live
                ON unmasking_requests(conversation_id, requester_id)
                WHERE status IN ('pending', 'mutual_pending', 'accepted');

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
