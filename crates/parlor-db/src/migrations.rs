use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                external_id   TEXT UNIQUE,
                email         TEXT,
                display_name  TEXT,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE workspaces (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE workspace_members (
                user_id       TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                workspace_id  TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                role          TEXT NOT NULL DEFAULT 'member' CHECK (role IN ('owner', 'member')),
                created_at    TEXT NOT NULL,
                PRIMARY KEY (user_id, workspace_id)
            );

            CREATE TABLE channels (
                id            TEXT PRIMARY KEY,
                workspace_id  TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                name          TEXT NOT NULL,
                is_private    INTEGER NOT NULL DEFAULT 0,
                created_by    TEXT REFERENCES users(id) ON DELETE SET NULL,
                created_at    TEXT NOT NULL,
                UNIQUE (workspace_id, name)
            );

            CREATE TABLE channel_members (
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                channel_id  TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                role        TEXT NOT NULL DEFAULT 'member' CHECK (role IN ('owner', 'member')),
                created_at  TEXT NOT NULL,
                PRIMARY KEY (user_id, channel_id)
            );

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                workspace_id    TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                channel_id      TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id),
                text            TEXT NOT NULL,
                parent_id       TEXT REFERENCES messages(id),
                thread_root_id  TEXT REFERENCES messages(id),
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_channel
                ON messages(channel_id, created_at);

            CREATE INDEX idx_messages_thread
                ON messages(thread_root_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
