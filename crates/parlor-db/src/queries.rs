use crate::Database;
use crate::models::{
    ChannelRow, MessageRow, UserRow, UserSummaryRow, WorkspaceMemberRow, WorkspaceRow,
    format_timestamp, parse_id, parse_role,
};
use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use parlor_types::models::{
    Channel, ChannelMeta, Message, MessageFilter, MessageScope, NewMessage, Role, User, UserSearch,
    UserSummary, Workspace, WorkspaceMember,
};

const MESSAGE_COLUMNS: &str =
    "id, workspace_id, channel_id, user_id, text, parent_id, thread_root_id, created_at";

const CHANNEL_COLUMNS: &str = "id, workspace_id, name, is_private, created_by, created_at";

impl Database {
    // -- Users --

    /// Maps an external identity to an internal user id, creating the user on
    /// first sight. Profile fields are only written at creation.
    pub fn ensure_user(
        &self,
        external_id: &str,
        email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<Uuid> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, external_id, email, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    external_id,
                    email,
                    display_name,
                    now()
                ],
            )?;

            let id: String = conn.query_row(
                "SELECT id FROM users WHERE external_id = ?1",
                [external_id],
                |row| row.get(0),
            )?;
            parse_id(&id)
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, external_id, email, display_name, created_at FROM users WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        external_id: row.get(1)?,
                        email: row.get(2)?,
                        display_name: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
        })?;

        row.map(User::try_from).transpose()
    }

    pub fn search_users(&self, search: &UserSearch) -> Result<Vec<UserSummary>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, email, display_name FROM users
                 WHERE email LIKE ?1 ESCAPE '\\' OR display_name LIKE ?1 ESCAPE '\\'
                 ORDER BY email ASC, id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![like_pattern(&search.needle), search.limit], user_summary_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(UserSummary::try_from).collect()
    }

    /// Members of the channel's workspace matching `search` who are not yet
    /// in the channel.
    pub fn search_channel_candidates(&self, channel: &ChannelMeta, search: &UserSearch) -> Result<Vec<UserSummary>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.email, u.display_name
                 FROM workspace_members wm
                 JOIN users u ON u.id = wm.user_id
                 WHERE wm.workspace_id = ?1
                   AND (u.email LIKE ?2 ESCAPE '\\' OR u.display_name LIKE ?2 ESCAPE '\\')
                   AND NOT EXISTS (
                        SELECT 1 FROM channel_members cm
                        WHERE cm.channel_id = ?3 AND cm.user_id = u.id)
                 ORDER BY u.email ASC, u.id ASC
                 LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        channel.workspace_id.to_string(),
                        like_pattern(&search.needle),
                        channel.id.to_string(),
                        search.limit
                    ],
                    user_summary_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(UserSummary::try_from).collect()
    }

    // -- Workspaces --

    /// Creates a workspace with `owner` as its first member, atomically.
    pub fn create_workspace(&self, owner: Uuid, name: &str) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let created_at = now();

        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id, name, created_at],
            )?;
            tx.execute(
                "INSERT INTO workspace_members (user_id, workspace_id, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![owner.to_string(), id, Role::Owner.as_str(), created_at],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        Workspace::try_from(WorkspaceRow {
            id,
            name: name.to_string(),
            created_at,
        })
    }

    pub fn workspace_exists(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM workspaces WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    pub fn list_workspaces_for_user(&self, user_id: Uuid) -> Result<Vec<Workspace>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT w.id, w.name, w.created_at
                 FROM workspaces w
                 JOIN workspace_members wm ON wm.workspace_id = w.id
                 WHERE wm.user_id = ?1
                 ORDER BY w.name ASC",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok(WorkspaceRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(Workspace::try_from).collect()
    }

    pub fn workspace_role(&self, user_id: Uuid, workspace_id: Uuid) -> Result<Option<Role>> {
        let role: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT role FROM workspace_members WHERE user_id = ?1 AND workspace_id = ?2",
                [user_id.to_string(), workspace_id.to_string()],
                |row| row.get(0),
            )
            .optional()
        })?;

        role.as_deref().map(parse_role).transpose()
    }

    /// Adds a workspace member. Returns false if the membership already existed.
    pub fn add_workspace_member(&self, user_id: Uuid, workspace_id: Uuid, role: Role) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO workspace_members (user_id, workspace_id, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id.to_string(), workspace_id.to_string(), role.as_str(), now()],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn list_workspace_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT wm.user_id, wm.role, u.email, u.display_name
                 FROM workspace_members wm
                 JOIN users u ON u.id = wm.user_id
                 WHERE wm.workspace_id = ?1
                 ORDER BY wm.created_at ASC",
            )?;
            let rows = stmt
                .query_map([workspace_id.to_string()], |row| {
                    Ok(WorkspaceMemberRow {
                        user_id: row.get(0)?,
                        role: row.get(1)?,
                        email: row.get(2)?,
                        display_name: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(WorkspaceMember::try_from).collect()
    }

    // -- Channels --

    /// Creates a channel and materializes the creator's owner membership in the
    /// same transaction. Returns `None` if the name is taken in the workspace.
    pub fn create_channel(
        &self,
        workspace_id: Uuid,
        name: &str,
        is_private: bool,
        creator: Uuid,
    ) -> Result<Option<Channel>> {
        let row = ChannelRow {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            is_private,
            created_by: Some(creator.to_string()),
            created_at: now(),
        };

        let created = self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT INTO channels (id, workspace_id, name, is_private, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    row.workspace_id,
                    row.name,
                    row.is_private,
                    row.created_by,
                    row.created_at
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            tx.execute(
                "INSERT INTO channel_members (user_id, channel_id, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![creator.to_string(), row.id, Role::Owner.as_str(), row.created_at],
            )?;
            tx.commit()?;
            Ok(true)
        })?;

        if !created {
            return Ok(None);
        }
        Channel::try_from(row).map(Some)
    }

    pub fn get_channel_meta(&self, id: Uuid) -> Result<Option<ChannelMeta>> {
        let row = self.with_conn(|conn| query_channel(conn, id))?;
        row.as_ref().map(ChannelRow::meta).transpose()
    }

    /// Public channels of the workspace plus private ones `user_id` belongs to.
    pub fn list_visible_channels(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Vec<Channel>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels c
                 WHERE c.workspace_id = ?1
                   AND (c.is_private = 0 OR EXISTS (
                        SELECT 1 FROM channel_members cm
                        WHERE cm.channel_id = c.id AND cm.user_id = ?2))
                 ORDER BY c.name ASC"
            ))?;
            let rows = stmt
                .query_map([workspace_id.to_string(), user_id.to_string()], channel_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(Channel::try_from).collect()
    }

    pub fn channel_role(&self, user_id: Uuid, channel_id: Uuid) -> Result<Option<Role>> {
        let role: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT role FROM channel_members WHERE user_id = ?1 AND channel_id = ?2",
                [user_id.to_string(), channel_id.to_string()],
                |row| row.get(0),
            )
            .optional()
        })?;

        role.as_deref().map(parse_role).transpose()
    }

    /// Adds a channel member. Returns false if the membership already existed.
    pub fn add_channel_member(&self, user_id: Uuid, channel_id: Uuid, role: Role) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO channel_members (user_id, channel_id, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id.to_string(), channel_id.to_string(), role.as_str(), now()],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn count_channel_members(&self, channel_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM channel_members WHERE channel_id = ?1",
                [channel_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            workspace_id: new.workspace_id.to_string(),
            channel_id: new.channel_id.to_string(),
            user_id: new.user_id.to_string(),
            text: new.text.clone(),
            parent_id: new.parent_id.map(|id| id.to_string()),
            thread_root_id: new.thread_root_id.map(|id| id.to_string()),
            created_at: now(),
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    row.id,
                    row.workspace_id,
                    row.channel_id,
                    row.user_id,
                    row.text,
                    row.parent_id,
                    row.thread_root_id,
                    row.created_at
                ],
            )?;
            Ok(())
        })?;

        Message::try_from(row)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id.to_string()],
                message_from_row,
            )
            .optional()
        })?;

        row.map(Message::try_from).transpose()
    }

    pub fn query_messages(&self, channel_id: Uuid, filter: &MessageFilter) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| query_messages(conn, channel_id, filter))?;
        rows.into_iter().map(Message::try_from).collect()
    }
}

fn now() -> String {
    format_timestamp(Utc::now())
}

/// `%needle%` with LIKE wildcards in the needle matched literally.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn user_summary_from_row(row: &Row<'_>) -> rusqlite::Result<UserSummaryRow> {
    Ok(UserSummaryRow {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
    })
}

fn query_channel(conn: &Connection, id: Uuid) -> Result<Option<ChannelRow>> {
    conn.query_row(
        &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
        [id.to_string()],
        channel_from_row,
    )
    .optional()
}

fn query_messages(conn: &Connection, channel_id: Uuid, filter: &MessageFilter) -> Result<Vec<MessageRow>> {
    // rowid breaks ties between messages created within the same microsecond
    let (clause, root) = match filter.scope {
        MessageScope::Channel => ("", None),
        MessageScope::RootsOnly => (" AND thread_root_id IS NULL", None),
        MessageScope::Thread(root) => (" AND thread_root_id = ?4", Some(root.to_string())),
    };
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE channel_id = ?1{clause}
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?2 OFFSET ?3"
    );

    let mut stmt = conn.prepare(&sql)?;
    let channel = channel_id.to_string();
    let rows = match root {
        Some(root) => stmt
            .query_map(params![channel, filter.limit, filter.offset, root], message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt
            .query_map(params![channel, filter.limit, filter.offset], message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };

    Ok(rows)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        channel_id: row.get(2)?,
        user_id: row.get(3)?,
        text: row.get(4)?,
        parent_id: row.get(5)?,
        thread_root_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelRow> {
    Ok(ChannelRow {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        is_private: row.get(3)?,
        created_by: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Database, Uuid, Channel) {
        let db = Database::open_in_memory().unwrap();
        let owner = db.ensure_user("auth|owner", Some("owner@example.com"), Some("Owner")).unwrap();
        let ws = db.create_workspace(owner, "acme").unwrap();
        let channel = db.create_channel(ws.id, "general", false, owner).unwrap().unwrap();
        (db, owner, channel)
    }

    fn post(db: &Database, channel: &Channel, user: Uuid, parent: Option<&Message>) -> Message {
        db.insert_message(&NewMessage {
            workspace_id: channel.workspace_id,
            channel_id: channel.id,
            user_id: user,
            text: "x".into(),
            parent_id: parent.map(|p| p.id),
            thread_root_id: parent.map(|p| p.thread_root_id.unwrap_or(p.id)),
        })
        .unwrap()
    }

    #[test]
    fn ensure_user_is_stable_per_subject() {
        let db = Database::open_in_memory().unwrap();
        let first = db.ensure_user("auth|abc", None, None).unwrap();
        let second = db.ensure_user("auth|abc", Some("late@example.com"), None).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, db.ensure_user("auth|other", None, None).unwrap());

        let user = db.get_user(first).unwrap().unwrap();
        assert_eq!(user.email, None);
    }

    #[test]
    fn workspace_creator_is_owner() {
        let (db, owner, channel) = seeded();
        assert_eq!(db.workspace_role(owner, channel.workspace_id).unwrap(), Some(Role::Owner));
        assert_eq!(db.channel_role(owner, channel.id).unwrap(), Some(Role::Owner));
        assert_eq!(channel.created_by, Some(owner));
    }

    #[test]
    fn duplicate_channel_name_is_rejected() {
        let (db, owner, channel) = seeded();
        let dup = db.create_channel(channel.workspace_id, "general", true, owner).unwrap();
        assert!(dup.is_none());
        assert_eq!(db.list_visible_channels(channel.workspace_id, owner).unwrap().len(), 1);
    }

    #[test]
    fn membership_insert_is_idempotent() {
        let (db, _owner, channel) = seeded();
        let guest = db.ensure_user("auth|guest", None, None).unwrap();
        assert!(db.add_channel_member(guest, channel.id, Role::Member).unwrap());
        assert!(!db.add_channel_member(guest, channel.id, Role::Member).unwrap());
        assert_eq!(db.count_channel_members(channel.id).unwrap(), 2);
    }

    #[test]
    fn private_channels_hidden_from_non_members() {
        let (db, owner, channel) = seeded();
        let secret = db.create_channel(channel.workspace_id, "secret", true, owner).unwrap().unwrap();
        let guest = db.ensure_user("auth|guest", None, None).unwrap();
        db.add_workspace_member(guest, channel.workspace_id, Role::Member).unwrap();

        let visible: Vec<Uuid> = db
            .list_visible_channels(channel.workspace_id, guest)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(visible, vec![channel.id]);

        db.add_channel_member(guest, secret.id, Role::Member).unwrap();
        assert_eq!(db.list_visible_channels(channel.workspace_id, guest).unwrap().len(), 2);
    }

    #[test]
    fn query_scopes_and_order() {
        let (db, owner, channel) = seeded();
        let root = post(&db, &channel, owner, None);
        let reply = post(&db, &channel, owner, Some(&root));
        let nested = post(&db, &channel, owner, Some(&reply));
        let other_root = post(&db, &channel, owner, None);

        let all = db.query_messages(channel.id, &MessageFilter::default()).unwrap();
        let ids: Vec<Uuid> = all.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![root.id, reply.id, nested.id, other_root.id]);

        let roots = db.query_messages(channel.id, &MessageFilter::new(None, true, None, None)).unwrap();
        assert_eq!(roots.iter().map(|m| m.id).collect::<Vec<_>>(), vec![root.id, other_root.id]);

        let thread = db
            .query_messages(channel.id, &MessageFilter::new(Some(root.id), false, None, None))
            .unwrap();
        assert_eq!(thread.iter().map(|m| m.id).collect::<Vec<_>>(), vec![reply.id, nested.id]);

        let page = db
            .query_messages(channel.id, &MessageFilter::new(None, false, Some(2), Some(1)))
            .unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![reply.id, nested.id]);
    }

    #[test]
    fn message_roundtrips_through_store() {
        let (db, owner, channel) = seeded();
        let root = post(&db, &channel, owner, None);
        let fetched = db.get_message(root.id).unwrap().unwrap();
        assert_eq!(fetched, root);
        assert!(db.get_message(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn user_search_matches_email_or_name() {
        let (db, owner, _) = seeded();
        let carol = db.ensure_user("auth|carol", Some("carol@example.com"), Some("Carol 100%")).unwrap();
        db.ensure_user("auth|dave", Some("dave@elsewhere.org"), None).unwrap();

        let hits = db.search_users(&UserSearch::new("EXAMPLE", None).unwrap()).unwrap();
        let ids: Vec<Uuid> = hits.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![carol, owner]);

        let hits = db.search_users(&UserSearch::new("100%", None).unwrap()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].display_name.as_deref(), Some("Carol 100%"));

        // wildcard characters in the needle are literal
        assert!(db.search_users(&UserSearch::new("_", None).unwrap()).unwrap().is_empty());
        assert_eq!(db.search_users(&UserSearch::new("e", Some(1)).unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn channel_candidates_exclude_members_and_outsiders() {
        let (db, owner, channel) = seeded();
        let meta = db.get_channel_meta(channel.id).unwrap().unwrap();
        let erin = db.ensure_user("auth|erin", Some("erin@example.com"), None).unwrap();
        let frank = db.ensure_user("auth|frank", Some("frank@example.com"), None).unwrap();
        db.ensure_user("auth|gina", Some("gina@example.com"), None).unwrap();
        db.add_workspace_member(erin, channel.workspace_id, Role::Member).unwrap();
        db.add_workspace_member(frank, channel.workspace_id, Role::Member).unwrap();
        db.add_channel_member(frank, channel.id, Role::Member).unwrap();

        let hits = db.search_channel_candidates(&meta, &UserSearch::new("example.com", None).unwrap()).unwrap();
        let ids: Vec<Uuid> = hits.into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![erin]);
        assert!(!ids.contains(&owner));
    }
}
