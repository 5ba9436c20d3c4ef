use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::config::GroupConfig;
use crate::ledger::ensure_parent_dir;
use crate::template::{load_template_text, DEFAULT_TEMPLATE_PATH};

/// Section set shared by every topic.
pub const GLOBAL_SECTION_TAG: &str = "__ALL__";

/// A per-group outreach flow as stored in the flows table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRecord {
    pub id: i64,
    pub name: String,
    /// Monitored source chat (`@username` or numeric id).
    pub chat: String,
    pub queue_path: String,
    pub template_text: String,
    pub attachments_enabled: bool,
    pub send_enabled: bool,
    pub subjects_only: bool,
    pub topic_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowRecord {
    /// Tag used for section lookup: the explicit topic tag, else the name.
    pub fn effective_topic(&self) -> &str {
        self.topic_tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct NewFlow {
    pub name: String,
    pub chat: String,
    pub queue_path: String,
    pub template_text: String,
    pub attachments_enabled: bool,
    pub send_enabled: bool,
    pub subjects_only: bool,
    pub topic_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSection {
    pub name: String,
    pub keywords: Vec<String>,
}

/// A captured inbound message.
#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub chat_id: i64,
    pub chat_username: Option<String>,
    pub user_id: i64,
    pub username: Option<String>,
    pub text: String,
    pub date: DateTime<Utc>,
    pub source_tag: Option<String>,
    pub subjects_json: Option<String>,
}

pub struct CourierDatabase {
    conn: Mutex<Connection>,
}

impl CourierDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        ensure_parent_dir(path)?;
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns.iter().any(|name| name == column))
    }

    fn add_column_if_missing(conn: &Connection, table: &str, column: &str, def: &str) -> Result<()> {
        if !Self::table_has_column(conn, table, column)? {
            conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, def), [])?;
            tracing::info!("Migrated {}: added column {}", table, column);
        }
        Ok(())
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER,
                chat_username TEXT,
                user_id INTEGER,
                username TEXT,
                text TEXT,
                date TEXT
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocked_users (user_id INTEGER PRIMARY KEY)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS topic_sections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic_tag TEXT NOT NULL,
                section_name TEXT NOT NULL,
                keywords_json TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_topic_sections_unique ON topic_sections(topic_tag, section_name)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS flows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                chat TEXT NOT NULL,
                queue_path TEXT NOT NULL,
                template_text TEXT NOT NULL,
                attachments_enabled INTEGER NOT NULL DEFAULT 0,
                send_enabled INTEGER NOT NULL DEFAULT 1,
                subjects_only INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // Columns added after the first schema.
        Self::add_column_if_missing(&conn, "flows", "topic_tag", "TEXT")?;
        Self::add_column_if_missing(&conn, "messages", "source_tag", "TEXT")?;
        Self::add_column_if_missing(&conn, "messages", "subjects_json", "TEXT")?;

        Ok(())
    }

    // ─── Flows ──────────────────────────────────────────────────────────────

    /// Seed the flows table from configured groups. Only runs against an
    /// empty table, so edits made at runtime survive restarts.
    pub fn seed_flows_from_config(&self, groups: &[GroupConfig]) -> Result<usize> {
        if groups.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock_conn()?;
        let existing: i64 = conn.query_row("SELECT COUNT(1) FROM flows", [], |row| row.get(0))?;
        if existing > 0 {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        let mut seeded = 0;
        for group in groups {
            let name = if group.name.trim().is_empty() {
                group.chat.trim().to_string()
            } else {
                group.name.trim().to_string()
            };
            let template = load_template_text(
                group.template_path.as_deref().map(Path::new),
                Path::new(DEFAULT_TEMPLATE_PATH),
            );
            seeded += tx.execute(
                r#"INSERT OR IGNORE INTO flows
                   (name, chat, queue_path, template_text, attachments_enabled,
                    send_enabled, subjects_only, topic_tag, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)"#,
                params![
                    name,
                    group.chat.trim(),
                    group.out_file,
                    template,
                    group.attachments_enabled,
                    group.send_enabled,
                    group.subjects_only,
                    group.topic_tag,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        tracing::info!("Seeded {} flow(s) from config", seeded);
        Ok(seeded)
    }

    pub fn list_flows(&self) -> Result<Vec<FlowRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, name, chat, queue_path, template_text, attachments_enabled,
                      send_enabled, subjects_only, topic_tag, created_at, updated_at
               FROM flows ORDER BY id ASC"#,
        )?;
        let rows = stmt
            .query_map([], Self::row_to_flow)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_flow(&self, name: &str) -> Result<Option<FlowRecord>> {
        let conn = self.lock_conn()?;
        let flow = conn
            .query_row(
                r#"SELECT id, name, chat, queue_path, template_text, attachments_enabled,
                          send_enabled, subjects_only, topic_tag, created_at, updated_at
                   FROM flows WHERE name = ?1"#,
                params![name],
                Self::row_to_flow,
            )
            .optional()?;
        Ok(flow)
    }

    fn row_to_flow(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRecord> {
        let created_at: String = row.get(9)?;
        let updated_at: String = row.get(10)?;
        Ok(FlowRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            chat: row.get(2)?,
            queue_path: row.get(3)?,
            template_text: row.get(4)?,
            attachments_enabled: row.get(5)?,
            send_enabled: row.get(6)?,
            subjects_only: row.get(7)?,
            topic_tag: row.get(8)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    pub fn create_flow(&self, flow: &NewFlow) -> Result<i64> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"INSERT INTO flows
               (name, chat, queue_path, template_text, attachments_enabled,
                send_enabled, subjects_only, topic_tag, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)"#,
            params![
                flow.name.trim(),
                flow.chat.trim(),
                flow.queue_path,
                flow.template_text,
                flow.attachments_enabled,
                flow.send_enabled,
                flow.subjects_only,
                flow.topic_tag,
                now,
            ],
        )
        .with_context(|| format!("Failed to create flow '{}'", flow.name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_flow_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE flows SET send_enabled = ?1, updated_at = ?2 WHERE name = ?3",
            params![enabled, Utc::now().to_rfc3339(), name],
        )?;
        Ok(changed > 0)
    }

    pub fn update_flow_template(&self, name: &str, template_text: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE flows SET template_text = ?1, updated_at = ?2 WHERE name = ?3",
            params![template_text.trim(), Utc::now().to_rfc3339(), name],
        )?;
        Ok(changed > 0)
    }

    /// Delete a flow. Sections filed under its topic go too, unless another
    /// flow still shares that topic.
    pub fn delete_flow(&self, name: &str) -> Result<bool> {
        let Some(flow) = self.get_flow(name)? else {
            return Ok(false);
        };
        let topic = flow.effective_topic().to_string();

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM flows WHERE id = ?1", params![flow.id])?;
        let still_used: i64 = tx.query_row(
            "SELECT COUNT(1) FROM flows WHERE COALESCE(NULLIF(TRIM(topic_tag), ''), name) = ?1",
            params![topic],
            |row| row.get(0),
        )?;
        if still_used == 0 {
            tx.execute("DELETE FROM topic_sections WHERE topic_tag = ?1", params![topic])?;
        }
        tx.commit()?;
        Ok(true)
    }

    // ─── Sections ───────────────────────────────────────────────────────────

    /// Insert or replace the keywords of a section under `topic_tag`.
    pub fn add_section(&self, topic_tag: &str, section_name: &str, keywords: &[String]) -> Result<()> {
        let keywords: Vec<&str> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();
        let keywords_json = serde_json::to_string(&keywords)?;
        let now = Utc::now().to_rfc3339();

        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO topic_sections
               (topic_tag, section_name, keywords_json, enabled, created_at, updated_at)
               VALUES (?1, ?2, ?3, 1, ?4, ?4)
               ON CONFLICT(topic_tag, section_name)
               DO UPDATE SET keywords_json = excluded.keywords_json,
                             enabled = 1,
                             updated_at = excluded.updated_at"#,
            params![topic_tag.trim(), section_name.trim(), keywords_json, now],
        )?;
        Ok(())
    }

    pub fn set_section_enabled(&self, topic_tag: &str, section_name: &str, enabled: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE topic_sections SET enabled = ?1, updated_at = ?2 WHERE topic_tag = ?3 AND section_name = ?4",
            params![enabled, Utc::now().to_rfc3339(), topic_tag, section_name],
        )?;
        Ok(changed > 0)
    }

    /// Enabled sections grouped by topic tag. Rows whose keyword list does
    /// not decode are skipped.
    pub fn list_enabled_sections(&self) -> Result<HashMap<String, Vec<TopicSection>>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT topic_tag, section_name, keywords_json
               FROM topic_sections WHERE enabled = 1 ORDER BY id ASC"#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out: HashMap<String, Vec<TopicSection>> = HashMap::new();
        for (tag, name, keywords_json) in rows {
            match serde_json::from_str::<Vec<String>>(&keywords_json) {
                Ok(keywords) => out.entry(tag).or_default().push(TopicSection { name, keywords }),
                Err(e) => tracing::warn!("Skipping section {}/{}: bad keywords ({})", tag, name, e),
            }
        }
        Ok(out)
    }

    // ─── Messages & blocked users ───────────────────────────────────────────

    pub fn insert_message(&self, msg: &CapturedMessage) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO messages
               (chat_id, chat_username, user_id, username, text, date, source_tag, subjects_json)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                msg.chat_id,
                msg.chat_username,
                msg.user_id,
                msg.username,
                msg.text,
                msg.date.to_rfc3339(),
                msg.source_tag,
                msg.subjects_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn message_count(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row("SELECT COUNT(1) FROM messages", [], |row| row.get(0))?)
    }

    pub fn block_user(&self, user_id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO blocked_users (user_id) VALUES (?1)",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn is_user_blocked(&self, user_id: i64) -> Result<bool> {
        let conn = self.lock_conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM blocked_users WHERE user_id = ?1",
                params![user_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, CourierDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let db = CourierDatabase::new(dir.path().join("data").join("listen_messages.db")).expect("db init");
        (dir, db)
    }

    fn group(name: &str, chat: &str) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            chat: chat.to_string(),
            out_file: format!("outputs/{}.txt", name),
            template_path: None,
            attachments_enabled: false,
            send_enabled: true,
            subjects_only: false,
            topic_tag: None,
        }
    }

    #[test]
    fn seeding_only_happens_on_empty_table() {
        let (_dir, db) = temp_db();
        let seeded = db
            .seed_flows_from_config(&[group("physics", "@physics_group"), group("chemistry", "-1001")])
            .unwrap();
        assert_eq!(seeded, 2);

        db.update_flow_enabled("physics", false).unwrap();
        assert_eq!(db.seed_flows_from_config(&[group("biology", "@bio")]).unwrap(), 0);

        let flows = db.list_flows().unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].name, "physics");
        assert!(!flows[0].send_enabled);
        assert!(!flows[0].template_text.is_empty());
    }

    #[test]
    fn flow_crud_round_trip() {
        let (_dir, db) = temp_db();
        db.create_flow(&NewFlow {
            name: "physics".into(),
            chat: "@physics_group".into(),
            queue_path: "outputs/physics.txt".into(),
            template_text: "Hi {username}".into(),
            attachments_enabled: false,
            send_enabled: true,
            subjects_only: true,
            topic_tag: Some("north_uni".into()),
        })
        .unwrap();

        assert!(db.update_flow_template("physics", "  Hello {username}\n").unwrap());
        let flow = db.get_flow("physics").unwrap().unwrap();
        assert_eq!(flow.template_text, "Hello {username}");
        assert_eq!(flow.effective_topic(), "north_uni");
        assert!(flow.subjects_only);

        assert!(!db.update_flow_enabled("missing", false).unwrap());
        assert!(db.create_flow(&NewFlow { name: "physics".into(), ..flow_stub() }).is_err());
    }

    fn flow_stub() -> NewFlow {
        NewFlow {
            name: String::new(),
            chat: "@x_group".into(),
            queue_path: "outputs/x.txt".into(),
            template_text: "x".into(),
            attachments_enabled: false,
            send_enabled: true,
            subjects_only: false,
            topic_tag: None,
        }
    }

    #[test]
    fn delete_flow_cascades_unshared_sections() {
        let (_dir, db) = temp_db();
        db.create_flow(&NewFlow { name: "a".into(), topic_tag: Some("uni".into()), ..flow_stub() }).unwrap();
        db.create_flow(&NewFlow { name: "b".into(), topic_tag: Some("uni".into()), ..flow_stub() }).unwrap();
        db.add_section("uni", "Calculus", &["calc".into()]).unwrap();

        assert!(db.delete_flow("a").unwrap());
        assert!(db.list_enabled_sections().unwrap().contains_key("uni"));

        assert!(db.delete_flow("b").unwrap());
        assert!(!db.list_enabled_sections().unwrap().contains_key("uni"));
        assert!(!db.delete_flow("b").unwrap());
    }

    #[test]
    fn sections_upsert_and_disable() {
        let (_dir, db) = temp_db();
        db.add_section(GLOBAL_SECTION_TAG, "Thesis", &["thesis".into(), " ".into()]).unwrap();
        db.add_section(GLOBAL_SECTION_TAG, "Thesis", &["thesis".into(), "dissertation".into()])
            .unwrap();

        let sections = db.list_enabled_sections().unwrap();
        let global = &sections[GLOBAL_SECTION_TAG];
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].keywords, vec!["thesis", "dissertation"]);

        db.set_section_enabled(GLOBAL_SECTION_TAG, "Thesis", false).unwrap();
        assert!(db.list_enabled_sections().unwrap().is_empty());
    }

    #[test]
    fn blocked_users_and_messages() {
        let (_dir, db) = temp_db();
        assert!(!db.is_user_blocked(42).unwrap());
        db.block_user(42).unwrap();
        db.block_user(42).unwrap();
        assert!(db.is_user_blocked(42).unwrap());

        db.insert_message(&CapturedMessage {
            chat_id: -1001,
            chat_username: Some("physics_group".into()),
            user_id: 7,
            username: Some("alice".into()),
            text: "need help".into(),
            date: Utc::now(),
            source_tag: Some("physics".into()),
            subjects_json: None,
        })
        .unwrap();
        assert_eq!(db.message_count().unwrap(), 1);
    }

    #[test]
    fn reopening_migrates_old_flow_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                r#"CREATE TABLE flows (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT UNIQUE NOT NULL,
                    chat TEXT NOT NULL,
                    queue_path TEXT NOT NULL,
                    template_text TEXT NOT NULL,
                    attachments_enabled INTEGER NOT NULL DEFAULT 0,
                    send_enabled INTEGER NOT NULL DEFAULT 1,
                    subjects_only INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"#,
                [],
            )
            .unwrap();
        }

        let db = CourierDatabase::new(&path).unwrap();
        db.create_flow(&NewFlow { name: "a".into(), topic_tag: Some("t".into()), ..flow_stub() }).unwrap();
        assert_eq!(db.get_flow("a").unwrap().unwrap().topic_tag.as_deref(), Some("t"));
    }
}
