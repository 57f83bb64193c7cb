use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::info;

use super::error::{StoreError, StoreResult};
use super::session_store::{BoxFuture, MonotonicClock, SessionStore, normalize_for_storage};
use crate::models::project::preview_of;
use crate::models::{
    Attachment, Conversation, GroundingMetadata, Message, NewProject, Project, ProjectUpdate,
    Role, new_id,
};

/// Migrations applied in order. Each entry is (version, sql).
/// Append new versions; existing databases depend on the ones already here.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS projects (
        id                 TEXT    PRIMARY KEY,
        user_id            TEXT    NOT NULL,
        name               TEXT    NOT NULL DEFAULT '',
        system_instruction TEXT    NOT NULL DEFAULT '',
        theme_id           TEXT    NOT NULL DEFAULT 'ocean',
        created_at         INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_projects_user
        ON projects (user_id, created_at DESC);
    CREATE TABLE IF NOT EXISTS conversations (
        id         TEXT    PRIMARY KEY,
        project_id TEXT    NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
        title      TEXT    NOT NULL DEFAULT '',
        preview    TEXT,
        updated_at INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_project
        ON conversations (project_id, updated_at DESC);
    CREATE TABLE IF NOT EXISTS messages (
        seq                INTEGER PRIMARY KEY AUTOINCREMENT,
        id                 TEXT    NOT NULL UNIQUE,
        conversation_id    TEXT    NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        role               TEXT    NOT NULL,
        text               TEXT    NOT NULL DEFAULT '',
        attachments        TEXT    NOT NULL DEFAULT '[]',
        grounding_metadata TEXT,
        timestamp          INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id, seq);",
)];

/// SQLite-backed session store.
///
/// Foreign keys cascade project and conversation deletes down to messages.
/// `SqlitePool` is internally reference-counted and cheap to clone.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    clock: Arc<MonotonicClock>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at the platform data path.
    pub async fn new() -> StoreResult<Self> {
        Self::open(&Self::db_path()?).await
    }

    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        info!(path = %path.display(), "Opened SQLite session store");

        Ok(Self {
            pool,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Private in-memory database. A single pinned connection keeps it alive.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // One statement per query call
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    fn db_path() -> StoreResult<PathBuf> {
        dirs::data_dir()
            .ok_or_else(|| StoreError::Initialization {
                message: "Cannot find data directory".into(),
            })
            .map(|p| p.join("lumina").join("lumina.db"))
    }
}

fn project_from_row(row: &SqliteRow) -> StoreResult<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        system_instruction: row.try_get("system_instruction")?,
        theme_id: row.try_get("theme_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        title: row.try_get("title")?,
        updated_at: row.try_get("updated_at")?,
        preview: row.try_get("preview")?,
    })
}

fn message_from_row(row: &SqliteRow) -> StoreResult<Message> {
    let role: String = row.try_get("role")?;
    let role = Role::parse(&role).ok_or_else(|| StoreError::InvalidData {
        message: format!("Unknown message role: {role}"),
    })?;
    let attachments: String = row.try_get("attachments")?;
    let attachments: Vec<Attachment> = serde_json::from_str(&attachments)?;
    let grounding_metadata: Option<String> = row.try_get("grounding_metadata")?;
    let grounding_metadata = grounding_metadata
        .map(|json| serde_json::from_str::<GroundingMetadata>(&json))
        .transpose()?;

    Ok(Message {
        id: row.try_get("id")?,
        role,
        text: row.try_get("text")?,
        attachments,
        is_streaming: false,
        grounding_metadata,
        timestamp: row.try_get("timestamp")?,
    })
}

impl SessionStore for SqliteSessionStore {
    fn list_projects(&self, user_id: &str) -> BoxFuture<'static, StoreResult<Vec<Project>>> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();

        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, user_id, name, system_instruction, theme_id, created_at
                 FROM projects
                 WHERE user_id = ?
                 ORDER BY created_at DESC",
            )
            .bind(&user_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(project_from_row).collect()
        })
    }

    fn create_project(&self, project: NewProject) -> BoxFuture<'static, StoreResult<Project>> {
        let pool = self.pool.clone();
        let created_at = self.clock.now();

        Box::pin(async move {
            let project = Project {
                id: new_id(),
                user_id: project.user_id,
                name: project.name,
                system_instruction: project.system_instruction,
                theme_id: project.theme_id,
                created_at,
            };
            sqlx::query(
                "INSERT INTO projects (id, user_id, name, system_instruction, theme_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&project.id)
            .bind(&project.user_id)
            .bind(&project.name)
            .bind(&project.system_instruction)
            .bind(&project.theme_id)
            .bind(project.created_at)
            .execute(&pool)
            .await?;
            Ok(project)
        })
    }

    fn update_project(
        &self,
        id: &str,
        update: ProjectUpdate,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();

        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE projects SET
                    name               = COALESCE(?1, name),
                    system_instruction = COALESCE(?2, system_instruction),
                    theme_id           = COALESCE(?3, theme_id)
                 WHERE id = ?4",
            )
            .bind(update.name)
            .bind(update.system_instruction)
            .bind(update.theme_id)
            .bind(&id)
            .execute(&pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::not_found("project", id));
            }
            Ok(())
        })
    }

    fn delete_project(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();

        Box::pin(async move {
            sqlx::query("DELETE FROM projects WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn list_conversations(
        &self,
        project_id: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Conversation>>> {
        let pool = self.pool.clone();
        let project_id = project_id.to_string();

        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, project_id, title, preview, updated_at
                 FROM conversations
                 WHERE project_id = ?
                 ORDER BY updated_at DESC",
            )
            .bind(&project_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(conversation_from_row).collect()
        })
    }

    fn create_conversation(
        &self,
        project_id: &str,
        title: &str,
    ) -> BoxFuture<'static, StoreResult<Conversation>> {
        let pool = self.pool.clone();
        let project_id = project_id.to_string();
        let title = title.to_string();
        let updated_at = self.clock.now();

        Box::pin(async move {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM projects WHERE id = ?")
                .bind(&project_id)
                .fetch_optional(&pool)
                .await?;
            if exists.is_none() {
                return Err(StoreError::not_found("project", project_id));
            }

            let conversation = Conversation {
                id: new_id(),
                project_id,
                title,
                updated_at,
                preview: None,
            };
            sqlx::query(
                "INSERT INTO conversations (id, project_id, title, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&conversation.id)
            .bind(&conversation.project_id)
            .bind(&conversation.title)
            .bind(conversation.updated_at)
            .execute(&pool)
            .await?;
            Ok(conversation)
        })
    }

    fn rename_conversation(&self, id: &str, title: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let title = title.to_string();
        let updated_at = self.clock.now();

        Box::pin(async move {
            let result =
                sqlx::query("UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3")
                    .bind(&title)
                    .bind(updated_at)
                    .bind(&id)
                    .execute(&pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::not_found("conversation", id));
            }
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();

        Box::pin(async move {
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn touch_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let updated_at = self.clock.now();

        Box::pin(async move {
            let result = sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
                .bind(updated_at)
                .bind(&id)
                .execute(&pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::not_found("conversation", id));
            }
            Ok(())
        })
    }

    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, role, text, attachments, grounding_metadata, timestamp
                 FROM messages
                 WHERE conversation_id = ?
                 ORDER BY seq ASC",
            )
            .bind(&conversation_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(message_from_row).collect()
        })
    }

    fn save_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<Message>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        let now = self.clock.now();

        Box::pin(async move {
            let message = normalize_for_storage(message, now);
            let attachments = serde_json::to_string(&message.attachments)?;
            let grounding_metadata = message
                .grounding_metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let mut tx = pool.begin().await?;

            let result = sqlx::query(
                "UPDATE conversations SET
                    updated_at = ?1,
                    preview    = COALESCE(?2, preview)
                 WHERE id = ?3",
            )
            .bind(now)
            .bind(preview_of(&message.text))
            .bind(&conversation_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::not_found("conversation", conversation_id));
            }

            sqlx::query(
                "INSERT INTO messages
                    (id, conversation_id, role, text, attachments, grounding_metadata, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    text               = excluded.text,
                    attachments        = excluded.attachments,
                    grounding_metadata = excluded.grounding_metadata,
                    timestamp          = excluded.timestamp",
            )
            .bind(&message.id)
            .bind(&conversation_id)
            .bind(message.role.as_str())
            .bind(&message.text)
            .bind(&attachments)
            .bind(&grounding_metadata)
            .bind(message.timestamp)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(message)
        })
    }

    fn delete_messages(
        &self,
        conversation_id: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            let mut tx = pool.begin().await?;
            for id in &ids {
                sqlx::query("DELETE FROM messages WHERE conversation_id = ?1 AND id = ?2")
                    .bind(&conversation_id)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }
}
