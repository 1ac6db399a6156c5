use async_trait::async_trait;
use fleet_core::{ClusterError, ClusterResult};
use fleet_domain::{Group, Task, TaskStatus, TaskStore, TaskType};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, instrument};

const TASK_COLUMNS: &str =
    "id, group_name, name, code, status, task_type, schedule, description, created_at, updated_at";

/// SQLite 任务存储
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 创建嵌入式SQLite任务存储，自动初始化数据库
    pub async fn new_embedded(database_url: &str, max_connections: u32) -> ClusterResult<Self> {
        debug!("Creating embedded SQLite task store at: {}", database_url);

        let mut connect_options =
            SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if !database_url.contains(":memory:") {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        Self::run_migrations(&pool).await?;

        debug!("Successfully created embedded SQLite task store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(pool: &SqlitePool) -> ClusterResult<()> {
        debug!("Running SQLite task store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_name TEXT NOT NULL,
                name TEXT NOT NULL,
                code TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                task_type TEXT NOT NULL DEFAULT 'IMMEDIATE',
                schedule TEXT,
                description TEXT NOT NULL DEFAULT '',
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (group_name, name)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_group_name ON tasks(group_name)")
            .execute(pool)
            .await?;

        debug!("Successfully completed SQLite task store migrations");
        Ok(())
    }

    fn row_to_task(row: &SqliteRow) -> ClusterResult<Task> {
        let status: String = row.try_get("status")?;
        let task_type: String = row.try_get("task_type")?;

        Ok(Task {
            id: row.try_get("id")?,
            group_name: row.try_get("group_name")?,
            name: row.try_get("name")?,
            code: row.try_get("code")?,
            status: TaskStatus::parse(&status)
                .ok_or_else(|| ClusterError::Serialization(format!("未知任务状态: {status}")))?,
            task_type: TaskType::parse(&task_type)
                .ok_or_else(|| ClusterError::Serialization(format!("未知任务类型: {task_type}")))?,
            schedule: row.try_get("schedule")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn list_groups(&self) -> ClusterResult<Vec<Group>> {
        let rows = sqlx::query("SELECT id, name FROM groups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> ClusterResult<Group> {
                Ok(Group {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn find_tasks_by_group(&self, group_name: &str) -> ClusterResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE group_name = ?1 ORDER BY name");
        let rows = sqlx::query(&sql)
            .bind(group_name)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn find_task(&self, group_name: &str, task_name: &str) -> ClusterResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE group_name = ?1 AND name = ?2");
        let row = sqlx::query(&sql)
            .bind(group_name)
            .bind(task_name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn save_group(&self, group: &Group) -> ClusterResult<Group> {
        let row = sqlx::query(
            r#"
            INSERT INTO groups (name) VALUES (?1)
            ON CONFLICT(name) DO UPDATE SET name = excluded.name
            RETURNING id, name
            "#,
        )
        .bind(&group.name)
        .fetch_one(&self.pool)
        .await?;

        Ok(Group {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    #[instrument(skip(self, task), fields(group = %task.group_name, task_name = %task.name))]
    async fn save_task(&self, task: &Task) -> ClusterResult<Task> {
        let sql = format!(
            r#"
            INSERT INTO tasks (group_name, name, code, status, task_type, schedule, description, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(group_name, name) DO UPDATE SET
                code = excluded.code,
                status = excluded.status,
                task_type = excluded.task_type,
                schedule = excluded.schedule,
                description = excluded.description,
                updated_at = excluded.updated_at
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&task.group_name)
            .bind(&task.name)
            .bind(&task.code)
            .bind(task.status.as_str())
            .bind(task.task_type.as_str())
            .bind(&task.schedule)
            .bind(&task.description)
            .bind(task.created_at)
            .bind(task.updated_at)
            .fetch_one(&self.pool)
            .await?;

        Self::row_to_task(&row)
    }
}
