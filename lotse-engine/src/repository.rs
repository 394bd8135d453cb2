use async_trait::async_trait;
use chrono::Utc;
use lotse_common::Error;
use lotse_types::{Task, TaskStatus};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::convert::TryFrom;
use std::time::Duration;

/// Persistence boundary for tasks. A trait so the execution engine can be
/// exercised against an in-memory fake in tests without a real database.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn add_task(&self, task: &Task) -> Result<(), Error>;
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, Error>;
    async fn update_status(&self, task_id: &str, status: TaskStatus, result: Option<serde_json::Value>, error: Option<String>) -> Result<(), Error>;
    /// Writes `ui_port`; writes `original_ui_port` too, but only the first
    /// time it is ever called for this task.
    async fn update_ui_info(&self, task_id: &str, ip_address: &str, ui_port: u16) -> Result<(), Error>;
    async fn update_vscode_port(&self, task_id: &str, port: u16) -> Result<(), Error>;
    async fn update_pid(&self, task_id: &str, pid: i32) -> Result<(), Error>;
    async fn delete_task(&self, task_id: &str) -> Result<(), Error>;
    async fn list_tasks(&self, stage: &str) -> Result<Vec<Task>, Error>;
    async fn running_tasks(&self) -> Result<Vec<Task>, Error>;
    async fn running_tasks_on_host(&self, hostname: &str) -> Result<Vec<Task>, Error>;
    async fn tasks_for_deployment(&self, deployment_id: &str) -> Result<Vec<Task>, Error>;
    async fn count_tasks_for_deployment(&self, deployment_id: &str) -> Result<i64, Error>;
}

/// Postgres-backed implementation. Connection pool settings mirror the
/// original SQLAlchemy engine (`pool_size=30, max_overflow=50,
/// pool_pre_ping=True, pool_recycle=1800`): `sqlx`'s pool has no separate
/// overflow concept, so `max_connections` covers both.
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = retry_connect(database_url, 5, Duration::from_secs(2)).await?;
        Ok(PgTaskRepository { pool })
    }

    /// Builds a repository over an already-open pool, so the gateway can
    /// share one pool between the task repository and the package lookup
    /// instead of opening two connection pools to the same database.
    pub fn with_pool(pool: PgPool) -> Self {
        PgTaskRepository { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn retry_connect(database_url: &str, retries: u32, delay: Duration) -> Result<PgPool, Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(80)
            .test_before_acquire(true)
            .max_lifetime(Duration::from_secs(1800))
            .acquire_timeout(Duration::from_secs(60))
            .connect(database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < retries => {
                tracing::warn!("database connection attempt {} failed, retrying in {:?}: {}", attempt, delay, e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn add_task(&self, task: &Task) -> Result<(), Error> {
        sqlx::query(
            r#"insert into tasks (task_id, deployment_id, package_name, package_version, stage,
                status, pod_name, namespace, hostname, ip_address, started_at, is_ui_app, arguments)
               values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(&task.task_id)
        .bind(&task.deployment_id)
        .bind(&task.package_name)
        .bind(&task.package_version)
        .bind(&task.stage)
        .bind(task.status.to_string())
        .bind(&task.pod_name)
        .bind(&task.namespace)
        .bind(&task.hostname)
        .bind(&task.ip_address)
        .bind(task.started_at)
        .bind(task.is_ui_app)
        .bind(serde_json::to_value(&task.arguments)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, Error> {
        let row = sqlx::query_as::<_, TaskRow>("select * from tasks where task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), Error> {
        // `finished_at` is stamped only when the new status is terminal, and
        // only once: a task that's already terminal never gets restamped.
        if status.is_terminal() {
            sqlx::query(
                "update tasks set status = $1, result = $2, error = $3, finished_at = $4
                 where task_id = $5 and finished_at is null",
            )
            .bind(status.to_string())
            .bind(result)
            .bind(error)
            .bind(Utc::now())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        } else {
            // A terminal task's row never gets a non-terminal status written
            // back over it: status transitions are monotonic toward
            // terminal, never away from it.
            sqlx::query(
                "update tasks set status = $1, result = $2, error = $3
                 where task_id = $4 and finished_at is null",
            )
            .bind(status.to_string())
            .bind(result)
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn update_ui_info(&self, task_id: &str, ip_address: &str, ui_port: u16) -> Result<(), Error> {
        sqlx::query(
            "update tasks set is_ui_app = true, ui_ip_address = $1, ui_port = $2,
             original_ui_port = coalesce(original_ui_port, $2) where task_id = $3",
        )
        .bind(ip_address)
        .bind(ui_port as i32)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_vscode_port(&self, task_id: &str, port: u16) -> Result<(), Error> {
        sqlx::query("update tasks set vscode_port = $1 where task_id = $2")
            .bind(port as i32)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_pid(&self, task_id: &str, pid: i32) -> Result<(), Error> {
        sqlx::query("update tasks set pid = $1 where task_id = $2")
            .bind(pid)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), Error> {
        sqlx::query("delete from tasks where task_id = $1").bind(task_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_tasks(&self, stage: &str) -> Result<Vec<Task>, Error> {
        let rows = sqlx::query_as::<_, TaskRow>("select * from tasks where stage = $1 order by started_at desc")
            .bind(stage)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn running_tasks(&self) -> Result<Vec<Task>, Error> {
        let rows = sqlx::query_as::<_, TaskRow>("select * from tasks where status in ('initializing', 'running')")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn running_tasks_on_host(&self, hostname: &str) -> Result<Vec<Task>, Error> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "select * from tasks where status in ('initializing', 'running') and hostname = $1",
        )
        .bind(hostname)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn tasks_for_deployment(&self, deployment_id: &str) -> Result<Vec<Task>, Error> {
        let rows = sqlx::query_as::<_, TaskRow>("select * from tasks where deployment_id = $1")
            .bind(deployment_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn count_tasks_for_deployment(&self, deployment_id: &str) -> Result<i64, Error> {
        let (count,): (i64,) = sqlx::query_as("select count(*) from tasks where deployment_id = $1")
            .bind(deployment_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    deployment_id: String,
    package_name: String,
    package_version: String,
    stage: String,
    status: String,
    pod_name: String,
    namespace: String,
    hostname: String,
    ip_address: String,
    pid: Option<i32>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    started_at: Option<chrono::DateTime<Utc>>,
    finished_at: Option<chrono::DateTime<Utc>>,
    is_ui_app: bool,
    ui_ip_address: Option<String>,
    ui_port: Option<i32>,
    original_ui_port: Option<i32>,
    vscode_port: Option<i32>,
    arguments: Option<serde_json::Value>,
}

impl TryFrom<TaskRow> for Task {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Self, Error> {
        let status = match row.status.as_str() {
            "initializing" => TaskStatus::Initializing,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            "timeout" => TaskStatus::Timeout,
            other => return Err(Error::GenericError(format!("unknown task status in database row: {}", other))),
        };
        Ok(Task {
            task_id: row.task_id,
            deployment_id: row.deployment_id,
            package_name: row.package_name,
            package_version: row.package_version,
            stage: row.stage,
            status,
            pod_name: row.pod_name,
            namespace: row.namespace,
            hostname: row.hostname,
            ip_address: row.ip_address,
            pid: row.pid,
            result: row.result,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
            is_ui_app: row.is_ui_app,
            ui_ip_address: row.ui_ip_address,
            ui_port: row.ui_port.map(|p| p as u16),
            original_ui_port: row.original_ui_port.map(|p| p as u16),
            vscode_port: row.vscode_port.map(|p| p as u16),
            arguments: row
                .arguments
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
        })
    }
}
