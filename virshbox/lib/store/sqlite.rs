use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate::Migrator,
    sqlite::{SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use tokio::fs;

use super::{
    Command, Diff, ListOptions, Sandbox, SandboxFilter, SandboxState, Snapshot, Store,
};
use crate::{
    utils::{Clock, SystemClock},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the sandbox store.
pub static STORE_MIGRATOR: Migrator = sqlx::migrate!("lib/store/migrations");

const SANDBOX_COLUMNS: &str = "id, job_id, agent_id, sandbox_name, base_image, network, ip, \
    state, ttl_seconds, host_name, host_address, created_at, updated_at, deleted_at";

const SNAPSHOT_COLUMNS: &str = "id, sandbox_id, name, kind, ref, created_at, meta_json";

const COMMAND_COLUMNS: &str =
    "id, sandbox_id, command, env_json, stdout, stderr, exit_code, started_at, ended_at";

const DIFF_COLUMNS: &str = "id, sandbox_id, from_snapshot, to_snapshot, diff_json, created_at";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`Store`] backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    clock: Arc<dyn Clock>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SqliteStore {
    /// Opens the database at `db_path`, creating it and running migrations as needed.
    pub async fn open(db_path: impl AsRef<Path>) -> VirshboxResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if !fs::try_exists(db_path).await? {
            fs::File::create(db_path).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await?;

        STORE_MIGRATOR.run(&pool).await?;
        tracing::debug!(path = %db_path.display(), "opened sandbox store");

        Ok(Self::from_pool(pool))
    }

    /// Opens a private in-memory database.
    pub async fn in_memory() -> VirshboxResult<Self> {
        // A memory database lives only as long as its one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        STORE_MIGRATOR.run(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    /// Wraps an already migrated pool.
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamps `updated_at` and `deleted_at` from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn fetch_sandbox(&self, column: &str, value: &str) -> VirshboxResult<Sandbox> {
        let row = sqlx::query(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE {column} = ? AND deleted_at IS NULL"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| VirshboxError::NotFound(format!("sandbox {value}")))?;

        sandbox_from_row(&row)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Store for SqliteStore {
    async fn create_sandbox(&self, sandbox: &Sandbox) -> VirshboxResult<()> {
        sqlx::query(&format!(
            "INSERT INTO sandboxes ({SANDBOX_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&sandbox.id)
        .bind(&sandbox.job_id)
        .bind(&sandbox.agent_id)
        .bind(&sandbox.sandbox_name)
        .bind(&sandbox.base_image)
        .bind(&sandbox.network)
        .bind(&sandbox.ip_address)
        .bind(sandbox.state.as_str())
        .bind(sandbox.ttl_seconds.map(to_i64))
        .bind(&sandbox.host_name)
        .bind(&sandbox.host_address)
        .bind(sandbox.created_at)
        .bind(sandbox.updated_at)
        .bind(sandbox.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "sandbox", &sandbox.sandbox_name))?;

        tracing::debug!(sandbox_id = %sandbox.id, name = %sandbox.sandbox_name, "stored sandbox");
        Ok(())
    }

    async fn get_sandbox(&self, id: &str) -> VirshboxResult<Sandbox> {
        self.fetch_sandbox("id", id).await
    }

    async fn get_sandbox_by_name(&self, name: &str) -> VirshboxResult<Sandbox> {
        self.fetch_sandbox("sandbox_name", name).await
    }

    async fn list_sandboxes(
        &self,
        filter: &SandboxFilter,
        options: ListOptions,
    ) -> VirshboxResult<Vec<Sandbox>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE deleted_at IS NULL"
        ));

        if let Some(agent_id) = &filter.agent_id {
            query.push(" AND agent_id = ").push_bind(agent_id.clone());
        }
        if let Some(job_id) = &filter.job_id {
            query.push(" AND job_id = ").push_bind(job_id.clone());
        }
        if let Some(base_image) = &filter.base_image {
            query.push(" AND base_image = ").push_bind(base_image.clone());
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(vm_name) = &filter.vm_name {
            query.push(" AND sandbox_name = ").push_bind(vm_name.clone());
        }

        push_order_and_page(&mut query, "created_at", options);

        query
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(sandbox_from_row)
            .collect()
    }

    async fn update_sandbox(&self, sandbox: &Sandbox) -> VirshboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET job_id = ?, agent_id = ?, sandbox_name = ?, base_image = ?, network = ?,
                ip = ?, state = ?, ttl_seconds = ?, host_name = ?, host_address = ?,
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&sandbox.job_id)
        .bind(&sandbox.agent_id)
        .bind(&sandbox.sandbox_name)
        .bind(&sandbox.base_image)
        .bind(&sandbox.network)
        .bind(&sandbox.ip_address)
        .bind(sandbox.state.as_str())
        .bind(sandbox.ttl_seconds.map(to_i64))
        .bind(&sandbox.host_name)
        .bind(&sandbox.host_address)
        .bind(self.clock.now())
        .bind(&sandbox.id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "sandbox", &sandbox.sandbox_name))?;

        if result.rows_affected() == 0 {
            return Err(VirshboxError::NotFound(format!("sandbox {}", sandbox.id)));
        }

        Ok(())
    }

    async fn update_sandbox_state(
        &self,
        id: &str,
        state: SandboxState,
        ip_address: Option<&str>,
    ) -> VirshboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET state = ?, ip = COALESCE(?, ip), updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(state.as_str())
        .bind(ip_address)
        .bind(self.clock.now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(VirshboxError::NotFound(format!("sandbox {id}")));
        }

        tracing::debug!(sandbox_id = %id, state = %state, "updated sandbox state");
        Ok(())
    }

    async fn delete_sandbox(&self, id: &str) -> VirshboxResult<()> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET state = ?, deleted_at = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(SandboxState::Destroyed.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(VirshboxError::NotFound(format!("sandbox {id}")));
        }

        Ok(())
    }

    async fn list_expired_sandboxes(
        &self,
        default_ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> VirshboxResult<Vec<Sandbox>> {
        let sql = if default_ttl.is_some() {
            format!(
                "SELECT {SANDBOX_COLUMNS} FROM sandboxes \
                 WHERE deleted_at IS NULL AND state != ? ORDER BY created_at ASC"
            )
        } else {
            format!(
                "SELECT {SANDBOX_COLUMNS} FROM sandboxes \
                 WHERE deleted_at IS NULL AND state != ? AND ttl_seconds IS NOT NULL \
                 ORDER BY created_at ASC"
            )
        };

        let rows = sqlx::query(&sql)
            .bind(SandboxState::Destroyed.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut expired = Vec::new();
        for row in &rows {
            let sandbox = sandbox_from_row(row)?;
            if sandbox
                .expires_at(default_ttl)
                .is_some_and(|expires_at| expires_at <= now)
            {
                expired.push(sandbox);
            }
        }

        Ok(expired)
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> VirshboxResult<()> {
        sqlx::query(&format!(
            "INSERT INTO snapshots ({SNAPSHOT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&snapshot.id)
        .bind(&snapshot.sandbox_id)
        .bind(&snapshot.name)
        .bind(snapshot.kind.as_str())
        .bind(&snapshot.reference)
        .bind(snapshot.created_at)
        .bind(&snapshot.meta_json)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "snapshot", &snapshot.name))?;

        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> VirshboxResult<Snapshot> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| VirshboxError::NotFound(format!("snapshot {id}")))?;

        snapshot_from_row(&row)
    }

    async fn get_snapshot_by_name(
        &self,
        sandbox_id: &str,
        name: &str,
    ) -> VirshboxResult<Snapshot> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE sandbox_id = ? AND name = ?"
        ))
        .bind(sandbox_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| VirshboxError::NotFound(format!("snapshot {name} of {sandbox_id}")))?;

        snapshot_from_row(&row)
    }

    async fn list_snapshots(
        &self,
        sandbox_id: &str,
        options: ListOptions,
    ) -> VirshboxResult<Vec<Snapshot>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE sandbox_id = "
        ));
        query.push_bind(sandbox_id.to_string());
        push_order_and_page(&mut query, "created_at", options);

        query
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(snapshot_from_row)
            .collect()
    }

    async fn save_command(&self, command: &Command) -> VirshboxResult<()> {
        sqlx::query(&format!(
            "INSERT INTO commands ({COMMAND_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&command.id)
        .bind(&command.sandbox_id)
        .bind(&command.command)
        .bind(&command.env_json)
        .bind(&command.stdout)
        .bind(&command.stderr)
        .bind(command.exit_code)
        .bind(command.started_at)
        .bind(command.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "command", &command.id))?;

        Ok(())
    }

    async fn get_command(&self, id: &str) -> VirshboxResult<Command> {
        let row = sqlx::query(&format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| VirshboxError::NotFound(format!("command {id}")))?;

        command_from_row(&row)
    }

    async fn list_commands(
        &self,
        sandbox_id: &str,
        options: ListOptions,
    ) -> VirshboxResult<Vec<Command>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE sandbox_id = "
        ));
        query.push_bind(sandbox_id.to_string());
        push_order_and_page(&mut query, "started_at", options);

        query
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(command_from_row)
            .collect()
    }

    async fn save_diff(&self, diff: &Diff) -> VirshboxResult<()> {
        let diff_json = serde_json::to_string(&diff.diff)?;
        sqlx::query(&format!(
            "INSERT INTO diffs ({DIFF_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(&diff.id)
        .bind(&diff.sandbox_id)
        .bind(&diff.from_snapshot)
        .bind(&diff.to_snapshot)
        .bind(diff_json)
        .bind(diff.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_insert_error(
                e,
                "diff",
                &format!("{}..{}", diff.from_snapshot, diff.to_snapshot),
            )
        })?;

        Ok(())
    }

    async fn get_diff(&self, id: &str) -> VirshboxResult<Diff> {
        let row = sqlx::query(&format!("SELECT {DIFF_COLUMNS} FROM diffs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| VirshboxError::NotFound(format!("diff {id}")))?;

        diff_from_row(&row)
    }

    async fn get_diff_by_snapshots(
        &self,
        sandbox_id: &str,
        from_snapshot: &str,
        to_snapshot: &str,
    ) -> VirshboxResult<Diff> {
        let row = sqlx::query(&format!(
            "SELECT {DIFF_COLUMNS} FROM diffs \
             WHERE sandbox_id = ? AND from_snapshot = ? AND to_snapshot = ?"
        ))
        .bind(sandbox_id)
        .bind(from_snapshot)
        .bind(to_snapshot)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            VirshboxError::NotFound(format!(
                "diff {from_snapshot}..{to_snapshot} of {sandbox_id}"
            ))
        })?;

        diff_from_row(&row)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn map_insert_error(error: sqlx::Error, kind: &str, identity: &str) -> VirshboxError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            VirshboxError::AlreadyExists(format!("{kind} {identity}"))
        }
        _ => VirshboxError::Database(error),
    }
}

fn push_order_and_page(query: &mut QueryBuilder<'_, Sqlite>, column: &str, options: ListOptions) {
    let direction = if options.ascending { "ASC" } else { "DESC" };
    query.push(format!(" ORDER BY {column} {direction}"));

    if let Some(limit) = options.limit {
        query.push(" LIMIT ").push_bind(i64::from(limit));
        if let Some(offset) = options.offset {
            query.push(" OFFSET ").push_bind(i64::from(offset));
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn sandbox_from_row(row: &SqliteRow) -> VirshboxResult<Sandbox> {
    let state: String = row.try_get("state")?;
    let ttl_seconds: Option<i64> = row.try_get("ttl_seconds")?;

    Ok(Sandbox {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        agent_id: row.try_get("agent_id")?,
        sandbox_name: row.try_get("sandbox_name")?,
        base_image: row.try_get("base_image")?,
        network: row.try_get("network")?,
        ip_address: row.try_get("ip")?,
        state: state.parse()?,
        ttl_seconds: ttl_seconds.and_then(|ttl| u64::try_from(ttl).ok()),
        host_name: row.try_get("host_name")?,
        host_address: row.try_get("host_address")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> VirshboxResult<Snapshot> {
    let kind: String = row.try_get("kind")?;

    Ok(Snapshot {
        id: row.try_get("id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        name: row.try_get("name")?,
        kind: kind.parse()?,
        reference: row.try_get("ref")?,
        created_at: row.try_get("created_at")?,
        meta_json: row.try_get("meta_json")?,
    })
}

fn command_from_row(row: &SqliteRow) -> VirshboxResult<Command> {
    Ok(Command {
        id: row.try_get("id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        command: row.try_get("command")?,
        env_json: row.try_get("env_json")?,
        stdout: row.try_get("stdout")?,
        stderr: row.try_get("stderr")?,
        exit_code: row.try_get("exit_code")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn diff_from_row(row: &SqliteRow) -> VirshboxResult<Diff> {
    let diff_json: String = row.try_get("diff_json")?;

    Ok(Diff {
        id: row.try_get("id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        from_snapshot: row.try_get("from_snapshot")?,
        to_snapshot: row.try_get("to_snapshot")?,
        diff: serde_json::from_str(&diff_json)?,
        created_at: row.try_get("created_at")?,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
