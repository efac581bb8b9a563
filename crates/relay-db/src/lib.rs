//! Relay persistence layer: users, API keys, projects, workspaces, runs and
//! evidence bundles.
//!
//! The crate offers an async API over sqlx's `Any` driver so the same code
//! serves SQLite (tests, local runs) and Postgres (production, selected via
//! `POSTGRES_URL`). UUIDs and timestamps are stored as TEXT, JSON payloads as
//! TEXT, booleans as INTEGER 0/1; one embedded migration set covers both
//! backends.

use std::{
    path::Path,
    str::FromStr,
    sync::{Arc, Once},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    AnyPool, Row,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Supported database backends for the persistence layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
}

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    driver: DatabaseDriver,
}

impl Database {
    /// Establishes a connection pool to the database at the given URL
    /// (e.g. `sqlite::memory:` or `postgres://…`) and runs migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            DatabaseDriver::Postgres
        } else {
            DatabaseDriver::Sqlite
        };

        let max_connections = match driver {
            DatabaseDriver::Sqlite if database_url.contains(":memory:") => 1,
            _ => 8,
        };

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to database at {database_url}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running embedded migrations")?;

        Ok(Self { pool, driver })
    }

    /// Connects to a file path via the `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        Self::connect(&url).await
    }

    /// Exposes the underlying pool for composed queries.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Returns the configured driver for this database handle.
    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    // ----- users -------------------------------------------------------

    /// Creates a user row. Users are created by external tooling; the core
    /// never mutates them.
    pub async fn create_user(&self, user: NewUser<'_>) -> Result<UserRecord> {
        let id = Uuid::new_v4();
        let now = encode_datetime(Utc::now());
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO users (id, email, display_name, is_admin, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO users (id, email, display_name, is_admin, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(user.email)
            .bind(user.display_name)
            .bind(encode_bool(user.is_admin))
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        self.fetch_user(id)
            .await?
            .ok_or_else(|| anyhow!("user inserted but missing when reloaded ({id})"))
    }

    pub async fn fetch_user(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM users WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM users WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    // ----- api keys ----------------------------------------------------

    /// Persists a hashed API key for the given user.
    pub async fn insert_api_key(
        &self,
        user_id: Uuid,
        token_hash: &str,
        label: Option<&str>,
    ) -> Result<ApiKeyRecord> {
        let id = Uuid::new_v4();
        let now = encode_datetime(Utc::now());
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO api_keys (id, user_id, token_hash, label, created_at, revoked_at) \
                 VALUES (?, ?, ?, ?, ?, NULL)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO api_keys (id, user_id, token_hash, label, created_at, revoked_at) \
                 VALUES ($1, $2, $3, $4, $5, NULL)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(user_id))
            .bind(token_hash)
            .bind(label)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        self.fetch_api_key(id)
            .await?
            .ok_or_else(|| anyhow!("api key inserted but missing when reloaded ({id})"))
    }

    pub async fn fetch_api_key(&self, id: Uuid) -> Result<Option<ApiKeyRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM api_keys WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM api_keys WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_api_key).transpose()
    }

    /// Retrieves an API key by its hashed token value (sha256 hex).
    pub async fn find_api_key_by_hash(&self, token_hash: &str) -> Result<Option<ApiKeyRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM api_keys WHERE token_hash = ?",
            DatabaseDriver::Postgres => "SELECT * FROM api_keys WHERE token_hash = $1",
        };
        let row = sqlx::query(select)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_api_key).transpose()
    }

    pub async fn revoke_api_key(&self, id: Uuid) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE api_keys SET revoked_at = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE api_keys SET revoked_at = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(encode_datetime(Utc::now()))
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- projects ----------------------------------------------------

    pub async fn create_project(&self, project: NewProject<'_>) -> Result<ProjectRecord> {
        let id = Uuid::new_v4();
        let now = encode_datetime(Utc::now());
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO projects (id, user_id, name, repo_url, created_at) \
                 VALUES (?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO projects (id, user_id, name, repo_url, created_at) \
                 VALUES ($1, $2, $3, $4, $5)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(project.user_id))
            .bind(project.name)
            .bind(project.repo_url)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        self.fetch_project(id)
            .await?
            .ok_or_else(|| anyhow!("project inserted but missing when reloaded ({id})"))
    }

    pub async fn fetch_project(&self, id: Uuid) -> Result<Option<ProjectRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM projects WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM projects WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_project).transpose()
    }

    pub async fn list_projects(&self, user_id: Uuid) -> Result<Vec<ProjectRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM projects WHERE user_id = ? ORDER BY created_at DESC"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM projects WHERE user_id = $1 ORDER BY created_at DESC"
            }
        };
        let mut rows = sqlx::query(select).bind(encode_uuid(user_id)).fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_project(row)?);
        }
        Ok(out)
    }

    // ----- workspaces --------------------------------------------------

    pub async fn fetch_workspace(&self, id: Uuid) -> Result<Option<WorkspaceRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM workspaces WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM workspaces WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_workspace).transpose()
    }

    pub async fn fetch_workspace_for_project(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<Option<WorkspaceRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM workspaces WHERE user_id = ? AND project_id = ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM workspaces WHERE user_id = $1 AND project_id = $2"
            }
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(user_id))
            .bind(encode_uuid(project_id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_workspace).transpose()
    }

    /// All warm workspaces owned by the user.
    pub async fn list_warm_workspaces(&self, user_id: Uuid) -> Result<Vec<WorkspaceRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM workspaces WHERE user_id = ? AND state = 'warm'"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM workspaces WHERE user_id = $1 AND state = 'warm'"
            }
        };
        let mut rows = sqlx::query(select).bind(encode_uuid(user_id)).fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_workspace(row)?);
        }
        Ok(out)
    }

    /// Transactional open: flips every other warm workspace of the user to
    /// cold and upserts the target row to `warm` in a single transaction.
    /// This is the sole enforcement point of the single-warm invariant; the
    /// caller performs sandbox driver work after the transaction commits and
    /// flips the target to `error` in a second transaction if that fails.
    ///
    /// Rows already in `deleted` are reused: the pair is unique, so reopening
    /// a deleted workspace allocates a fresh volume name on the same row and
    /// clears the stale thread id.
    pub async fn open_workspace(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<WorkspaceOpenOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let select_warm = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM workspaces WHERE user_id = ? AND state = 'warm'"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM workspaces WHERE user_id = $1 AND state = 'warm' FOR UPDATE"
            }
        };
        let warm_rows = sqlx::query(select_warm)
            .bind(encode_uuid(user_id))
            .fetch_all(&mut *tx)
            .await?;

        let mut displaced = Vec::new();
        let mut target: Option<WorkspaceRecord> = None;
        for row in warm_rows {
            let ws = map_workspace(row)?;
            if ws.project_id == project_id {
                target = Some(ws);
            } else {
                displaced.push(ws);
            }
        }

        let cool = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE workspaces SET state = 'cold', container_id = NULL, idle_expires_at = NULL \
                 WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE workspaces SET state = 'cold', container_id = NULL, idle_expires_at = NULL \
                 WHERE id = $1"
            }
        };
        for ws in &displaced {
            sqlx::query(cool)
                .bind(encode_uuid(ws.id))
                .execute(&mut *tx)
                .await?;
        }

        let workspace = match target {
            Some(ws) => ws,
            None => {
                // Upsert-then-lock: the insert is a no-op when a concurrent
                // open (or an old cold/error/deleted row) already owns the
                // pair, and the locked re-select makes the warm flip race
                // free.
                let id = Uuid::new_v4();
                let insert = match self.driver {
                    DatabaseDriver::Sqlite => {
                        "INSERT INTO workspaces (id, user_id, project_id, state, \
                         container_id, volume_name, thread_id, image_name, image_digest, \
                         runtime_metadata, last_active_at, idle_expires_at) \
                         VALUES (?, ?, ?, 'cold', NULL, NULL, NULL, NULL, NULL, NULL, ?, NULL) \
                         ON CONFLICT (user_id, project_id) DO NOTHING"
                    }
                    DatabaseDriver::Postgres => {
                        "INSERT INTO workspaces (id, user_id, project_id, state, \
                         container_id, volume_name, thread_id, image_name, image_digest, \
                         runtime_metadata, last_active_at, idle_expires_at) \
                         VALUES ($1, $2, $3, 'cold', NULL, NULL, NULL, NULL, NULL, NULL, $4, NULL) \
                         ON CONFLICT (user_id, project_id) DO NOTHING"
                    }
                };
                sqlx::query(insert)
                    .bind(encode_uuid(id))
                    .bind(encode_uuid(user_id))
                    .bind(encode_uuid(project_id))
                    .bind(encode_datetime(now))
                    .execute(&mut *tx)
                    .await?;

                let select_pair = match self.driver {
                    DatabaseDriver::Sqlite => {
                        "SELECT * FROM workspaces WHERE user_id = ? AND project_id = ?"
                    }
                    DatabaseDriver::Postgres => {
                        "SELECT * FROM workspaces WHERE user_id = $1 AND project_id = $2 FOR UPDATE"
                    }
                };
                let ws = sqlx::query(select_pair)
                    .bind(encode_uuid(user_id))
                    .bind(encode_uuid(project_id))
                    .fetch_optional(&mut *tx)
                    .await?
                    .map(map_workspace)
                    .transpose()?
                    .ok_or_else(|| anyhow!("workspace upsert lost its row ({user_id}, {project_id})"))?;

                // Volume names are allocated at first warm and only
                // reallocated after the deleted transition nulled them.
                let volume_name = ws
                    .volume_name
                    .clone()
                    .unwrap_or_else(|| volume_name_for(ws.id));
                let thread_id = if ws.state == WorkspaceState::Deleted {
                    None
                } else {
                    ws.thread_id.clone()
                };
                let warmup = match self.driver {
                    DatabaseDriver::Sqlite => {
                        "UPDATE workspaces SET state = 'warm', volume_name = ?, \
                         thread_id = ?, last_active_at = ? WHERE id = ?"
                    }
                    DatabaseDriver::Postgres => {
                        "UPDATE workspaces SET state = 'warm', volume_name = $1, \
                         thread_id = $2, last_active_at = $3 WHERE id = $4"
                    }
                };
                sqlx::query(warmup)
                    .bind(&volume_name)
                    .bind(thread_id.as_deref())
                    .bind(encode_datetime(now))
                    .bind(encode_uuid(ws.id))
                    .execute(&mut *tx)
                    .await?;
                WorkspaceRecord {
                    state: WorkspaceState::Warm,
                    volume_name: Some(volume_name),
                    thread_id,
                    last_active_at: now,
                    ..ws
                }
            }
        };

        tx.commit().await?;
        Ok(WorkspaceOpenOutcome {
            workspace,
            displaced,
        })
    }

    /// Finalizes a successful warm-up with the live container details.
    pub async fn mark_workspace_warm(&self, update: WorkspaceWarmUpdate<'_>) -> Result<()> {
        let sql = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE workspaces SET state = 'warm', container_id = ?, image_name = ?, \
                 image_digest = ?, runtime_metadata = ?, last_active_at = ?, idle_expires_at = ? \
                 WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE workspaces SET state = 'warm', container_id = $1, image_name = $2, \
                 image_digest = $3, runtime_metadata = $4, last_active_at = $5, \
                 idle_expires_at = $6 WHERE id = $7"
            }
        };
        let metadata = update
            .runtime_metadata
            .map(|value| serde_json::to_string(value))
            .transpose()
            .context("serializing workspace runtime metadata")?;
        sqlx::query(sql)
            .bind(update.container_id)
            .bind(update.image_name)
            .bind(update.image_digest)
            .bind(metadata)
            .bind(encode_datetime(update.last_active_at))
            .bind(encode_datetime(update.idle_expires_at))
            .bind(encode_uuid(update.id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stops tracking the container: state becomes `cold`, volume and thread
    /// id are retained.
    pub async fn mark_workspace_cold(&self, id: Uuid) -> Result<()> {
        let sql = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE workspaces SET state = 'cold', container_id = NULL, idle_expires_at = NULL \
                 WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE workspaces SET state = 'cold', container_id = NULL, idle_expires_at = NULL \
                 WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_workspace_error(&self, id: Uuid) -> Result<()> {
        let sql = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE workspaces SET state = 'error', container_id = NULL, idle_expires_at = NULL \
                 WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE workspaces SET state = 'error', container_id = NULL, idle_expires_at = NULL \
                 WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal transition used by retention: volume is gone, the row keeps
    /// its identity so the (user, project) pair stays unique.
    pub async fn mark_workspace_deleted(&self, id: Uuid) -> Result<()> {
        let sql = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE workspaces SET state = 'deleted', container_id = NULL, volume_name = NULL, \
                 idle_expires_at = NULL WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE workspaces SET state = 'deleted', container_id = NULL, volume_name = NULL, \
                 idle_expires_at = NULL WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Post-run bookkeeping: refreshed thread id and idle deadline.
    pub async fn touch_workspace_after_run(
        &self,
        id: Uuid,
        thread_id: Option<&str>,
        last_active_at: DateTime<Utc>,
        idle_expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE workspaces SET thread_id = COALESCE(?, thread_id), last_active_at = ?, \
                 idle_expires_at = ? WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE workspaces SET thread_id = COALESCE($1, thread_id), last_active_at = $2, \
                 idle_expires_at = $3 WHERE id = $4"
            }
        };
        sqlx::query(sql)
            .bind(thread_id)
            .bind(encode_datetime(last_active_at))
            .bind(encode_datetime(idle_expires_at))
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Warm workspaces whose idle deadline has passed; input to the reaper.
    pub async fn list_idle_warm_workspaces(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkspaceRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM workspaces WHERE state = 'warm' AND container_id IS NOT NULL \
                 AND idle_expires_at IS NOT NULL AND idle_expires_at < ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM workspaces WHERE state = 'warm' AND container_id IS NOT NULL \
                 AND idle_expires_at IS NOT NULL AND idle_expires_at < $1"
            }
        };
        let mut rows = sqlx::query(select)
            .bind(encode_datetime(now))
            .fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_workspace(row)?);
        }
        Ok(out)
    }

    /// Cold workspaces older than the retention cutoff that still own a
    /// volume; input to the retention collector.
    pub async fn list_expired_cold_workspaces(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkspaceRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM workspaces WHERE state = 'cold' AND volume_name IS NOT NULL \
                 AND last_active_at < ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM workspaces WHERE state = 'cold' AND volume_name IS NOT NULL \
                 AND last_active_at < $1"
            }
        };
        let mut rows = sqlx::query(select)
            .bind(encode_datetime(cutoff))
            .fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_workspace(row)?);
        }
        Ok(out)
    }

    // ----- runs --------------------------------------------------------

    pub async fn insert_run(&self, run: NewRun<'_>) -> Result<RunRecord> {
        let snapshot = run
            .env_snapshot
            .map(|value| serde_json::to_string(value))
            .transpose()
            .context("serializing run env snapshot")?;
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO runs (id, user_id, project_id, workspace_id, status, prompt, \
                 started_at, image_name, image_digest, env_snapshot) \
                 VALUES (?, ?, ?, ?, 'running', ?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO runs (id, user_id, project_id, workspace_id, status, prompt, \
                 started_at, image_name, image_digest, env_snapshot) \
                 VALUES ($1, $2, $3, $4, 'running', $5, $6, $7, $8, $9)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(run.id))
            .bind(encode_uuid(run.user_id))
            .bind(encode_uuid(run.project_id))
            .bind(encode_uuid(run.workspace_id))
            .bind(run.prompt)
            .bind(encode_datetime(run.started_at))
            .bind(run.image_name)
            .bind(run.image_digest)
            .bind(snapshot)
            .execute(&self.pool)
            .await?;

        self.fetch_run(run.id)
            .await?
            .ok_or_else(|| anyhow!("run inserted but missing when reloaded ({})", run.id))
    }

    /// Terminal update for a run. `status` must not be `running`.
    pub async fn finish_run(&self, completion: RunCompletion<'_>) -> Result<RunRecord> {
        let snapshot = completion
            .env_snapshot
            .map(|value| serde_json::to_string(value))
            .transpose()
            .context("serializing run env snapshot")?;
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE runs SET status = ?, final_text = ?, diff = ?, test_output = ?, \
                 error_message = ?, finished_at = ?, duration_ms = ?, input_tokens = ?, \
                 output_tokens = ?, git_commit = ?, \
                 env_snapshot = COALESCE(?, env_snapshot) WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE runs SET status = $1, final_text = $2, diff = $3, test_output = $4, \
                 error_message = $5, finished_at = $6, duration_ms = $7, input_tokens = $8, \
                 output_tokens = $9, git_commit = $10, \
                 env_snapshot = COALESCE($11, env_snapshot) WHERE id = $12"
            }
        };
        sqlx::query(update)
            .bind(completion.status.as_str())
            .bind(completion.final_text)
            .bind(completion.diff)
            .bind(completion.test_output)
            .bind(completion.error_message)
            .bind(encode_datetime(completion.finished_at))
            .bind(completion.duration_ms as i64)
            .bind(completion.input_tokens.map(|v| v as i64))
            .bind(completion.output_tokens.map(|v| v as i64))
            .bind(completion.git_commit)
            .bind(snapshot)
            .bind(encode_uuid(completion.id))
            .execute(&self.pool)
            .await?;

        self.fetch_run(completion.id)
            .await?
            .ok_or_else(|| anyhow!("run updated but missing when reloaded ({})", completion.id))
    }

    pub async fn fetch_run(&self, id: Uuid) -> Result<Option<RunRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM runs WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM runs WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_run).transpose()
    }

    pub async fn list_recent_runs(&self, project_id: Uuid, limit: u32) -> Result<Vec<RunRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM runs WHERE project_id = ? ORDER BY started_at DESC LIMIT ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM runs WHERE project_id = $1 ORDER BY started_at DESC LIMIT $2"
            }
        };
        let mut rows = sqlx::query(select)
            .bind(encode_uuid(project_id))
            .bind(limit as i64)
            .fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_run(row)?);
        }
        Ok(out)
    }

    /// Number of runs the user has started at or after `since`. Backs the
    /// daily quota, so it counts every status including failures.
    pub async fn count_runs_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<u64> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT COUNT(*) AS run_count FROM runs WHERE user_id = ? AND started_at >= ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT COUNT(*) AS run_count FROM runs WHERE user_id = $1 AND started_at >= $2"
            }
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(user_id))
            .bind(encode_datetime(since))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("run_count")?;
        Ok(count as u64)
    }

    // ----- evidence bundles --------------------------------------------

    /// Upserts the pending bundle row for a run. The unique constraint on
    /// `run_id` makes this idempotent and serializes builders per run.
    pub async fn create_pending_bundle(&self, run: &RunRecord) -> Result<EvidenceBundleRecord> {
        if let Some(existing) = self.fetch_bundle_for_run(run.id).await? {
            return Ok(existing);
        }
        let id = Uuid::new_v4();
        let now = encode_datetime(Utc::now());
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO evidence_bundles (id, run_id, user_id, project_id, workspace_id, \
                 status, bundle_path, error_message, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, 'pending', NULL, NULL, ?, ?) \
                 ON CONFLICT (run_id) DO NOTHING"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO evidence_bundles (id, run_id, user_id, project_id, workspace_id, \
                 status, bundle_path, error_message, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, 'pending', NULL, NULL, $6, $7) \
                 ON CONFLICT (run_id) DO NOTHING"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(run.id))
            .bind(encode_uuid(run.user_id))
            .bind(encode_uuid(run.project_id))
            .bind(encode_uuid(run.workspace_id))
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        self.fetch_bundle_for_run(run.id)
            .await?
            .ok_or_else(|| anyhow!("bundle upserted but missing when reloaded ({})", run.id))
    }

    pub async fn fetch_bundle_for_run(&self, run_id: Uuid) -> Result<Option<EvidenceBundleRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM evidence_bundles WHERE run_id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM evidence_bundles WHERE run_id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(run_id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_bundle).transpose()
    }

    /// Pending bundles in creation order; the durable work queue for the
    /// evidence builder.
    pub async fn list_pending_bundles(&self, limit: u32) -> Result<Vec<EvidenceBundleRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM evidence_bundles WHERE status = 'pending' \
                 ORDER BY created_at ASC LIMIT ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM evidence_bundles WHERE status = 'pending' \
                 ORDER BY created_at ASC LIMIT $1"
            }
        };
        let mut rows = sqlx::query(select).bind(limit as i64).fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_bundle(row)?);
        }
        Ok(out)
    }

    pub async fn mark_bundle_ready(&self, run_id: Uuid, bundle_path: &str) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE evidence_bundles SET status = 'ready', bundle_path = ?, \
                 error_message = NULL, updated_at = ? WHERE run_id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE evidence_bundles SET status = 'ready', bundle_path = $1, \
                 error_message = NULL, updated_at = $2 WHERE run_id = $3"
            }
        };
        sqlx::query(update)
            .bind(bundle_path)
            .bind(encode_datetime(Utc::now()))
            .bind(encode_uuid(run_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_bundle_error(&self, run_id: Uuid, error_message: &str) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE evidence_bundles SET status = 'error', error_message = ?, updated_at = ? \
                 WHERE run_id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE evidence_bundles SET status = 'error', error_message = $1, \
                 updated_at = $2 WHERE run_id = $3"
            }
        };
        sqlx::query(update)
            .bind(error_message)
            .bind(encode_datetime(Utc::now()))
            .bind(encode_uuid(run_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Retention transition once the zip has been removed from disk.
    pub async fn mark_bundle_deleted(&self, id: Uuid) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE evidence_bundles SET status = 'deleted', bundle_path = NULL, \
                 updated_at = ? WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE evidence_bundles SET status = 'deleted', bundle_path = NULL, \
                 updated_at = $1 WHERE id = $2"
            }
        };
        sqlx::query(update)
            .bind(encode_datetime(Utc::now()))
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_expired_bundles(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EvidenceBundleRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM evidence_bundles WHERE status = 'ready' \
                 AND bundle_path IS NOT NULL AND created_at < ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM evidence_bundles WHERE status = 'ready' \
                 AND bundle_path IS NOT NULL AND created_at < $1"
            }
        };
        let mut rows = sqlx::query(select)
            .bind(encode_datetime(cutoff))
            .fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_bundle(row)?);
        }
        Ok(out)
    }
}

fn volume_name_for(workspace_id: Uuid) -> String {
    format!("ws-{workspace_id}")
}

// ----- encoding helpers -----------------------------------------------

fn encode_uuid(id: Uuid) -> String {
    id.to_string()
}

fn encode_datetime(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn encode_bool(value: bool) -> i64 {
    i64::from(value)
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value).with_context(|| format!("invalid uuid column value: {value}"))
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp column value: {value}"))
}

fn decode_datetime(row: &AnyRow, column: &str) -> Result<DateTime<Utc>> {
    parse_datetime(row.try_get::<String, _>(column)?)
}

fn decode_optional_datetime(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.try_get::<Option<String>, _>(column)?
        .map(parse_datetime)
        .transpose()
}

fn decode_optional_json(row: &AnyRow, column: &str) -> Result<Option<Value>> {
    row.try_get::<Option<String>, _>(column)?
        .map(|raw| {
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in column {column}"))
        })
        .transpose()
}

// ----- row mappers ----------------------------------------------------

fn map_user(row: AnyRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        is_admin: row.try_get::<i64, _>("is_admin")? != 0,
        created_at: decode_datetime(&row, "created_at")?,
        updated_at: decode_datetime(&row, "updated_at")?,
    })
}

fn map_api_key(row: AnyRow) -> Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
        token_hash: row.try_get("token_hash")?,
        label: row.try_get("label")?,
        created_at: decode_datetime(&row, "created_at")?,
        revoked_at: decode_optional_datetime(&row, "revoked_at")?,
    })
}

fn map_project(row: AnyRow) -> Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
        name: row.try_get("name")?,
        repo_url: row.try_get("repo_url")?,
        created_at: decode_datetime(&row, "created_at")?,
    })
}

fn map_workspace(row: AnyRow) -> Result<WorkspaceRecord> {
    let state: String = row.try_get("state")?;
    Ok(WorkspaceRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
        project_id: parse_uuid(row.try_get::<String, _>("project_id")?)?,
        state: WorkspaceState::from_str(&state)?,
        container_id: row.try_get("container_id")?,
        volume_name: row.try_get("volume_name")?,
        thread_id: row.try_get("thread_id")?,
        image_name: row.try_get("image_name")?,
        image_digest: row.try_get("image_digest")?,
        runtime_metadata: decode_optional_json(&row, "runtime_metadata")?,
        last_active_at: decode_datetime(&row, "last_active_at")?,
        idle_expires_at: decode_optional_datetime(&row, "idle_expires_at")?,
    })
}

fn map_run(row: AnyRow) -> Result<RunRecord> {
    let status: String = row.try_get("status")?;
    Ok(RunRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
        project_id: parse_uuid(row.try_get::<String, _>("project_id")?)?,
        workspace_id: parse_uuid(row.try_get::<String, _>("workspace_id")?)?,
        status: RunStatus::from_str(&status)?,
        prompt: row.try_get("prompt")?,
        final_text: row.try_get("final_text")?,
        diff: row.try_get("diff")?,
        test_output: row.try_get("test_output")?,
        error_message: row.try_get("error_message")?,
        started_at: decode_datetime(&row, "started_at")?,
        finished_at: decode_optional_datetime(&row, "finished_at")?,
        duration_ms: row.try_get::<Option<i64>, _>("duration_ms")?.map(|v| v as u64),
        input_tokens: row.try_get::<Option<i64>, _>("input_tokens")?.map(|v| v as u64),
        output_tokens: row.try_get::<Option<i64>, _>("output_tokens")?.map(|v| v as u64),
        git_commit: row.try_get("git_commit")?,
        image_name: row.try_get("image_name")?,
        image_digest: row.try_get("image_digest")?,
        env_snapshot: decode_optional_json(&row, "env_snapshot")?,
    })
}

fn map_bundle(row: AnyRow) -> Result<EvidenceBundleRecord> {
    let status: String = row.try_get("status")?;
    Ok(EvidenceBundleRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        run_id: parse_uuid(row.try_get::<String, _>("run_id")?)?,
        user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
        project_id: parse_uuid(row.try_get::<String, _>("project_id")?)?,
        workspace_id: parse_uuid(row.try_get::<String, _>("workspace_id")?)?,
        status: BundleStatus::from_str(&status)?,
        bundle_path: row.try_get("bundle_path")?,
        error_message: row.try_get("error_message")?,
        created_at: decode_datetime(&row, "created_at")?,
        updated_at: decode_datetime(&row, "updated_at")?,
    })
}

// ----- records and enums ----------------------------------------------

/// Identity anchor. Never mutated by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub email: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub is_admin: bool,
}

/// Hashed credential consumed by the daemon's auth layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Logical grouping owning at most one workspace at any time. Immutable
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProject<'a> {
    pub user_id: Uuid,
    pub name: &'a str,
    pub repo_url: &'a str,
}

/// Workspace lifecycle states. `deleted` and `error` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Warm,
    Cold,
    Deleted,
    Error,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Warm => "warm",
            WorkspaceState::Cold => "cold",
            WorkspaceState::Deleted => "deleted",
            WorkspaceState::Error => "error",
        }
    }
}

impl FromStr for WorkspaceState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "warm" => Ok(WorkspaceState::Warm),
            "cold" => Ok(WorkspaceState::Cold),
            "deleted" => Ok(WorkspaceState::Deleted),
            "error" => Ok(WorkspaceState::Error),
            other => Err(anyhow!("unknown workspace state: {}", other)),
        }
    }
}

/// The durable handle to a sandbox: container identity while warm, volume
/// and agent thread across cold cycles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub state: WorkspaceState,
    pub container_id: Option<String>,
    pub volume_name: Option<String>,
    pub thread_id: Option<String>,
    pub image_name: Option<String>,
    pub image_digest: Option<String>,
    pub runtime_metadata: Option<Value>,
    pub last_active_at: DateTime<Utc>,
    pub idle_expires_at: Option<DateTime<Utc>>,
}

/// Result of the transactional open: the warm target plus every peer that
/// was flipped cold inside the same transaction (containers still need a
/// best-effort stop by the caller).
#[derive(Debug, Clone)]
pub struct WorkspaceOpenOutcome {
    pub workspace: WorkspaceRecord,
    pub displaced: Vec<WorkspaceRecord>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceWarmUpdate<'a> {
    pub id: Uuid,
    pub container_id: &'a str,
    pub image_name: Option<&'a str>,
    pub image_digest: Option<&'a str>,
    pub runtime_metadata: Option<&'a Value>,
    pub last_active_at: DateTime<Utc>,
    pub idle_expires_at: DateTime<Utc>,
}

/// Run statuses. `running` is the only non-terminal status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "timeout" => Ok(RunStatus::Timeout),
            other => Err(anyhow!("unknown run status: {}", other)),
        }
    }
}

/// One prompt invocation against a warm workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub status: RunStatus,
    pub prompt: String,
    pub final_text: Option<String>,
    pub diff: Option<String>,
    pub test_output: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub git_commit: Option<String>,
    pub image_name: Option<String>,
    pub image_digest: Option<String>,
    pub env_snapshot: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub prompt: &'a str,
    pub started_at: DateTime<Utc>,
    pub image_name: Option<&'a str>,
    pub image_digest: Option<&'a str>,
    pub env_snapshot: Option<&'a Value>,
}

#[derive(Debug, Clone)]
pub struct RunCompletion<'a> {
    pub id: Uuid,
    pub status: RunStatus,
    pub final_text: Option<&'a str>,
    pub diff: Option<&'a str>,
    pub test_output: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub git_commit: Option<&'a str>,
    pub env_snapshot: Option<&'a Value>,
}

/// Evidence bundle statuses. `ready` rows own a zip on disk until retention
/// flips them to `deleted`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Pending,
    Ready,
    Error,
    Deleted,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Pending => "pending",
            BundleStatus::Ready => "ready",
            BundleStatus::Error => "error",
            BundleStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for BundleStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BundleStatus::Pending),
            "ready" => Ok(BundleStatus::Ready),
            "error" => Ok(BundleStatus::Error),
            "deleted" => Ok(BundleStatus::Deleted),
            other => Err(anyhow!("unknown bundle status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceBundleRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub status: BundleStatus,
    pub bundle_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ----- background worker plumbing --------------------------------------

/// Helper trait for background jobs that need a graceful shutdown.
#[async_trait]
pub trait BackgroundWorker: Send + Sync {
    async fn run(self: Arc<Self>) -> Result<()>;
}

/// A guard that owns the join handle of a running worker.
pub struct WorkerGuard {
    handle: JoinHandle<Result<()>>,
}

impl WorkerGuard {
    pub fn new(handle: JoinHandle<Result<()>>) -> Self {
        Self { handle }
    }

    pub async fn join(self) -> Result<()> {
        self.handle.await??;
        Ok(())
    }
}

/// Registry owning the join handles of the daemon's sweepers so startup can
/// hand them out and shutdown can surface their errors.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerGuard>>,
}

impl WorkerRegistry {
    pub fn register(&self, handle: JoinHandle<Result<()>>) {
        self.workers.write().push(WorkerGuard::new(handle));
    }

    pub async fn wait_all(self) -> Result<()> {
        for guard in self.workers.into_inner() {
            guard.join().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TEST_DB_URL: &str = "sqlite::memory:";

    async fn setup_db() -> Database {
        Database::connect(TEST_DB_URL).await.unwrap()
    }

    async fn seed_user(db: &Database) -> UserRecord {
        db.create_user(NewUser {
            email: Some("dev@example.com"),
            display_name: Some("Dev"),
            is_admin: false,
        })
        .await
        .unwrap()
    }

    async fn seed_project(db: &Database, user: &UserRecord, name: &str) -> ProjectRecord {
        db.create_project(NewProject {
            user_id: user.id,
            name,
            repo_url: "https://github.com/octocat/Hello-World.git",
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn project_roundtrip() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let project = seed_project(&db, &user, "hello").await;

        let fetched = db.fetch_project(project.id).await.unwrap().unwrap();
        assert_eq!(fetched, project);

        let listed = db.list_projects(user.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, project.id);
    }

    #[tokio::test]
    async fn api_key_lookup_and_revocation() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let key = db
            .insert_api_key(user.id, "hash-abc", Some("ci"))
            .await
            .unwrap();

        let found = db.find_api_key_by_hash("hash-abc").await.unwrap().unwrap();
        assert_eq!(found.id, key.id);
        assert_eq!(found.user_id, user.id);
        assert!(!found.is_revoked());

        db.revoke_api_key(key.id).await.unwrap();
        let revoked = db.find_api_key_by_hash("hash-abc").await.unwrap().unwrap();
        assert!(revoked.is_revoked());
    }

    #[tokio::test]
    async fn open_workspace_allocates_volume_once() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let project = seed_project(&db, &user, "p1").await;

        let first = db.open_workspace(user.id, project.id).await.unwrap();
        assert_eq!(first.workspace.state, WorkspaceState::Warm);
        let volume = first.workspace.volume_name.clone().unwrap();
        assert_eq!(volume, format!("ws-{}", first.workspace.id));
        assert!(first.displaced.is_empty());

        let second = db.open_workspace(user.id, project.id).await.unwrap();
        assert_eq!(second.workspace.id, first.workspace.id);
        assert_eq!(second.workspace.volume_name.as_deref(), Some(volume.as_str()));
    }

    #[tokio::test]
    async fn open_workspace_displaces_other_warm_rows() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let p1 = seed_project(&db, &user, "p1").await;
        let p2 = seed_project(&db, &user, "p2").await;

        let w1 = db.open_workspace(user.id, p1.id).await.unwrap().workspace;
        db.mark_workspace_warm(WorkspaceWarmUpdate {
            id: w1.id,
            container_id: "c-1",
            image_name: Some("relay-workspace:latest"),
            image_digest: Some("sha256:abc"),
            runtime_metadata: None,
            last_active_at: Utc::now(),
            idle_expires_at: Utc::now() + Duration::minutes(20),
        })
        .await
        .unwrap();

        let outcome = db.open_workspace(user.id, p2.id).await.unwrap();
        assert_eq!(outcome.displaced.len(), 1);
        assert_eq!(outcome.displaced[0].id, w1.id);
        assert_eq!(outcome.displaced[0].container_id.as_deref(), Some("c-1"));

        let cooled = db.fetch_workspace(w1.id).await.unwrap().unwrap();
        assert_eq!(cooled.state, WorkspaceState::Cold);
        assert!(cooled.container_id.is_none());
        assert!(cooled.volume_name.is_some());

        let warm = db.list_warm_workspaces(user.id).await.unwrap();
        assert_eq!(warm.len(), 1);
        assert_eq!(warm[0].project_id, p2.id);
    }

    #[tokio::test]
    async fn reopening_deleted_workspace_reuses_row_with_fresh_volume() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let project = seed_project(&db, &user, "p1").await;

        let ws = db.open_workspace(user.id, project.id).await.unwrap().workspace;
        db.touch_workspace_after_run(ws.id, Some("thread-1"), Utc::now(), Utc::now())
            .await
            .unwrap();
        db.mark_workspace_cold(ws.id).await.unwrap();
        db.mark_workspace_deleted(ws.id).await.unwrap();

        let deleted = db.fetch_workspace(ws.id).await.unwrap().unwrap();
        assert_eq!(deleted.state, WorkspaceState::Deleted);
        assert!(deleted.volume_name.is_none());

        let reopened = db.open_workspace(user.id, project.id).await.unwrap().workspace;
        assert_eq!(reopened.id, ws.id);
        assert_eq!(reopened.state, WorkspaceState::Warm);
        assert_eq!(
            reopened.volume_name.as_deref(),
            Some(format!("ws-{}", ws.id).as_str())
        );
        assert!(reopened.thread_id.is_none());
    }

    #[tokio::test]
    async fn run_insert_and_finish_hold_status_invariants() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let project = seed_project(&db, &user, "p1").await;
        let ws = db.open_workspace(user.id, project.id).await.unwrap().workspace;

        let run_id = Uuid::new_v4();
        let run = db
            .insert_run(NewRun {
                id: run_id,
                user_id: user.id,
                project_id: project.id,
                workspace_id: ws.id,
                prompt: "create hello.txt",
                started_at: Utc::now(),
                image_name: Some("relay-workspace:latest"),
                image_digest: Some("sha256:abc"),
                env_snapshot: None,
            })
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());
        assert!(run.duration_ms.is_none());

        let snapshot = serde_json::json!({ "evidencePath": format!("/workspace/evidence/{run_id}") });
        let finished = db
            .finish_run(RunCompletion {
                id: run_id,
                status: RunStatus::Succeeded,
                final_text: Some("created hello.txt"),
                diff: Some("+++ b/hello.txt"),
                test_output: None,
                error_message: None,
                finished_at: Utc::now(),
                duration_ms: 1234,
                input_tokens: None,
                output_tokens: None,
                git_commit: Some("abc123"),
                env_snapshot: Some(&snapshot),
            })
            .await
            .unwrap();

        assert_eq!(finished.status, RunStatus::Succeeded);
        assert!(finished.finished_at.is_some());
        assert_eq!(finished.duration_ms, Some(1234));
        let snapshot = finished.env_snapshot.unwrap();
        assert_eq!(
            snapshot["evidencePath"],
            format!("/workspace/evidence/{run_id}")
        );
    }

    #[tokio::test]
    async fn count_runs_since_scopes_to_user_and_window() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let other = seed_user(&db).await;
        let project = seed_project(&db, &user, "p1").await;
        let other_project = seed_project(&db, &other, "p2").await;
        let ws = db.open_workspace(user.id, project.id).await.unwrap().workspace;
        let other_ws = db
            .open_workspace(other.id, other_project.id)
            .await
            .unwrap()
            .workspace;

        let now = Utc::now();
        for offset in [0i64, 1, 2] {
            db.insert_run(NewRun {
                id: Uuid::new_v4(),
                user_id: user.id,
                project_id: project.id,
                workspace_id: ws.id,
                prompt: "p",
                started_at: now + Duration::seconds(offset),
                image_name: None,
                image_digest: None,
                env_snapshot: None,
            })
            .await
            .unwrap();
        }
        db.insert_run(NewRun {
            id: Uuid::new_v4(),
            user_id: other.id,
            project_id: other_project.id,
            workspace_id: other_ws.id,
            prompt: "p",
            started_at: now,
            image_name: None,
            image_digest: None,
            env_snapshot: None,
        })
        .await
        .unwrap();

        assert_eq!(db.count_runs_since(user.id, now).await.unwrap(), 3);
        assert_eq!(
            db.count_runs_since(user.id, now + Duration::seconds(2)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn pending_bundle_upsert_is_idempotent() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let project = seed_project(&db, &user, "p1").await;
        let ws = db.open_workspace(user.id, project.id).await.unwrap().workspace;
        let run = db
            .insert_run(NewRun {
                id: Uuid::new_v4(),
                user_id: user.id,
                project_id: project.id,
                workspace_id: ws.id,
                prompt: "p",
                started_at: Utc::now(),
                image_name: None,
                image_digest: None,
                env_snapshot: None,
            })
            .await
            .unwrap();

        let first = db.create_pending_bundle(&run).await.unwrap();
        let second = db.create_pending_bundle(&run).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, BundleStatus::Pending);

        db.mark_bundle_ready(run.id, "/var/lib/relay/evidence/bundle.zip")
            .await
            .unwrap();
        let ready = db.fetch_bundle_for_run(run.id).await.unwrap().unwrap();
        assert_eq!(ready.status, BundleStatus::Ready);
        assert!(ready.bundle_path.is_some());

        // A later upsert must not resurrect the pending state.
        let after = db.create_pending_bundle(&run).await.unwrap();
        assert_eq!(after.status, BundleStatus::Ready);
    }

    #[tokio::test]
    async fn sweep_queries_select_expired_rows_only() {
        let db = setup_db().await;
        let user = seed_user(&db).await;
        let project = seed_project(&db, &user, "p1").await;
        let ws = db.open_workspace(user.id, project.id).await.unwrap().workspace;

        let now = Utc::now();
        db.mark_workspace_warm(WorkspaceWarmUpdate {
            id: ws.id,
            container_id: "c-1",
            image_name: None,
            image_digest: None,
            runtime_metadata: None,
            last_active_at: now - Duration::hours(1),
            idle_expires_at: now - Duration::minutes(1),
        })
        .await
        .unwrap();

        let idle = db.list_idle_warm_workspaces(now).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, ws.id);

        db.mark_workspace_cold(ws.id).await.unwrap();
        assert!(db.list_idle_warm_workspaces(now).await.unwrap().is_empty());

        let expired = db
            .list_expired_cold_workspaces(now - Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);

        let not_expired = db
            .list_expired_cold_workspaces(now - Duration::hours(2))
            .await
            .unwrap();
        assert!(not_expired.is_empty());
    }
}
