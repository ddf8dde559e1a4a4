//! Persistence for CompIntel: checkpoints, research documents, and a libSQL
//! database holding run records, the cost ledger, and fetch history.
//!
//! - [`CheckpointStore`]: per-(competitor, stage) JSON snapshots, atomically replaced
//! - [`write_research_result`]: the per-competitor research document
//! - [`Storage`]: libSQL run history and cost reporting

mod checkpoint;
mod documents;
mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use compintel_shared::{CompIntelError, CostLedgerEntry, Result, Source};
use libsql::{Connection, Database, params};

pub use checkpoint::CheckpointStore;
pub use documents::{read_research_result, research_result_path, write_research_result};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CompIntelError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for reporting only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CompIntelError::Storage(format!(
                "database not found at {} (run `compintel init` first)",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CompIntelError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CompIntelError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Record the start of a pipeline run.
    pub async fn insert_run(&self, run_id: &str, dry_run: bool) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at, status, dry_run) VALUES (?1, ?2, 'running', ?3)",
                params![run_id, now.as_str(), i64::from(dry_run)],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Mark a run finished with a terminal status and optional JSON summary.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: &str,
        summary_json: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, status = ?2, summary_json = ?3 WHERE id = ?4",
                params![now.as_str(), status, summary_json, run_id],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, status, dry_run FROM runs WHERE id = ?1",
                params![run_id],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CompIntelError::Storage(e.to_string())),
        }
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, status, dry_run
                 FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Cost ledger operations
    // -----------------------------------------------------------------------

    /// Persist one ledger entry. `(run_id, seq)` is unique.
    pub async fn insert_cost_entry(&self, run_id: &str, entry: &CostLedgerEntry) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO cost_entries
                   (run_id, seq, recorded_at, task, provider, model,
                    input_tokens, output_tokens, cost_usd, cumulative_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    entry.seq as i64,
                    entry.timestamp.to_rfc3339(),
                    entry.task.as_str(),
                    entry.provider.as_str(),
                    entry.model.as_str(),
                    entry.input_tokens as i64,
                    entry.output_tokens as i64,
                    entry.cost_usd,
                    entry.cumulative_usd,
                ],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;
        Ok(())
    }

    /// All entries for a run, in append order.
    pub async fn list_cost_entries(&self, run_id: &str) -> Result<Vec<CostLedgerEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, recorded_at, task, provider, model,
                        input_tokens, output_tokens, cost_usd, cumulative_usd
                 FROM cost_entries WHERE run_id = ?1 ORDER BY seq",
                params![run_id],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(CostLedgerEntry {
                seq: row
                    .get::<i64>(0)
                    .map_err(|e| CompIntelError::Storage(e.to_string()))? as u64,
                timestamp: parse_timestamp(
                    &row.get::<String>(1)
                        .map_err(|e| CompIntelError::Storage(e.to_string()))?,
                )?,
                task: row
                    .get::<String>(2)
                    .map_err(|e| CompIntelError::Storage(e.to_string()))?,
                provider: row
                    .get::<String>(3)
                    .map_err(|e| CompIntelError::Storage(e.to_string()))?,
                model: row
                    .get::<String>(4)
                    .map_err(|e| CompIntelError::Storage(e.to_string()))?,
                input_tokens: row.get::<i64>(5).unwrap_or(0) as u64,
                output_tokens: row.get::<i64>(6).unwrap_or(0) as u64,
                cost_usd: row.get::<f64>(7).unwrap_or(0.0),
                cumulative_usd: row.get::<f64>(8).unwrap_or(0.0),
            });
        }
        Ok(results)
    }

    /// Spend grouped by provider and by task. `None` covers every run.
    pub async fn cost_summary(&self, run_id: Option<&str>) -> Result<CostSummary> {
        let by_provider = self.grouped_cost("provider", run_id).await?;
        let by_task = self.grouped_cost("task", run_id).await?;
        let total_usd = by_provider.iter().map(|g| g.cost_usd).sum();
        let calls = by_provider.iter().map(|g| g.calls).sum();
        Ok(CostSummary {
            run_id: run_id.map(str::to_string),
            total_usd,
            calls,
            by_provider,
            by_task,
        })
    }

    async fn grouped_cost(&self, column: &str, run_id: Option<&str>) -> Result<Vec<CostGroup>> {
        // `column` is one of two internal literals, never user input.
        let sql = format!(
            "SELECT {column}, COUNT(*), SUM(input_tokens), SUM(output_tokens), SUM(cost_usd)
             FROM cost_entries WHERE (?1 IS NULL OR run_id = ?1)
             GROUP BY {column} ORDER BY SUM(cost_usd) DESC, {column}"
        );
        let mut rows = self
            .conn
            .query(&sql, params![run_id])
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(CostGroup {
                key: row
                    .get::<String>(0)
                    .map_err(|e| CompIntelError::Storage(e.to_string()))?,
                calls: row.get::<i64>(1).unwrap_or(0) as u64,
                input_tokens: row.get::<i64>(2).unwrap_or(0) as u64,
                output_tokens: row.get::<i64>(3).unwrap_or(0) as u64,
                cost_usd: row.get::<f64>(4).unwrap_or(0.0),
            });
        }
        Ok(results)
    }

    /// Record that a soft budget threshold was crossed. Idempotent per run.
    pub async fn insert_budget_alert(
        &self,
        run_id: &str,
        threshold_pct: u32,
        spent_usd: f64,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO budget_alerts (run_id, threshold_pct, spent_usd, raised_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, threshold_pct, spent_usd, now.as_str()],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Thresholds crossed during a run. Returns `Vec<(threshold_pct, spent_usd)>`.
    pub async fn list_budget_alerts(&self, run_id: &str) -> Result<Vec<(u32, f64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT threshold_pct, spent_usd FROM budget_alerts
                 WHERE run_id = ?1 ORDER BY threshold_pct",
                params![run_id],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let pct: u32 = row
                .get(0)
                .map_err(|e| CompIntelError::Storage(e.to_string()))?;
            let spent: f64 = row.get(1).unwrap_or(0.0);
            results.push((pct, spent));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Source history
    // -----------------------------------------------------------------------

    /// Record every fetch attempt made for a competitor during a run.
    pub async fn record_sources(
        &self,
        run_id: &str,
        competitor: &str,
        sources: &[Source],
    ) -> Result<()> {
        self.check_writable()?;
        for source in sources {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO sources
                       (id, run_id, competitor, url, category, status, status_code, accessed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        source.id.as_str(),
                        run_id,
                        competitor,
                        source.url.as_str(),
                        source.category.as_str(),
                        source.status.as_str(),
                        source.status_code.map(i64::from),
                        source.accessed_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| CompIntelError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    /// Fetch attempts per status for a run. Returns `Vec<(status, count)>`.
    pub async fn source_status_counts(&self, run_id: &str) -> Result<Vec<(String, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM sources WHERE run_id = ?1
                 GROUP BY status ORDER BY status",
                params![run_id],
            )
            .await
            .map_err(|e| CompIntelError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row
                .get(0)
                .map_err(|e| CompIntelError::Storage(e.to_string()))?;
            let count = row.get::<i64>(1).unwrap_or(0) as u64;
            results.push((status, count));
        }
        Ok(results)
    }
}

/// A pipeline invocation.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `running`, `complete`, `failed`, or `budget_halted`.
    pub status: String,
    pub dry_run: bool,
}

/// Spend for one provider or task.
#[derive(Debug, Clone, PartialEq)]
pub struct CostGroup {
    pub key: String,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Aggregated spend report.
#[derive(Debug, Clone)]
pub struct CostSummary {
    pub run_id: Option<String>,
    pub total_usd: f64,
    pub calls: u64,
    pub by_provider: Vec<CostGroup>,
    pub by_task: Vec<CostGroup>,
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CompIntelError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`RunRecord`].
fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    Ok(RunRecord {
        id: row
            .get::<String>(0)
            .map_err(|e| CompIntelError::Storage(e.to_string()))?,
        started_at: parse_timestamp(
            &row.get::<String>(1)
                .map_err(|e| CompIntelError::Storage(e.to_string()))?,
        )?,
        finished_at: match row.get::<String>(2) {
            Ok(s) => Some(parse_timestamp(&s)?),
            Err(_) => None,
        },
        status: row
            .get::<String>(3)
            .map_err(|e| CompIntelError::Storage(e.to_string()))?,
        dry_run: row.get::<i64>(4).unwrap_or(0) != 0,
    })
}
