//! SQL migration definitions for the CompIntel database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: runs, cost_entries, sources",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per pipeline invocation
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    status       TEXT NOT NULL,
    dry_run      INTEGER NOT NULL DEFAULT 0,
    summary_json TEXT
);

-- Append-only cost ledger
CREATE TABLE IF NOT EXISTS cost_entries (
    run_id         TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    seq            INTEGER NOT NULL,
    recorded_at    TEXT NOT NULL,
    task           TEXT NOT NULL,
    provider       TEXT NOT NULL,
    model          TEXT NOT NULL,
    input_tokens   INTEGER NOT NULL,
    output_tokens  INTEGER NOT NULL,
    cost_usd       REAL NOT NULL,
    cumulative_usd REAL NOT NULL,
    PRIMARY KEY (run_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_cost_entries_provider ON cost_entries(provider);

-- Every fetch attempt, including failures
CREATE TABLE IF NOT EXISTS sources (
    id          TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    competitor  TEXT NOT NULL,
    url         TEXT NOT NULL,
    category    TEXT NOT NULL,
    status      TEXT NOT NULL,
    status_code INTEGER,
    accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_competitor ON sources(competitor);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Budget alert history",
            sql: r#"
CREATE TABLE IF NOT EXISTS budget_alerts (
    run_id        TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    threshold_pct INTEGER NOT NULL,
    spent_usd     REAL NOT NULL,
    raised_at     TEXT NOT NULL,
    PRIMARY KEY (run_id, threshold_pct)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
