//! Schema bootstrap and the `OptionalExt` row-mapping helper.

use crate::types::StoreError;

pub(super) fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
         INSERT OR IGNORE INTO schema_version (version) VALUES (1);

         CREATE TABLE IF NOT EXISTS tasks (
            task_id      TEXT PRIMARY KEY,
            hypothesis   TEXT NOT NULL,
            status       TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            pages_limit  INTEGER NOT NULL,
            time_limit_s INTEGER NOT NULL
         );

         CREATE TABLE IF NOT EXISTS jobs (
            job_id       TEXT PRIMARY KEY,
            task_id      TEXT NOT NULL REFERENCES tasks(task_id),
            kind         TEXT NOT NULL,
            payload      TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            priority     INTEGER NOT NULL,
            state        TEXT NOT NULL,
            attempts     INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL,
            claim_token  TEXT,
            last_error   TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_jobs_task ON jobs(task_id);
         CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs(task_id, kind, payload_hash);
         CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);

         CREATE TABLE IF NOT EXISTS pages (
            page_id          TEXT PRIMARY KEY,
            url              TEXT NOT NULL UNIQUE,
            domain           TEXT NOT NULL,
            domain_category  TEXT NOT NULL,
            title            TEXT NOT NULL,
            fetched_at       TEXT NOT NULL,
            html_path        TEXT,
            paper_metadata   TEXT,
            page_type        TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_pages_domain ON pages(domain);

         CREATE TABLE IF NOT EXISTS fragments (
            fragment_id      TEXT PRIMARY KEY,
            page_id          TEXT NOT NULL REFERENCES pages(page_id),
            fragment_type    TEXT NOT NULL,
            text             TEXT NOT NULL,
            text_hash        TEXT NOT NULL,
            heading_context  TEXT,
            is_primary       INTEGER NOT NULL,
            relevance_reason TEXT NOT NULL,
            UNIQUE(page_id, text_hash)
         );
         CREATE INDEX IF NOT EXISTS idx_fragments_page ON fragments(page_id);

         CREATE TABLE IF NOT EXISTS claims (
            claim_id           TEXT PRIMARY KEY,
            task_id            TEXT NOT NULL REFERENCES tasks(task_id),
            claim_text         TEXT NOT NULL,
            confidence         REAL NOT NULL,
            uncertainty        REAL NOT NULL,
            controversy        REAL NOT NULL,
            source_fragment_ids TEXT NOT NULL,
            verification_notes TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_claims_task ON claims(task_id);

         CREATE TABLE IF NOT EXISTS edges (
            edge_id                  TEXT PRIMARY KEY,
            source_type              TEXT NOT NULL,
            source_id                TEXT NOT NULL,
            target_type              TEXT NOT NULL,
            target_id                TEXT NOT NULL,
            relation                 TEXT NOT NULL,
            nli_edge_confidence      REAL NOT NULL,
            is_academic              INTEGER NOT NULL,
            source_domain_category   TEXT NOT NULL,
            target_domain_category   TEXT NOT NULL,
            task_id                  TEXT NOT NULL REFERENCES tasks(task_id),
            UNIQUE(source_type, source_id, target_type, target_id, relation)
         );
         CREATE INDEX IF NOT EXISTS idx_edges_task ON edges(task_id);
         CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_type, target_id);
         CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_type, source_id);

         CREATE TABLE IF NOT EXISTS interventions (
            queue_id       TEXT PRIMARY KEY,
            task_id        TEXT NOT NULL REFERENCES tasks(task_id),
            url            TEXT NOT NULL,
            domain         TEXT NOT NULL,
            auth_type      TEXT NOT NULL,
            status         TEXT NOT NULL,
            search_job_id  TEXT,
            session_data   TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_interventions_domain ON interventions(domain, status);

         CREATE TABLE IF NOT EXISTS engine_health (
            engine               TEXT PRIMARY KEY,
            success_rate_1h      REAL NOT NULL,
            success_rate_24h     REAL NOT NULL,
            captcha_rate         REAL NOT NULL,
            median_latency_ms    REAL NOT NULL,
            last_used_at         TEXT,
            circuit_state        TEXT NOT NULL,
            consecutive_failures INTEGER NOT NULL,
            cooldown_until       TEXT
         );

         CREATE TABLE IF NOT EXISTS domain_budgets (
            domain                 TEXT NOT NULL,
            date                   TEXT NOT NULL,
            requests_today         INTEGER NOT NULL DEFAULT 0,
            pages_today            INTEGER NOT NULL DEFAULT 0,
            max_requests_per_day   INTEGER NOT NULL,
            max_pages_per_day      INTEGER NOT NULL,
            PRIMARY KEY(domain, date)
         );

         CREATE TABLE IF NOT EXISTS searches (
            search_id        TEXT PRIMARY KEY,
            task_id          TEXT NOT NULL REFERENCES tasks(task_id),
            query            TEXT NOT NULL,
            status           TEXT NOT NULL,
            pages_fetched    INTEGER NOT NULL,
            useful_fragments INTEGER NOT NULL,
            harvest_rate     REAL NOT NULL,
            novelty_score    REAL NOT NULL,
            claims_found     INTEGER NOT NULL,
            has_primary_source INTEGER NOT NULL,
            created_at       TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_searches_task ON searches(task_id);

         CREATE TABLE IF NOT EXISTS feedback_audit (
            seq          INTEGER PRIMARY KEY AUTOINCREMENT,
            action       TEXT NOT NULL,
            target_id    TEXT NOT NULL,
            payload      TEXT NOT NULL,
            recorded_at  TEXT NOT NULL
         );",
    )
    .map_err(|e| StoreError::Sqlite(e.to_string()))
}

pub(super) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
