#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use error_log_core::{
    decode_modules, decode_tags, encode_tags, format_rfc3339, now_utc, parse_stored_timestamp,
    Complexity, Environment, EnvironmentDetail, EnvironmentLabel, EnvironmentResolution,
    EnvironmentSnapshot, ErrorFilter, ErrorLogError, ErrorRecord, ErrorSummary, NewErrorRecord,
    SnapshotProvider, Status,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;

const SCHEMA_ERROR_LOG_V1: &str = r"
CREATE TABLE IF NOT EXISTS environments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  python_version TEXT NOT NULL,
  platform TEXT,
  modules TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
  UNIQUE (python_version, modules)
);

CREATE TABLE IF NOT EXISTS errors (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  error_name TEXT NOT NULL,
  description TEXT NOT NULL,
  error_type TEXT,
  traceback TEXT,
  fix TEXT,
  complexity TEXT CHECK (
    complexity IN ('Low', 'Medium', 'High', 'Critical') OR complexity IS NULL
  ),
  status TEXT NOT NULL DEFAULT 'Open' CHECK (
    status IN ('Open', 'In Progress', 'Resolved', 'Won''t Fix')
  ),
  tags TEXT,
  environment_id INTEGER,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
  updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
  FOREIGN KEY (environment_id) REFERENCES environments(id)
);

CREATE INDEX IF NOT EXISTS idx_errors_environment_created
  ON errors(environment_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_errors_created
  ON errors(created_at DESC, id DESC);
";

const ERROR_SELECT_JOINED: &str = "SELECT
    e.id, e.error_name, e.description, e.error_type, e.traceback, e.fix,
    e.complexity, e.status, e.tags, e.environment_id, e.created_at, e.updated_at,
    env.python_version, env.platform
 FROM errors e
 LEFT JOIN environments env ON env.id = e.environment_id";

const ENVIRONMENT_COLUMNS: &str = "id, python_version, platform, modules, created_at";

/// `SQLite`-backed environment registry and error repository.
///
/// One handle owns one connection; the CLI opens a handle per invocation.
pub struct SqliteErrorLogStore {
    conn: Connection,
}

impl SqliteErrorLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        // environment_id is advisory: errors may point at a missing environment.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = OFF;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        tracing::debug!(path = %path.display(), "opened error log database");
        Ok(Self { conn })
    }

    /// Creates both tables if missing. Existing rows are left untouched.
    pub fn initialize(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_ERROR_LOG_V1)
            .context("failed to apply error log schema")?;
        Ok(())
    }

    /// Returns the id of the environment matching the snapshot's
    /// (version, module set), inserting it first if it does not exist.
    ///
    /// The insert and the lookup run in one immediate transaction against the
    /// `UNIQUE (python_version, modules)` constraint, so a concurrent writer
    /// observing the same environment ends up with the same id.
    pub fn resolve_or_create_environment(
        &mut self,
        snapshot: &EnvironmentSnapshot,
    ) -> Result<EnvironmentResolution> {
        snapshot
            .validate()
            .map_err(|err| anyhow!("environment validation failed: {err}"))?;
        let python_version = snapshot.python_version.trim();
        let modules = snapshot.module_encoding().map_err(core_error)?;
        let now = format_rfc3339(now_utc()).map_err(core_error)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start environment transaction")?;

        let inserted = tx
            .execute(
                "INSERT INTO environments(python_version, platform, modules, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(python_version, modules) DO NOTHING",
                params![python_version, snapshot.platform, modules, now],
            )
            .context("failed to insert environment")?;

        let environment_id: i64 = tx
            .query_row(
                "SELECT id FROM environments WHERE python_version = ?1 AND modules = ?2",
                params![python_version, modules],
                |row| row.get(0),
            )
            .context("failed to look up environment after insert")?;

        tx.commit()
            .context("failed to commit environment transaction")?;

        let created = inserted == 1;
        if created {
            tracing::info!(
                environment_id,
                python_version,
                module_count = snapshot.modules.len(),
                "registered new environment"
            );
        } else {
            tracing::debug!(environment_id, "reusing existing environment");
        }

        Ok(EnvironmentResolution {
            environment_id,
            created,
        })
    }

    /// Takes a snapshot from `provider` and resolves it.
    pub fn resolve_current_environment(
        &mut self,
        provider: &dyn SnapshotProvider,
    ) -> Result<EnvironmentResolution> {
        let snapshot = provider.snapshot().map_err(core_error)?;
        self.resolve_or_create_environment(&snapshot)
    }

    pub fn get_environment(&self, environment_id: i64) -> Result<Option<Environment>> {
        self.conn
            .query_row(
                &format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE id = ?1"),
                params![environment_id],
                parse_environment_row,
            )
            .optional()
            .with_context(|| format!("failed to load environment {environment_id}"))
    }

    /// All environments, most recently created first.
    pub fn list_environments(&self) -> Result<Vec<Environment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], parse_environment_row)?;
        collect_rows(rows)
    }

    pub fn environment_detail(&self, environment_id: i64) -> Result<Option<EnvironmentDetail>> {
        let Some(environment) = self.get_environment(environment_id)? else {
            return Ok(None);
        };
        let errors = self.list_by_environment(environment_id)?;
        Ok(Some(EnvironmentDetail {
            environment,
            errors,
        }))
    }

    /// Validates and appends one error record, returning it as stored.
    ///
    /// Identical submissions are not deduplicated. Status falls back to
    /// `Open`; complexity is stored exactly as given.
    pub fn save_error(&mut self, input: &NewErrorRecord) -> Result<ErrorRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("error record validation failed: {err}"))?;

        let tags = encode_tags(&input.tags).map_err(core_error)?;
        let now = format_rfc3339(now_utc()).map_err(core_error)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start error transaction")?;

        tx.execute(
            "INSERT INTO errors(
                error_name, description, error_type, traceback, fix,
                complexity, status, tags, environment_id, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                input.error_name,
                input.description,
                input.error_type,
                input.traceback,
                input.fix,
                input.complexity.map(Complexity::as_str),
                input.effective_status().as_str(),
                tags,
                input.environment_id,
                now,
            ],
        )
        .context("failed to insert error record")?;

        let error_id = tx.last_insert_rowid();
        tx.commit().context("failed to commit error transaction")?;

        tracing::info!(
            error_id,
            environment_id = ?input.environment_id,
            "saved error record"
        );

        self.get_error(error_id)?
            .ok_or_else(|| anyhow!("error record {error_id} missing after insert"))
    }

    pub fn get_error(&self, error_id: i64) -> Result<Option<ErrorRecord>> {
        self.conn
            .query_row(
                &format!("{ERROR_SELECT_JOINED} WHERE e.id = ?1"),
                params![error_id],
                parse_error_row,
            )
            .optional()
            .with_context(|| format!("failed to load error record {error_id}"))
    }

    /// Every error, newest first, with the linked environment's version and
    /// platform when the environment exists.
    pub fn list_all(&self) -> Result<Vec<ErrorRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ERROR_SELECT_JOINED} ORDER BY e.created_at DESC, e.id DESC"
        ))?;
        let rows = stmt.query_map([], parse_error_row)?;
        collect_rows(rows)
    }

    /// Errors linked to one environment, newest first. The environment
    /// columns are not joined.
    pub fn list_by_environment(&self, environment_id: i64) -> Result<Vec<ErrorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                id, error_name, description, error_type, traceback, fix,
                complexity, status, tags, environment_id, created_at, updated_at,
                NULL, NULL
             FROM errors
             WHERE environment_id = ?1
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![environment_id], parse_error_row)?;
        collect_rows(rows)
    }

    pub fn search(&self, filter: &ErrorFilter) -> Result<Vec<ErrorRecord>> {
        Ok(filter.apply(self.list_all()?))
    }

    pub fn summary(&self) -> Result<ErrorSummary> {
        Ok(ErrorSummary::from_records(&self.list_all()?))
    }

    pub fn count_environments(&self) -> Result<usize> {
        count_rows(&self.conn, "SELECT COUNT(*) FROM environments")
    }

    pub fn count_errors(&self) -> Result<usize> {
        count_rows(&self.conn, "SELECT COUNT(*) FROM errors")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_environment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Environment> {
    let modules_raw: Option<String> = row.get(3)?;
    Ok(Environment {
        id: row.get(0)?,
        python_version: row.get(1)?,
        platform: row.get(2)?,
        modules: decode_modules(modules_raw.as_deref()),
        created_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
    })
}

fn parse_error_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErrorRecord> {
    let complexity_raw: Option<String> = row.get(6)?;
    let status_raw: String = row.get(7)?;
    let tags_raw: Option<String> = row.get(8)?;
    let python_version: Option<String> = row.get(12)?;

    let complexity = complexity_raw
        .as_deref()
        .map(|raw| {
            Complexity::parse(raw)
                .ok_or_else(|| invalid_column(6, format!("invalid complexity: {raw}")))
        })
        .transpose()?;

    let status = Status::parse(&status_raw)
        .ok_or_else(|| invalid_column(7, format!("invalid status: {status_raw}")))?;

    let environment = match python_version {
        Some(python_version) => Some(EnvironmentLabel {
            python_version,
            platform: row.get(13)?,
        }),
        None => None,
    };

    Ok(ErrorRecord {
        id: row.get(0)?,
        error_name: row.get(1)?,
        description: row.get(2)?,
        error_type: row.get(3)?,
        traceback: row.get(4)?,
        fix: row.get(5)?,
        complexity,
        status,
        tags: decode_tags(tags_raw.as_deref()),
        environment_id: row.get(9)?,
        environment,
        created_at: parse_timestamp(10, &row.get::<_, String>(10)?)?,
        updated_at: parse_timestamp(11, &row.get::<_, String>(11)?)?,
    })
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_stored_timestamp(raw).map_err(|err| invalid_column(column, err.to_string()))
}

fn invalid_column(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn core_error(err: ErrorLogError) -> anyhow::Error {
    anyhow!(err.to_string())
}

fn count_rows(conn: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    usize::try_from(count).with_context(|| format!("invalid row count: {count}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use error_log_core::ModuleSet;
    use proptest::prelude::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteErrorLogStore {
        let store = must(SqliteErrorLogStore::open(Path::new(":memory:")));
        must(store.initialize());
        store
    }

    fn temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("error-log-{label}-{}.sqlite3", Ulid::new()))
    }

    fn snapshot(version: &str, platform: &str, modules: &[(&str, &str)]) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            python_version: version.to_string(),
            platform: Some(platform.to_string()),
            modules: modules
                .iter()
                .map(|(name, version)| ((*name).to_string(), (*version).to_string()))
                .collect(),
        }
    }

    fn fixture_error(name: &str, status: Status) -> NewErrorRecord {
        NewErrorRecord {
            status: Some(status),
            complexity: Some(Complexity::Low),
            ..NewErrorRecord::new(name, "fixture description")
        }
    }

    fn backdate_error(store: &SqliteErrorLogStore, error_id: i64, created_at: &str) {
        let result = store.connection().execute(
            "UPDATE errors SET created_at = ?1 WHERE id = ?2",
            params![created_at, error_id],
        );
        if let Err(err) = result {
            panic!("failed to backdate error {error_id}: {err}");
        }
    }

    #[test]
    fn initialize_is_idempotent_and_keeps_rows() {
        let mut store = fixture_store();
        let _ = must(store.save_error(&fixture_error("first", Status::Open)));

        must(store.initialize());
        must(store.initialize());

        assert_eq!(must(store.count_errors()), 1);
    }

    #[test]
    fn resolving_same_snapshot_twice_reuses_the_row() {
        let mut store = fixture_store();
        let snap = snapshot("3.11.4", "Linux-6.1", &[("pandas", "2.0.1")]);

        let first = must(store.resolve_or_create_environment(&snap));
        let second = must(store.resolve_or_create_environment(&snap));

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.environment_id, second.environment_id);
        assert_eq!(must(store.count_environments()), 1);
    }

    #[test]
    fn platform_is_first_write_wins() {
        let mut store = fixture_store();
        let linux = snapshot("3.11.4", "Linux-6.1", &[("pandas", "2.0.1")]);
        let mac = snapshot("3.11.4", "macOS-14.2", &[("pandas", "2.0.1")]);

        let first = must(store.resolve_or_create_environment(&linux));
        let second = must(store.resolve_or_create_environment(&mac));

        assert_eq!(first.environment_id, second.environment_id);
        assert_eq!(must(store.count_environments()), 1);
        let stored = match must(store.get_environment(first.environment_id)) {
            Some(value) => value,
            None => panic!("environment missing"),
        };
        assert_eq!(stored.platform.as_deref(), Some("Linux-6.1"));
    }

    #[test]
    fn version_or_module_change_creates_new_environment() {
        let mut store = fixture_store();
        let base = must(store.resolve_or_create_environment(&snapshot(
            "3.11.4",
            "Linux",
            &[("pandas", "2.0.1")],
        )));
        let upgraded = must(store.resolve_or_create_environment(&snapshot(
            "3.11.4",
            "Linux",
            &[("pandas", "2.1.0")],
        )));
        let new_python = must(store.resolve_or_create_environment(&snapshot(
            "3.12.0",
            "Linux",
            &[("pandas", "2.0.1")],
        )));

        assert_ne!(base.environment_id, upgraded.environment_id);
        assert_ne!(base.environment_id, new_python.environment_id);
        assert!(upgraded.environment_id < new_python.environment_id);
        assert_eq!(must(store.count_environments()), 3);
    }

    #[test]
    fn empty_module_set_still_deduplicates() {
        let mut store = fixture_store();
        let snap = snapshot("3.11.4", "Linux", &[]);

        let first = must(store.resolve_or_create_environment(&snap));
        let second = must(store.resolve_or_create_environment(&snap));

        assert_eq!(first.environment_id, second.environment_id);
        assert_eq!(must(store.count_environments()), 1);
    }

    #[test]
    fn blank_python_version_is_rejected() {
        let mut store = fixture_store();
        let result = store.resolve_or_create_environment(&snapshot("  ", "Linux", &[]));
        assert!(result.is_err());
        assert_eq!(must(store.count_environments()), 0);
    }

    #[test]
    fn two_handles_on_one_file_share_the_environment() {
        let path = temp_db_path("shared-env");
        let mut left = must(SqliteErrorLogStore::open(&path));
        must(left.initialize());
        let mut right = must(SqliteErrorLogStore::open(&path));
        must(right.initialize());

        let snap = snapshot("3.11.4", "Linux", &[("requests", "2.31.0")]);
        let from_left = must(left.resolve_or_create_environment(&snap));
        let from_right = must(right.resolve_or_create_environment(&snap));

        assert_eq!(from_left.environment_id, from_right.environment_id);
        assert!(!from_right.created);
        assert_eq!(must(right.count_environments()), 1);
    }

    #[test]
    fn concurrent_handles_resolve_to_one_environment() {
        let path = temp_db_path("concurrent-env");
        let snap = snapshot("3.11.4", "Linux", &[("pandas", "2.0.1"), ("numpy", "1.26.0")]);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let snap = snap.clone();
                std::thread::spawn(move || {
                    let mut store = must(SqliteErrorLogStore::open(&path));
                    must(store.initialize());
                    must(store.resolve_or_create_environment(&snap))
                })
            })
            .collect();

        let mut resolutions = Vec::new();
        for worker in workers {
            match worker.join() {
                Ok(resolution) => resolutions.push(resolution),
                Err(_) => panic!("environment worker panicked"),
            }
        }

        let first_id = resolutions[0].environment_id;
        assert!(resolutions
            .iter()
            .all(|resolution| resolution.environment_id == first_id));
        assert_eq!(
            resolutions
                .iter()
                .filter(|resolution| resolution.created)
                .count(),
            1
        );

        let store = must(SqliteErrorLogStore::open(&path));
        assert_eq!(must(store.count_environments()), 1);
    }

    #[test]
    fn python_version_padding_is_not_part_of_the_key() {
        let mut store = fixture_store();
        let plain = must(store.resolve_or_create_environment(&snapshot("3.11.4", "Linux", &[])));
        let padded = must(store.resolve_or_create_environment(&snapshot(" 3.11.4 ", "Linux", &[])));

        assert_eq!(plain.environment_id, padded.environment_id);
        assert!(!padded.created);
        assert_eq!(must(store.count_environments()), 1);

        let stored = match must(store.get_environment(plain.environment_id)) {
            Some(value) => value,
            None => panic!("environment missing"),
        };
        assert_eq!(stored.python_version, "3.11.4");
    }

    #[test]
    fn provider_snapshot_is_resolved() {
        let mut store = fixture_store();
        let provider = error_log_core::StaticSnapshotProvider::new(snapshot(
            "3.10.2",
            "Linux",
            &[("flask", "3.0.0")],
        ));

        let first = must(store.resolve_current_environment(&provider));
        let second = must(store.resolve_current_environment(&provider));
        assert_eq!(first.environment_id, second.environment_id);
    }

    #[test]
    fn end_to_end_scenario_round_trips() {
        let mut store = fixture_store();
        let env = must(store.resolve_or_create_environment(&snapshot(
            "3.11.4",
            "Linux-6.1-x86_64",
            &[("pandas", "2.0.1")],
        )));

        let input = NewErrorRecord {
            error_name: "KeyError: 'x'".to_string(),
            description: "missing key in dict".to_string(),
            error_type: Some("KeyError".to_string()),
            traceback: Some("Traceback (most recent call last):\n  ...".to_string()),
            fix: Some("use dict.get".to_string()),
            complexity: Some(Complexity::Medium),
            status: Some(Status::Open),
            tags: vec!["dict".to_string(), "lookup".to_string()],
            environment_id: Some(env.environment_id),
        };
        let saved = must(store.save_error(&input));

        let all = must(store.list_all());
        assert_eq!(all.len(), 1);
        let record = &all[0];
        assert_eq!(record, &saved);
        assert_eq!(record.error_name, input.error_name);
        assert_eq!(record.description, input.description);
        assert_eq!(record.error_type, input.error_type);
        assert_eq!(record.traceback, input.traceback);
        assert_eq!(record.fix, input.fix);
        assert_eq!(record.complexity, Some(Complexity::Medium));
        assert_eq!(record.status, Status::Open);
        assert_eq!(record.tags, vec!["dict", "lookup"]);
        assert_eq!(record.environment_id, Some(env.environment_id));
        assert_eq!(record.created_at, record.updated_at);
        let label = match &record.environment {
            Some(value) => value,
            None => panic!("expected joined environment"),
        };
        assert_eq!(label.python_version, "3.11.4");
        assert_eq!(label.platform.as_deref(), Some("Linux-6.1-x86_64"));
    }

    #[test]
    fn blank_name_or_description_writes_nothing() {
        let mut store = fixture_store();

        assert!(store.save_error(&NewErrorRecord::new("", "desc")).is_err());
        assert!(store.save_error(&NewErrorRecord::new("name", "")).is_err());
        assert!(store.save_error(&NewErrorRecord::new("  ", "\n")).is_err());

        assert_eq!(must(store.count_errors()), 0);
    }

    #[test]
    fn omitted_status_defaults_to_open_and_complexity_stays_unset() {
        let mut store = fixture_store();
        let saved = must(store.save_error(&NewErrorRecord::new("bare", "only required")));

        assert_eq!(saved.status, Status::Open);
        assert_eq!(saved.complexity, None);
        assert!(saved.tags.is_empty());
        assert_eq!(saved.environment, None);
        assert_eq!(saved.environment_id, None);
    }

    #[test]
    fn empty_tags_are_stored_as_null() {
        let mut store = fixture_store();
        let saved = must(store.save_error(&NewErrorRecord::new("no tags", "desc")));

        let raw: Option<String> = match store.connection().query_row(
            "SELECT tags FROM errors WHERE id = ?1",
            params![saved.id],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to read raw tags: {err}"),
        };
        assert_eq!(raw, None);
    }

    #[test]
    fn identical_submissions_get_distinct_ids() {
        let mut store = fixture_store();
        let first = must(store.save_error(&fixture_error("dup", Status::Open)));
        let second = must(store.save_error(&fixture_error("dup", Status::Open)));

        assert_ne!(first.id, second.id);
        assert_eq!(must(store.count_errors()), 2);
    }

    #[test]
    fn unknown_environment_id_is_accepted() {
        let mut store = fixture_store();
        let input = NewErrorRecord {
            environment_id: Some(4242),
            ..NewErrorRecord::new("orphan", "points at nothing")
        };

        let saved = must(store.save_error(&input));
        assert_eq!(saved.environment_id, Some(4242));
        assert_eq!(saved.environment, None);
    }

    #[test]
    fn list_all_orders_newest_first() {
        let mut store = fixture_store();
        let older = must(store.save_error(&fixture_error("older", Status::Open)));
        let newer = must(store.save_error(&fixture_error("newer", Status::Open)));
        let oldest = must(store.save_error(&fixture_error("oldest", Status::Open)));
        backdate_error(&store, older.id, "2020-01-02T00:00:00Z");
        backdate_error(&store, oldest.id, "2020-01-01T00:00:00Z");

        let ids: Vec<_> = must(store.list_all()).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newer.id, older.id, oldest.id]);
    }

    #[test]
    fn same_second_inserts_fall_back_to_insertion_order() {
        let mut store = fixture_store();
        let first = must(store.save_error(&fixture_error("a", Status::Open)));
        let second = must(store.save_error(&fixture_error("b", Status::Open)));
        backdate_error(&store, first.id, "2024-05-05T10:00:00Z");
        backdate_error(&store, second.id, "2024-05-05T10:00:00Z");

        let ids: Vec<_> = must(store.list_all()).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn list_by_environment_is_ordered_subset_of_list_all() {
        let mut store = fixture_store();
        let env_a = must(store.resolve_or_create_environment(&snapshot("3.11.4", "Linux", &[])));
        let env_b = must(store.resolve_or_create_environment(&snapshot("3.12.1", "Linux", &[])));

        for (index, env) in [env_a, env_b, env_a, env_a, env_b].iter().enumerate() {
            let input = NewErrorRecord {
                environment_id: Some(env.environment_id),
                ..fixture_error(&format!("error-{index}"), Status::Open)
            };
            let saved = must(store.save_error(&input));
            backdate_error(&store, saved.id, &format!("2024-01-0{}T00:00:00Z", index + 1));
        }
        let _ = must(store.save_error(&fixture_error("unlinked", Status::Open)));

        let expected: Vec<_> = must(store.list_all())
            .into_iter()
            .filter(|record| record.environment_id == Some(env_a.environment_id))
            .map(|record| record.id)
            .collect();
        let scoped = must(store.list_by_environment(env_a.environment_id));

        assert_eq!(expected.len(), 3);
        assert_eq!(
            scoped.iter().map(|record| record.id).collect::<Vec<_>>(),
            expected
        );
        assert!(scoped.iter().all(|record| record.environment.is_none()));
    }

    #[test]
    fn sqlite_current_timestamp_rows_still_list() {
        let mut store = fixture_store();
        let legacy = must(store.save_error(&fixture_error("legacy", Status::Open)));
        let _ = must(store.save_error(&fixture_error("modern", Status::Open)));

        if let Err(err) = store.connection().execute(
            "UPDATE errors SET created_at = '2023-11-02 08:15:00',
                               updated_at = '2023-11-02 08:15:00'
             WHERE id = ?1",
            params![legacy.id],
        ) {
            panic!("failed to rewrite timestamps: {err}");
        }

        let all = must(store.list_all());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].error_name, "modern");
        assert_eq!(all[1].error_name, "legacy");
        assert_eq!(all[1].created_at.year(), 2023);
        assert_eq!(all[1].created_at.offset(), time::UtcOffset::UTC);
    }

    #[test]
    fn malformed_stored_tags_do_not_break_listing() {
        let mut store = fixture_store();
        let broken = must(store.save_error(&fixture_error("broken", Status::Open)));
        let healthy = NewErrorRecord {
            tags: vec!["ok".to_string()],
            ..fixture_error("healthy", Status::Open)
        };
        let _ = must(store.save_error(&healthy));

        if let Err(err) = store.connection().execute(
            "UPDATE errors SET tags = '[not json' WHERE id = ?1",
            params![broken.id],
        ) {
            panic!("failed to corrupt tags: {err}");
        }

        let all = must(store.list_all());
        assert_eq!(all.len(), 2);
        for record in all {
            if record.id == broken.id {
                assert!(record.tags.is_empty());
            } else {
                assert_eq!(record.tags, vec!["ok"]);
            }
        }
    }

    #[test]
    fn malformed_stored_modules_decode_as_empty() {
        let mut store = fixture_store();
        let env = must(store.resolve_or_create_environment(&snapshot(
            "3.11.4",
            "Linux",
            &[("pandas", "2.0.1")],
        )));
        if let Err(err) = store.connection().execute(
            "UPDATE environments SET modules = 'garbage' WHERE id = ?1",
            params![env.environment_id],
        ) {
            panic!("failed to corrupt modules: {err}");
        }

        let listed = must(store.list_environments());
        assert_eq!(listed.len(), 1);
        assert!(listed[0].modules.is_empty());
    }

    #[test]
    fn environments_list_newest_first_with_modules() {
        let mut store = fixture_store();
        let first = must(store.resolve_or_create_environment(&snapshot(
            "3.10.0",
            "Linux",
            &[("numpy", "1.26.0"), ("pandas", "2.0.1")],
        )));
        let second = must(store.resolve_or_create_environment(&snapshot("3.11.4", "Linux", &[])));

        let listed = must(store.list_environments());
        assert_eq!(
            listed.iter().map(|env| env.id).collect::<Vec<_>>(),
            vec![second.environment_id, first.environment_id]
        );
        assert_eq!(
            listed[1].modules.get("pandas").map(String::as_str),
            Some("2.0.1")
        );
    }

    #[test]
    fn environment_detail_includes_its_errors() {
        let mut store = fixture_store();
        let env = must(store.resolve_or_create_environment(&snapshot("3.11.4", "Linux", &[])));
        let input = NewErrorRecord {
            environment_id: Some(env.environment_id),
            ..fixture_error("scoped", Status::Resolved)
        };
        let _ = must(store.save_error(&input));
        let _ = must(store.save_error(&fixture_error("elsewhere", Status::Open)));

        let detail = match must(store.environment_detail(env.environment_id)) {
            Some(value) => value,
            None => panic!("missing environment detail"),
        };
        assert_eq!(detail.environment.python_version, "3.11.4");
        assert_eq!(detail.errors.len(), 1);
        assert_eq!(detail.errors[0].error_name, "scoped");

        assert!(must(store.environment_detail(999)).is_none());
    }

    #[test]
    fn search_and_summary_run_over_all_records() {
        let mut store = fixture_store();
        let _ = must(store.save_error(&fixture_error("ValueError: bad token", Status::Open)));
        let _ = must(store.save_error(&fixture_error("KeyError", Status::Resolved)));
        let critical = NewErrorRecord {
            complexity: Some(Complexity::Critical),
            ..fixture_error("Segfault", Status::InProgress)
        };
        let _ = must(store.save_error(&critical));

        let by_term = must(store.search(&ErrorFilter {
            term: Some("valueerror".to_string()),
            ..ErrorFilter::default()
        }));
        assert_eq!(by_term.len(), 1);

        let by_status = must(store.search(&ErrorFilter {
            statuses: [Status::Open, Status::Resolved].into_iter().collect(),
            ..ErrorFilter::default()
        }));
        assert_eq!(by_status.len(), 2);
        assert!(by_status
            .iter()
            .all(|record| record.status != Status::InProgress));

        assert_eq!(
            must(store.summary()),
            ErrorSummary {
                total: 3,
                open: 1,
                resolved: 1,
                critical: 1,
            }
        );
    }

    #[test]
    fn schema_rejects_unknown_status_text() {
        let store = fixture_store();
        let result = store.connection().execute(
            "INSERT INTO errors(error_name, description, status) VALUES ('a', 'b', 'Maybe')",
            [],
        );
        assert!(result.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_module_enumeration_order_does_not_change_identity(
            modules in prop::collection::btree_map("[a-z]{1,10}", "[0-9]\\.[0-9]\\.[0-9]", 0..16)
        ) {
            let mut store = fixture_store();
            let forward: Vec<_> = modules.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let mut reversed = forward.clone();
            reversed.reverse();

            let first = EnvironmentSnapshot {
                python_version: "3.11.4".to_string(),
                platform: Some("Linux".to_string()),
                modules: forward.into_iter().collect::<ModuleSet>(),
            };
            let second = EnvironmentSnapshot {
                modules: reversed.into_iter().collect::<ModuleSet>(),
                ..first.clone()
            };

            let a = must(store.resolve_or_create_environment(&first));
            let b = must(store.resolve_or_create_environment(&second));

            prop_assert_eq!(a.environment_id, b.environment_id);
            prop_assert_eq!(must(store.count_environments()), 1);
        }
    }
}
