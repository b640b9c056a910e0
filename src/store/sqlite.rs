// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-backed trace store.
//!
//! The default durable backend. One `spans` table holds every persisted
//! span; traces are derived at query time by grouping on `trace_id`.
//! LLM aggregates are denormalized into columns at append time so trace
//! listings never have to parse the JSON payloads.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StoreError;
use crate::span::Span;
use crate::types::{SpanStatus, SpanType, TraceId};

use super::tree::assemble_tree;
use super::types::{derive_status, Page, TraceFilter, TraceSummary, TraceTree};
use super::TraceStore;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Get the trace directory for a project.
pub fn get_trace_directory(project_root: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(project_root.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    let hash_short = &hash[..8];

    let project_name = Path::new(project_root)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".spantrail")
        .join("traces")
        .join(format!("{}-{}", project_name, hash_short))
}

/// Trace storage using SQLite.
///
/// The connection sits behind a mutex so one store instance can be shared
/// between the exporter's batch writer and query readers.
pub struct SqliteTraceStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteTraceStore {
    /// Open or create the trace database for the given project.
    pub fn open(project_root: &str) -> Result<Self, StoreError> {
        let dir = get_trace_directory(project_root);
        Self::open_at(&dir.join("traces.db"))
    }

    /// Open or create a trace database at a specific path.
    ///
    /// This is useful for testing or when you want to use a custom location.
    pub fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Backend(format!("Failed to open trace database: {}", e)))?;

        // WAL mode for concurrent reads during the exporter's writes.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Backend(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock_conn();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS spans (
                span_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                parent_span_id TEXT,
                name TEXT NOT NULL,
                span_type TEXT NOT NULL,
                agent_id TEXT,
                status TEXT NOT NULL,
                inputs TEXT NOT NULL DEFAULT '{}',
                outputs TEXT NOT NULL DEFAULT '{}',
                llm_calls TEXT NOT NULL DEFAULT '[]',
                error TEXT,
                llm_call_count INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0.0,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                duration_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_spans_trace_id ON spans(trace_id);
            CREATE INDEX IF NOT EXISTS idx_spans_start_time ON spans(start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_spans_agent_id ON spans(agent_id);
            "#,
        )
        .map_err(|e| StoreError::Backend(format!("Failed to create schema: {}", e)))?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| StoreError::Backend(format!("Failed to get schema version: {}", e)))?;

        if current_version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::Backend(format!("Failed to set schema version: {}", e)))?;
        }

        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a writer panicked mid-operation; the
        // connection itself is still usable for subsequent statements.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_span(conn: &Connection, span: &Span) -> Result<(), StoreError> {
        let inputs_json = serde_json::to_string(&span.inputs)?;
        let outputs_json = serde_json::to_string(&span.outputs)?;
        let llm_calls_json = serde_json::to_string(&span.llm_calls)?;
        let error_json = span
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO spans (
                span_id, trace_id, parent_span_id, name, span_type, agent_id,
                status, inputs, outputs, llm_calls, error,
                llm_call_count, total_tokens, total_cost,
                start_time, end_time, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                span.span_id.to_string(),
                span.trace_id.to_string(),
                span.parent_span_id.map(|id| id.to_string()),
                span.name,
                span.span_type.as_str(),
                span.agent_id,
                span.status.as_str(),
                inputs_json,
                outputs_json,
                llm_calls_json,
                error_json,
                span.llm_calls.len() as i64,
                span.total_tokens() as i64,
                span.total_cost_usd(),
                span.start_time.timestamp_micros(),
                span.end_time.map(|t| t.timestamp_micros()),
                span.duration_ms.map(|d| d as i64),
            ],
        )
        .map_err(|e| StoreError::Backend(format!("Failed to append span: {}", e)))?;

        Ok(())
    }

    fn row_to_span(row: &rusqlite::Row<'_>) -> rusqlite::Result<Span> {
        let span_id: String = row.get(0)?;
        let trace_id: String = row.get(1)?;
        let parent_span_id: Option<String> = row.get(2)?;
        let span_type: String = row.get(4)?;
        let status: String = row.get(6)?;
        let inputs_json: String = row.get(7)?;
        let outputs_json: String = row.get(8)?;
        let llm_calls_json: String = row.get(9)?;
        let error_json: Option<String> = row.get(10)?;
        let start_us: i64 = row.get(11)?;
        let end_us: Option<i64> = row.get(12)?;
        let duration_ms: Option<i64> = row.get(13)?;

        Ok(Span {
            span_id: parse_uuid(&span_id).into(),
            trace_id: parse_uuid(&trace_id).into(),
            parent_span_id: parent_span_id.map(|s| parse_uuid(&s).into()),
            name: row.get(3)?,
            span_type: SpanType::parse(&span_type),
            agent_id: row.get(5)?,
            status: SpanStatus::parse(&status),
            inputs: serde_json::from_str(&inputs_json).unwrap_or_default(),
            outputs: serde_json::from_str(&outputs_json).unwrap_or_default(),
            llm_calls: serde_json::from_str(&llm_calls_json).unwrap_or_default(),
            error: error_json.and_then(|s| serde_json::from_str(&s).ok()),
            start_time: from_micros(start_us),
            end_time: end_us.map(from_micros),
            duration_ms: duration_ms.map(|d| d.max(0) as u64),
        })
    }
}

const SPAN_COLUMNS: &str = "span_id, trace_id, parent_span_id, name, span_type, agent_id, \
     status, inputs, outputs, llm_calls, error, start_time, end_time, duration_ms";

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_default()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

impl TraceStore for SqliteTraceStore {
    fn append(&self, span: &Span) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        Self::insert_span(&conn, span)
    }

    fn append_batch(&self, spans: &[Span]) -> Result<(), StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Backend(format!("Failed to begin transaction: {}", e)))?;
        for span in spans {
            Self::insert_span(&tx, span)?;
        }
        tx.commit()
            .map_err(|e| StoreError::Backend(format!("Failed to commit batch: {}", e)))?;
        Ok(())
    }

    fn get_trace(&self, trace_id: TraceId) -> Result<TraceTree, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM spans WHERE trace_id = ? ORDER BY start_time ASC",
                SPAN_COLUMNS
            ))
            .map_err(|e| StoreError::Backend(format!("Failed to prepare query: {}", e)))?;

        let spans = stmt
            .query_map(params![trace_id.to_string()], Self::row_to_span)
            .map_err(|e| StoreError::Backend(format!("Failed to query trace: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Backend(format!("Failed to read spans: {}", e)))?;

        if spans.is_empty() {
            return Err(StoreError::NotFound(trace_id));
        }
        Ok(assemble_tree(trace_id, spans))
    }

    fn list_traces(
        &self,
        filter: &TraceFilter,
        page: &Page,
    ) -> Result<Vec<TraceSummary>, StoreError> {
        let mut where_sql = String::new();
        let mut having = Vec::new();
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();

        let agent_id = filter.agent_id.clone();
        if let Some(agent) = &agent_id {
            where_sql =
                "WHERE trace_id IN (SELECT DISTINCT trace_id FROM spans WHERE agent_id = ?)"
                    .to_string();
            args.push(agent);
        }

        let after_us = filter.started_after.map(|t| t.timestamp_micros());
        if let Some(after) = &after_us {
            having.push("MIN(start_time) >= ?");
            args.push(after);
        }
        let before_us = filter.started_before.map(|t| t.timestamp_micros());
        if let Some(before) = &before_us {
            having.push("MIN(start_time) <= ?");
            args.push(before);
        }
        match filter.status {
            Some(SpanStatus::Running) => having.push("SUM(status = 'running') > 0"),
            Some(SpanStatus::Error) => {
                having.push("SUM(status = 'running') = 0 AND SUM(status = 'error') > 0")
            }
            Some(SpanStatus::Success) => {
                having.push("SUM(status = 'running') = 0 AND SUM(status = 'error') = 0")
            }
            None => {}
        }

        let having_sql = if having.is_empty() {
            String::new()
        } else {
            format!("HAVING {}", having.join(" AND "))
        };

        let limit = page.limit as i64;
        let offset = page.offset as i64;
        args.push(&limit);
        args.push(&offset);

        let sql = format!(
            r#"
            SELECT trace_id,
                   MIN(start_time) AS started,
                   MAX(end_time) AS ended,
                   COUNT(*) AS span_count,
                   SUM(status = 'running') AS running,
                   SUM(status = 'error') AS errored,
                   SUM(llm_call_count) AS llm_calls,
                   SUM(total_tokens) AS tokens,
                   SUM(total_cost) AS cost,
                   (SELECT name FROM spans s2 WHERE s2.trace_id = s.trace_id
                        ORDER BY s2.start_time ASC LIMIT 1) AS root_name,
                   (SELECT agent_id FROM spans s3 WHERE s3.trace_id = s.trace_id
                        AND s3.agent_id IS NOT NULL ORDER BY s3.start_time ASC LIMIT 1) AS agent_id
            FROM spans s
            {}
            GROUP BY trace_id
            {}
            ORDER BY started DESC
            LIMIT ? OFFSET ?
            "#,
            where_sql, having_sql
        );

        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(format!("Failed to prepare listing: {}", e)))?;

        let summaries = stmt
            .query_map(args.as_slice(), |row| {
                let trace_id: String = row.get(0)?;
                let started: i64 = row.get(1)?;
                let ended: Option<i64> = row.get(2)?;
                let span_count: i64 = row.get(3)?;
                let running: i64 = row.get(4)?;
                let errored: i64 = row.get(5)?;
                let llm_calls: i64 = row.get(6)?;
                let tokens: i64 = row.get(7)?;
                let cost: f64 = row.get(8)?;
                let root_name: String = row.get(9)?;
                let agent_id: Option<String> = row.get(10)?;

                Ok(TraceSummary {
                    trace_id: parse_uuid(&trace_id).into(),
                    root_name,
                    agent_id,
                    status: derive_status(running.max(0) as u64, errored.max(0) as u64),
                    started_at: from_micros(started),
                    ended_at: if running > 0 {
                        None
                    } else {
                        ended.map(from_micros)
                    },
                    span_count: span_count.max(0) as u64,
                    llm_call_count: llm_calls.max(0) as u64,
                    total_tokens: tokens.max(0) as u64,
                    total_cost_usd: cost,
                })
            })
            .map_err(|e| StoreError::Backend(format!("Failed to list traces: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Backend(format!("Failed to collect summaries: {}", e)))?;

        Ok(summaries)
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.lock_conn();
        let rows = conn
            .execute(
                r#"
                DELETE FROM spans WHERE trace_id IN (
                    SELECT trace_id FROM spans
                    GROUP BY trace_id
                    HAVING MIN(start_time) < ?
                )
                "#,
                params![cutoff.timestamp_micros()],
            )
            .map_err(|e| StoreError::Backend(format!("Failed to delete traces: {}", e)))?;

        Ok(rows as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LlmCall, SpanId};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteTraceStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteTraceStore::open_at(&temp_dir.path().join("traces.db")).unwrap();
        (store, temp_dir)
    }

    fn closed_span(name: &str, trace_id: TraceId, parent: Option<SpanId>) -> Span {
        let mut span = Span::new(name, SpanType::ToolCall, trace_id, parent);
        span.close(SpanStatus::Success, None).unwrap();
        span
    }

    #[test]
    fn test_append_and_get_trace() {
        let (store, _temp) = create_test_store();
        let trace_id = TraceId::new();

        let mut root = Span::new("run", SpanType::AgentDecision, trace_id, None);
        root.record_input("goal", json!("summarize repo")).unwrap();
        root.add_llm_call(
            LlmCall::new("claude-sonnet-4", "prompt", "response")
                .with_tokens(120, 40)
                .with_cost_usd(0.003),
        )
        .unwrap();
        root.close(SpanStatus::Success, None).unwrap();
        let child = closed_span("read_file", trace_id, Some(root.span_id));

        store.append(&root).unwrap();
        store.append(&child).unwrap();

        let tree = store.get_trace(trace_id).unwrap();
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.span_count(), 2);

        let stored_root = &tree.roots[0].span;
        assert_eq!(stored_root.span_id, root.span_id);
        assert_eq!(stored_root.name, "run");
        assert_eq!(stored_root.inputs["goal"], json!("summarize repo"));
        assert_eq!(stored_root.llm_calls.len(), 1);
        assert_eq!(stored_root.llm_calls[0].total_tokens(), 160);
        assert_eq!(stored_root.status, SpanStatus::Success);
        assert_eq!(tree.roots[0].children[0].span.span_id, child.span_id);
    }

    #[test]
    fn test_get_trace_not_found() {
        let (store, _temp) = create_test_store();
        let err = store.get_trace(TraceId::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_append_idempotent_last_write_wins() {
        let (store, _temp) = create_test_store();
        let trace_id = TraceId::new();

        let mut span = Span::new("step", SpanType::Custom, trace_id, None);
        span.close(SpanStatus::Success, None).unwrap();
        store.append(&span).unwrap();

        // Retried append of the same span_id with different payload.
        span.name = "step-renamed".to_string();
        store.append(&span).unwrap();

        let tree = store.get_trace(trace_id).unwrap();
        assert_eq!(tree.span_count(), 1);
        assert_eq!(tree.roots[0].span.name, "step-renamed");
    }

    #[test]
    fn test_orphan_is_synthetic_root() {
        let (store, _temp) = create_test_store();
        let trace_id = TraceId::new();

        // Parent was never persisted (e.g., dropped under backpressure).
        let orphan = closed_span("orphan", trace_id, Some(SpanId::new()));
        store.append(&orphan).unwrap();

        let tree = store.get_trace(trace_id).unwrap();
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].span.span_id, orphan.span_id);
    }

    #[test]
    fn test_append_batch() {
        let (store, _temp) = create_test_store();
        let trace_id = TraceId::new();
        let root = closed_span("root", trace_id, None);
        let spans: Vec<Span> = (0..10)
            .map(|i| closed_span(&format!("step-{}", i), trace_id, Some(root.span_id)))
            .collect();

        store.append(&root).unwrap();
        store.append_batch(&spans).unwrap();

        let tree = store.get_trace(trace_id).unwrap();
        assert_eq!(tree.span_count(), 11);
    }

    #[test]
    fn test_list_traces_newest_first() {
        let (store, _temp) = create_test_store();

        let mut trace_ids = Vec::new();
        for i in 0..3 {
            let trace_id = TraceId::new();
            let mut span = Span::new(
                &format!("run-{}", i),
                SpanType::AgentDecision,
                trace_id,
                None,
            );
            span.close(SpanStatus::Success, None).unwrap();
            store.append(&span).unwrap();
            trace_ids.push(trace_id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let summaries = store
            .list_traces(&TraceFilter::default(), &Page::default())
            .unwrap();
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].trace_id, trace_ids[2]);
        assert_eq!(summaries[2].trace_id, trace_ids[0]);
        assert_eq!(summaries[0].root_name, "run-2");
        assert_eq!(summaries[0].status, SpanStatus::Success);
    }

    #[test]
    fn test_list_traces_filters() {
        let (store, _temp) = create_test_store();

        let tagged = TraceId::new();
        let mut span = Span::new("tagged", SpanType::AgentDecision, tagged, None);
        span.agent_id = Some("researcher".to_string());
        span.close(SpanStatus::Error, Some(crate::types::ErrorInfo::new("E", "failed")))
            .unwrap();
        store.append(&span).unwrap();

        let untagged = TraceId::new();
        store
            .append(&closed_span("untagged", untagged, None))
            .unwrap();

        let by_agent = store
            .list_traces(
                &TraceFilter::default().with_agent_id("researcher"),
                &Page::default(),
            )
            .unwrap();
        assert_eq!(by_agent.len(), 1);
        assert_eq!(by_agent[0].trace_id, tagged);
        assert_eq!(by_agent[0].agent_id.as_deref(), Some("researcher"));

        let errored = store
            .list_traces(
                &TraceFilter::default().with_status(SpanStatus::Error),
                &Page::default(),
            )
            .unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].status, SpanStatus::Error);

        let succeeded = store
            .list_traces(
                &TraceFilter::default().with_status(SpanStatus::Success),
                &Page::default(),
            )
            .unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].trace_id, untagged);
    }

    #[test]
    fn test_list_traces_running_status_and_open_end() {
        let (store, _temp) = create_test_store();
        let trace_id = TraceId::new();

        let root = {
            let mut s = Span::new("root", SpanType::AgentDecision, trace_id, None);
            s.close(SpanStatus::Success, None).unwrap();
            s
        };
        // Still-running child persisted by a partial export.
        let running = Span::new("child", SpanType::ToolCall, trace_id, Some(root.span_id));
        store.append(&root).unwrap();
        store.append(&running).unwrap();

        let summaries = store
            .list_traces(&TraceFilter::default(), &Page::default())
            .unwrap();
        assert_eq!(summaries[0].status, SpanStatus::Running);
        assert!(summaries[0].ended_at.is_none());
    }

    #[test]
    fn test_list_traces_pagination() {
        let (store, _temp) = create_test_store();
        for i in 0..5 {
            store
                .append(&closed_span(&format!("run-{}", i), TraceId::new(), None))
                .unwrap();
        }

        let first = store
            .list_traces(&TraceFilter::default(), &Page::new(0, 2))
            .unwrap();
        let second = store
            .list_traces(&TraceFilter::default(), &Page::new(2, 2))
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first[0].trace_id, second[0].trace_id);
    }

    #[test]
    fn test_delete_before() {
        let (store, _temp) = create_test_store();

        let old_trace = TraceId::new();
        let mut old_span = closed_span("old", old_trace, None);
        old_span.start_time = Utc::now() - chrono::Duration::days(40);
        store.append(&old_span).unwrap();

        let recent_trace = TraceId::new();
        store
            .append(&closed_span("recent", recent_trace, None))
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let removed = store.delete_before(cutoff).unwrap();
        assert_eq!(removed, 1);

        assert!(store.get_trace(old_trace).unwrap_err().is_not_found());
        assert!(store.get_trace(recent_trace).is_ok());
    }

    #[test]
    fn test_llm_aggregates_in_summary() {
        let (store, _temp) = create_test_store();
        let trace_id = TraceId::new();

        let mut span = Span::new("run", SpanType::LlmCall, trace_id, None);
        span.add_llm_call(
            LlmCall::new("m", "p", "r").with_tokens(100, 50).with_cost_usd(0.02),
        )
        .unwrap();
        span.add_llm_call(LlmCall::new("m", "p", "r").with_tokens(10, 5))
            .unwrap();
        span.close(SpanStatus::Success, None).unwrap();
        store.append(&span).unwrap();

        let summaries = store
            .list_traces(&TraceFilter::default(), &Page::default())
            .unwrap();
        assert_eq!(summaries[0].llm_call_count, 2);
        assert_eq!(summaries[0].total_tokens, 165);
        assert!((summaries[0].total_cost_usd - 0.02).abs() < 1e-9);
    }
}
