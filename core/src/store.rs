//! SQLite persistence layer.
//!
//! RULE: Only store.rs talks to the database.
//! Pipeline stages hand finished values to store methods; they never
//! execute SQL directly.

use rusqlite::{params, Connection};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

use crate::{
    anomaly_detector::Anomaly,
    engine::PipelineReport,
    error::{PipelineError, PipelineResult},
    event::EventLogEntry,
    metric_engine::MetricValue,
    ontology::Ontology,
    types::{EntityId, Period},
};

pub struct MetricStore {
    conn: Connection,
}

impl MetricStore {
    /// Open (or create) the metric database at `path`.
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        // WAL mode: better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PipelineResult<()> {
        self.conn.execute_batch(include_str!("../../migrations/001_metrics.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(
        &self,
        run_id: &str,
        tenant_id: &str,
        seed: Option<u64>,
        version: &str,
    ) -> PipelineResult<()> {
        insert_run(&self.conn, run_id, tenant_id, seed, version)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> PipelineResult<()> {
        append_event(&self.conn, entry)
    }

    pub fn events_for_run(&self, run_id: &str) -> PipelineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, seq, stage, event_type, payload
             FROM event_log WHERE run_id = ?1
             ORDER BY seq ASC, id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(EventLogEntry {
                    id:         Some(row.get(0)?),
                    run_id:     row.get(1)?,
                    seq:        row.get(2)?,
                    stage:      row.get(3)?,
                    event_type: row.get(4)?,
                    payload:    row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ── Metric values ──────────────────────────────────────────

    /// Insert or overwrite the value for its (tenant, metric, period).
    pub fn upsert_metric_value(&self, value: &MetricValue) -> PipelineResult<()> {
        upsert_metric_value(&self.conn, value)
    }

    /// Stored values of one metric, oldest period first.
    pub fn series(&self, tenant_id: &str, metric_id: &str) -> PipelineResult<Vec<MetricValue>> {
        let mut stmt = self.conn.prepare(
            "SELECT tenant_id, metric_id, period, value, unit, breakdown, warnings, previous_value
             FROM metric_value WHERE tenant_id = ?1 AND metric_id = ?2
             ORDER BY period ASC",
        )?;
        let rows = stmt
            .query_map(params![tenant_id, metric_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(tenant_id, metric_id, period, value, unit, breakdown, warnings, previous)| {
                let breakdown: Option<BTreeMap<String, f64>> =
                    breakdown.map(|b| serde_json::from_str(&b)).transpose()?;
                let mut value = MetricValue {
                    tenant_id,
                    metric_id,
                    period: parse_period(&period)?,
                    value,
                    unit: enum_from_text(&unit)?,
                    breakdown,
                    warnings: serde_json::from_str(&warnings)?,
                    previous_value: None,
                    change_absolute: None,
                    change_percent: None,
                };
                value.set_previous(previous);
                Ok(value)
            })
            .collect()
    }

    /// Every stored series of `ontology`'s metrics for one tenant, for
    /// seeding a fresh engine's history.
    pub fn load_history(&self, tenant_id: &str, ontology: &Ontology) -> PipelineResult<Vec<MetricValue>> {
        let mut out = Vec::new();
        for metric_id in ontology.order() {
            out.extend(self.series(tenant_id, metric_id)?);
        }
        Ok(out)
    }

    pub fn metric_value_count(&self, tenant_id: &str) -> PipelineResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM metric_value WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    // ── Lineage ────────────────────────────────────────────────

    /// Replace the contributing entities of one (tenant, metric, period).
    pub fn replace_lineage(
        &self,
        tenant_id: &str,
        metric_id: &str,
        period: Period,
        entity_ids: &[EntityId],
    ) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        replace_lineage(&tx, tenant_id, metric_id, period, entity_ids)?;
        tx.commit()?;
        Ok(())
    }

    /// Entity ids behind a stored value, sorted.
    pub fn lineage(&self, tenant_id: &str, metric_id: &str, period: Period) -> PipelineResult<Vec<EntityId>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id FROM metric_lineage
             WHERE tenant_id = ?1 AND metric_id = ?2 AND period = ?3
             ORDER BY entity_id ASC",
        )?;
        let ids = stmt
            .query_map(params![tenant_id, metric_id, period.to_string()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    // ── Anomalies ──────────────────────────────────────────────

    pub fn insert_anomalies(&self, run_id: &str, anomalies: &[Anomaly]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        insert_anomalies(&tx, run_id, anomalies)?;
        tx.commit()?;
        Ok(())
    }

    pub fn anomalies_for_run(&self, run_id: &str) -> PipelineResult<Vec<Anomaly>> {
        let mut stmt = self.conn.prepare(
            "SELECT tenant_id, metric_id, period, method, observed_value, baseline,
                    deviation, severity, direction, component_of
             FROM anomaly WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(AnomalyRow {
                    tenant_id:      row.get(0)?,
                    metric_id:      row.get(1)?,
                    period:         row.get(2)?,
                    method:         row.get(3)?,
                    observed_value: row.get(4)?,
                    baseline:       row.get(5)?,
                    deviation:      row.get(6)?,
                    severity:       row.get(7)?,
                    direction:      row.get(8)?,
                    component_of:   row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|r| {
                Ok(Anomaly {
                    metric_id:      r.metric_id,
                    tenant_id:      r.tenant_id,
                    period:         parse_period(&r.period)?,
                    method:         enum_from_text(&r.method)?,
                    observed_value: r.observed_value,
                    baseline:       r.baseline,
                    deviation:      r.deviation,
                    severity:       r.severity,
                    direction:      enum_from_text(&r.direction)?,
                    component_of:   r.component_of,
                })
            })
            .collect()
    }

    // ── Whole runs ─────────────────────────────────────────────

    /// Persist everything a finished run produced, in one transaction: a
    /// failure at any step leaves the database as it was.
    pub fn save_report(&self, report: &PipelineReport, seed: Option<u64>, version: &str) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        insert_run(&tx, &report.run_id, &report.tenant_id, seed, version)?;
        for (seq, event) in report.events.iter().enumerate() {
            append_event(&tx, &EventLogEntry::from_event(&report.run_id, seq as u32, event)?)?;
        }
        for value in &report.metric_values {
            upsert_metric_value(&tx, value)?;
        }
        for l in &report.lineage {
            replace_lineage(&tx, &report.tenant_id, &l.metric_id, l.period, &l.entity_ids)?;
        }
        insert_anomalies(&tx, &report.run_id, &report.anomalies)?;
        tx.commit()?;
        log::debug!(
            "store: saved run '{}' ({} values, {} anomalies)",
            report.run_id,
            report.metric_values.len(),
            report.anomalies.len()
        );
        Ok(())
    }
}

// ── Statements ─────────────────────────────────────────────────────
// Shared by the single-call methods and `save_report`; the caller owns the
// transaction.

fn insert_run(
    conn: &Connection,
    run_id: &str,
    tenant_id: &str,
    seed: Option<u64>,
    version: &str,
) -> PipelineResult<()> {
    conn.execute(
        "INSERT INTO run (run_id, tenant_id, seed, version, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run_id,
            tenant_id,
            seed.map(|s| s as i64),
            version,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn append_event(conn: &Connection, entry: &EventLogEntry) -> PipelineResult<()> {
    conn.execute(
        "INSERT INTO event_log (run_id, seq, stage, event_type, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![entry.run_id, entry.seq, entry.stage, entry.event_type, entry.payload],
    )?;
    Ok(())
}

fn upsert_metric_value(conn: &Connection, value: &MetricValue) -> PipelineResult<()> {
    let breakdown = value.breakdown.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO metric_value
             (tenant_id, metric_id, period, value, unit, breakdown, warnings, previous_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            value.tenant_id,
            value.metric_id,
            value.period.to_string(),
            value.value,
            enum_text(&value.unit)?,
            breakdown,
            serde_json::to_string(&value.warnings)?,
            value.previous_value,
        ],
    )?;
    Ok(())
}

fn replace_lineage(
    conn: &Connection,
    tenant_id: &str,
    metric_id: &str,
    period: Period,
    entity_ids: &[EntityId],
) -> PipelineResult<()> {
    let period = period.to_string();
    conn.execute(
        "DELETE FROM metric_lineage WHERE tenant_id = ?1 AND metric_id = ?2 AND period = ?3",
        params![tenant_id, metric_id, period],
    )?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO metric_lineage (tenant_id, metric_id, period, entity_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for id in entity_ids {
        stmt.execute(params![tenant_id, metric_id, period, id])?;
    }
    Ok(())
}

fn insert_anomalies(conn: &Connection, run_id: &str, anomalies: &[Anomaly]) -> PipelineResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO anomaly (run_id, tenant_id, metric_id, period, method, observed_value,
                              baseline, deviation, severity, direction, component_of)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for a in anomalies {
        stmt.execute(params![
            run_id,
            a.tenant_id,
            a.metric_id,
            a.period.to_string(),
            enum_text(&a.method)?,
            a.observed_value,
            a.baseline,
            a.deviation,
            a.severity,
            enum_text(&a.direction)?,
            a.component_of,
        ])?;
    }
    Ok(())
}

struct AnomalyRow {
    tenant_id:      String,
    metric_id:      String,
    period:         String,
    method:         String,
    observed_value: f64,
    baseline:       f64,
    deviation:      f64,
    severity:       f64,
    direction:      String,
    component_of:   Option<String>,
}

/// Text form of a unit-variant enum, as serde names it.
fn enum_text<T: Serialize>(value: &T) -> PipelineResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(PipelineError::Other(anyhow::anyhow!("expected a string enum, got {other}"))),
    }
}

fn enum_from_text<T: DeserializeOwned>(text: &str) -> PipelineResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(text.to_string()))?)
}

fn parse_period(text: &str) -> PipelineResult<Period> {
    text.parse()
        .map_err(|e: String| PipelineError::Other(anyhow::anyhow!("bad period in store: {e}")))
}
