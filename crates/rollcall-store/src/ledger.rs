use std::sync::Arc;

use chrono::{NaiveDate, SubsecRound, Utc};
use rollcall_core::{
    AttendanceFilter, AttendanceLedger, AttendanceRecord, AttendanceStatus, NewAttendance,
    StoreError,
};
use rusqlite::types::Value;
use rusqlite::{params, ErrorCode};
use tokio_rusqlite::Connection;

use crate::{backend, format_date, from_millis, parse_date};

/// Raw `attendance` row, decoded outside the connection thread.
struct AttendanceRow {
    record_id: String,
    identity_id: String,
    class_id: String,
    subject_id: String,
    date: String,
    status: String,
    match_score: Option<f64>,
    recorded_at: i64,
}

impl AttendanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            record_id: row.get(0)?,
            identity_id: row.get(1)?,
            class_id: row.get(2)?,
            subject_id: row.get(3)?,
            date: row.get(4)?,
            status: row.get(5)?,
            match_score: row.get(6)?,
            recorded_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<AttendanceRecord, StoreError> {
        let status = AttendanceStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "record {}: unknown status {:?}",
                self.record_id, self.status
            ))
        })?;
        Ok(AttendanceRecord {
            date: parse_date(&self.date)?,
            recorded_at: from_millis(self.recorded_at)?,
            record_id: self.record_id,
            identity_id: self.identity_id,
            class_id: self.class_id,
            subject_id: self.subject_id,
            status,
            match_score: self.match_score.map(|s| s as f32),
        })
    }
}

/// SQLite-backed [`AttendanceLedger`].
///
/// Uniqueness of `(identity_id, subject_id, date)` is left to the
/// `idx_attendance_dedup` index; `record` never reads before writing.
pub struct SqliteAttendanceLedger {
    conn: Arc<Connection>,
}

impl SqliteAttendanceLedger {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Build the WHERE clause and positional parameters for `filter`.
fn filter_clause(filter: &AttendanceFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    let mut push = |column: &str, op: &str, value: Value| {
        values.push(value);
        clauses.push(format!("{column} {op} ?{}", values.len()));
    };

    if let Some(class_id) = &filter.class_id {
        push("class_id", "=", Value::Text(class_id.clone()));
    }
    if let Some(subject_id) = &filter.subject_id {
        push("subject_id", "=", Value::Text(subject_id.clone()));
    }
    if let Some(identity_id) = &filter.identity_id {
        push("identity_id", "=", Value::Text(identity_id.clone()));
    }
    if let Some(date) = filter.date {
        push("date", "=", Value::Text(format_date(date)));
    }
    if let Some(from) = filter.from {
        push("date", ">=", Value::Text(format_date(from)));
    }
    if let Some(to) = filter.to {
        push("date", "<=", Value::Text(format_date(to)));
    }

    let mut sql = String::new();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY date DESC, recorded_at DESC");

    // SQLite requires a LIMIT before OFFSET; -1 means unbounded.
    match (filter.limit, filter.offset) {
        (None, None) => {}
        (limit, offset) => {
            values.push(Value::Integer(limit.map_or(-1, i64::from)));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
            values.push(Value::Integer(offset.map_or(0, i64::from)));
            sql.push_str(&format!(" OFFSET ?{}", values.len()));
        }
    }

    (sql, values)
}

impl AttendanceLedger for SqliteAttendanceLedger {
    async fn record(&self, attendance: NewAttendance) -> Result<AttendanceRecord, StoreError> {
        let record = AttendanceRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            identity_id: attendance.identity_id.clone(),
            class_id: attendance.class_id.clone(),
            subject_id: attendance.subject_id.clone(),
            date: attendance.date,
            status: attendance.status,
            match_score: attendance.match_score,
            // Stored with millisecond precision.
            recorded_at: Utc::now().trunc_subsecs(3),
        };

        let row = record.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO attendance (record_id, identity_id, class_id, subject_id,
                         date, status, match_score, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.record_id,
                        row.identity_id,
                        row.class_id,
                        row.subject_id,
                        format_date(row.date),
                        row.status.as_str(),
                        row.match_score.map(f64::from),
                        row.recorded_at.timestamp_millis(),
                    ],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(err) if is_unique_violation(&err) => Ok(false),
                    Err(err) => Err(err.into()),
                }
            })
            .await
            .map_err(backend)?;

        if !inserted {
            return Err(StoreError::DuplicateAttendance(attendance.key()));
        }

        tracing::debug!(
            record_id = %record.record_id,
            identity_id = %record.identity_id,
            status = %record.status,
            "attendance row inserted"
        );
        Ok(record)
    }

    async fn query(&self, filter: AttendanceFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let (clause, values) = filter_clause(&filter);
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT record_id, identity_id, class_id, subject_id, date, status, \
                     match_score, recorded_at FROM attendance{clause}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(values), AttendanceRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)?;
        rows.into_iter().map(AttendanceRow::decode).collect()
    }

    async fn count_for_date(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let date = format_date(date);
        let n = self
            .conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1",
                    [date],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(backend)?;
        Ok(n.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use rollcall_core::EmbeddingProfile;

    async fn ledger() -> SqliteAttendanceLedger {
        Database::open_in_memory(EmbeddingProfile::new(2, "test-model"))
            .await
            .unwrap()
            .ledger()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, d).unwrap()
    }

    fn present(identity_id: &str, subject_id: &str, date: NaiveDate) -> NewAttendance {
        NewAttendance {
            identity_id: identity_id.into(),
            class_id: "10-A".into(),
            subject_id: subject_id.into(),
            date,
            status: AttendanceStatus::Present,
            match_score: Some(0.12),
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let ledger = ledger().await;
        let first = ledger.record(present("s1", "math", day(2))).await.unwrap();
        assert_eq!(first.status, AttendanceStatus::Present);

        let mut again = present("s1", "math", day(2));
        again.status = AttendanceStatus::Absent;
        match ledger.record(again).await {
            Err(StoreError::DuplicateAttendance(key)) => {
                assert_eq!(key.identity_id, "s1");
                assert_eq!(key.subject_id, "math");
                assert_eq!(key.date, day(2));
            }
            other => panic!("expected DuplicateAttendance, got {other:?}"),
        }

        // The original row is untouched.
        let rows = ledger.query(AttendanceFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], first);
    }

    #[tokio::test]
    async fn test_other_subject_or_day_is_distinct() {
        let ledger = ledger().await;
        ledger.record(present("s1", "math", day(2))).await.unwrap();
        ledger.record(present("s1", "physics", day(2))).await.unwrap();
        ledger.record(present("s1", "math", day(3))).await.unwrap();
        ledger.record(present("s2", "math", day(2))).await.unwrap();
        assert_eq!(ledger.count_for_date(day(2)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_query_orders_newest_first_and_filters() {
        let ledger = ledger().await;
        for d in [3, 1, 5, 2, 4] {
            ledger.record(present("s1", "math", day(d))).await.unwrap();
        }
        ledger.record(present("s2", "physics", day(9))).await.unwrap();

        let math = ledger
            .query(AttendanceFilter {
                subject_id: Some("math".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let dates: Vec<_> = math.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![day(5), day(4), day(3), day(2), day(1)]);

        let ranged = ledger
            .query(AttendanceFilter {
                identity_id: Some("s1".into()),
                from: Some(day(2)),
                to: Some(day(4)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ranged.len(), 3);

        let page = ledger
            .query(AttendanceFilter {
                subject_id: Some("math".into()),
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        let dates: Vec<_> = page.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![day(4), day(3)]);
    }

    #[tokio::test]
    async fn test_absent_record_has_no_score() {
        let ledger = ledger().await;
        let mut absent = present("s1", "math", day(2));
        absent.status = AttendanceStatus::Absent;
        absent.match_score = None;
        ledger.record(absent).await.unwrap();

        let rows = ledger
            .query(AttendanceFilter {
                date: Some(day(2)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows[0].status, AttendanceStatus::Absent);
        assert!(rows[0].match_score.is_none());
    }

    #[test]
    fn test_filter_clause_offset_without_limit() {
        let (sql, values) = filter_clause(&AttendanceFilter {
            offset: Some(10),
            ..Default::default()
        });
        assert!(sql.ends_with("LIMIT ?1 OFFSET ?2"));
        assert_eq!(values, vec![Value::Integer(-1), Value::Integer(10)]);
    }
}
