use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rollcall_core::{
    AttendanceFilter, AttendanceLedger, AttendanceSession, Embedding, EmbeddingStore, Enrollment,
    Frame, StoreError, SubmitOutcome,
};
use rollcall_store::{SqliteAttendanceLedger, SqliteEmbeddingStore};
use zbus::interface;

use crate::extractor::CommandExtractor;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

pub type Session = AttendanceSession<SqliteEmbeddingStore, SqliteAttendanceLedger>;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    session: Session,
    extractor: Option<CommandExtractor>,
    default_timeout: Duration,
}

impl AttendanceService {
    pub fn new(
        session: Session,
        extractor: Option<CommandExtractor>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            session,
            extractor,
            default_timeout,
        }
    }

    fn timeout(&self, timeout_ms: u64) -> Duration {
        if timeout_ms == 0 {
            self.default_timeout
        } else {
            Duration::from_millis(timeout_ms)
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll (or re-enroll) an identity with its reference embedding.
    ///
    /// `model_version` tags the embedding; empty leaves it untagged.
    async fn enroll(
        &self,
        identity_id: &str,
        class_id: &str,
        roll_number: &str,
        display_name: &str,
        embedding: Vec<f64>,
        model_version: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, class_id, "enroll requested");
        let enrollment = Enrollment {
            identity_id: identity_id.to_string(),
            class_id: class_id.to_string(),
            roll_number: roll_number.to_string(),
            display_name: display_name.to_string(),
            embedding: to_embedding(&embedding, model_version),
        };
        let identity = self.session.enroll(enrollment).await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "identity_id": identity.identity_id,
            "class_id": identity.class_id,
            "enrolled_at": identity.enrolled_at,
        })
        .to_string())
    }

    /// Match an embedding against the class roster and record attendance.
    ///
    /// `date` is `YYYY-MM-DD`, or empty for today (UTC). `timeout_ms` of 0
    /// uses the daemon default. Returns the outcome as JSON.
    async fn submit_attendance(
        &self,
        embedding: Vec<f64>,
        model_version: &str,
        class_id: &str,
        subject_id: &str,
        date: &str,
        timeout_ms: u64,
    ) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        tracing::info!(class_id, subject_id, %date, "submit requested");
        let outcome = self
            .session
            .submit(
                to_embedding(&embedding, model_version),
                class_id,
                subject_id,
                date,
                self.timeout(timeout_ms),
            )
            .await;
        outcome_json(&outcome)
    }

    /// Run the configured extractor on an encoded frame, then submit.
    ///
    /// `content_type` (e.g. `image/jpeg`) is passed to the extractor; empty
    /// leaves it to sniff the bytes.
    async fn capture_attendance(
        &self,
        frame: Vec<u8>,
        content_type: &str,
        class_id: &str,
        subject_id: &str,
        date: &str,
        timeout_ms: u64,
    ) -> zbus::fdo::Result<String> {
        let Some(extractor) = &self.extractor else {
            return Err(zbus::fdo::Error::NotSupported(
                "no extractor configured (ROLLCALL_EXTRACTOR_CMD)".into(),
            ));
        };
        let date = parse_date(date)?;
        tracing::info!(class_id, subject_id, %date, bytes = frame.len(), content_type, "capture requested");
        let frame = to_frame(frame, content_type);
        let outcome = self
            .session
            .submit_capture(
                extractor,
                &frame,
                class_id,
                subject_id,
                date,
                self.timeout(timeout_ms),
            )
            .await;
        outcome_json(&outcome)
    }

    /// Mark every identity without a record for this subject/date absent.
    async fn finalize(
        &self,
        class_id: &str,
        subject_id: &str,
        date: &str,
    ) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let summary = self
            .session
            .finalize(class_id, subject_id, date)
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&summary).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// List enrolled identities, optionally restricted to a class (empty = all).
    async fn list_identities(&self, class_id: &str) -> zbus::fdo::Result<String> {
        let class_id = Some(class_id).filter(|c| !c.is_empty());
        let identities = self
            .session
            .store()
            .list(class_id)
            .await
            .map_err(to_fdo)?;
        let rows: Vec<_> = identities
            .iter()
            .map(|i| {
                serde_json::json!({
                    "identity_id": i.identity_id,
                    "class_id": i.class_id,
                    "roll_number": i.roll_number,
                    "display_name": i.display_name,
                    "enrolled_at": i.enrolled_at,
                })
            })
            .collect();
        Ok(serde_json::Value::Array(rows).to_string())
    }

    /// Remove an enrolled identity. Its attendance history is kept.
    async fn remove_identity(&self, identity_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(identity_id, "remove_identity requested");
        self.session
            .store()
            .remove(identity_id)
            .await
            .map_err(to_fdo)
    }

    /// Query attendance history. `filter` is a JSON `AttendanceFilter` (or empty).
    async fn query_attendance(&self, filter: &str) -> zbus::fdo::Result<String> {
        let filter: AttendanceFilter = if filter.trim().is_empty() {
            AttendanceFilter::default()
        } else {
            serde_json::from_str(filter)
                .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("filter: {e}")))?
        };
        let records = self
            .session
            .ledger()
            .query(filter)
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let today = Utc::now().date_naive();
        let enrolled = self.session.store().count().await.map_err(to_fdo)?;
        let today_attendance = self
            .session
            .ledger()
            .count_for_date(today)
            .await
            .map_err(to_fdo)?;
        let profile = self.session.profile();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrolled": enrolled,
            "today": today,
            "today_attendance": today_attendance,
            "distance_threshold": self.session.threshold(),
            "embedding_dim": profile.dimension,
            "model_version": profile.model_version,
            "extractor": self.extractor.as_ref().map(|e| e.program()),
        })
        .to_string())
    }
}

/// D-Bus carries doubles; embeddings are stored as `f32`.
fn to_embedding(values: &[f64], model_version: &str) -> Embedding {
    let values = values.iter().map(|&v| v as f32).collect();
    match model_version.trim() {
        "" => Embedding::new(values),
        version => Embedding::tagged(values, version),
    }
}

fn to_frame(data: Vec<u8>, content_type: &str) -> Frame {
    match content_type.trim() {
        "" => Frame::new(data),
        content_type => Frame::new(data).with_content_type(content_type),
    }
}

fn parse_date(date: &str) -> zbus::fdo::Result<NaiveDate> {
    let date = date.trim();
    if date.is_empty() {
        return Ok(Utc::now().date_naive());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("date {date:?}: {e}")))
}

fn to_fdo(err: StoreError) -> zbus::fdo::Error {
    match err {
        StoreError::Validation(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::warn!(error = %other, "store error");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn outcome_json(outcome: &SubmitOutcome) -> zbus::fdo::Result<String> {
    serde_json::to_string(outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{EmbeddingProfile, FailureCause, ValidationError};

    #[test]
    fn test_parse_date_explicit_and_default() {
        assert_eq!(
            parse_date("2024-12-21").unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 21).unwrap()
        );
        assert_eq!(parse_date("").unwrap(), Utc::now().date_naive());
        assert!(matches!(
            parse_date("21/12/2024"),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_to_embedding_narrows_to_f32() {
        let embedding = to_embedding(&[0.5, -1.25], "");
        assert_eq!(embedding.values, vec![0.5f32, -1.25f32]);
        assert!(embedding.model_version.is_none());
    }

    #[test]
    fn test_to_embedding_keeps_model_tag() {
        let embedding = to_embedding(&[1.0, 0.0], "facenet-512");
        assert_eq!(embedding.model_version.as_deref(), Some("facenet-512"));

        let profile = EmbeddingProfile::new(2, "resnet34-128");
        assert!(matches!(
            profile.validate(&embedding),
            Err(ValidationError::ModelVersion { .. })
        ));
        assert!(profile.validate(&to_embedding(&[1.0, 0.0], "resnet34-128")).is_ok());
    }

    #[test]
    fn test_to_frame_content_type() {
        let frame = to_frame(vec![0xff, 0xd8], "image/jpeg");
        assert_eq!(frame.content_type.as_deref(), Some("image/jpeg"));
        assert!(to_frame(vec![1], "  ").content_type.is_none());
    }

    #[test]
    fn test_validation_maps_to_invalid_args() {
        let err = to_fdo(StoreError::Validation(ValidationError::EmptyEmbedding));
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
        let err = to_fdo(StoreError::Backend("disk full".into()));
        assert!(matches!(err, zbus::fdo::Error::Failed(_)));
    }

    #[test]
    fn test_outcome_json_is_tagged() {
        let json = outcome_json(&SubmitOutcome::Failed {
            cause: FailureCause::Timeout,
        })
        .unwrap();
        assert_eq!(json, r#"{"outcome":"failed","cause":{"kind":"timeout"}}"#);
    }
}
