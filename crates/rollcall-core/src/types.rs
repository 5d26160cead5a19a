use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input rejected before any store access.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("required field is empty: {0}")]
    EmptyField(&'static str),
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("embedding has {actual} dimensions, store expects {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding was produced by model {actual:?}, store is bound to {expected:?}")]
    ModelVersion { expected: String, actual: String },
    #[error("embedding contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Face embedding vector (128-dimensional for the default recognition model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding. Untagged embeddings are
    /// assumed to come from the store's model.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn tagged(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self { values, model_version: Some(model_version.into()) }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm.
    pub fn magnitude(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// The comparison universe a store is bound to: every embedding stored or
/// compared must share this dimensionality and model version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingProfile {
    pub dimension: usize,
    pub model_version: String,
}

impl EmbeddingProfile {
    pub fn new(dimension: usize, model_version: impl Into<String>) -> Self {
        Self { dimension, model_version: model_version.into() }
    }

    /// Check that `embedding` belongs to this universe.
    pub fn validate(&self, embedding: &Embedding) -> Result<(), ValidationError> {
        if embedding.values.is_empty() {
            return Err(ValidationError::EmptyEmbedding);
        }
        if embedding.dim() != self.dimension {
            return Err(ValidationError::Dimension {
                expected: self.dimension,
                actual: embedding.dim(),
            });
        }
        if let Some(version) = &embedding.model_version {
            if *version != self.model_version {
                return Err(ValidationError::ModelVersion {
                    expected: self.model_version.clone(),
                    actual: version.clone(),
                });
            }
        }
        if let Some(idx) = embedding.values.iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinite(idx));
        }
        Ok(())
    }
}

/// Enrollment request for one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub identity_id: String,
    pub class_id: String,
    pub roll_number: String,
    pub display_name: String,
    pub embedding: Embedding,
}

impl Enrollment {
    /// Field and embedding checks shared by every store implementation.
    pub fn validate(&self, profile: &EmbeddingProfile) -> Result<(), ValidationError> {
        for (name, value) in [
            ("identity_id", &self.identity_id),
            ("class_id", &self.class_id),
            ("roll_number", &self.roll_number),
            ("display_name", &self.display_name),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(name));
            }
        }
        profile.validate(&self.embedding)
    }
}

/// An enrolled identity with its reference embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub identity_id: String,
    pub class_id: String,
    pub roll_number: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Unresolved,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Unresolved => "unresolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "unresolved" => Some(Self::Unresolved),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup key: at most one attendance record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttendanceKey {
    pub identity_id: String,
    pub subject_id: String,
    pub date: NaiveDate,
}

impl std::fmt::Display for AttendanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.identity_id, self.subject_id, self.date)
    }
}

/// A record about to be appended to the ledger.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub identity_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    /// Cosine distance of the match that produced this record, if any.
    pub match_score: Option<f32>,
}

impl NewAttendance {
    pub fn key(&self) -> AttendanceKey {
        AttendanceKey {
            identity_id: self.identity_id.clone(),
            subject_id: self.subject_id.clone(),
            date: self.date,
        }
    }
}

/// A persisted, immutable attendance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: String,
    pub identity_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub match_score: Option<f32>,
    pub recorded_at: DateTime<Utc>,
}

/// Ledger query filter. Every field narrows the result; `None` matches all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttendanceFilter {
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub identity_id: Option<String>,
    pub date: Option<NaiveDate>,
    /// Inclusive lower bound.
    pub from: Option<NaiveDate>,
    /// Inclusive upper bound.
    pub to: Option<NaiveDate>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> EmbeddingProfile {
        EmbeddingProfile::new(3, "resnet34-128")
    }

    fn enrollment(values: Vec<f32>) -> Enrollment {
        Enrollment {
            identity_id: "s-1".into(),
            class_id: "c-1".into(),
            roll_number: "17".into(),
            display_name: "Asha".into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_profile_accepts_matching_embedding() {
        assert!(profile().validate(&Embedding::new(vec![0.1, 0.2, 0.3])).is_ok());
        let tagged = Embedding::tagged(vec![0.1, 0.2, 0.3], "resnet34-128");
        assert!(profile().validate(&tagged).is_ok());
    }

    #[test]
    fn test_profile_rejects_wrong_dimension() {
        let err = profile().validate(&Embedding::new(vec![0.1, 0.2])).unwrap_err();
        assert_eq!(err, ValidationError::Dimension { expected: 3, actual: 2 });
    }

    #[test]
    fn test_profile_rejects_other_model_version() {
        let tagged = Embedding::tagged(vec![0.1, 0.2, 0.3], "w600k_r50");
        assert!(matches!(
            profile().validate(&tagged),
            Err(ValidationError::ModelVersion { .. })
        ));
    }

    #[test]
    fn test_profile_rejects_non_finite() {
        let err = profile().validate(&Embedding::new(vec![0.1, f32::NAN, 0.3])).unwrap_err();
        assert_eq!(err, ValidationError::NonFinite(1));
    }

    #[test]
    fn test_profile_rejects_empty() {
        let err = profile().validate(&Embedding::new(vec![])).unwrap_err();
        assert_eq!(err, ValidationError::EmptyEmbedding);
    }

    #[test]
    fn test_enrollment_rejects_blank_fields() {
        let mut e = enrollment(vec![0.1, 0.2, 0.3]);
        e.display_name = "  ".into();
        assert_eq!(
            e.validate(&profile()).unwrap_err(),
            ValidationError::EmptyField("display_name")
        );
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            AttendanceStatus::Present,
            AttendanceStatus::Absent,
            AttendanceStatus::Unresolved,
        ] {
            assert_eq!(AttendanceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AttendanceStatus::parse("late"), None);
    }
}
