//! Storage contracts consumed by the attendance session.
//!
//! Implementations own persistence; the session only sees these traits, so
//! tests can inject in-memory or failing backends.

use std::future::Future;

use chrono::NaiveDate;
use thiserror::Error;

use crate::types::{
    AttendanceFilter, AttendanceKey, AttendanceRecord, EmbeddingProfile, Enrollment,
    EnrolledIdentity, NewAttendance, ValidationError,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("attendance already recorded for {0}")]
    DuplicateAttendance(AttendanceKey),
    #[error("database is bound to {stored:?}, configured for {configured:?}")]
    ProfileMismatch {
        stored: EmbeddingProfile,
        configured: EmbeddingProfile,
    },
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Enrolled identities and their reference embeddings.
pub trait EmbeddingStore: Send + Sync + 'static {
    /// Every identity enrolled in `class_id`, in no particular order.
    fn candidates_for_class(
        &self,
        class_id: &str,
    ) -> impl Future<Output = Result<Vec<EnrolledIdentity>, StoreError>> + Send;

    /// Insert or replace the identity. Re-enrollment replaces the stored
    /// embedding wholesale.
    fn enroll(
        &self,
        enrollment: Enrollment,
    ) -> impl Future<Output = Result<EnrolledIdentity, StoreError>> + Send;

    fn get(
        &self,
        identity_id: &str,
    ) -> impl Future<Output = Result<Option<EnrolledIdentity>, StoreError>> + Send;

    /// Returns `true` if an identity was removed.
    fn remove(&self, identity_id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn count(&self) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Append-only attendance ledger.
///
/// `record` must enforce uniqueness of [`AttendanceKey`] atomically and
/// return [`StoreError::DuplicateAttendance`] on conflict.
pub trait AttendanceLedger: Send + Sync + 'static {
    fn record(
        &self,
        attendance: NewAttendance,
    ) -> impl Future<Output = Result<AttendanceRecord, StoreError>> + Send;

    /// Matching records, newest date first.
    fn query(
        &self,
        filter: AttendanceFilter,
    ) -> impl Future<Output = Result<Vec<AttendanceRecord>, StoreError>> + Send;

    fn count_for_date(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}
