//! rollcall-core: Face-embedding attendance engine.
//!
//! Matches a captured embedding against a class roster by cosine distance
//! and records at most one attendance entry per identity, subject and day.

pub mod capture;
pub mod matcher;
pub mod session;
pub mod store;
pub mod types;

pub use capture::{CaptureError, EmbeddingExtractor, Frame};
pub use matcher::{
    cosine_distance, CosineMatcher, Decision, MatchError, MatchResult, Matcher,
    DEFAULT_DISTANCE_THRESHOLD,
};
pub use session::{
    AttendanceSession, FailureCause, FinalizeSummary, MatchedIdentity, SessionState,
    SubmitOutcome,
};
pub use store::{AttendanceLedger, EmbeddingStore, StoreError};
pub use types::{
    AttendanceFilter, AttendanceKey, AttendanceRecord, AttendanceStatus, Embedding,
    EmbeddingProfile, EnrolledIdentity, Enrollment, NewAttendance, ValidationError,
};
