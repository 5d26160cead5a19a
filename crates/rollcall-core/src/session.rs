//! Attendance session: one matching attempt from embedding to ledger entry.
//!
//! ```text
//! Idle -> CandidatesFetched -> Matched | Rejected | NoCandidates
//!      -> Recorded | Conflict | Failed
//! ```
//!
//! `Rejected` and `NoCandidates` both surface as [`SubmitOutcome::NoMatch`] so a
//! caller cannot infer roster size. They are logged as distinct events.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::time::{self, Instant};

use crate::capture::{EmbeddingExtractor, Frame};
use crate::matcher::{CosineMatcher, Decision, MatchError, Matcher};
use crate::store::{AttendanceLedger, EmbeddingStore, StoreError};
use crate::types::{
    AttendanceStatus, Embedding, EmbeddingProfile, EnrolledIdentity, Enrollment, NewAttendance,
    ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    CandidatesFetched,
    Matched,
    Rejected,
    NoCandidates,
    Recorded,
    Conflict,
    Failed,
}

/// Why a submission ended in `Failed`. Every cause is safe to retry by
/// resubmitting the same inputs except `Invalid` and `DimensionMismatch`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    Timeout,
    NoFaceDetected,
    Invalid { reason: String },
    DimensionMismatch { detail: String },
    Capture { detail: String },
    Storage { detail: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::NoFaceDetected => f.write_str("no face detected"),
            Self::Invalid { reason } => write!(f, "invalid input: {reason}"),
            Self::DimensionMismatch { detail } => write!(f, "dimension mismatch: {detail}"),
            Self::Capture { detail } => write!(f, "capture failed: {detail}"),
            Self::Storage { detail } => write!(f, "storage failed: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedIdentity {
    pub identity_id: String,
    pub roll_number: String,
    pub display_name: String,
}

impl From<&EnrolledIdentity> for MatchedIdentity {
    fn from(identity: &EnrolledIdentity) -> Self {
        Self {
            identity_id: identity.identity_id.clone(),
            roll_number: identity.roll_number.clone(),
            display_name: identity.display_name.clone(),
        }
    }
}

/// What the calling UI sees for one submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Recorded {
        identity: MatchedIdentity,
        score: f32,
        record_id: String,
    },
    /// Attendance for this identity/subject/date already exists.
    Conflict { identity_id: String },
    NoMatch,
    Failed { cause: FailureCause },
}

impl SubmitOutcome {
    fn failed(cause: FailureCause) -> (SessionState, Self) {
        (SessionState::Failed, Self::Failed { cause })
    }
}

/// Result of closing a class session with absentees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeSummary {
    pub marked_absent: usize,
    pub already_recorded: usize,
}

/// Orchestrates matching against an injected store and ledger.
///
/// Cheap to clone; clones share the same backends.
pub struct AttendanceSession<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    matcher: CosineMatcher,
    profile: EmbeddingProfile,
}

impl<S, L> Clone for AttendanceSession<S, L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            matcher: self.matcher,
            profile: self.profile.clone(),
        }
    }
}

impl<S: EmbeddingStore, L: AttendanceLedger> AttendanceSession<S, L> {
    pub fn new(
        store: Arc<S>,
        ledger: Arc<L>,
        profile: EmbeddingProfile,
        matcher: CosineMatcher,
    ) -> Self {
        Self {
            store,
            ledger,
            matcher,
            profile,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn profile(&self) -> &EmbeddingProfile {
        &self.profile
    }

    pub fn threshold(&self) -> f32 {
        self.matcher.threshold
    }

    /// Enroll or re-enroll an identity. Validated before touching the store.
    pub async fn enroll(&self, enrollment: Enrollment) -> Result<EnrolledIdentity, StoreError> {
        enrollment.validate(&self.profile)?;
        let identity = self.store.enroll(enrollment).await?;
        tracing::info!(
            identity_id = %identity.identity_id,
            class_id = %identity.class_id,
            "identity enrolled"
        );
        Ok(identity)
    }

    /// Match `embedding` against the class roster and record attendance.
    ///
    /// `timeout` bounds the candidate fetch. Once the ledger write is issued it
    /// runs to completion even if this future is dropped.
    pub async fn submit(
        &self,
        embedding: Embedding,
        class_id: &str,
        subject_id: &str,
        date: NaiveDate,
        timeout: Duration,
    ) -> SubmitOutcome {
        let deadline = deadline_after(timeout);
        self.run(embedding, class_id, subject_id, date, deadline)
            .await
            .1
    }

    /// Extract an embedding from `frame` and submit it. Extraction shares the
    /// same deadline as the rest of the submission.
    pub async fn submit_capture<E: EmbeddingExtractor>(
        &self,
        extractor: &E,
        frame: &Frame,
        class_id: &str,
        subject_id: &str,
        date: NaiveDate,
        timeout: Duration,
    ) -> SubmitOutcome {
        let deadline = deadline_after(timeout);

        let embedding = match time::timeout_at(deadline, extractor.extract(frame)).await {
            Ok(Ok(Some(embedding))) => embedding,
            Ok(Ok(None)) => {
                tracing::info!(class_id, "no face detected in frame");
                return SubmitOutcome::failed(FailureCause::NoFaceDetected).1;
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "embedding extraction failed");
                return SubmitOutcome::failed(FailureCause::Capture {
                    detail: err.to_string(),
                })
                .1;
            }
            Err(_) => {
                tracing::warn!(?timeout, "embedding extraction timed out");
                return SubmitOutcome::failed(FailureCause::Timeout).1;
            }
        };

        self.run(embedding, class_id, subject_id, date, deadline)
            .await
            .1
    }

    /// Drive the state machine and return the terminal state with the outcome.
    pub(crate) async fn run(
        &self,
        embedding: Embedding,
        class_id: &str,
        subject_id: &str,
        date: NaiveDate,
        deadline: Instant,
    ) -> (SessionState, SubmitOutcome) {
        let mut state = SessionState::Idle;

        if let Err(err) = self.validate_submission(&embedding, class_id, subject_id) {
            tracing::warn!(error = %err, "submission rejected by validation");
            return SubmitOutcome::failed(FailureCause::Invalid {
                reason: err.to_string(),
            });
        }

        let candidates =
            match time::timeout_at(deadline, self.store.candidates_for_class(class_id)).await {
                Ok(Ok(candidates)) => candidates,
                Ok(Err(err)) => {
                    tracing::warn!(class_id, error = %err, "candidate fetch failed");
                    return SubmitOutcome::failed(FailureCause::Storage {
                        detail: err.to_string(),
                    });
                }
                Err(_) => {
                    tracing::warn!(class_id, "candidate fetch timed out");
                    return SubmitOutcome::failed(FailureCause::Timeout);
                }
            };
        transition(&mut state, SessionState::CandidatesFetched);
        tracing::debug!(class_id, candidates = candidates.len(), "candidates fetched");

        let result = match self.matcher.nearest(&embedding, &candidates) {
            Ok(result) => result,
            Err(MatchError::DimensionMismatch { left, right }) => {
                tracing::error!(
                    class_id,
                    query_dim = left,
                    enrolled_dim = right,
                    "embedding dimension mismatch against enrolled roster; model version skew?"
                );
                return SubmitOutcome::failed(FailureCause::DimensionMismatch {
                    detail: format!("query has {left} dimensions, enrolled has {right}"),
                });
            }
        };

        let (identity, score) = match result.decision {
            Decision::NoCandidates => {
                transition(&mut state, SessionState::NoCandidates);
                tracing::info!(class_id, "no candidates enrolled for class");
                return (state, SubmitOutcome::NoMatch);
            }
            Decision::Rejected => {
                transition(&mut state, SessionState::Rejected);
                tracing::info!(
                    class_id,
                    best_score = ?result.best_score,
                    threshold = self.matcher.threshold,
                    "nearest candidate rejected above threshold"
                );
                return (state, SubmitOutcome::NoMatch);
            }
            Decision::Matched => {
                transition(&mut state, SessionState::Matched);
                let found = result.best_identity_id.as_deref().and_then(|id| {
                    candidates.iter().find(|c| c.identity_id == id)
                });
                match (found, result.best_score) {
                    (Some(identity), Some(score)) => (MatchedIdentity::from(identity), score),
                    _ => {
                        tracing::error!(class_id, "matched result without identity or score");
                        return SubmitOutcome::failed(FailureCause::Storage {
                            detail: "matched identity missing from roster".into(),
                        });
                    }
                }
            }
        };

        // Last point where cancelling is free of side effects.
        if Instant::now() >= deadline {
            tracing::warn!(class_id, identity_id = %identity.identity_id, "deadline passed before ledger write");
            return SubmitOutcome::failed(FailureCause::Timeout);
        }

        let attendance = NewAttendance {
            identity_id: identity.identity_id.clone(),
            class_id: class_id.to_string(),
            subject_id: subject_id.to_string(),
            date,
            status: AttendanceStatus::Present,
            match_score: Some(score),
        };

        // Detached so the write completes even if the caller goes away.
        let ledger = Arc::clone(&self.ledger);
        let write = tokio::spawn(async move { ledger.record(attendance).await });

        match write.await {
            Ok(Ok(record)) => {
                transition(&mut state, SessionState::Recorded);
                tracing::info!(
                    identity_id = %identity.identity_id,
                    subject_id,
                    %date,
                    score,
                    record_id = %record.record_id,
                    "attendance recorded"
                );
                (
                    state,
                    SubmitOutcome::Recorded {
                        identity,
                        score,
                        record_id: record.record_id,
                    },
                )
            }
            Ok(Err(StoreError::DuplicateAttendance(key))) => {
                transition(&mut state, SessionState::Conflict);
                tracing::info!(%key, "attendance already recorded");
                (
                    state,
                    SubmitOutcome::Conflict {
                        identity_id: identity.identity_id,
                    },
                )
            }
            Ok(Err(err)) => {
                tracing::warn!(identity_id = %identity.identity_id, error = %err, "ledger write failed");
                SubmitOutcome::failed(FailureCause::Storage {
                    detail: err.to_string(),
                })
            }
            Err(err) => {
                tracing::error!(error = %err, "ledger write task failed");
                SubmitOutcome::failed(FailureCause::Storage {
                    detail: err.to_string(),
                })
            }
        }
    }

    /// Mark every enrolled identity of the class without a record for
    /// `subject_id`/`date` as absent.
    pub async fn finalize(
        &self,
        class_id: &str,
        subject_id: &str,
        date: NaiveDate,
    ) -> Result<FinalizeSummary, StoreError> {
        if class_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("class_id").into());
        }
        if subject_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("subject_id").into());
        }

        let roster = self.store.candidates_for_class(class_id).await?;
        let mut summary = FinalizeSummary::default();

        for identity in roster {
            let attendance = NewAttendance {
                identity_id: identity.identity_id,
                class_id: class_id.to_string(),
                subject_id: subject_id.to_string(),
                date,
                status: AttendanceStatus::Absent,
                match_score: None,
            };
            match self.ledger.record(attendance).await {
                Ok(_) => summary.marked_absent += 1,
                Err(StoreError::DuplicateAttendance(_)) => summary.already_recorded += 1,
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            class_id,
            subject_id,
            %date,
            marked_absent = summary.marked_absent,
            already_recorded = summary.already_recorded,
            "session finalized"
        );
        Ok(summary)
    }

    fn validate_submission(
        &self,
        embedding: &Embedding,
        class_id: &str,
        subject_id: &str,
    ) -> Result<(), ValidationError> {
        if class_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("class_id"));
        }
        if subject_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("subject_id"));
        }
        self.profile.validate(embedding)
    }
}

/// Stand-in deadline when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn transition(state: &mut SessionState, next: SessionState) {
    tracing::trace!(from = ?*state, to = ?next, "session transition");
    *state = next;
}
