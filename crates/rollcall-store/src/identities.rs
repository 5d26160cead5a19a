use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use rollcall_core::{
    Embedding, EmbeddingProfile, EmbeddingStore, EnrolledIdentity, Enrollment, StoreError,
};
use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;

use crate::{backend, decode_embedding, encode_embedding, from_millis};

const SELECT_IDENTITY: &str = "SELECT identity_id, class_id, roll_number, display_name, \
     model_version, embedding_dimension, embedding, enrolled_at FROM identities";

/// Raw `identities` row, decoded outside the connection thread.
struct IdentityRow {
    identity_id: String,
    class_id: String,
    roll_number: String,
    display_name: String,
    model_version: String,
    dimension: i64,
    embedding: Vec<u8>,
    enrolled_at: i64,
}

impl IdentityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identity_id: row.get(0)?,
            class_id: row.get(1)?,
            roll_number: row.get(2)?,
            display_name: row.get(3)?,
            model_version: row.get(4)?,
            dimension: row.get(5)?,
            embedding: row.get(6)?,
            enrolled_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<EnrolledIdentity, StoreError> {
        let dimension = usize::try_from(self.dimension).map_err(|_| {
            StoreError::Corrupt(format!(
                "identity {}: negative dimension {}",
                self.identity_id, self.dimension
            ))
        })?;
        let values = decode_embedding(&self.embedding, dimension)?;
        Ok(EnrolledIdentity {
            identity_id: self.identity_id,
            class_id: self.class_id,
            roll_number: self.roll_number,
            display_name: self.display_name,
            embedding: Embedding::tagged(values, self.model_version),
            enrolled_at: from_millis(self.enrolled_at)?,
        })
    }
}

/// SQLite-backed [`EmbeddingStore`].
pub struct SqliteEmbeddingStore {
    conn: Arc<Connection>,
    profile: EmbeddingProfile,
}

impl SqliteEmbeddingStore {
    pub(crate) fn new(conn: Arc<Connection>, profile: EmbeddingProfile) -> Self {
        Self { conn, profile }
    }

    /// Every enrolled identity, ordered by class then roll number.
    pub async fn list(&self, class_id: Option<&str>) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let class_id = class_id.map(str::to_owned);
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "{SELECT_IDENTITY} WHERE (?1 IS NULL OR class_id = ?1) \
                     ORDER BY class_id, roll_number"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([class_id], IdentityRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)?;
        rows.into_iter().map(IdentityRow::decode).collect()
    }
}

impl EmbeddingStore for SqliteEmbeddingStore {
    async fn candidates_for_class(
        &self,
        class_id: &str,
    ) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let class_id = class_id.to_owned();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare_cached(&format!("{SELECT_IDENTITY} WHERE class_id = ?1"))?;
                let rows = stmt
                    .query_map([class_id], IdentityRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)?;
        rows.into_iter().map(IdentityRow::decode).collect()
    }

    async fn enroll(&self, enrollment: Enrollment) -> Result<EnrolledIdentity, StoreError> {
        enrollment.validate(&self.profile)?;

        let identity = EnrolledIdentity {
            identity_id: enrollment.identity_id,
            class_id: enrollment.class_id,
            roll_number: enrollment.roll_number,
            display_name: enrollment.display_name,
            embedding: Embedding::tagged(
                enrollment.embedding.values,
                self.profile.model_version.clone(),
            ),
            enrolled_at: Utc::now().trunc_subsecs(3),
        };

        let row = identity.clone();
        let replaced = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existed = tx
                    .query_row(
                        "SELECT 1 FROM identities WHERE identity_id = ?1",
                        [&row.identity_id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                tx.execute(
                    "INSERT INTO identities (identity_id, class_id, roll_number, display_name,
                         model_version, embedding_dimension, embedding, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(identity_id) DO UPDATE SET
                         class_id = excluded.class_id,
                         roll_number = excluded.roll_number,
                         display_name = excluded.display_name,
                         model_version = excluded.model_version,
                         embedding_dimension = excluded.embedding_dimension,
                         embedding = excluded.embedding,
                         enrolled_at = excluded.enrolled_at",
                    params![
                        row.identity_id,
                        row.class_id,
                        row.roll_number,
                        row.display_name,
                        row.embedding.model_version,
                        row.embedding.dim() as i64,
                        encode_embedding(&row.embedding.values),
                        row.enrolled_at.timestamp_millis(),
                    ],
                )?;
                tx.commit()?;
                Ok(existed)
            })
            .await
            .map_err(backend)?;

        if replaced {
            tracing::info!(identity_id = %identity.identity_id, "re-enrolled; previous embedding replaced");
        }
        Ok(identity)
    }

    async fn get(&self, identity_id: &str) -> Result<Option<EnrolledIdentity>, StoreError> {
        let identity_id = identity_id.to_owned();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!("{SELECT_IDENTITY} WHERE identity_id = ?1"),
                        [identity_id],
                        IdentityRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(backend)?;
        row.map(IdentityRow::decode).transpose()
    }

    async fn remove(&self, identity_id: &str) -> Result<bool, StoreError> {
        let identity_id = identity_id.to_owned();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM identities WHERE identity_id = ?1", [identity_id])?;
                Ok(n > 0)
            })
            .await
            .map_err(backend)?;
        Ok(removed)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
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
    use rollcall_core::ValidationError;

    fn profile() -> EmbeddingProfile {
        EmbeddingProfile::new(3, "resnet34-128")
    }

    fn enrollment(id: &str, class_id: &str, values: Vec<f32>) -> Enrollment {
        Enrollment {
            identity_id: id.into(),
            class_id: class_id.into(),
            roll_number: format!("{id}-roll"),
            display_name: format!("Student {id}"),
            embedding: Embedding::new(values),
        }
    }

    async fn store() -> SqliteEmbeddingStore {
        Database::open_in_memory(profile()).await.unwrap().identities()
    }

    #[tokio::test]
    async fn test_candidates_scoped_to_class() {
        let store = store().await;
        store.enroll(enrollment("a", "c1", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.enroll(enrollment("b", "c1", vec![0.0, 1.0, 0.0])).await.unwrap();
        store.enroll(enrollment("c", "c2", vec![0.0, 0.0, 1.0])).await.unwrap();

        let mut ids: Vec<_> = store
            .candidates_for_class("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.identity_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(store.candidates_for_class("c3").await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_embedding_survives_storage() {
        let store = store().await;
        let values = vec![0.125, -0.5, 0.875];
        store.enroll(enrollment("a", "c1", values.clone())).await.unwrap();

        let fetched = store.get("a").await.unwrap().unwrap();
        assert_eq!(fetched.embedding.values, values);
        assert_eq!(fetched.embedding.model_version.as_deref(), Some("resnet34-128"));
        assert_eq!(fetched.roll_number, "a-roll");
    }

    #[tokio::test]
    async fn test_reenrollment_replaces_embedding() {
        let store = store().await;
        store.enroll(enrollment("a", "c1", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.enroll(enrollment("a", "c2", vec![0.0, 1.0, 0.0])).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let fetched = store.get("a").await.unwrap().unwrap();
        assert_eq!(fetched.class_id, "c2");
        assert_eq!(fetched.embedding.values, vec![0.0, 1.0, 0.0]);
        assert!(store.candidates_for_class("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_validates_dimension() {
        let store = store().await;
        let err = store
            .enroll(enrollment("a", "c1", vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::Dimension { expected: 3, actual: 2 })
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let store = store().await;
        store.enroll(enrollment("b", "c1", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.enroll(enrollment("a", "c1", vec![0.0, 1.0, 0.0])).await.unwrap();
        store.enroll(enrollment("z", "c0", vec![0.0, 0.0, 1.0])).await.unwrap();

        let all: Vec<_> = store
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.identity_id)
            .collect();
        assert_eq!(all, vec!["z", "a", "b"]);

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        let c1 = store.list(Some("c1")).await.unwrap();
        assert_eq!(c1.len(), 1);
        assert_eq!(c1[0].identity_id, "b");
    }
}
