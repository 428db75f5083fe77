use backfill_core::error::AppError;
use backfill_core::models::{Fields, Record, UpdateBatch};
use backfill_core::predicate::{FieldCondition, Predicate};
use backfill_core::traits::RecordStore;
use backfill_core::util::split_path;
use serde_json::Value;
use sqlx::{PgPool, Pool, Postgres, QueryBuilder};

/// JSON values that count as "not filled in".
const BLANK_VALUES: &str = r#"('null'::jsonb, '""'::jsonb, '[]'::jsonb, '{}'::jsonb)"#;

/// One collection of JSONB documents in PostgreSQL.
///
/// Updates merge top-level keys (`doc || fields`); documents are never
/// replaced wholesale.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: Pool<Postgres>,
    collection: String,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, collection: impl Into<String>) -> Self {
        Self {
            pool,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Insert or replace a document.
    pub async fn upsert(&self, id: &str, doc: &Value) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id)
            DO UPDATE SET doc = EXCLUDED.doc, updated_at = NOW()
            "#,
        )
        .bind(&self.collection)
        .bind(id)
        .bind(doc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::PersistenceError(e.to_string()))?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Value>, AppError> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT doc FROM documents WHERE collection = $1 AND id = $2")
                .bind(&self.collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.map(|r| r.0))
    }

    /// Number of documents in the collection.
    pub async fn count_all(&self) -> Result<u64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = $1")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    pub async fn count_matching(&self, predicate: &Predicate) -> Result<u64, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM documents WHERE collection = ");
        qb.push_bind(self.collection.clone());
        qb.push(" AND ");
        push_predicate(&mut qb, predicate);

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    pub async fn select_matching(
        &self,
        predicate: &Predicate,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id, doc FROM documents WHERE collection = ");
        qb.push_bind(self.collection.clone());
        qb.push(" AND ");
        push_predicate(&mut qb, predicate);
        if let Some(after) = after {
            qb.push(" AND id > ");
            qb.push_bind(after.to_string());
        }
        qb.push(" ORDER BY id LIMIT ");
        qb.push_bind(limit.min(i64::MAX as usize) as i64);

        let rows = qb
            .build_query_as::<DocumentRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Merge every item of `batch` in one statement. Returns rows matched.
    pub async fn bulk_update(&self, batch: &UpdateBatch) -> Result<u64, AppError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = batch.ids();
        let fields: Vec<Value> = batch
            .items()
            .iter()
            .map(|r| Value::Object(r.fields.clone()))
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE documents AS d
            SET doc = d.doc || u.fields, updated_at = NOW()
            FROM UNNEST($2::text[], $3::jsonb[]) AS u(id, fields)
            WHERE d.collection = $1 AND d.id = u.id
            "#,
        )
        .bind(&self.collection)
        .bind(&ids)
        .bind(&fields)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::PersistenceError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    pub async fn update_one(&self, id: &str, fields: &Fields) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET doc = doc || $3, updated_at = NOW()
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(&self.collection)
        .bind(id)
        .bind(Value::Object(fields.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::PersistenceError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

/// Render `predicate` as a boolean SQL expression over the `doc` column.
///
/// Mirrors [`Predicate::matches`]: absent, `null`, `""`, `[]`, and `{}` all
/// count as missing. An empty predicate matches nothing.
fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    if predicate.is_empty() {
        qb.push("FALSE");
        return;
    }

    qb.push("(");
    for (i, condition) in predicate.conditions().iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        match condition {
            FieldCondition::Missing(path) => {
                qb.push("COALESCE(doc #> ");
                qb.push_bind(path_array(path));
                qb.push(", 'null'::jsonb) IN ");
                qb.push(BLANK_VALUES);
            }
            FieldCondition::ArrayElementMissing { array, field } => {
                // CASE keeps jsonb_array_elements away from non-arrays.
                qb.push("CASE WHEN jsonb_typeof(doc #> ");
                qb.push_bind(path_array(array));
                qb.push(") = 'array' THEN EXISTS (SELECT 1 FROM jsonb_array_elements(doc #> ");
                qb.push_bind(path_array(array));
                qb.push(") AS e(elem) WHERE COALESCE(e.elem #> ");
                qb.push_bind(path_array(field));
                qb.push(", 'null'::jsonb) IN ");
                qb.push(BLANK_VALUES);
                qb.push(") ELSE FALSE END");
            }
        }
    }
    qb.push(")");
}

fn path_array(path: &str) -> Vec<String> {
    split_path(path).into_iter().map(str::to_string).collect()
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    doc: Value,
}

impl From<DocumentRow> for Record {
    fn from(row: DocumentRow) -> Self {
        Record::new(row.id, row.doc)
    }
}

// -- Trait implementation --

impl RecordStore for PgRecordStore {
    async fn count_matching(&self, predicate: &Predicate) -> Result<u64, AppError> {
        PgRecordStore::count_matching(self, predicate).await
    }

    async fn select_matching(
        &self,
        predicate: &Predicate,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>, AppError> {
        PgRecordStore::select_matching(self, predicate, after, limit).await
    }

    async fn bulk_update(&self, batch: &UpdateBatch) -> Result<u64, AppError> {
        PgRecordStore::bulk_update(self, batch).await
    }

    async fn update_one(&self, id: &str, fields: &Fields) -> Result<bool, AppError> {
        PgRecordStore::update_one(self, id, fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(predicate: &Predicate) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_predicate(&mut qb, predicate);
        qb.sql().to_string()
    }

    #[test]
    fn empty_predicate_renders_false() {
        assert_eq!(render(&Predicate::default()), "FALSE");
    }

    #[test]
    fn conditions_are_or_joined_with_binds() {
        let sql = render(&Predicate::missing("summary").or(FieldCondition::ArrayElementMissing {
            array: "messages".into(),
            field: "sentiment".into(),
        }));
        assert!(sql.starts_with("(COALESCE(doc #> $1"));
        assert!(sql.contains(" OR CASE WHEN jsonb_typeof(doc #> $2)"));
        assert!(sql.contains("jsonb_array_elements(doc #> $3)"));
        assert!(sql.contains("e.elem #> $4"));
        assert!(sql.ends_with("ELSE FALSE END)"));
    }

    #[test]
    fn paths_split_into_segments() {
        assert_eq!(path_array("customer.address.city"), vec!["customer", "address", "city"]);
        assert_eq!(path_array("items.0"), vec!["items", "0"]);
    }
}
