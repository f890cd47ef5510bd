use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};

use tally_core::{Category, CategoryRef, ProcessingStatus, RawRow, Transaction};

use crate::store::{StoreError, TransactionStore};

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            original_transaction_id TEXT NOT NULL,
            bank_source_id TEXT NOT NULL,
            transaction_date TEXT NOT NULL,
            transaction_type TEXT NOT NULL,
            description TEXT NOT NULL,
            notes TEXT,
            country TEXT,
            original_amount TEXT NOT NULL,
            original_currency TEXT NOT NULL,
            reporting_amount TEXT,
            exchange_rate TEXT,
            category_ai_id TEXT,
            category_ai_name TEXT,
            category_confidence TEXT,
            category_manual_id TEXT,
            category_manual_name TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            normalised_at TEXT,
            categorised_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_original_id ON transactions(original_transaction_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            examples TEXT NOT NULL DEFAULT '[]',
            is_active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            row_number INTEGER NOT NULL,
            fields TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Sqlite-backed implementation of the persistence port.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        SqliteStore { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Queues a raw row for a later normalization run.
    pub async fn add_source_row(&self, row: &RawRow) -> Result<(), StoreError> {
        let fields = serde_json::to_string(&row.fields).unwrap_or_else(|_| "[]".to_string());
        sqlx::query("INSERT INTO source_rows (source_id, row_number, fields) VALUES (?, ?, ?)")
            .bind(&row.source_id)
            .bind(row.row_number as i64)
            .bind(fields)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_category(&self, category: &Category) -> Result<(), StoreError> {
        let examples =
            serde_json::to_string(&category.examples).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            r#"
            INSERT INTO categories (id, name, description, examples, is_active)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                examples = excluded.examples,
                is_active = excluded.is_active
            "#,
        )
        .bind(&category.id)
        .bind(&category.name)
        .bind(&category.description)
        .bind(examples)
        .bind(category.is_active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for SqliteStore {
    async fn read_source_rows(&self, source_id: &str) -> Result<Vec<RawRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT source_id, row_number, fields FROM source_rows WHERE source_id = ? ORDER BY id",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let fields_json: String = r.get("fields");
                let fields: Vec<String> =
                    serde_json::from_str(&fields_json).map_err(|e| StoreError::Corrupt {
                        id: format!("source_row:{source_id}"),
                        reason: e.to_string(),
                    })?;
                Ok(RawRow {
                    source_id: r.get("source_id"),
                    row_number: r.get::<i64, _>("row_number") as usize,
                    fields,
                })
            })
            .collect()
    }

    async fn find_by_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE status = ? ORDER BY created_at, id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_transaction).collect()
    }

    async fn write_batch(&self, transactions: &[Transaction]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for t in transactions {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO transactions (
                    id, original_transaction_id, bank_source_id, transaction_date,
                    transaction_type, description, notes, country,
                    original_amount, original_currency, reporting_amount, exchange_rate,
                    category_ai_id, category_ai_name, category_confidence,
                    category_manual_id, category_manual_name,
                    status, created_at, modified_at, normalised_at, categorised_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&t.id)
            .bind(&t.original_transaction_id)
            .bind(&t.bank_source_id)
            .bind(t.transaction_date.to_string())
            .bind(t.transaction_type.to_string())
            .bind(&t.description)
            .bind(&t.notes)
            .bind(&t.country)
            .bind(t.original_amount.to_string())
            .bind(&t.original_currency)
            .bind(t.reporting_amount.map(|d| d.to_string()))
            .bind(t.exchange_rate.map(|d| d.to_string()))
            .bind(t.category_ai.as_ref().map(|c| c.id.clone()))
            .bind(t.category_ai.as_ref().map(|c| c.name.clone()))
            .bind(t.category_confidence.map(|d| d.to_string()))
            .bind(t.category_manual.as_ref().map(|c| c.id.clone()))
            .bind(t.category_manual.as_ref().map(|c| c.name.clone()))
            .bind(t.status.as_str())
            .bind(t.created_at.to_rfc3339())
            .bind(t.modified_at.to_rfc3339())
            .bind(t.normalised_at.map(|d| d.to_rfc3339()))
            .bind(t.categorised_at.map(|d| d.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_category(
        &self,
        transaction_id: &str,
        category: &CategoryRef,
        is_manual: bool,
        confidence: Option<Decimal>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = if is_manual {
            sqlx::query(
                r#"
                UPDATE transactions
                SET category_manual_id = ?, category_manual_name = ?, modified_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&category.id)
            .bind(&category.name)
            .bind(&now)
            .bind(transaction_id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE transactions
                SET category_ai_id = ?, category_ai_name = ?, category_confidence = ?,
                    status = 'CATEGORISED', categorised_at = ?, modified_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&category.id)
            .bind(&category.name)
            .bind(confidence.map(|d| d.to_string()))
            .bind(&now)
            .bind(&now)
            .bind(transaction_id)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(transaction_id.to_string()));
        }
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, description, examples, is_active FROM categories WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let examples_json: String = r.get("examples");
                Category {
                    id: r.get("id"),
                    name: r.get("name"),
                    description: r.get("description"),
                    examples: serde_json::from_str(&examples_json).unwrap_or_default(),
                    is_active: r.get::<i64, _>("is_active") != 0,
                }
            })
            .collect())
    }
}

fn decode_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction, StoreError> {
    let id: String = row.get("id");
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };

    let date_str: String = row.get("transaction_date");
    let transaction_date =
        NaiveDate::from_str(&date_str).map_err(|e| corrupt(e.to_string()))?;

    let type_str: String = row.get("transaction_type");
    let transaction_type = match type_str.as_str() {
        "DEBIT" => tally_core::TransactionType::Debit,
        "CREDIT" => tally_core::TransactionType::Credit,
        other => return Err(corrupt(format!("unknown transaction type '{other}'"))),
    };

    let status_str: String = row.get("status");
    let status: ProcessingStatus = status_str.parse().map_err(|e| corrupt(e))?;

    let decimal = |col: &str| -> Result<Option<Decimal>, StoreError> {
        row.get::<Option<String>, _>(col)
            .map(|s| Decimal::from_str(&s).map_err(|e| corrupt(e.to_string())))
            .transpose()
    };
    let timestamp = |col: &str| -> Result<Option<DateTime<Utc>>, StoreError> {
        row.get::<Option<String>, _>(col)
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| corrupt(e.to_string()))
            })
            .transpose()
    };
    let category = |id_col: &str, name_col: &str| -> Option<CategoryRef> {
        let cat_id: Option<String> = row.get(id_col);
        let cat_name: Option<String> = row.get(name_col);
        match (cat_id, cat_name) {
            (Some(id), Some(name)) => Some(CategoryRef { id, name }),
            _ => None,
        }
    };

    Ok(Transaction {
        id: id.clone(),
        original_transaction_id: row.get("original_transaction_id"),
        bank_source_id: row.get("bank_source_id"),
        transaction_date,
        transaction_type,
        description: row.get("description"),
        notes: row.get("notes"),
        country: row.get("country"),
        original_amount: decimal("original_amount")?
            .ok_or_else(|| corrupt("missing original amount".to_string()))?,
        original_currency: row.get("original_currency"),
        reporting_amount: decimal("reporting_amount")?,
        exchange_rate: decimal("exchange_rate")?,
        category_ai: category("category_ai_id", "category_ai_name"),
        category_confidence: decimal("category_confidence")?,
        category_manual: category("category_manual_id", "category_manual_name"),
        status,
        created_at: timestamp("created_at")?
            .ok_or_else(|| corrupt("missing created_at".to_string()))?,
        modified_at: timestamp("modified_at")?
            .ok_or_else(|| corrupt("missing modified_at".to_string()))?,
        normalised_at: timestamp("normalised_at")?,
        categorised_at: timestamp("categorised_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tally_core::TransactionType;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("tally.db")).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn tx(reference: &str) -> Transaction {
        let mut t = Transaction::new(
            reference.to_string(),
            "monzo".to_string(),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            TransactionType::Debit,
            "TESCO STORES 123".to_string(),
            Decimal::new(1299, 2),
            "GBP".to_string(),
        );
        t.set_status(ProcessingStatus::Normalised).unwrap();
        t
    }

    #[tokio::test]
    async fn write_batch_round_trips() {
        let (_dir, store) = store().await;
        let t = tx("ref-1");
        store.write_batch(&[t.clone()]).await.unwrap();

        let loaded = store
            .find_by_status(ProcessingStatus::Normalised)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, t.id);
        assert_eq!(loaded[0].original_transaction_id, "ref-1");
        assert_eq!(loaded[0].original_amount, Decimal::new(1299, 2));
        assert!(loaded[0].reporting_amount.is_none());
    }

    #[tokio::test]
    async fn write_batch_upserts_by_id() {
        let (_dir, store) = store().await;
        let mut t = tx("ref-1");
        store.write_batch(&[t.clone()]).await.unwrap();

        t.description = "TESCO EXPRESS".to_string();
        store.write_batch(&[t.clone()]).await.unwrap();

        let loaded = store
            .find_by_status(ProcessingStatus::Normalised)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].description, "TESCO EXPRESS");
    }

    #[tokio::test]
    async fn update_ai_category_advances_status() {
        let (_dir, store) = store().await;
        let t = tx("ref-1");
        store.write_batch(&[t.clone()]).await.unwrap();

        store
            .update_category(
                &t.id,
                &CategoryRef {
                    id: "groceries".to_string(),
                    name: "Groceries".to_string(),
                },
                false,
                Some(Decimal::from(88)),
            )
            .await
            .unwrap();

        let loaded = store
            .find_by_status(ProcessingStatus::Categorised)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].category_ai.as_ref().unwrap().id, "groceries");
        assert_eq!(loaded[0].category_confidence, Some(Decimal::from(88)));
        assert!(loaded[0].categorised_at.is_some());
    }

    #[tokio::test]
    async fn update_manual_category_leaves_status_alone() {
        let (_dir, store) = store().await;
        let t = tx("ref-1");
        store.write_batch(&[t.clone()]).await.unwrap();

        store
            .update_category(
                &t.id,
                &CategoryRef {
                    id: "groceries".to_string(),
                    name: "Groceries".to_string(),
                },
                true,
                None,
            )
            .await
            .unwrap();

        let loaded = store
            .find_by_status(ProcessingStatus::Normalised)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].category_manual.as_ref().unwrap().id, "groceries");
        assert!(loaded[0].category_ai.is_none());
    }

    #[tokio::test]
    async fn update_category_unknown_id_is_not_found() {
        let (_dir, store) = store().await;
        let err = store
            .update_category(
                "missing",
                &CategoryRef {
                    id: "x".to_string(),
                    name: "X".to_string(),
                },
                false,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn source_rows_round_trip_in_order() {
        let (_dir, store) = store().await;
        store
            .add_source_row(&RawRow::new("monzo", 1, vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        store
            .add_source_row(&RawRow::new("monzo", 2, vec!["c".into()]))
            .await
            .unwrap();
        store
            .add_source_row(&RawRow::new("starling", 1, vec!["z".into()]))
            .await
            .unwrap();

        let rows = store.read_source_rows("monzo").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields, vec!["a", "b"]);
        assert_eq!(rows[1].row_number, 2);
    }

    #[tokio::test]
    async fn categories_filter_inactive() {
        let (_dir, store) = store().await;
        store
            .save_category(&Category::new("groceries", "Groceries", "Food shops"))
            .await
            .unwrap();
        let mut retired = Category::new("old", "Old", "");
        retired.is_active = false;
        store.save_category(&retired).await.unwrap();

        let cats = store.list_categories().await.unwrap();
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].id, "groceries");
    }
}
