//! Borrow history repository for database operations

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres};

use crate::{
    error::AppResult,
    models::borrow::{BorrowRecord, BorrowRow, BorrowStatus, NewBorrow},
};

#[derive(Clone)]
pub struct BorrowsRepository {
    pool: Pool<Postgres>,
}

impl BorrowsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get borrow record by ID
    pub async fn get_by_id(&self, id: i64) -> AppResult<Option<BorrowRecord>> {
        sqlx::query_as::<_, BorrowRow>("SELECT * FROM borrow_histories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(BorrowRecord::try_from)
            .transpose()
    }

    /// Loan history for a book, newest first
    pub async fn for_book(&self, book_id: i64) -> AppResult<Vec<BorrowRecord>> {
        sqlx::query_as::<_, BorrowRow>(
            "SELECT * FROM borrow_histories WHERE book_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(BorrowRecord::try_from)
        .collect()
    }
}

pub(crate) async fn insert(conn: &mut PgConnection, borrow: &NewBorrow) -> AppResult<BorrowRecord> {
    let row = sqlx::query_as::<_, BorrowRow>(
        r#"
        INSERT INTO borrow_histories (book_id, user_id, borrowed_at, status)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(borrow.book_id)
    .bind(borrow.user_id)
    .bind(borrow.borrowed_at)
    .bind(BorrowStatus::Borrowed.as_str())
    .fetch_one(&mut *conn)
    .await?;

    row.try_into()
}

pub(crate) async fn get(conn: &mut PgConnection, id: i64) -> AppResult<Option<BorrowRecord>> {
    sqlx::query_as::<_, BorrowRow>("SELECT * FROM borrow_histories WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(BorrowRecord::try_from)
        .transpose()
}

/// The row lock taken by the UPDATE serializes concurrent returns of the
/// same record; the loser re-evaluates the status predicate and matches
/// nothing.
pub(crate) async fn mark_returned(
    conn: &mut PgConnection,
    id: i64,
    at: DateTime<Utc>,
) -> AppResult<Option<BorrowRecord>> {
    sqlx::query_as::<_, BorrowRow>(
        r#"
        UPDATE borrow_histories
        SET status = $2, returned_at = $3, updated_at = $3
        WHERE id = $1 AND status = $4
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(BorrowStatus::Returned.as_str())
    .bind(at)
    .bind(BorrowStatus::Borrowed.as_str())
    .fetch_optional(&mut *conn)
    .await?
    .map(BorrowRecord::try_from)
    .transpose()
}
