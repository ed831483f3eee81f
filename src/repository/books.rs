//! Books repository for database operations

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::book::{Book, BookQuery, BookRow, CreateBook, UpdateBook},
};

#[derive(Clone)]
pub struct BooksRepository {
    pool: Pool<Postgres>,
}

impl BooksRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Create a new book
    pub async fn create(&self, book: &CreateBook) -> AppResult<Book> {
        let row = sqlx::query_as::<_, BookRow>(
            r#"
            INSERT INTO books (title, author, price, stock)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&book.title)
        .bind(&book.author)
        .bind(book.price)
        .bind(book.stock)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    /// Get book by ID, deleted or not
    pub async fn get_by_id(&self, id: i64) -> AppResult<Option<Book>> {
        let row = sqlx::query_as::<_, BookRow>("SELECT * FROM books WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Book::from))
    }

    /// List non-deleted books with optional title search
    pub async fn list(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        let pattern = query.search_term().map(|term| format!("%{}%", escape_like(term)));

        let rows = sqlx::query_as::<_, BookRow>(
            r#"
            SELECT * FROM books
            WHERE deleted_at IS NULL
              AND ($1::TEXT IS NULL OR title ILIKE $1)
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(pattern)
        .bind(query.size())
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Book::from).collect())
    }

    /// Most recently created books
    pub async fn latest(&self, limit: i64) -> AppResult<Vec<Book>> {
        let rows = sqlx::query_as::<_, BookRow>(
            r#"
            SELECT * FROM books
            WHERE deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Book::from).collect())
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// `SELECT ... FOR UPDATE` on one book row
pub(crate) async fn lock(conn: &mut PgConnection, id: i64) -> AppResult<Option<Book>> {
    let row = sqlx::query_as::<_, BookRow>("SELECT * FROM books WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(Book::from))
}

pub(crate) async fn adjust_stock(conn: &mut PgConnection, id: i64, delta: i32) -> AppResult<i32> {
    let stock = sqlx::query_scalar::<_, i32>(
        r#"
        UPDATE books
        SET stock = stock + $2, updated_at = NOW()
        WHERE id = $1
        RETURNING stock
        "#,
    )
    .bind(id)
    .bind(delta)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_check_violation() => {
            AppError::InvalidStock(format!("Stock of book {} cannot go below zero", id))
        }
        // numeric_value_out_of_range
        sqlx::Error::Database(ref db) if db.code().as_deref() == Some("22003") => {
            AppError::InvalidStock(format!("Stock of book {} is out of range", id))
        }
        other => AppError::Database(other),
    })?;

    stock.ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
}

pub(crate) async fn update(conn: &mut PgConnection, id: i64, changes: &UpdateBook) -> AppResult<Book> {
    sqlx::query_as::<_, BookRow>(
        r#"
        UPDATE books
        SET title = $2, author = $3, price = $4, stock = $5, updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NULL
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&changes.title)
    .bind(&changes.author)
    .bind(changes.price)
    .bind(changes.stock)
    .fetch_optional(&mut *conn)
    .await?
    .map(Book::from)
    .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
}

pub(crate) async fn soft_delete(conn: &mut PgConnection, id: i64, at: DateTime<Utc>) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE books SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Book with id {} not found", id)));
    }
    Ok(())
}
