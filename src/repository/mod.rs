//! Repository layer for database operations
//!
//! Services talk to storage through [`Store`] for lock-free reads and
//! single-statement writes, and through [`StoreTx`] for anything that must
//! hold row locks or commit several writes together. Two implementations
//! exist: [`Repository`] on Postgres and [`memory::MemoryStore`] in process.

pub mod books;
pub mod borrows;
pub mod memory;
pub mod transaction;
pub mod users;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::{
        book::{Book, BookQuery, CreateBook, UpdateBook},
        borrow::{BorrowRecord, NewBorrow},
        user::{NewUser, User},
    },
};

/// Authoritative storage for books, users and loan history
#[async_trait]
pub trait Store: Send + Sync {
    /// Connectivity check
    async fn ping(&self) -> AppResult<()>;

    /// Open a transaction. Dropping the returned handle without committing
    /// rolls it back and releases every lock it holds.
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>>;

    async fn insert_book(&self, book: &CreateBook) -> AppResult<Book>;
    /// Fetch a book row, soft-deleted rows included
    async fn find_book(&self, id: i64) -> AppResult<Option<Book>>;
    /// Page through non-deleted books ordered by id
    async fn list_books(&self, query: &BookQuery) -> AppResult<Vec<Book>>;
    /// Most recently created non-deleted books, newest first
    async fn latest_books(&self, limit: i64) -> AppResult<Vec<Book>>;

    async fn find_borrow(&self, id: i64) -> AppResult<Option<BorrowRecord>>;
    /// Loan history of a book, newest first
    async fn borrows_for_book(&self, book_id: i64) -> AppResult<Vec<BorrowRecord>>;

    /// Fails with `Conflict` when the username is taken
    async fn insert_user(&self, user: &NewUser) -> AppResult<User>;
    async fn find_user(&self, id: i64) -> AppResult<Option<User>>;
    /// Non-deleted user by username
    async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>>;
    /// Returns `None` when no non-deleted user has this id
    async fn update_user_name(&self, id: i64, name: &str) -> AppResult<Option<User>>;
    /// Returns `false` when no non-deleted user has this id
    async fn soft_delete_user(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool>;
}

/// An open transaction
#[async_trait]
pub trait StoreTx: Send {
    /// Take the exclusive row lock on a book and read it under the lock.
    /// The lock is held until commit or rollback.
    async fn lock_book(&mut self, id: i64) -> AppResult<Option<Book>>;

    /// Add `delta` to a book's stock and return the new value. Fails if the
    /// result would be negative.
    async fn adjust_stock(&mut self, id: i64, delta: i32) -> AppResult<i32>;

    async fn update_book(&mut self, id: i64, changes: &UpdateBook) -> AppResult<Book>;

    async fn soft_delete_book(&mut self, id: i64, at: DateTime<Utc>) -> AppResult<()>;

    async fn active_user_exists(&mut self, id: i64) -> AppResult<bool>;

    async fn insert_borrow(&mut self, borrow: &NewBorrow) -> AppResult<BorrowRecord>;

    async fn get_borrow(&mut self, id: i64) -> AppResult<Option<BorrowRecord>>;

    /// Conditionally move a record from `borrowed` to `returned`.
    /// Returns `None` if the record is missing or no longer `borrowed`.
    async fn mark_returned(
        &mut self,
        id: i64,
        at: DateTime<Utc>,
    ) -> AppResult<Option<BorrowRecord>>;

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}

/// Commit when `outcome` succeeded, roll back explicitly otherwise
pub async fn finish<T>(tx: Box<dyn StoreTx>, outcome: AppResult<T>) -> AppResult<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Postgres-backed store holding the connection pool
#[derive(Clone)]
pub struct Repository {
    pub pool: Pool<Postgres>,
    pub books: books::BooksRepository,
    pub borrows: borrows::BorrowsRepository,
    pub users: users::UsersRepository,
}

impl Repository {
    /// Create a new repository with the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            books: books::BooksRepository::new(pool.clone()),
            borrows: borrows::BorrowsRepository::new(pool.clone()),
            users: users::UsersRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl Store for Repository {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(transaction::PgTransaction::new(tx)))
    }

    async fn insert_book(&self, book: &CreateBook) -> AppResult<Book> {
        self.books.create(book).await
    }

    async fn find_book(&self, id: i64) -> AppResult<Option<Book>> {
        self.books.get_by_id(id).await
    }

    async fn list_books(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        self.books.list(query).await
    }

    async fn latest_books(&self, limit: i64) -> AppResult<Vec<Book>> {
        self.books.latest(limit).await
    }

    async fn find_borrow(&self, id: i64) -> AppResult<Option<BorrowRecord>> {
        self.borrows.get_by_id(id).await
    }

    async fn borrows_for_book(&self, book_id: i64) -> AppResult<Vec<BorrowRecord>> {
        self.borrows.for_book(book_id).await
    }

    async fn insert_user(&self, user: &NewUser) -> AppResult<User> {
        self.users.create(user).await
    }

    async fn find_user(&self, id: i64) -> AppResult<Option<User>> {
        self.users.get_by_id(id).await
    }

    async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        self.users.get_by_username(username).await
    }

    async fn update_user_name(&self, id: i64, name: &str) -> AppResult<Option<User>> {
        self.users.update_name(id, name).await
    }

    async fn soft_delete_user(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        self.users.soft_delete(id, at).await
    }
}
