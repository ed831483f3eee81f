//! Postgres transaction handle

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};

use super::{books, borrows, users, StoreTx};
use crate::{
    error::AppResult,
    models::{
        book::{Book, UpdateBook},
        borrow::{BorrowRecord, NewBorrow},
    },
};

/// Wraps a `sqlx::Transaction`, which issues a rollback when dropped
/// uncommitted (early return, panic unwinding, or a cancelled future).
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl StoreTx for PgTransaction {
    async fn lock_book(&mut self, id: i64) -> AppResult<Option<Book>> {
        books::lock(&mut self.tx, id).await
    }

    async fn adjust_stock(&mut self, id: i64, delta: i32) -> AppResult<i32> {
        books::adjust_stock(&mut self.tx, id, delta).await
    }

    async fn update_book(&mut self, id: i64, changes: &UpdateBook) -> AppResult<Book> {
        books::update(&mut self.tx, id, changes).await
    }

    async fn soft_delete_book(&mut self, id: i64, at: DateTime<Utc>) -> AppResult<()> {
        books::soft_delete(&mut self.tx, id, at).await
    }

    async fn active_user_exists(&mut self, id: i64) -> AppResult<bool> {
        users::active_exists(&mut self.tx, id).await
    }

    async fn insert_borrow(&mut self, borrow: &NewBorrow) -> AppResult<BorrowRecord> {
        borrows::insert(&mut self.tx, borrow).await
    }

    async fn get_borrow(&mut self, id: i64) -> AppResult<Option<BorrowRecord>> {
        borrows::get(&mut self.tx, id).await
    }

    async fn mark_returned(
        &mut self,
        id: i64,
        at: DateTime<Utc>,
    ) -> AppResult<Option<BorrowRecord>> {
        borrows::mark_returned(&mut self.tx, id, at).await
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
