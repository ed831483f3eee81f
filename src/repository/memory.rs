//! In-process store with the same transactional semantics as Postgres
//!
//! Row locks are per-row async mutexes held by the transaction until it
//! ends. Writes are buffered inside the transaction and applied to the
//! shared tables in one step on commit, so other readers never observe a
//! partial transaction. Dropping a transaction without committing discards
//! its buffer and releases its locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex as SyncMutex, PoisonError,
    },
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Store, StoreTx};
use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, BookQuery, CreateBook, Lifecycle, UpdateBook},
        borrow::{BorrowRecord, LoanState, NewBorrow},
        user::{NewUser, User},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Book(i64),
    Borrow(i64),
}

#[derive(Default)]
struct Tables {
    books: BTreeMap<i64, Book>,
    borrows: BTreeMap<i64, BorrowRecord>,
    users: BTreeMap<i64, User>,
}

#[derive(Default)]
struct Sequences {
    books: AtomicI64,
    borrows: AtomicI64,
    users: AtomicI64,
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    // Only touched between awaits, so a blocking mutex is enough
    row_locks: SyncMutex<HashMap<RowKey, Arc<Mutex<()>>>>,
    sequences: Sequences,
}

/// Shared in-process store; clones share the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            held: HashMap::new(),
            books: HashMap::new(),
            borrows: HashMap::new(),
        }))
    }

    async fn insert_book(&self, book: &CreateBook) -> AppResult<Book> {
        if book.stock < 0 {
            return Err(AppError::InvalidStock("Stock cannot be negative".to_string()));
        }
        let now = Utc::now();
        let created = Book {
            id: next_id(&self.inner.sequences.books),
            title: book.title.clone(),
            author: book.author.clone(),
            price: book.price,
            stock: book.stock,
            created_at: now,
            updated_at: now,
            lifecycle: Lifecycle::Active,
        };
        let mut tables = self.inner.tables.lock().await;
        tables.books.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_book(&self, id: i64) -> AppResult<Option<Book>> {
        Ok(self.inner.tables.lock().await.books.get(&id).cloned())
    }

    async fn list_books(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        let needle = query.search_term().map(str::to_lowercase);
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .books
            .values()
            .filter(|book| book.is_active())
            .filter(|book| match &needle {
                Some(needle) => book.title.to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .skip(query.offset().max(0) as usize)
            .take(query.size().max(0) as usize)
            .cloned()
            .collect())
    }

    async fn latest_books(&self, limit: i64) -> AppResult<Vec<Book>> {
        let tables = self.inner.tables.lock().await;
        let mut books: Vec<Book> = tables
            .books
            .values()
            .filter(|book| book.is_active())
            .cloned()
            .collect();
        books.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        books.truncate(limit.max(0) as usize);
        Ok(books)
    }

    async fn find_borrow(&self, id: i64) -> AppResult<Option<BorrowRecord>> {
        Ok(self.inner.tables.lock().await.borrows.get(&id).cloned())
    }

    async fn borrows_for_book(&self, book_id: i64) -> AppResult<Vec<BorrowRecord>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .borrows
            .values()
            .rev()
            .filter(|record| record.book_id == book_id)
            .cloned()
            .collect())
    }

    async fn insert_user(&self, user: &NewUser) -> AppResult<User> {
        let mut tables = self.inner.tables.lock().await;
        if tables.users.values().any(|u| u.username == user.username) {
            return Err(AppError::Conflict(format!(
                "Username {} already exists",
                user.username
            )));
        }
        let now = Utc::now();
        let created = User {
            id: next_id(&self.inner.sequences.users),
            name: user.name.clone(),
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            role: user.role,
            created_at: now,
            updated_at: now,
            lifecycle: Lifecycle::Active,
        };
        tables.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_user(&self, id: i64) -> AppResult<Option<User>> {
        Ok(self.inner.tables.lock().await.users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.is_active() && u.username == username)
            .cloned())
    }

    async fn update_user_name(&self, id: i64, name: &str) -> AppResult<Option<User>> {
        let mut tables = self.inner.tables.lock().await;
        Ok(tables
            .users
            .get_mut(&id)
            .filter(|u| u.is_active())
            .map(|u| {
                u.name = name.to_string();
                u.updated_at = Utc::now();
                u.clone()
            }))
    }

    async fn soft_delete_user(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let mut tables = self.inner.tables.lock().await;
        match tables.users.get_mut(&id).filter(|u| u.is_active()) {
            Some(user) => {
                user.lifecycle = Lifecycle::Deleted { at };
                user.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Transaction over a [`MemoryStore`]
pub struct MemoryTx {
    inner: Arc<Inner>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    books: HashMap<i64, Book>,
    borrows: HashMap<i64, BorrowRecord>,
}

impl MemoryTx {
    /// Block until the row lock is ours; re-entrant within the transaction
    async fn acquire(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let lock = {
            let mut locks = self
                .inner
                .row_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };
        let guard = lock.lock_owned().await;
        self.held.insert(key, guard);
    }

    async fn current_book(&self, id: i64) -> Option<Book> {
        if let Some(book) = self.books.get(&id) {
            return Some(book.clone());
        }
        self.inner.tables.lock().await.books.get(&id).cloned()
    }

    async fn current_borrow(&self, id: i64) -> Option<BorrowRecord> {
        if let Some(record) = self.borrows.get(&id) {
            return Some(record.clone());
        }
        self.inner.tables.lock().await.borrows.get(&id).cloned()
    }

    /// Drop every held row lock and forget locks nobody else is using
    fn release(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys: Vec<RowKey> = self.held.drain().map(|(key, _guard)| key).collect();
        let mut locks = self
            .inner
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            // A waiter or holder keeps its own clone alive
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }

    async fn locked_book(&mut self, id: i64) -> AppResult<Book> {
        self.acquire(RowKey::Book(id)).await;
        self.current_book(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_book(&mut self, id: i64) -> AppResult<Option<Book>> {
        self.acquire(RowKey::Book(id)).await;
        Ok(self.current_book(id).await)
    }

    async fn adjust_stock(&mut self, id: i64, delta: i32) -> AppResult<i32> {
        let mut book = self.locked_book(id).await?;
        let stock = book.stock.checked_add(delta).ok_or_else(|| {
            AppError::InvalidStock(format!("Stock of book {} is out of range", id))
        })?;
        if stock < 0 {
            return Err(AppError::InvalidStock(format!(
                "Stock of book {} cannot go below zero",
                id
            )));
        }
        book.stock = stock;
        book.updated_at = Utc::now();
        self.books.insert(id, book);
        Ok(stock)
    }

    async fn update_book(&mut self, id: i64, changes: &UpdateBook) -> AppResult<Book> {
        let mut book = self.locked_book(id).await?;
        if !book.is_active() {
            return Err(AppError::NotFound(format!("Book with id {} not found", id)));
        }
        book.title = changes.title.clone();
        book.author = changes.author.clone();
        book.price = changes.price;
        book.stock = changes.stock;
        book.updated_at = Utc::now();
        self.books.insert(id, book.clone());
        Ok(book)
    }

    async fn soft_delete_book(&mut self, id: i64, at: DateTime<Utc>) -> AppResult<()> {
        let mut book = self.locked_book(id).await?;
        if !book.is_active() {
            return Err(AppError::NotFound(format!("Book with id {} not found", id)));
        }
        book.lifecycle = Lifecycle::Deleted { at };
        book.updated_at = at;
        self.books.insert(id, book);
        Ok(())
    }

    async fn active_user_exists(&mut self, id: i64) -> AppResult<bool> {
        let tables = self.inner.tables.lock().await;
        Ok(tables.users.get(&id).map_or(false, User::is_active))
    }

    async fn insert_borrow(&mut self, borrow: &NewBorrow) -> AppResult<BorrowRecord> {
        let id = next_id(&self.inner.sequences.borrows);
        self.acquire(RowKey::Borrow(id)).await;
        let record = BorrowRecord {
            id,
            book_id: borrow.book_id,
            user_id: borrow.user_id,
            borrowed_at: borrow.borrowed_at,
            state: LoanState::Borrowed,
            created_at: borrow.borrowed_at,
            updated_at: borrow.borrowed_at,
        };
        self.borrows.insert(id, record.clone());
        Ok(record)
    }

    async fn get_borrow(&mut self, id: i64) -> AppResult<Option<BorrowRecord>> {
        Ok(self.current_borrow(id).await)
    }

    async fn mark_returned(
        &mut self,
        id: i64,
        at: DateTime<Utc>,
    ) -> AppResult<Option<BorrowRecord>> {
        self.acquire(RowKey::Borrow(id)).await;
        match self.current_borrow(id).await {
            Some(record) if record.state == LoanState::Borrowed => {
                let returned = record.into_returned(at)?;
                self.borrows.insert(id, returned.clone());
                Ok(Some(returned))
            }
            _ => Ok(None),
        }
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let mut this = *self;
        {
            let mut tables = this.inner.tables.lock().await;
            for (id, book) in this.books.drain() {
                tables.books.insert(id, book);
            }
            for (id, record) in this.borrows.drain() {
                tables.borrows.insert(id, record);
            }
        }
        // Row locks are released only after the writes are visible
        this.release();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn new_book(stock: i32) -> CreateBook {
        CreateBook {
            title: "Snow Crash".into(),
            author: "Neal Stephenson".into(),
            price: Decimal::new(1500, 2),
            stock,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let book = store.insert_book(&new_book(2)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.adjust_stock(book.id, -1).await.unwrap(), 1);
        assert_eq!(store.find_book(book.id).await.unwrap().unwrap().stock, 2);

        tx.commit().await.unwrap();
        assert_eq!(store.find_book(book.id).await.unwrap().unwrap().stock, 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes_and_releases_lock() {
        let store = MemoryStore::new();
        let book = store.insert_book(&new_book(2)).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.lock_book(book.id).await.unwrap();
            tx.adjust_stock(book.id, -2).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let locked = tx.lock_book(book.id).await.unwrap().unwrap();
        assert_eq!(locked.stock, 2);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_stock_never_negative() {
        let store = MemoryStore::new();
        let book = store.insert_book(&new_book(0)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.adjust_stock(book.id, -1).await,
            Err(AppError::InvalidStock(_))
        ));
    }

    #[tokio::test]
    async fn test_stock_overflow_is_a_stock_error() {
        let store = MemoryStore::new();
        let book = store.insert_book(&new_book(i32::MAX)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.adjust_stock(book.id, 1).await,
            Err(AppError::InvalidStock(_))
        ));
        assert_eq!(tx.adjust_stock(book.id, -1).await.unwrap(), i32::MAX - 1);
    }

    fn tracked_locks(store: &MemoryStore) -> usize {
        store.inner.row_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_row_locks_are_forgotten_after_release() {
        let store = MemoryStore::new();
        let book = store.insert_book(&new_book(3)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.lock_book(book.id).await.unwrap();
        tx.lock_book(404).await.unwrap();
        assert_eq!(tracked_locks(&store), 2);
        tx.commit().await.unwrap();
        assert_eq!(tracked_locks(&store), 0);

        {
            let mut tx = store.begin().await.unwrap();
            tx.adjust_stock(book.id, -1).await.unwrap();
        }
        assert_eq!(tracked_locks(&store), 0);

        let mut tx = store.begin().await.unwrap();
        tx.lock_book(book.id).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(tracked_locks(&store), 0);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_transaction() {
        let store = MemoryStore::new();
        let book = store.insert_book(&new_book(1)).await.unwrap();

        let book_id = book.id;

        let mut first = store.begin().await.unwrap();
        first.lock_book(book_id).await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut second = store.begin().await.unwrap();
                let seen = second.lock_book(book_id).await.unwrap().unwrap();
                second.rollback().await.unwrap();
                seen.stock
            })
        };

        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        first.adjust_stock(book_id, -1).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(contender.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_returned_is_conditional() {
        let store = MemoryStore::new();
        let book = store.insert_book(&new_book(1)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let record = tx
            .insert_borrow(&NewBorrow {
                book_id: book.id,
                user_id: 1,
                borrowed_at: Utc::now(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.mark_returned(record.id, Utc::now()).await.unwrap().is_some());
        assert!(tx.mark_returned(record.id, Utc::now()).await.unwrap().is_none());
        tx.commit().await.unwrap();

        let stored = store.find_borrow(record.id).await.unwrap().unwrap();
        assert!(stored.returned_at().is_some());
    }
}
