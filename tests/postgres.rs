//! Lending consistency tests against PostgreSQL
//!
//! Each test gets a fresh database with the migrations applied.
//! Run with: DATABASE_URL=postgres://... cargo test --test postgres -- --ignored

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;

use lending_server::{
    config::AppConfig,
    error::AppError,
    models::{
        book::CreateBook,
        borrow::BorrowStatus,
        user::{NewUser, Role},
    },
    repository::{Repository, Store},
    services::{cache::MemoryCache, Services},
};

fn services(store: Arc<dyn Store>) -> Services {
    Services::new(store, Arc::new(MemoryCache::new()), &AppConfig::default())
}

async fn add_book(store: &dyn Store, stock: i32) -> i64 {
    store
        .insert_book(&CreateBook {
            title: "The Left Hand of Darkness".into(),
            author: "Ursula K. Le Guin".into(),
            price: Decimal::new(1450, 2),
            stock,
        })
        .await
        .unwrap()
        .id
}

async fn add_user(store: &dyn Store, username: &str) -> i64 {
    store
        .insert_user(&NewUser {
            name: username.into(),
            username: username.into(),
            password_hash: "unused".into(),
            role: Role::User,
        })
        .await
        .unwrap()
        .id
}

async fn stock_of(store: &dyn Store, book_id: i64) -> i32 {
    store.find_book(book_id).await.unwrap().unwrap().stock
}

#[sqlx::test]
#[ignore = "needs DATABASE_URL"]
async fn test_concurrent_borrows_never_oversell(pool: PgPool) {
    let store: Arc<dyn Store> = Arc::new(Repository::new(pool));
    let services = services(store.clone());
    let user_id = add_user(store.as_ref(), "reader").await;
    let book_id = add_book(store.as_ref(), 3).await;

    let attempts: Vec<_> = (0..12)
        .map(|_| {
            let loans = services.loans.clone();
            tokio::spawn(async move { loans.borrow(book_id, user_id).await })
        })
        .collect();

    let mut borrowed = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => borrowed += 1,
            Err(AppError::InvalidStock(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(borrowed, 3);
    assert_eq!(stock_of(store.as_ref(), book_id).await, 0);
    assert_eq!(services.loans.history_for_book(book_id).await.unwrap().len(), 3);
}

#[sqlx::test]
#[ignore = "needs DATABASE_URL"]
async fn test_concurrent_returns_restore_stock_once(pool: PgPool) {
    let store: Arc<dyn Store> = Arc::new(Repository::new(pool));
    let services = services(store.clone());
    let user_id = add_user(store.as_ref(), "reader").await;
    let book_id = add_book(store.as_ref(), 1).await;
    let history_id = services.loans.borrow(book_id, user_id).await.unwrap().id;

    let returns: Vec<_> = (0..4)
        .map(|_| {
            let loans = services.loans.clone();
            tokio::spawn(async move { loans.return_book(history_id, book_id).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in returns {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(AppError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(stock_of(store.as_ref(), book_id).await, 1);
    assert_eq!(
        services.loans.get_record(history_id).await.unwrap().status(),
        BorrowStatus::Returned
    );
}

#[sqlx::test]
#[ignore = "needs DATABASE_URL"]
async fn test_stock_floor_is_enforced_by_the_table(pool: PgPool) {
    let store = Repository::new(pool);
    let book_id = add_book(&store, 0).await;

    let mut tx = store.begin().await.unwrap();
    let result = tx.adjust_stock(book_id, -1).await;
    assert!(matches!(result, Err(AppError::InvalidStock(_))));
    tx.rollback().await.unwrap();

    assert_eq!(stock_of(&store, book_id).await, 0);
}

#[sqlx::test]
#[ignore = "needs DATABASE_URL"]
async fn test_stock_overflow_is_a_stock_error(pool: PgPool) {
    let store = Repository::new(pool);
    let book_id = add_book(&store, i32::MAX).await;

    let mut tx = store.begin().await.unwrap();
    let result = tx.adjust_stock(book_id, 1).await;
    assert!(matches!(result, Err(AppError::InvalidStock(_))));
    tx.rollback().await.unwrap();

    assert_eq!(stock_of(&store, book_id).await, i32::MAX);
}

#[sqlx::test]
#[ignore = "needs DATABASE_URL"]
async fn test_mark_returned_only_moves_borrowed_records(pool: PgPool) {
    let store: Arc<dyn Store> = Arc::new(Repository::new(pool));
    let services = services(store.clone());
    let user_id = add_user(store.as_ref(), "reader").await;
    let book_id = add_book(store.as_ref(), 1).await;
    let history_id = services.loans.borrow(book_id, user_id).await.unwrap().id;

    let mut tx = store.begin().await.unwrap();
    let first = tx.mark_returned(history_id, Utc::now()).await.unwrap();
    assert_eq!(first.unwrap().status(), BorrowStatus::Returned);
    assert!(tx.mark_returned(history_id, Utc::now()).await.unwrap().is_none());
    tx.rollback().await.unwrap();

    // Rolled back, so the loan is still open
    assert_eq!(
        services.loans.get_record(history_id).await.unwrap().status(),
        BorrowStatus::Borrowed
    );
}
