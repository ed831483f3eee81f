//! Business logic services

pub mod cache;
pub mod catalog;
pub mod loans;
pub mod redis;
pub mod users;

use std::sync::Arc;

use crate::{config::AppConfig, repository::Store};
use cache::Cache;

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub catalog: catalog::CatalogService,
    pub loans: loans::LoansService,
    pub users: users::UsersService,
}

impl Services {
    /// Create all services over a shared store and cache
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>, config: &AppConfig) -> Self {
        Self {
            catalog: catalog::CatalogService::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                config.cache.clone(),
            ),
            loans: loans::LoansService::new(Arc::clone(&store), cache),
            users: users::UsersService::new(store, config.auth.clone()),
        }
    }
}
