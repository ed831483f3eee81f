//! Data models for the lending server

pub mod book;
pub mod borrow;
pub mod user;

// Re-export commonly used types
pub use book::{Book, BookQuery, BookResponse, CreateBook, Lifecycle, UpdateBook};
pub use borrow::{BorrowRecord, BorrowRecordResponse, BorrowStatus, LoanState, NewBorrow};
pub use user::{NewUser, Role, User, UserClaims, UserResponse};
