pub mod db;
pub mod memory;
pub mod store;

pub use db::{create_db, DbPool, SqliteStore};
pub use memory::MemoryStore;
pub use store::{StoreError, TransactionStore};
