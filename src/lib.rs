pub mod catalog;
pub mod config;
pub mod database;
pub mod filter;
pub mod recovery;
pub mod storage;
pub mod worker;

pub use config::DatabaseConfig;
pub use database::Database;
pub use filter::{CompareOp, DataFilter, LogicOp};
