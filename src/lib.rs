// ABOUTME: Library root for mongo-custodian
// ABOUTME: Task engine for MongoDB backup, restore, import and retention jobs

pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod models;
pub mod process;
pub mod progress;
pub mod scheduler;
pub mod store;
pub mod tasks;

pub use config::Config;
pub use engine::{Deletion, Engine, EngineContext};
pub use error::EngineError;
