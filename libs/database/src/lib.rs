//! Redis connection management for the song request services.
//!
//! Both the listener and the delivery worker talk to a single Redis
//! deployment: connection records live in hashes, delivery requests flow
//! through a stream. This crate owns getting a healthy
//! [`ConnectionManager`](redis::aio::ConnectionManager) at startup.
//!
//! # Features
//!
//! - `config` (default) - `RedisConfig::from_env` via `core_config::FromEnv`
//!
//! ```ignore
//! use core_config::FromEnv;
//! use database::redis::{RedisConfig, connect_from_config_with_retry};
//!
//! let config = RedisConfig::from_env()?;
//! let conn = connect_from_config_with_retry(config, None).await?;
//! ```

pub mod common;
pub mod redis;

pub use common::{DatabaseError, DatabaseResult, RetryConfig};
