//! # mesh-storage
//!
//! Key-value persistence layer for the meshwork overlay.
//!
//! This crate provides a RocksDB-based storage abstraction with support for:
//! - Column families for different record types (physical connections, nodes)
//! - Durable (fsync) writes for score accounting
//! - Simple iteration for load-on-open stores
//!
//! ## Column Families
//!
//! - `PhysicalConns`: per-host connection records (evil score) keyed by host
//! - `Nodes`: known node addresses with connect info keyed by address
//! - `Metadata`: node metadata and configuration

mod database;
mod error;

pub use database::{ColumnFamily, Database};
pub use error::{StorageError, StorageResult};

/// Storage trait for abstracting database operations.
///
/// This allows for easy testing with mock implementations.
pub trait Storage: Send + Sync {
    /// Get a value by key from a column family.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Put a key-value pair into a column family.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Put a key-value pair and fsync before returning.
    fn put_sync(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.put(cf, key, value)
    }

    /// Delete a key from a column family.
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()>;

    /// Check if a key exists in a column family.
    fn contains(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Create an iterator over a column family.
    fn iter(&self, cf: ColumnFamily)
        -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;
}
