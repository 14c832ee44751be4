//! Integration test suite for the storage core.
//!
//! 1. Encoding round trips through full tables
//! 2. Concurrent insert and update
//! 3. Snapshot reads across version chains

pub mod concurrency_tests;
pub mod helpers;
pub mod mvcc_tests;
pub mod round_trip_tests;
