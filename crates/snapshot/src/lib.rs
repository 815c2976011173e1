//! # deferq-snapshot
//!
//! A value held in memory behind a read/write lock and persisted wholesale to
//! a file on every change.
//!
//! # Architecture
//!
//! 1. [`FileStorage`] moves bytes to and from named files
//! 2. [`Codec`] turns the value into bytes and back
//! 3. [`durable`] layers a backup/marker protocol over the storage so that a
//!    crash mid-save never destroys the last complete snapshot
//! 4. [`SnapshotStore`] owns the value, the lock, and the optional auto-save
//!    timer, and notifies a [`SnapshotObserver`] around every load and save

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod codec;
pub mod durable;
mod kv;
mod observer;
mod storage;
mod store;

pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use durable::Recovery;
pub use kv::KvStore;
pub use observer::{NoopObserver, SnapshotObserver};
pub use storage::{FileStorage, LocalFileStorage};
pub use store::{SnapshotStore, SnapshotStoreBuilder, SnapshotValue};
