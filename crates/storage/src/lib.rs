#![forbid(unsafe_code)]

pub mod blobs;
pub mod remote;
pub mod repository;
pub mod sqlite;

pub use blobs::{BlobError, BlobKind};
pub use remote::{InMemoryRemote, RemoteDocumentStore, RemoteError};
pub use repository::{InMemoryKeyValueStore, KeyValueStore, Storage, StorageError};
