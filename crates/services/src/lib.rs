#![forbid(unsafe_code)]

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod debounce;
pub mod error;
pub mod persistence;
pub mod store;
pub mod sync;

pub use lms_core::Clock;

pub use catalog::{CourseCatalog, CourseOutline, StaticCatalog};
pub use config::StoreConfig;
pub use error::{CatalogError, StoreError, SyncError};
pub use store::{ProgressStore, StoreDeps};
pub use sync::Subscription;
