pub mod config;
pub mod feed;
pub mod filer;
pub mod model;
pub mod store;
pub mod sync;
pub mod tickers;
pub mod utils;

// Re-exports
pub use config::{FeedSource, SyncConfig};
pub use store::{Collection, Store, UpsertAction, UpsertStats};
pub use sync::{AutoUpdateState, AutoUpdater, CycleSummary, SyncEngine};
