pub mod migrations;
pub mod sqlite_store;
pub mod store;

pub use sqlite_store::{SqliteStore, StoreOptions};
pub use store::ConversationStore;
