pub mod in_memory_storage;
pub mod local_storage;
pub mod mirrored_storage;
pub mod object_store;
pub mod retry;
pub mod sqlite_database;

pub use in_memory_storage::InMemoryStorage;
pub use local_storage::LocalFsStorage;
pub use mirrored_storage::MirroredStorage;
pub use object_store::HttpObjectStore;
pub use sqlite_database::SqliteDatabase;
