pub mod config;
pub mod memory;
pub mod redis;
pub mod store;
pub mod suite;
pub mod types;

pub use memory::MemoryStore;
pub use store::{stream_candidates_with_problems, Store, StoreError, StoreResult};
pub use suite::{CallingConvention, TestCase, TestDataError, TestSuite};
