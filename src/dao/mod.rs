/// Database model definitions.
pub mod models;
/// Persistence backends behind the [`quiz_store::QuizStore`] trait.
pub mod quiz_store;
/// Storage abstraction layer for database operations.
pub mod storage;
/// Observable subsets of the store.
pub mod topic;
