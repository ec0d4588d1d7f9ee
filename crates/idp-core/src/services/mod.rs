//! Services shared by the API and the CLI

mod database;

pub use database::{
    CollectionCounts, DatabaseService, LoginAttemptResult, NewSession, NewUser, ProfileUpdate,
    StoreTransaction, DEFAULT_SOURCE_TAG,
};
