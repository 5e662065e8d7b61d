pub mod auth;
pub mod database;
pub mod google_auth;
pub mod memory_store;
pub mod reconciliation;
pub mod store;
pub mod tier;
pub mod verifier;
