pub mod crypto;
pub mod db;
pub mod model;

pub use db::{InsertResult, Store};
pub use model::SecretRecord;
