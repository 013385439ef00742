pub mod config;
pub mod controller;
pub mod error;
pub mod format;
pub mod ledger;
pub mod orchestrator;
pub mod scheduler;
pub mod selection;
pub mod settlement;
pub mod types;

pub mod test_helpers;

pub use error::{
    Error,
    Result,
};
