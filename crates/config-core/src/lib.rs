//! Pure domain logic for the configuration service: the condition
//! language, evaluator, data model, and write-path orchestration. No I/O —
//! adapters in `config-postgres` and `config-replica` implement the port
//! traits declared in [`ports`].

pub mod condition;
pub mod error;
pub mod evaluator;
pub mod path;
pub mod permission;
pub mod ports;
pub mod proposal;
pub mod reference;
pub mod segmentation;
pub mod service;
pub mod types;
pub mod variant;
pub mod schema;

pub use error::{ConfigError, ErrorKind, Result};
