pub mod config;
pub mod error;
pub mod error_utils;
pub mod relevance;
pub mod state_file;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::*;
pub use error_utils::*;
pub use relevance::*;
pub use traits::*;
pub use types::*;
