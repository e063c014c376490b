pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod labels;
pub mod model;

pub use error::{PredictError, Result};
