//! Utility modules

pub mod errors;
pub mod text;
