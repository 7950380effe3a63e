// src/lib.rs

//! Work Schedule Pipeline Library
//!
//! Uploaded work-data files trigger an execution that persists the records,
//! ensures each user has a configuration, renders a schedule per user and
//! delivers it to the user's channel.

pub mod config;
pub mod delivery;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod stage;
pub mod stages;
pub mod storage;
pub mod store;
pub mod utils;

#[cfg(feature = "lambda")]
pub mod lambda;

#[cfg(test)]
mod test_support;
