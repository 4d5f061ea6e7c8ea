//! Task module
//!
//! This module contains the task record and its lifecycle rules.

mod model;

pub use model::*;
