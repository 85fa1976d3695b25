//! Database query modules.
//!
//! Each module provides async functions that operate on one table.

pub mod attachments;
pub mod audit;
pub mod messages;
