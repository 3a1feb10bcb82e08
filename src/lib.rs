//! BasinDB workspace facade.
//!
//! Re-exports the table-format primitives from `common` and the retention
//! subsystem from `cleaner` so integration tests and embedders only need a
//! single dependency.

pub use cleaner;
pub use common;
