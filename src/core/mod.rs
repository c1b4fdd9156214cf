// Core modules implementing the read-only bolt reader and error modeling.
pub mod cursor;
pub mod db;
pub mod error;
#[cfg(any(test, feature = "fixture"))]
#[doc(hidden)]
pub mod fixture;
pub mod format;
pub mod page;
