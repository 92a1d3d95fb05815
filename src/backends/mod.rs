//! Backends Module
//!
//! Concrete `CacheBackend` implementations.

mod json_file;

pub use json_file::JsonFileBackend;
