//! Write-path services over the internal object store.

pub mod objects;

pub use objects::ObjectService;
