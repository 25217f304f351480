//! Studio editing core: change-tracking store, change detector, integrity checks.

pub mod changes;
pub mod detector;
pub mod manager;

pub use changes::*;
pub use detector::*;
pub use manager::*;
