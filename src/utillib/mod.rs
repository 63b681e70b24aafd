//! Various utilities

pub mod logging;
pub mod shared_map;
