//! Statistics module
//!
//! Control-thread storage of collected measurements.

pub mod history;
