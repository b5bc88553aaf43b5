//! Utils module - logging setup and time sources

pub mod clock;
pub mod logging;
