//! # engine
//!
//! Rule compilation and the scan runtime.
//!
//! * [`sanitizer`] / [`expr`] / [`compiler`] turn a rule tree into a row filter.
//! * [`timeframe`] finds the historical data a tree needs.
//! * [`scan`] runs one strategy's two-phase loop; [`manager`] owns the loops;
//!   [`scheduler`] starts them on a cron cadence.

pub mod cancel;
pub mod compiler;
pub mod expr;
pub mod manager;
pub mod sanitizer;
pub mod scan;
pub mod scheduler;
pub mod timeframe;

pub use compiler::{apply, compile};
pub use manager::ScanManager;
pub use scheduler::{parse_cron, Scheduler};
