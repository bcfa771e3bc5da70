//! Domain models shared across the scanner: market data, rule trees and
//! strategies.

pub mod market;
pub mod rule;
pub mod strategy;

pub use market::{Candle, Frame, Row, Series, Timeframe, STANDARD_COLUMNS};
pub use rule::{Group, Node, Operator};
pub use strategy::{ScanRules, Strategy, StrategyCreate, StrategyUpdate};
