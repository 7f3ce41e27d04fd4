//! Mock device implementations for testing and development.
//!
//! This module provides simulated readers that can be controlled
//! programmatically without requiring physical hardware.

pub mod reader;

pub use reader::{MOCK_ATR, MockReader, MockReaderConfig, MockReaderHandle};
