//! Configuration Module
//!
//! Wrapper option resolution and transport passthrough settings.

mod options;

pub use options::{OptionsPatch, ProxyOptions, TransportOptions};
