//! bslscan core - scanner execution and adaptive retry engine.
//!
//! Invokes an external SonarQube-style scanner over 1C:Enterprise (BSL)
//! source trees, parses its free-text output, classifies failures against a
//! signature catalogue and retries around the BSL tokenization failure by
//! repairing or excluding the offending files, bounded by a fixed attempt
//! budget.

pub mod bsl_doctor;
pub mod cancel;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod exclusions;
pub mod invoker;
pub mod output_parser;
pub mod properties;
pub mod scan_result;

pub use cancel::*;
pub use config::*;
pub use engine::*;
pub use scan_result::*;
