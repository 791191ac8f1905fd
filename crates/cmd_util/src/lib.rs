//! Small helpers shared by every binary: tracing setup and `key=value`
//! config-line parsing.
pub mod env;
pub mod keyvalue;
