//! Core library for the ae-pipeline relay service.
//!
//! Measurement documents flow from the control process through an analysis
//! stage and an adaptive stage, and the next experimental point flows back:
//!
//! ```text
//! control --(from_control)--> analysis --(from_analysis)--> adaptive
//!    ^                                                          |
//!    +------------------- feedback store <----------------------+
//! ```
//!
//! The three stages only share the message channel and the feedback store,
//! both of which a single broker process can host over TCP.

pub mod broker;
pub mod channel;
pub mod cli;
pub mod config;
pub mod control;
pub mod document;
pub mod error;
pub mod logging;
pub mod recommend;
pub mod recovery;
pub mod reduce;
pub mod relay;
pub mod store;
