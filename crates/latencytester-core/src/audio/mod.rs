//! Audio processing module
//!
//! This module contains all audio-related functionality including:
//! - Fractional delay buffering ([`delay_line`])
//! - Probe signal generation ([`probe`])
//! - FFT cross-correlation and sub-sample peak fitting ([`correlation`])
//! - The measurement state machine ([`analyzer`]) and its echo tuning ([`echo`]),
//!   publishing through a lock-free [`snapshot`] cell
//! - Input/output stream pairing ([`duplex`]) over real devices ([`engine`])
//!   or a simulated cable ([`loopback`])
//! - The measurement front end ([`latency`])

pub mod analyzer;
pub mod correlation;
pub mod delay_line;
pub mod duplex;
pub mod echo;
pub mod engine;
pub mod latency;
pub mod loopback;
pub mod probe;
pub mod report;
pub mod snapshot;
