//! flowsplit: fan a packet stream out across flow-hashed lanes.
//!
//! Packets are read from a live interface or from capture files, keyed by a
//! normalized IP or port pair, and handed to one of N lanes. Each lane can
//! write its packets to its own pcap file and/or stream them through an
//! external decoder whose line output is saved next to it.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;

pub use config::Config;
pub use core::{FlowKey, FlowRouter, PacketRecord, SplitBy};
pub use engine::{Engine, RunSummary, StopHandle};
pub use error::{FlowSplitError, Result};
