//! Core shared types for packet splitting
//!
//! - `PacketRecord`: one captured frame with its flow key
//! - `flow`: split criterion, flow keys, and the lane router
//! - `filter`: filter expressions applied to capture files

pub mod filter;
pub mod flow;
pub mod packet;

pub use filter::PacketFilter;
pub use flow::{classify, FlowKey, FlowRouter, SplitBy};
pub use packet::PacketRecord;
