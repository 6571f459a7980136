//! Captured packet representation
//!
//! A `PacketRecord` is produced once by the capture source, handed to exactly
//! one lane, and dropped after that lane has persisted it.

use std::time::Duration;

use pcap_file::pcap::PcapPacket;
use pcap_file::DataLink;

use super::flow::FlowKey;

/// A single captured frame plus the flow key it was classified under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    /// Capture timestamp (since the Unix epoch)
    pub timestamp: Duration,
    /// Length of the frame on the wire
    pub orig_len: u32,
    /// Captured bytes
    pub data: Vec<u8>,
    /// Link type of the source this frame was read from
    pub datalink: DataLink,
    /// Flow key derived from the active split criterion
    pub flow_key: FlowKey,
}

impl PacketRecord {
    pub fn new(
        timestamp: Duration,
        orig_len: u32,
        data: Vec<u8>,
        datalink: DataLink,
        flow_key: FlowKey,
    ) -> Self {
        Self {
            timestamp,
            orig_len,
            data,
            datalink,
            flow_key,
        }
    }

    /// Number of bytes actually captured
    pub fn captured_len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Borrow as a pcap record for writing
    pub fn as_pcap(&self) -> PcapPacket<'_> {
        PcapPacket::new(self.timestamp, self.orig_len, &self.data)
    }
}
