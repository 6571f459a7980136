use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowSplitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("at least one lane is required")]
    ZeroLanes,

    #[error("capture source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("no capture source could be opened")]
    NoUsableSource,

    #[error("invalid filter expression {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("capture error: {0}")]
    Capture(String),

    #[error("live capture on {0:?} requires the `live` feature")]
    LiveUnavailable(String),

    #[error("failed to start decoder for lane {lane}: {reason}")]
    DecoderSpawn { lane: usize, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap_file::PcapError),
}

pub type Result<T> = std::result::Result<T, FlowSplitError>;
