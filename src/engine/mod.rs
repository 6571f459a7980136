//! Packet Engine
//!
//! Splits one packet stream across a fixed set of lanes.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────────────────┐
//! │   Capture   │────▶│    Router    │────▶│  Lane 0 .. Lane N-1          │
//! │ (live/file) │     │ hash % lanes │     │  (rendezvous channel each)   │
//! └─────────────┘     └──────────────┘     └──────────────────────────────┘
//!                                                 │               │
//!                                                 ▼               ▼
//!                                          ┌────────────┐  ┌──────────────┐
//!                                          │  Capture   │  │   Decoder    │
//!                                          │   file     │  │  subprocess  │
//!                                          └────────────┘  └──────────────┘
//!                                                                 │
//!                                                                 ▼
//!                                                          ┌──────────────┐
//!                                                          │ .meta file   │
//!                                                          └──────────────┘
//! ```
//!
//! The producer runs on the caller's thread. Every lane has a receive thread
//! and, when decoding, a drain thread reading the decoder's output.

pub mod capture;
pub mod decoder;
pub mod lane;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pcap_file::pcap::PcapHeader;
use pcap_file::{DataLink, Endianness, TsResolution};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::FlowRouter;
use crate::error::Result;

pub use capture::{
    CaptureConfig, CaptureSource, CaptureStats, FileFilter, Ingest, PacketCapture, SourceKind,
};
pub use decoder::{DecoderConfig, DecoderPipe, DrainReport};
pub use lane::{capture_file_name, LaneHandle, LaneReport, LaneSetup, LaneSummary, LanesConfig};

/// Shared flag asking the producer (and live decoder drains) to wind down
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; the run then shuts down normally
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Producer-side counters; owned by the producer loop only
#[derive(Debug, Clone, Copy, Default)]
struct RunCounters {
    read: u64,
    dropped: u64,
    delivered: u64,
    lost: u64,
    limit_reached: bool,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Interface, file, or directory name the outputs are named after
    pub source: String,
    pub kind: SourceKind,
    /// Frames read from the source
    pub packets_read: u64,
    /// Frames without the layer required by the split criterion
    pub packets_dropped: u64,
    /// Frames handed to a lane
    pub packets_delivered: u64,
    /// Frames whose lane had already gone away
    pub packets_lost: u64,
    pub limit_reached: bool,
    pub capture: CaptureStats,
    pub lanes: Vec<LaneSummary>,
}

/// Header used for every capture file and decoder input of a run. Link type
/// and timestamp resolution come from the first input so timestamps are
/// written back at the precision they were read with.
pub fn capture_header(datalink: DataLink, ts_resolution: TsResolution, snaplen: u32) -> PcapHeader {
    PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen,
        datalink,
        ts_resolution,
        endianness: Endianness::Little,
    }
}

/// Main packet splitting engine
pub struct Engine {
    config: Config,
    stop: StopHandle,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stop: StopHandle::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle that can end the run early from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run to completion: open the source, start every lane, feed packets
    /// until the source is exhausted (or the limit is hit), then close all
    /// lanes and wait for them to drain.
    pub fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;

        let lanes_config = &self.config.lanes;
        let router = FlowRouter::new(lanes_config.count)?;
        let mut source = CaptureSource::open(&self.config.capture, lanes_config.split_by)?;

        let dir = lanes_config.output_dir.join(source.id());
        if lanes_config.dump || lanes_config.decode {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "Failed to create output directory");
            }
        }

        let snaplen = self.config.capture.snaplen.max(source.snaplen());
        let header = capture_header(source.datalink(), source.ts_resolution(), snaplen);
        let decoder = lanes_config.decode.then(|| self.config.decoder.clone());

        let mut lanes = Vec::with_capacity(router.lanes());
        for index in 0..router.lanes() {
            let setup = LaneSetup {
                index,
                dir: dir.clone(),
                file_name: capture_file_name(source.id(), index),
                dump: lanes_config.dump,
                decoder: decoder.clone(),
                header: header.clone(),
                mode: source.kind(),
            };
            lanes.push(LaneHandle::spawn(setup, &self.stop)?);
        }
        info!(
            lanes = lanes.len(),
            split_by = %lanes_config.split_by,
            source = source.id(),
            dump = lanes_config.dump,
            decode = lanes_config.decode,
            "Lanes started"
        );

        let counters = self.produce(&mut source, &router, &lanes);

        info!("Closing lanes");
        let closing: Vec<_> = lanes.into_iter().map(LaneHandle::close).collect();

        info!("Waiting for lanes");
        let lanes: Vec<_> = closing.into_iter().map(|lane| lane.join()).collect();

        info!(
            read = counters.read,
            dropped = counters.dropped,
            delivered = counters.delivered,
            "Finished"
        );

        Ok(RunSummary {
            source: source.id().to_string(),
            kind: source.kind(),
            packets_read: counters.read,
            packets_dropped: counters.dropped,
            packets_delivered: counters.delivered,
            packets_lost: counters.lost,
            limit_reached: counters.limit_reached,
            capture: source.stats().clone(),
            lanes,
        })
    }

    /// The single producer loop
    fn produce(
        &self,
        source: &mut CaptureSource,
        router: &FlowRouter,
        lanes: &[LaneHandle],
    ) -> RunCounters {
        let limit = self.config.capture.limit;
        let mut counters = RunCounters::default();

        while let Some(ingest) = source.next(&self.stop) {
            counters.read += 1;

            match ingest {
                Ingest::Packet(packet) => {
                    let index = router.route(packet.flow_key);
                    if lanes[index].send(packet) {
                        counters.delivered += 1;
                    } else {
                        counters.lost += 1;
                        error!(lane = index, read = counters.read, "Lane stopped receiving, packet lost");
                    }
                }
                Ingest::Dropped => counters.dropped += 1,
            }

            if limit != 0 && counters.read >= limit {
                counters.limit_reached = true;
                info!(limit, "Limit reached");
                break;
            }
        }

        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_shared() {
        let stop = StopHandle::new();
        let other = stop.clone();
        assert!(!other.is_stopped());
        stop.stop();
        assert!(other.is_stopped());
    }

    #[test]
    fn test_capture_header() {
        let header = capture_header(DataLink::ETHERNET, TsResolution::MicroSecond, 65535);
        assert_eq!(header.snaplen, 65535);
        assert_eq!(header.ts_resolution, TsResolution::MicroSecond);
        assert_eq!(header.endianness, Endianness::Little);
        assert_eq!(header.datalink, DataLink::ETHERNET);
        assert_eq!(header.version_major, 2);
        assert_eq!(header.version_minor, 4);

        let nano = capture_header(DataLink::RAW, TsResolution::NanoSecond, 262144);
        assert_eq!(nano.ts_resolution, TsResolution::NanoSecond);
        assert_eq!(nano.datalink, DataLink::RAW);
    }

    #[test]
    fn test_zero_lanes_is_fatal() {
        let mut config = Config::default();
        config.lanes.count = 0;
        config.capture.path = Some("/nonexistent".into());
        let engine = Engine::new(config);
        assert!(matches!(engine.run(), Err(crate::FlowSplitError::ZeroLanes)));
    }
}
