//! Worker lanes
//!
//! A lane owns one inbound packet channel and, depending on the run mode, a
//! lazily created capture file and a decoder pipe. Lanes never talk to each
//! other; each one runs its receive loop on a dedicated thread.
//!
//! The inbound channel is a zero-capacity rendezvous channel: the producer
//! blocks until the lane is ready to take the packet. That is the only
//! backpressure in the pipeline.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use pcap_file::pcap::{PcapHeader, PcapWriter};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::{PacketRecord, SplitBy};
use crate::error::{FlowSplitError, Result};

use super::capture::SourceKind;
use super::decoder::{DecoderConfig, DecoderInput, DecoderPipe, DrainReport};
use super::StopHandle;

/// Lanes log their counter every this many packets
const PROGRESS_INTERVAL: u64 = 100_000;

/// Lane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
    /// Number of lanes
    pub count: usize,
    /// Flow key criterion
    pub split_by: SplitBy,
    /// Root output directory
    pub output_dir: PathBuf,
    /// Write each lane's packets to a capture file
    pub dump: bool,
    /// Pipe each lane's packets through the decoder
    pub decode: bool,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            count: 1,
            split_by: SplitBy::Ip,
            output_dir: PathBuf::from("/tmp"),
            dump: false,
            decode: false,
        }
    }
}

/// Name of a lane's capture file; the metadata file appends `.meta`
pub fn capture_file_name(source_id: &str, index: usize) -> String {
    format!("{}_{}.pcap", source_id, index)
        .replace('-', "_")
        .replace('>', "")
}

/// Everything a lane needs to start
#[derive(Debug, Clone)]
pub struct LaneSetup {
    pub index: usize,
    /// Directory holding this run's capture and metadata files
    pub dir: PathBuf,
    pub file_name: String,
    pub dump: bool,
    pub decoder: Option<DecoderConfig>,
    pub header: PcapHeader,
    pub mode: SourceKind,
}

impl LaneSetup {
    pub fn capture_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(format!("{}.meta", self.file_name))
    }
}

enum WriterState {
    Pending,
    Open(PcapWriter<BufWriter<File>>),
    Failed,
}

/// Capture file that is created on the first packet written to it
pub struct CaptureFileWriter {
    path: PathBuf,
    header: PcapHeader,
    state: WriterState,
}

impl CaptureFileWriter {
    pub fn new(path: PathBuf, header: PcapHeader) -> Self {
        Self {
            path,
            header,
            state: WriterState::Pending,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, WriterState::Open(_))
    }

    /// Write one record, creating the file and its header first if needed
    pub fn write(&mut self, packet: &PacketRecord) -> Result<()> {
        if matches!(self.state, WriterState::Pending) {
            match self.create() {
                Ok(writer) => {
                    debug!(path = %self.path.display(), "Capture file created");
                    self.state = WriterState::Open(writer);
                }
                Err(e) => {
                    self.state = WriterState::Failed;
                    return Err(e);
                }
            }
        }

        match &mut self.state {
            WriterState::Open(writer) => {
                writer.write_packet(&packet.as_pcap())?;
                Ok(())
            }
            _ => Err(FlowSplitError::Capture(format!(
                "capture file {} unavailable",
                self.path.display()
            ))),
        }
    }

    fn create(&self) -> Result<PcapWriter<BufWriter<File>>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)?;
        Ok(PcapWriter::with_header(BufWriter::new(file), self.header.clone())?)
    }

    /// Flush and close the file. Returns its path if it was ever created.
    pub fn finish(self) -> Result<Option<PathBuf>> {
        match self.state {
            WriterState::Open(writer) => {
                let mut buffered = writer.into_writer();
                buffered.flush()?;
                Ok(Some(self.path))
            }
            _ => Ok(None),
        }
    }
}

/// Per-lane counters collected by the receive loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaneReport {
    pub index: usize,
    /// Packets received from the producer
    pub packets: u64,
    /// Captured bytes received
    pub bytes: u64,
    /// Capture file, if one was created
    pub capture_file: Option<PathBuf>,
    /// Packets that could not be written to the capture file
    pub dump_errors: u64,
    /// Whether the decoder was running for this lane
    pub decode_enabled: bool,
    /// Why decoding was disabled, if it was requested but failed to start
    pub decode_error: Option<String>,
    /// Packets that could not be written to the decoder
    pub decode_errors: u64,
}

/// Final state of a lane after both of its loops have finished
#[derive(Debug, Clone, Serialize)]
pub struct LaneSummary {
    #[serde(flatten)]
    pub lane: LaneReport,
    pub decoder: Option<DrainReport>,
}

/// Receive side of a lane, run on its own thread
struct Lane {
    index: usize,
    dump: Option<CaptureFileWriter>,
    decoder: Option<DecoderInput>,
    report: LaneReport,
}

impl Lane {
    fn run(mut self, rx: Receiver<PacketRecord>) -> LaneReport {
        debug!(lane = self.index, dump = self.dump.is_some(), decode = self.decoder.is_some(), "Lane ready");

        for packet in rx.iter() {
            self.handle(&packet);
        }

        self.teardown();
        self.report
    }

    fn handle(&mut self, packet: &PacketRecord) {
        self.report.packets += 1;
        self.report.bytes += u64::from(packet.captured_len());
        if self.report.packets % PROGRESS_INTERVAL == 0 {
            info!(lane = self.index, packets = self.report.packets, bytes = self.report.bytes, "Lane progress");
        }

        if let Some(dump) = self.dump.as_mut() {
            if let Err(e) = dump.write(packet) {
                self.report.dump_errors += 1;
                if self.report.dump_errors == 1 {
                    warn!(lane = self.index, packet = self.report.packets, error = %e, "Failed to write capture file");
                } else {
                    debug!(lane = self.index, packet = self.report.packets, error = %e, "Failed to write capture file");
                }
            }
        }

        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(e) = decoder.write(packet) {
                self.report.decode_errors += 1;
                if self.report.decode_errors == 1 {
                    warn!(lane = self.index, packet = self.report.packets, error = %e, "Failed to write to decoder");
                } else {
                    debug!(lane = self.index, packet = self.report.packets, error = %e, "Failed to write to decoder");
                }
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(dump) = self.dump.take() {
            let path = dump.path().to_path_buf();
            match dump.finish() {
                Ok(created) => self.report.capture_file = created,
                Err(e) => {
                    error!(lane = self.index, path = %path.display(), error = %e, "Failed to close capture file");
                    self.report.capture_file = Some(path);
                }
            }
        }

        if let Some(decoder) = self.decoder.take() {
            if let Err(e) = decoder.close() {
                warn!(lane = self.index, error = %e, "Failed to close decoder input");
            }
        }

        info!(
            lane = self.index,
            packets = self.report.packets,
            dump_errors = self.report.dump_errors,
            decode_errors = self.report.decode_errors,
            "Lane finished"
        );
    }
}

/// Producer-side handle to a running lane
pub struct LaneHandle {
    index: usize,
    tx: Sender<PacketRecord>,
    receiver: JoinHandle<LaneReport>,
    drain: Option<JoinHandle<DrainReport>>,
}

impl LaneHandle {
    /// Start the lane's receive loop and, if decoding, its decoder and drain
    /// loop. A decoder that fails to start only disables decoding for this
    /// lane.
    pub fn spawn(setup: LaneSetup, stop: &StopHandle) -> Result<Self> {
        let index = setup.index;
        let (tx, rx) = crossbeam_channel::bounded::<PacketRecord>(0);

        let mut report = LaneReport {
            index,
            ..LaneReport::default()
        };

        let dump = setup
            .dump
            .then(|| CaptureFileWriter::new(setup.capture_path(), setup.header.clone()));

        let mut decoder = None;
        let mut drain = None;
        if let Some(config) = setup.decoder.as_ref() {
            let started = DecoderPipe::spawn(
                config,
                index,
                &setup.meta_path(),
                setup.header.clone(),
                setup.mode,
                stop.clone(),
            )
            .and_then(DecoderPipe::start);

            match started {
                Ok((input, handle)) => {
                    report.decode_enabled = true;
                    decoder = Some(input);
                    drain = Some(handle);
                }
                Err(e) => {
                    error!(lane = index, error = %e, "Decoder unavailable, decoding disabled for lane");
                    report.decode_error = Some(e.to_string());
                }
            }
        }

        let lane = Lane {
            index,
            dump,
            decoder,
            report,
        };
        let receiver = thread::Builder::new()
            .name(format!("lane-{}", index))
            .spawn(move || lane.run(rx))?;

        Ok(Self {
            index,
            tx,
            receiver,
            drain,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Hand a packet to the lane, blocking until it is accepted. Returns
    /// `false` if the lane's receive loop is gone.
    pub fn send(&self, packet: PacketRecord) -> bool {
        self.tx.send(packet).is_ok()
    }

    /// Close the inbound channel; no more packets will be sent
    pub fn close(self) -> ClosingLane {
        drop(self.tx);
        ClosingLane {
            index: self.index,
            receiver: self.receiver,
            drain: self.drain,
        }
    }
}

/// A lane whose inbound channel is closed but whose loops may still be running
pub struct ClosingLane {
    index: usize,
    receiver: JoinHandle<LaneReport>,
    drain: Option<JoinHandle<DrainReport>>,
}

impl ClosingLane {
    /// Wait for the receive loop and the decoder drain loop to finish
    pub fn join(self) -> LaneSummary {
        let lane = self.receiver.join().unwrap_or_else(|_| {
            error!(lane = self.index, "Lane receive loop panicked");
            LaneReport {
                index: self.index,
                ..LaneReport::default()
            }
        });

        let decoder = self.drain.map(|handle| {
            handle.join().unwrap_or_else(|_| {
                error!(lane = self.index, "Decoder drain loop panicked");
                DrainReport::default()
            })
        });

        LaneSummary { lane, decoder }
    }
}
