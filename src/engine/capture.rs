//! Packet capture sources
//!
//! Supports two kinds of input:
//! - Live interface capture through libpcap (feature `live`)
//! - Offline pcap files, either a single file or every file in a directory
//!
//! `CaptureSource` strings the inputs together into one sequential stream and
//! classifies each frame into a flow key, dropping frames that lack the layer
//! required by the split criterion.
//!
//! Capture files are filtered in-process by `PacketFilter`. With `live`,
//! expressions outside its grammar are handed to libpcap instead. A filter
//! nothing can apply is an error, never silently ignored.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pcap_file::pcap::PcapReader;
use pcap_file::{DataLink, PcapError, TsResolution};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{classify, PacketFilter, PacketRecord, SplitBy};
use crate::error::{FlowSplitError, Result};

use super::StopHandle;

/// A capture gives up after this many back-to-back read errors
const MAX_CONSECUTIVE_ERRORS: u32 = 64;

/// Pause between failed live reads
#[cfg(feature = "live")]
const LIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface to capture from; tried first when set
    pub interface: Option<String>,
    /// Offline pcap file or directory of pcap files
    pub path: Option<PathBuf>,
    /// Packet filter expression (tcpdump syntax)
    pub filter: String,
    /// Snapshot length for live capture and written headers
    pub snaplen: u32,
    /// Enable promiscuous mode (live)
    pub promiscuous: bool,
    /// Read timeout in milliseconds (live)
    pub timeout_ms: i32,
    /// Stop after this many packets have been read (0 = no limit)
    pub limit: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            path: None,
            filter: "not port 22".to_string(),
            snaplen: 65535,
            promiscuous: true,
            timeout_ms: 1000,
            limit: 0,
        }
    }
}

/// Where packets come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Live interface, no natural end
    Live,
    /// One or more capture files
    Offline,
}

/// A frame as read from a capture, before classification
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub timestamp: Duration,
    pub orig_len: u32,
    pub data: Vec<u8>,
}

/// Result of polling a capture for its next frame
#[derive(Debug)]
pub enum Poll {
    /// A frame was read
    Frame(RawFrame),
    /// Nothing available yet (live read timeout)
    Idle,
    /// A frame was read but rejected by the filter
    Filtered,
    /// No more frames will come from this capture
    Exhausted,
}

/// Trait for packet capture implementations
pub trait PacketCapture {
    /// Read the next frame. An `Err` means one unreadable record; the caller
    /// may keep polling.
    fn next_frame(&mut self) -> Result<Poll>;

    /// Link type of the frames this capture yields
    fn datalink(&self) -> DataLink;

    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Timestamp resolution of the frames
    fn ts_resolution(&self) -> TsResolution {
        TsResolution::MicroSecond
    }

    /// Snapshot length the input was recorded with
    fn snaplen(&self) -> Option<u32> {
        None
    }
}

/// Counts back-to-back read failures
#[derive(Debug, Clone, Copy)]
pub(crate) struct ErrorBudget {
    consecutive: u32,
    limit: u32,
}

impl ErrorBudget {
    pub(crate) fn new(limit: u32) -> Self {
        Self { consecutive: 0, limit }
    }

    /// Record one failure; true once `limit` failures happened in a row
    pub(crate) fn fail(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.limit
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub(crate) fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// How frames read from capture files are filtered
#[derive(Debug, Clone)]
pub enum FileFilter {
    /// No filter configured
    None,
    /// Matched in-process
    Native(PacketFilter),
    /// Compiled by libpcap for each file's link type
    #[cfg(feature = "live")]
    Libpcap(String),
}

impl FileFilter {
    /// Resolve a filter expression for offline input. An expression that
    /// neither the built-in matcher nor (with `live`) libpcap accepts is an
    /// `InvalidFilter` error.
    pub fn resolve(filter: &str) -> Result<Self> {
        let filter = filter.trim();
        if filter.is_empty() {
            return Ok(FileFilter::None);
        }

        match PacketFilter::parse(filter) {
            Ok(native) => Ok(FileFilter::Native(native)),
            #[cfg(feature = "live")]
            Err(e) => {
                debug!(filter, error = %e, "Falling back to libpcap for capture files");
                compile_bpf(filter, DataLink::ETHERNET)?;
                Ok(FileFilter::Libpcap(filter.to_string()))
            }
            #[cfg(not(feature = "live"))]
            Err(e) => Err(e),
        }
    }
}

/// Capture statistics kept by the source adapter
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    /// Inputs successfully opened
    pub sources_opened: u64,
    /// Inputs skipped because they could not be opened
    pub sources_skipped: u64,
    /// Records that could not be read
    pub read_errors: u64,
    /// Frames rejected by the offline filter
    pub filtered: u64,
}

/// What the adapter hands back to the producer for each frame read
#[derive(Debug)]
pub enum Ingest {
    /// Classified and ready for routing
    Packet(PacketRecord),
    /// Missing the layer required by the split criterion
    Dropped,
}

/// Sequential packet stream over a live interface or a list of files
pub struct CaptureSource {
    kind: SourceKind,
    id: String,
    split: SplitBy,
    filter: FileFilter,
    datalink: DataLink,
    ts_resolution: TsResolution,
    snaplen: u32,
    current: Option<Box<dyn PacketCapture>>,
    pending: VecDeque<PathBuf>,
    stats: CaptureStats,
}

impl CaptureSource {
    /// Open the configured source.
    ///
    /// The interface is tried first; if it cannot be opened the path is used
    /// instead. An invalid filter, a missing path, or a sole input that fails
    /// to open are fatal.
    pub fn open(config: &CaptureConfig, split: SplitBy) -> Result<Self> {
        let mut live_err = None;

        if let Some(name) = config.interface.as_deref().filter(|n| !n.is_empty()) {
            match open_live(name, config) {
                Ok(capture) => {
                    info!(interface = name, filter = %config.filter, "Live capture started");
                    let datalink = capture.datalink();
                    return Ok(Self {
                        kind: SourceKind::Live,
                        id: name.to_string(),
                        split,
                        filter: FileFilter::None,
                        datalink,
                        ts_resolution: TsResolution::MicroSecond,
                        snaplen: config.snaplen,
                        current: Some(capture),
                        pending: VecDeque::new(),
                        stats: CaptureStats {
                            sources_opened: 1,
                            ..CaptureStats::default()
                        },
                    });
                }
                Err(e @ FlowSplitError::InvalidFilter { .. }) => return Err(e),
                Err(e) => {
                    warn!(interface = name, error = %e, "Error opening interface");
                    live_err = Some(e);
                }
            }
        }

        let path = match config.path.as_ref() {
            Some(p) => p,
            None => {
                return Err(live_err.unwrap_or_else(|| {
                    FlowSplitError::Config("no interface or capture path configured".into())
                }))
            }
        };

        let filter = FileFilter::resolve(&config.filter)?;
        let (id, inputs) = resolve_inputs(path)?;
        let sole = inputs.len() == 1;
        let mut source = Self {
            kind: SourceKind::Offline,
            id,
            split,
            filter,
            datalink: DataLink::ETHERNET,
            ts_resolution: TsResolution::MicroSecond,
            snaplen: config.snaplen,
            current: None,
            pending: inputs.into(),
            stats: CaptureStats::default(),
        };

        if sole {
            let path = source.pending.pop_front().ok_or(FlowSplitError::NoUsableSource)?;
            let capture = OfflineCapture::open(&path, &source.filter)?;
            info!(file = %path.display(), "File opened");
            source.current = Some(Box::new(capture));
            source.stats.sources_opened += 1;
        } else if !source.open_next() {
            return Err(FlowSplitError::NoUsableSource);
        }

        if let Some(capture) = source.current.as_ref() {
            source.datalink = capture.datalink();
            source.ts_resolution = capture.ts_resolution();
            source.snaplen = capture.snaplen().unwrap_or(config.snaplen);
        }

        Ok(source)
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Identifier used to name output files (interface, file or directory name)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Link type of the first opened input
    pub fn datalink(&self) -> DataLink {
        self.datalink
    }

    /// Timestamp resolution of the first opened input
    pub fn ts_resolution(&self) -> TsResolution {
        self.ts_resolution
    }

    /// Snapshot length of the first opened input
    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Pull the next frame from the current input, moving on to the next
    /// input at EOF. Returns `None` once every input is exhausted or `stop`
    /// has been requested.
    pub fn next(&mut self, stop: &StopHandle) -> Option<Ingest> {
        loop {
            if stop.is_stopped() {
                return None;
            }

            if self.current.is_none() && !self.open_next() {
                return None;
            }
            let Some(capture) = self.current.as_mut() else {
                return None;
            };

            match capture.next_frame() {
                Ok(Poll::Frame(frame)) => {
                    let datalink = capture.datalink();
                    let ingest = match classify(datalink, &frame.data, self.split) {
                        Some(key) => Ingest::Packet(PacketRecord::new(
                            frame.timestamp,
                            frame.orig_len,
                            frame.data,
                            datalink,
                            key,
                        )),
                        None => Ingest::Dropped,
                    };
                    return Some(ingest);
                }
                Ok(Poll::Idle) => continue,
                Ok(Poll::Filtered) => self.stats.filtered += 1,
                Ok(Poll::Exhausted) => {
                    info!(source = capture.name(), "EOF reached");
                    self.current = None;
                }
                Err(e) => {
                    self.stats.read_errors += 1;
                    warn!(source = capture.name(), error = %e, "Skipping unreadable packet");
                }
            }
        }
    }

    /// Open the next pending file, skipping any that fail
    fn open_next(&mut self) -> bool {
        while let Some(path) = self.pending.pop_front() {
            match OfflineCapture::open(&path, &self.filter) {
                Ok(capture) => {
                    info!(file = %path.display(), "File opened");
                    if self.stats.sources_opened > 0 {
                        if capture.datalink() != self.datalink {
                            warn!(
                                file = %path.display(),
                                datalink = ?capture.datalink(),
                                expected = ?self.datalink,
                                "Link type differs from first input"
                            );
                        }
                        if capture.ts_resolution() != self.ts_resolution {
                            warn!(
                                file = %path.display(),
                                resolution = ?capture.ts_resolution(),
                                expected = ?self.ts_resolution,
                                "Timestamp resolution differs from first input"
                            );
                        }
                    }
                    self.stats.sources_opened += 1;
                    self.current = Some(Box::new(capture));
                    return true;
                }
                Err(e) => {
                    self.stats.sources_skipped += 1;
                    warn!(file = %path.display(), error = %e, "Error opening file");
                }
            }
        }
        false
    }
}

/// Expand a path into an identifier and an ordered list of input files
fn resolve_inputs(path: &Path) -> Result<(String, Vec<PathBuf>)> {
    let meta = fs::metadata(path).map_err(|_| FlowSplitError::SourceNotFound(path.to_path_buf()))?;
    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    if !meta.is_dir() {
        return Ok((id, vec![path.to_path_buf()]));
    }

    let mut inputs = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            debug!(path = %entry.path().display(), "Skipping sub-directory");
            continue;
        }
        inputs.push(entry.path());
    }
    inputs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    if inputs.is_empty() {
        warn!(dir = %path.display(), "Capture directory is empty");
        return Err(FlowSplitError::NoUsableSource);
    }
    Ok((id, inputs))
}

#[cfg(feature = "live")]
fn open_live(name: &str, config: &CaptureConfig) -> Result<Box<dyn PacketCapture>> {
    Ok(Box::new(LiveCapture::open(name, config)?))
}

#[cfg(not(feature = "live"))]
fn open_live(name: &str, _config: &CaptureConfig) -> Result<Box<dyn PacketCapture>> {
    Err(FlowSplitError::LiveUnavailable(name.to_string()))
}

/// Filter state of one open capture file
enum OfflineFilter {
    None,
    Native(PacketFilter),
    #[cfg(feature = "live")]
    Bpf(pcap::BpfProgram),
}

/// Offline pcap file reader
pub struct OfflineCapture {
    name: String,
    reader: PcapReader<BufReader<File>>,
    datalink: DataLink,
    ts_resolution: TsResolution,
    snaplen: u32,
    errors: ErrorBudget,
    filter: OfflineFilter,
}

impl OfflineCapture {
    pub fn open(path: &Path, filter: &FileFilter) -> Result<Self> {
        let file = File::open(path)?;
        let reader = PcapReader::new(BufReader::new(file))?;
        let header = reader.header();
        let name = path.display().to_string();

        let filter = match filter {
            FileFilter::None => OfflineFilter::None,
            FileFilter::Native(native) => OfflineFilter::Native(native.clone()),
            #[cfg(feature = "live")]
            FileFilter::Libpcap(expr) => OfflineFilter::Bpf(compile_bpf(expr, header.datalink)?),
        };

        Ok(Self {
            name,
            datalink: header.datalink,
            ts_resolution: header.ts_resolution,
            snaplen: header.snaplen,
            reader,
            errors: ErrorBudget::new(MAX_CONSECUTIVE_ERRORS),
            filter,
        })
    }

    fn accepts(&self, data: &[u8]) -> bool {
        match &self.filter {
            OfflineFilter::None => true,
            OfflineFilter::Native(native) => native.matches(self.datalink, data),
            #[cfg(feature = "live")]
            OfflineFilter::Bpf(prog) => prog.filter(data),
        }
    }
}

impl PacketCapture for OfflineCapture {
    fn next_frame(&mut self) -> Result<Poll> {
        let frame = match self.reader.next_packet() {
            None => return Ok(Poll::Exhausted),
            Some(Ok(packet)) => RawFrame {
                timestamp: packet.timestamp,
                orig_len: packet.orig_len,
                data: packet.data.into_owned(),
            },
            Some(Err(PcapError::IncompleteBuffer)) => {
                warn!(file = %self.name, "Truncated record at end of file");
                return Ok(Poll::Exhausted);
            }
            Some(Err(PcapError::IoError(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(file = %self.name, "Truncated record at end of file");
                return Ok(Poll::Exhausted);
            }
            Some(Err(e)) => {
                if self.errors.fail() {
                    warn!(file = %self.name, errors = self.errors.consecutive(), "Too many read errors, abandoning file");
                    return Ok(Poll::Exhausted);
                }
                return Err(e.into());
            }
        };
        self.errors.reset();

        if self.accepts(&frame.data) {
            Ok(Poll::Frame(frame))
        } else {
            Ok(Poll::Filtered)
        }
    }

    fn datalink(&self) -> DataLink {
        self.datalink
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ts_resolution(&self) -> TsResolution {
        self.ts_resolution
    }

    fn snaplen(&self) -> Option<u32> {
        Some(self.snaplen)
    }
}

#[cfg(feature = "live")]
fn compile_bpf(filter: &str, datalink: DataLink) -> Result<pcap::BpfProgram> {
    pcap::Capture::dead(pcap::Linktype(u32::from(datalink) as i32))
        .and_then(|dead| dead.compile(filter, true))
        .map_err(|e| FlowSplitError::InvalidFilter {
            filter: filter.to_string(),
            reason: e.to_string(),
        })
}

/// Live interface capture through libpcap
#[cfg(feature = "live")]
pub struct LiveCapture {
    name: String,
    capture: pcap::Capture<pcap::Active>,
    datalink: DataLink,
    errors: ErrorBudget,
}

#[cfg(feature = "live")]
impl LiveCapture {
    pub fn open(name: &str, config: &CaptureConfig) -> Result<Self> {
        let mut capture = pcap::Capture::from_device(name)
            .and_then(|c| {
                c.promisc(config.promiscuous)
                    .snaplen(config.snaplen as i32)
                    .timeout(config.timeout_ms)
                    .open()
            })
            .map_err(|e| FlowSplitError::Capture(format!("{}: {}", name, e)))?;

        capture
            .filter(&config.filter, true)
            .map_err(|e| FlowSplitError::InvalidFilter {
                filter: config.filter.clone(),
                reason: e.to_string(),
            })?;

        let datalink = DataLink::from(capture.get_datalink().0 as u32);
        Ok(Self {
            name: name.to_string(),
            capture,
            datalink,
            errors: ErrorBudget::new(MAX_CONSECUTIVE_ERRORS),
        })
    }
}

#[cfg(feature = "live")]
impl PacketCapture for LiveCapture {
    fn next_frame(&mut self) -> Result<Poll> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.errors.reset();
                let ts = packet.header.ts;
                Ok(Poll::Frame(RawFrame {
                    timestamp: Duration::new(ts.tv_sec as u64, (ts.tv_usec as u32) * 1000),
                    orig_len: packet.header.len,
                    data: packet.data.to_vec(),
                }))
            }
            Err(pcap::Error::TimeoutExpired) => {
                self.errors.reset();
                Ok(Poll::Idle)
            }
            Err(pcap::Error::NoMorePackets) => Ok(Poll::Exhausted),
            Err(e) => {
                if self.errors.fail() {
                    warn!(interface = %self.name, errors = self.errors.consecutive(), error = %e, "Too many capture errors, stopping");
                    return Ok(Poll::Exhausted);
                }
                std::thread::sleep(LIVE_ERROR_BACKOFF);
                Err(FlowSplitError::Capture(e.to_string()))
            }
        }
    }

    fn datalink(&self) -> DataLink {
        self.datalink
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;
    use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
    use std::io::Write;
    use tempfile::TempDir;

    fn udp_frame(sport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(sport, 53);
        let mut out = Vec::new();
        builder.write(&mut out, b"payload").unwrap();
        out
    }

    fn ssh_frame(sport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(sport, 22, 1, 1024);
        let mut out = Vec::new();
        builder.write(&mut out, b"SSH-2.0").unwrap();
        out
    }

    fn write_pcap(path: &Path, frames: &[Vec<u8>]) {
        write_pcap_with(
            path,
            PcapHeader {
                datalink: DataLink::ETHERNET,
                ..PcapHeader::default()
            },
            frames,
        );
    }

    fn write_pcap_with(path: &Path, header: PcapHeader, frames: &[Vec<u8>]) {
        let mut writer = PcapWriter::with_header(File::create(path).unwrap(), header).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let pkt = PcapPacket::new(Duration::from_secs(i as u64 + 1), frame.len() as u32, frame);
            writer.write_packet(&pkt).unwrap();
        }
    }

    fn offline_config(path: &Path) -> CaptureConfig {
        CaptureConfig {
            path: Some(path.to_path_buf()),
            filter: String::new(),
            ..CaptureConfig::default()
        }
    }

    fn drain(source: &mut CaptureSource) -> (usize, usize) {
        let stop = StopHandle::new();
        let (mut packets, mut dropped) = (0, 0);
        while let Some(ingest) = source.next(&stop) {
            match ingest {
                Ingest::Packet(_) => packets += 1,
                Ingest::Dropped => dropped += 1,
            }
        }
        (packets, dropped)
    }

    #[test]
    fn test_capture_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.snaplen, 65535);
        assert_eq!(config.filter, "not port 22");
        assert!(config.promiscuous);
        assert_eq!(config.limit, 0);
    }

    #[test]
    fn test_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace-1.pcap");
        write_pcap(&path, &[udp_frame(1000), udp_frame(1001), vec![0u8; 4]]);

        let mut source = CaptureSource::open(&offline_config(&path), SplitBy::Port).unwrap();
        assert_eq!(source.kind(), SourceKind::Offline);
        assert_eq!(source.id(), "trace-1.pcap");
        assert_eq!(source.datalink(), DataLink::ETHERNET);
        assert_eq!(drain(&mut source), (2, 1));
    }

    #[test]
    fn test_directory_skips_bad_files() {
        let dir = TempDir::new().unwrap();
        write_pcap(&dir.path().join("a.pcap"), &[udp_frame(1)]);
        File::create(dir.path().join("b.txt"))
            .unwrap()
            .write_all(b"not a capture")
            .unwrap();
        write_pcap(&dir.path().join("c.pcap"), &[udp_frame(2), udp_frame(3)]);
        fs::create_dir(dir.path().join("nested")).unwrap();

        let mut source = CaptureSource::open(&offline_config(dir.path()), SplitBy::Ip).unwrap();
        assert_eq!(drain(&mut source), (3, 0));
        assert_eq!(source.stats().sources_opened, 2);
        assert_eq!(source.stats().sources_skipped, 1);
    }

    #[test]
    fn test_missing_path_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = offline_config(&dir.path().join("nope.pcap"));
        assert!(matches!(
            CaptureSource::open(&config, SplitBy::Ip),
            Err(FlowSplitError::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_sole_unreadable_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.pcap");
        fs::write(&path, b"garbage garbage garbage garbage").unwrap();
        assert!(CaptureSource::open(&offline_config(&path), SplitBy::Ip).is_err());
    }

    #[test]
    fn test_empty_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            CaptureSource::open(&offline_config(dir.path()), SplitBy::Ip),
            Err(FlowSplitError::NoUsableSource)
        ));
    }

    #[test]
    fn test_nothing_configured() {
        let config = CaptureConfig {
            interface: None,
            path: None,
            ..CaptureConfig::default()
        };
        assert!(CaptureSource::open(&config, SplitBy::Ip).is_err());
    }

    #[cfg(not(feature = "live"))]
    #[test]
    fn test_interface_falls_back_to_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fallback.pcap");
        write_pcap(&path, &[udp_frame(7)]);

        let mut config = offline_config(&path);
        config.interface = Some("eth-does-not-exist".into());
        let mut source = CaptureSource::open(&config, SplitBy::Ip).unwrap();
        assert_eq!(source.kind(), SourceKind::Offline);
        assert_eq!(drain(&mut source), (1, 0));

        config.path = None;
        assert!(matches!(
            CaptureSource::open(&config, SplitBy::Ip),
            Err(FlowSplitError::LiveUnavailable(_))
        ));
    }

    #[test]
    fn test_default_filter_applies_to_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ssh.pcap");
        write_pcap(&path, &[ssh_frame(50000), udp_frame(1000), ssh_frame(50001)]);

        let config = CaptureConfig {
            path: Some(path),
            ..CaptureConfig::default()
        };
        let mut source = CaptureSource::open(&config, SplitBy::Ip).unwrap();
        assert_eq!(drain(&mut source), (1, 0));
        assert_eq!(source.stats().filtered, 2);
    }

    #[test]
    fn test_unusable_filter_is_fatal_for_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.pcap");
        write_pcap(&path, &[udp_frame(1)]);

        let mut config = offline_config(&path);
        config.filter = "port 22 and (".into();
        assert!(matches!(
            CaptureSource::open(&config, SplitBy::Ip),
            Err(FlowSplitError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_file_filter_resolution() {
        assert!(matches!(FileFilter::resolve("  ").unwrap(), FileFilter::None));
        assert!(matches!(
            FileFilter::resolve("udp and not port 22").unwrap(),
            FileFilter::Native(_)
        ));
    }

    #[test]
    fn test_source_keeps_input_header_properties() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nano.pcap");
        let header = PcapHeader {
            datalink: DataLink::ETHERNET,
            ts_resolution: TsResolution::NanoSecond,
            snaplen: 262144,
            ..PcapHeader::default()
        };
        write_pcap_with(&path, header, &[udp_frame(1)]);

        let source = CaptureSource::open(&offline_config(&path), SplitBy::Ip).unwrap();
        assert_eq!(source.ts_resolution(), TsResolution::NanoSecond);
        assert_eq!(source.snaplen(), 262144);
    }

    #[test]
    fn test_error_budget() {
        let mut budget = ErrorBudget::new(3);
        assert!(!budget.fail());
        assert!(!budget.fail());
        budget.reset();
        assert!(!budget.fail());
        assert!(!budget.fail());
        assert!(budget.fail());
        assert_eq!(budget.consecutive(), 3);
    }

    #[test]
    fn test_stop_handle_ends_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.pcap");
        write_pcap(&path, &[udp_frame(1), udp_frame(2)]);

        let mut source = CaptureSource::open(&offline_config(&path), SplitBy::Ip).unwrap();
        let stop = StopHandle::new();
        stop.stop();
        assert!(source.next(&stop).is_none());
    }
}
