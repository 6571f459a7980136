//! Decoder subprocess bridge
//!
//! Each decoding lane runs one external command through a shell. Packets are
//! streamed into its stdin as a pcap container (header once, then one record
//! per packet) and every line it prints on stdout is appended to the lane's
//! metadata file.
//!
//! The two directions are driven independently:
//! - `DecoderInput` is owned by the lane's receive loop and closed when the
//!   lane's inbound stream ends.
//! - `DecoderDrain` runs on its own thread, owns the child process, and keeps
//!   reading until the child's output is exhausted.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcap_file::pcap::{PcapHeader, PcapWriter};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::core::PacketRecord;
use crate::error::{FlowSplitError, Result};

use super::capture::SourceKind;
use super::StopHandle;

/// Decoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Command line handed to the shell
    pub command: String,
    /// Shell used to run the command (`<shell> -c <command>`)
    pub shell: String,
    /// Pause before re-reading after end-of-stream on a live run (ms)
    pub idle_backoff_ms: u64,
    /// Buffer size for reading decoder output
    pub read_buffer: usize,
    /// Buffer size for writing packets to the decoder
    pub write_buffer: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            shell: "sh".to_string(),
            idle_backoff_ms: 1000,
            read_buffer: 1024 * 1024,
            write_buffer: 1024 * 1024,
        }
    }
}

/// A started decoder, not yet split between its two control flows
pub struct DecoderPipe {
    input: DecoderInput,
    drain: DecoderDrain,
}

impl DecoderPipe {
    /// Create the metadata file, spawn the decoder and write the container
    /// header to its input.
    pub fn spawn(
        config: &DecoderConfig,
        lane: usize,
        meta_path: &Path,
        header: PcapHeader,
        mode: SourceKind,
        stop: StopHandle,
    ) -> Result<Self> {
        let spawn_err = |reason: String| FlowSplitError::DecoderSpawn { lane, reason };

        if config.command.trim().is_empty() {
            return Err(spawn_err("empty decoder command".into()));
        }

        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| spawn_err(format!("{}: {}", parent.display(), e)))?;
        }
        let meta = File::create(meta_path)
            .map_err(|e| spawn_err(format!("{}: {}", meta_path.display(), e)))?;

        let mut child = Command::new(&config.shell)
            .arg("-c")
            .arg(&config.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| spawn_err(format!("{} -c {:?}: {}", config.shell, config.command, e)))?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                reap(&mut child);
                return Err(spawn_err("decoder pipes unavailable".into()));
            }
        };

        let buffered = BufWriter::with_capacity(config.write_buffer, stdin);
        let writer = match PcapWriter::with_header(buffered, header) {
            Ok(writer) => writer,
            Err(e) => {
                reap(&mut child);
                return Err(spawn_err(format!("writing capture header: {}", e)));
            }
        };

        debug!(lane, pid = child.id(), command = %config.command, "Decoder started");

        Ok(Self {
            input: DecoderInput {
                lane,
                writer,
                written: 0,
            },
            drain: DecoderDrain {
                lane,
                child,
                reader: BufReader::with_capacity(config.read_buffer, stdout),
                meta: BufWriter::new(meta),
                meta_path: meta_path.to_path_buf(),
                mode,
                idle_backoff: Duration::from_millis(config.idle_backoff_ms),
                stop,
            },
        })
    }

    /// Start the drain thread and hand back the input side
    pub fn start(self) -> Result<(DecoderInput, JoinHandle<DrainReport>)> {
        let lane = self.input.lane;
        let drain = self.drain;
        let handle = thread::Builder::new()
            .name(format!("lane-{}-decode", lane))
            .spawn(move || drain.run())
            .map_err(|e| FlowSplitError::DecoderSpawn {
                lane,
                reason: format!("drain thread: {}", e),
            })?;
        Ok((self.input, handle))
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Write side of the decoder pipe
pub struct DecoderInput {
    lane: usize,
    writer: PcapWriter<BufWriter<ChildStdin>>,
    written: u64,
}

impl DecoderInput {
    /// Queue one packet record for the decoder
    pub fn write(&mut self, packet: &PacketRecord) -> Result<()> {
        self.writer.write_packet(&packet.as_pcap())?;
        self.written += 1;
        Ok(())
    }

    /// Packets written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush buffered records and close the decoder's stdin
    pub fn close(self) -> Result<()> {
        let mut buffered = self.writer.into_writer();
        buffered.flush()?;
        debug!(lane = self.lane, packets = self.written, "Decoder input closed");
        Ok(())
    }
}

/// Summary of one lane's decoder output
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    /// Metadata file the lines were written to
    pub meta_path: PathBuf,
    /// Lines read from the decoder
    pub lines: u64,
    /// Lines that could not be written to the metadata file
    pub write_errors: u64,
    /// Decoder exit code, if it exited normally
    pub exit_code: Option<i32>,
}

/// Read side of the decoder pipe; owns the child process
struct DecoderDrain<R: Read = ChildStdout> {
    lane: usize,
    child: Child,
    reader: BufReader<R>,
    meta: BufWriter<File>,
    meta_path: PathBuf,
    mode: SourceKind,
    idle_backoff: Duration,
    stop: StopHandle,
}

impl<R: Read> DecoderDrain<R> {
    fn run(mut self) -> DrainReport {
        let mut report = DrainReport {
            meta_path: self.meta_path.clone(),
            ..DrainReport::default()
        };
        let mut line = Vec::with_capacity(4096);
        let mut broken = false;

        loop {
            line.clear();
            match self.reader.read_until(b'\n', &mut line) {
                Ok(0) => {
                    if self.output_finished() {
                        break;
                    }
                    trace!(lane = self.lane, "Decoder idle");
                    thread::sleep(self.idle_backoff);
                }
                Ok(_) => {
                    if line.last() == Some(&b'\n') {
                        line.pop();
                    }
                    report.lines += 1;
                    trace!(lane = self.lane, line = %String::from_utf8_lossy(&line));

                    if let Err(e) = self
                        .meta
                        .write_all(&line)
                        .and_then(|_| self.meta.write_all(b"\n"))
                    {
                        report.write_errors += 1;
                        if report.write_errors == 1 {
                            warn!(lane = self.lane, lines = report.lines, error = %e, "Failed to write decoder output");
                        } else {
                            debug!(lane = self.lane, lines = report.lines, error = %e, "Failed to write decoder output");
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(lane = self.lane, lines = report.lines, error = %e, "Error reading decoder output");
                    broken = true;
                    break;
                }
            }
        }

        info!(lane = self.lane, lines = report.lines, "Consumed lines");

        if let Err(e) = self.meta.flush() {
            error!(lane = self.lane, path = %self.meta_path.display(), error = %e, "Failed to flush metadata file");
        }

        // Nobody reads the decoder's output any more; a child still running
        // would block the wait below.
        if broken || (self.mode == SourceKind::Live && self.stop.is_stopped()) {
            if let Ok(None) = self.child.try_wait() {
                debug!(lane = self.lane, "Killing decoder");
                let _ = self.child.kill();
            }
        }

        match self.child.wait() {
            Ok(status) => {
                report.exit_code = status.code();
                if !status.success() {
                    warn!(lane = self.lane, %status, "Decoder exited with failure");
                }
            }
            Err(e) => warn!(lane = self.lane, error = %e, "Failed to wait for decoder"),
        }

        report
    }

    /// Decide whether an end-of-stream means the decoder is done.
    ///
    /// Capture files have a natural end, so EOF is final. A live capture has
    /// none: keep waiting until the decoder process itself has exited or a
    /// stop is requested.
    fn output_finished(&mut self) -> bool {
        match self.mode {
            SourceKind::Offline => true,
            SourceKind::Live => match self.child.try_wait() {
                Ok(Some(_)) => true,
                Ok(None) if self.stop.is_stopped() => {
                    debug!(lane = self.lane, "Stop requested, no longer waiting for decoder");
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(lane = self.lane, error = %e, "Cannot poll decoder state");
                    true
                }
            },
        }
    }
}
