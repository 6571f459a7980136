use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use flowsplit::{Config, Engine, SplitBy};

#[derive(Parser)]
#[command(name = "flowsplit")]
#[command(author, version, about = "Split packet captures across flow-hashed lanes")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Pcap file or directory of pcap files to read from
    #[arg(short = 'r', long = "read")]
    pub read: Option<PathBuf>,

    /// Interface to capture from
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Output directory
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Number of lanes
    #[arg(short = 'b', long)]
    pub lanes: Option<usize>,

    /// Split by "ip" or "port"
    #[arg(short, long)]
    pub split_by: Option<SplitBy>,

    /// Packet filter expression (tcpdump syntax)
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Write each lane's packets to a pcap file
    #[arg(long)]
    pub dump: bool,

    /// Pipe each lane's packets through the decoder command
    #[arg(long)]
    pub decode: bool,

    /// Decoder command (overrides the config file)
    #[arg(long)]
    pub decoder_cmd: Option<String>,

    /// Stop after this many packets (0 = no limit)
    #[arg(short = 'c', long)]
    pub count: Option<u64>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    /// Load the config file (if any) and layer command-line values on top
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => {
                let mut config = Config::default();
                config.apply_env_overrides();
                config
            }
        };

        if let Some(path) = &self.read {
            config.capture.path = Some(path.clone());
        }
        if let Some(interface) = &self.interface {
            config.capture.interface = Some(interface.clone());
        }
        if let Some(filter) = &self.filter {
            config.capture.filter = filter.clone();
        }
        if let Some(count) = self.count {
            config.capture.limit = count;
        }
        if let Some(dir) = &self.output_dir {
            config.lanes.output_dir = dir.clone();
        }
        if let Some(lanes) = self.lanes {
            config.lanes.count = lanes;
        }
        if let Some(split_by) = self.split_by {
            config.lanes.split_by = split_by;
        }
        if self.dump {
            config.lanes.dump = true;
        }
        if self.decode {
            config.lanes.decode = true;
        }
        if let Some(cmd) = &self.decoder_cmd {
            config.decoder.command = cmd.clone();
        }

        Ok(config)
    }
}

pub fn run_command(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let engine = Engine::new(config);
    let summary = engine.run().context("Run failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            read = summary.packets_read,
            dropped = summary.packets_dropped,
            delivered = summary.packets_delivered,
            limit_reached = summary.limit_reached,
            "Run complete"
        );
        for lane in &summary.lanes {
            info!(
                lane = lane.lane.index,
                packets = lane.lane.packets,
                lines = lane.decoder.as_ref().map(|d| d.lines).unwrap_or(0),
                "Lane summary"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "flowsplit", "-r", "/data/x.pcap", "-b", "4", "-s", "port", "--dump", "-c", "100",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.capture.path, Some(PathBuf::from("/data/x.pcap")));
        assert_eq!(config.lanes.count, 4);
        assert_eq!(config.lanes.split_by, SplitBy::Port);
        assert!(config.lanes.dump);
        assert!(!config.lanes.decode);
        assert_eq!(config.capture.limit, 100);
    }

    #[test]
    fn test_bad_split_rejected() {
        assert!(Cli::try_parse_from(["flowsplit", "-s", "vlan"]).is_err());
    }
}
