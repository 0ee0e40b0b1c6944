use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::protocol::{Bin, Value};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the nodes discovered behind the seed host.
    Nodes,
    /// Run info commands against one node of the cluster.
    Info(InfoArgs),
    /// Read a record.
    Get(RecordArgs),
    /// Write bins to a record.
    Put(PutArgs),
    /// Delete a record.
    Delete(RecordArgs),
    /// Stream every record of a namespace (or set) from all nodes.
    Scan(ScanArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Seed host to discover the cluster from.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port of the seed host.
    #[arg(long, global = true, default_value_t = 3000)]
    pub port: u16,

    /// JSON file with cluster settings; `--host` is added to its seeds.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Transaction timeout in milliseconds. Zero disables the deadline.
    #[arg(long, global = true, default_value_t = 1000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct InfoArgs {
    /// Info command names; none asks for the default set.
    pub names: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RecordArgs {
    #[arg(long, short)]
    pub namespace: String,

    #[arg(long, short, default_value = "")]
    pub set: String,

    /// Record key. Parsed as an integer when `--int-key` is given.
    pub key: String,

    #[arg(long)]
    pub int_key: bool,

    /// Bins to read; all of them when omitted.
    #[arg(long = "bin")]
    pub bins: Vec<String>,
}

impl RecordArgs {
    pub fn key_value(&self) -> Result<Value, String> {
        if self.int_key {
            self.key
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|err| format!("key {:?} is not an integer: {err}", self.key))
        } else {
            Ok(Value::from(self.key.as_str()))
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PutArgs {
    #[command(flatten)]
    pub record: RecordArgs,

    /// `name=value` pairs; values that parse as integers are stored as such.
    #[arg(long = "set-bin", value_parser = parse_bin, required = true)]
    pub values: Vec<Bin>,

    /// Record TTL in seconds; zero keeps the namespace default.
    #[arg(long, default_value_t = 0)]
    pub ttl: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    #[arg(long, short)]
    pub namespace: String,

    #[arg(long, short)]
    pub set: Option<String>,

    /// Percentage of each partition to sample.
    #[arg(long, default_value_t = 100)]
    pub percent: u8,

    /// Return only record metadata.
    #[arg(long)]
    pub no_bins: bool,

    /// Worker threads used to fan out over the nodes; zero means one per CPU.
    #[arg(long, default_value_t = 4)]
    pub threads: usize,
}

/// Parses `name=value`. Integers become integer bins, anything else a string.
pub fn parse_bin(arg: &str) -> Result<Bin, String> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {arg:?}"))?;
    if name.is_empty() {
        return Err(format!("empty bin name in {arg:?}"));
    }
    let value = match value.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::from(value),
    };
    Ok(Bin::new(name, value))
}
