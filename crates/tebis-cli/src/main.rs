//! tebis CLI
//!
//! Browse a Tebis server's catalog and export time series.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand, ValueEnum};
use polars::prelude::*;
use serde_json::{Value as JsonValue, json};
use tebis::{ClientConfig, PointRef, ResultTable, TebisClient, TimeInput};

#[derive(Parser)]
#[command(name = "tebis")]
#[command(about = "Query a Tebis process-data historian")]
#[command(after_help = "\
EXAMPLES:
    # Points whose name contains 'kessel'
    tebis --host 10.0.0.5 points --filter kessel

    # One hour of minute values as CSV
    tebis --host 10.0.0.5 read -p Kessel.Temp -p 4712 \\
        --start '2024-03-01 08:00:00' --end '2024-03-01 09:00:00' --rate 60

    # The same hour undecoded, appended to a dump file
    tebis --host 10.0.0.5 read -p Kessel.Temp --start 1709280000 --end 1709283600 \\
        --rate 60 --raw -o kessel.bin

    # The last two minutes of live values as parquet
    tebis --config tebis.json current -p Kessel.Temp --count 120 -f parquet -o live.parquet
")]
struct Args {
    /// JSON configuration file; command-line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Server-side configuration file named in every request
    #[arg(long)]
    config_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List measurement points
    Points {
        /// Case-insensitive name filter
        #[arg(long)]
        filter: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List the resolutions the server keeps data for
    Reductions,
    /// List point groups
    Groups,
    /// Read a time range
    Read {
        /// Point id or name; repeatable
        #[arg(short, long = "point", required = true)]
        points: Vec<PointRef>,
        /// Start time: epoch seconds or ms, or 'YYYY-MM-DD HH:MM:SS' local time
        #[arg(long)]
        start: TimeInput,
        /// End time, same forms as --start
        #[arg(long)]
        end: TimeInput,
        /// Resolution in seconds; must be one of the server's reductions
        #[arg(long, default_value = "1")]
        rate: f64,
        /// Use the slow text procedure instead of the binary one
        #[arg(long)]
        text: bool,
        /// Append the undecoded batch payloads to --output instead of decoding
        #[arg(long, conflicts_with = "text")]
        raw: bool,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Read the most recent one-second values
    Current {
        #[arg(short, long = "point", required = true)]
        points: Vec<PointRef>,
        /// Number of samples
        #[arg(long, default_value = "1")]
        count: u32,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Print the server's current time estimate
    Now,
}

#[derive(clap::Args)]
struct OutputArgs {
    #[arg(short, long, value_enum, default_value = "csv")]
    format: Format,
    /// Write to a file instead of stdout (required for parquet)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Json,
    Parquet,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let live = matches!(args.command, Command::Current { .. } | Command::Now);
    let config = load_config(&args, live)?;
    log::debug!("Effective configuration: {config:?}");
    let client = TebisClient::connect(config)
        .context("failed to connect to the Tebis server")?;

    match args.command {
        Command::Points { filter, json } => {
            let points: Vec<_> = match &filter {
                Some(needle) => client.catalog().search(needle).collect(),
                None => client.catalog().points().collect(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&points)?);
            } else {
                for point in points {
                    let kind = if point.is_virtual() { "virtual" } else { "real" };
                    println!(
                        "{:>8}  {:<40} {:<10} {:<8} {}",
                        point.id, point.name, point.unit, kind, point.description
                    );
                }
            }
        }
        Command::Reductions => {
            for resolution_ms in client.catalog().reductions().iter() {
                println!("{resolution_ms} ms ({} s)", resolution_ms as f64 / 1000.0);
            }
        }
        Command::Groups => {
            println!("{}", serde_json::to_string_pretty(client.catalog().groups())?);
        }
        Command::Read {
            points,
            start,
            end,
            rate,
            raw: true,
            output,
            ..
        } => {
            let path = output
                .output
                .as_ref()
                .context("--raw needs --output")?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let mut out = BufWriter::new(file);
            let written = client.read_raw(&points, start, end, rate, &mut out)?;
            log::info!("Appended {written} bytes to {}", path.display());
        }
        Command::Read {
            points,
            start,
            end,
            rate,
            text,
            output,
            ..
        } => {
            let table = if text {
                client.read_text(&points, start, end, rate)?
            } else {
                client.read(&points, start, end, rate)?
            };
            log::info!(
                "Read {} rows x {} points",
                table.rows(),
                table.columns().count()
            );
            write_table(&table, &output)?;
        }
        Command::Current {
            points,
            count,
            output,
        } => {
            let table = client.read_current_values(&points, count)?;
            write_table(&table, &output)?;
        }
        Command::Now => {
            let now_ms = client.current_time_ms()?;
            match DateTime::from_timestamp_millis(now_ms) {
                Some(now) => println!("{now_ms} ({})", now.with_timezone(&Local)),
                None => println!("{now_ms}"),
            }
        }
    }
    Ok(())
}

/// File layer first, then whatever was given on the command line.
fn load_config(args: &Args, live: bool) -> anyhow::Result<ClientConfig> {
    let mut layers = Vec::new();
    if let Some(path) = &args.config {
        layers.push(read_json(path)?);
    }

    let mut overrides = serde_json::Map::new();
    if let Some(host) = &args.host {
        overrides.insert("host".into(), json!(host));
    }
    if let Some(port) = args.port {
        overrides.insert("port".into(), json!(port));
    }
    if let Some(config_file) = &args.config_file {
        overrides.insert("configFile".into(), json!(config_file));
    }
    if live {
        overrides.insert("liveValues".into(), json!({ "enable": true }));
    }
    layers.push(JsonValue::Object(overrides));

    let config = ClientConfig::from_layers(layers)?;
    if config.host.is_none() {
        anyhow::bail!("no server host: pass --host or set \"host\" in the config file");
    }
    Ok(config)
}

fn read_json(path: &Path) -> anyhow::Result<JsonValue> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn write_table(table: &ResultTable, output: &OutputArgs) -> anyhow::Result<()> {
    match output.format {
        Format::Json => {
            let json = table.to_json()?;
            match &output.output {
                Some(path) => std::fs::write(path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Format::Csv => {
            let mut df = table.to_dataframe()?;
            match &output.output {
                Some(path) => {
                    let mut file = create(path)?;
                    CsvWriter::new(&mut file).finish(&mut df)?;
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    CsvWriter::new(&mut stdout).finish(&mut df)?;
                    stdout.flush()?;
                }
            }
        }
        Format::Parquet => {
            let path = output
                .output
                .as_ref()
                .context("parquet output needs --output")?;
            let mut df = table.to_dataframe()?;
            let mut file = create(path)?;
            ParquetWriter::new(&mut file).finish(&mut df)?;
        }
    }
    if let Some(path) = &output.output {
        log::info!("Wrote {}", path.display());
    }
    Ok(())
}

fn create(path: &Path) -> anyhow::Result<File> {
    File::create(path).with_context(|| format!("failed to create {}", path.display()))
}
