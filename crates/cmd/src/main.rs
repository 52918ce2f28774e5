// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs::File,
    io::{self, BufReader, Read, Write},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use snafu::{ResultExt, Whatever, whatever};
use spool_queue::{FlushMode, Position, QueueBuilder, QueueConfig, QueueReport, Record, inspect};
use tracing::info;

mod logging;

use logging::{LogFormat, init_logging};

#[derive(Debug, Parser)]
#[clap(
name = "spool",
about = "Inspect and operate spool queue directories",
author = env!("CARGO_PKG_AUTHORS"),
version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log filter, e.g. `debug` or `warn,spool_queue=debug`. Falls back to RUST_LOG.
    #[arg(long, global = true)]
    log_level:  Option<String>,
    #[arg(long, global = true, value_enum, default_value_t)]
    log_format: LogFormat,
    #[command(subcommand)]
    commands:   Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Inspect(InspectArgs),
    Verify(VerifyArgs),
    Push(PushArgs),
    Drain(DrainArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print every segment, its frame count and the committed checkpoint.
Never modifies the directory.
Examples:

spool inspect /var/lib/agent/queue
spool inspect /var/lib/agent/queue --json

")]
struct InspectArgs {
    dir:  PathBuf,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

impl InspectArgs {
    fn run(&self, out: &mut dyn Write) -> Result<(), Whatever> {
        let report = inspect(&self.dir)
            .with_whatever_context(|_| format!("Failed to inspect {}", self.dir.display()))?;
        if self.json {
            serde_json::to_writer_pretty(&mut *out, &report)
                .whatever_context("Failed to serialize report")?;
            writeln!(out).whatever_context("Failed to write output")?;
        } else {
            print_report(&report, out).whatever_context("Failed to write output")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Check every segment and the checkpoint for corruption.
Exits non-zero when anything is damaged.
Examples:

spool verify /var/lib/agent/queue

")]
struct VerifyArgs {
    dir: PathBuf,
}

impl VerifyArgs {
    fn run(&self, out: &mut dyn Write) -> Result<(), Whatever> {
        let report = inspect(&self.dir)
            .with_whatever_context(|_| format!("Failed to inspect {}", self.dir.display()))?;
        for segment in &report.segments {
            if let Some(corruption) = &segment.corruption {
                writeln!(
                    out,
                    "{}: corrupt at offset {}: {}",
                    segment.path.display(),
                    corruption.offset,
                    corruption.reason
                )
                .whatever_context("Failed to write output")?;
            }
        }
        if let Some(error) = &report.checkpoint_error {
            writeln!(out, "checkpoint: {error}").whatever_context("Failed to write output")?;
        }
        if !report.is_clean() {
            whatever!("Queue at {} is damaged", self.dir.display());
        }
        writeln!(
            out,
            "ok: {} segments, {} frames",
            report.segments.len(),
            report.total_frames()
        )
        .whatever_context("Failed to write output")?;
        Ok(())
    }
}

/// Queue directory plus the limits to open it with. These must match the
/// producer that owns the directory.
#[derive(Debug, Clone, Args)]
struct QueueArgs {
    dir:              PathBuf,
    /// JSON queue configuration. Its `dir` is replaced by DIR.
    #[arg(long, value_name = "FILE")]
    config:           Option<PathBuf>,
    #[arg(long)]
    max_segment_size: Option<u64>,
    #[arg(long)]
    max_record_size:  Option<u64>,
    #[arg(long)]
    max_total_size:   Option<u64>,
}

impl QueueArgs {
    fn builder(&self) -> Result<QueueBuilder, Whatever> {
        let mut config: QueueConfig = match &self.config {
            Some(path) => {
                let file = File::open(path)
                    .with_whatever_context(|_| format!("Failed to open {}", path.display()))?;
                serde_json::from_reader(BufReader::new(file))
                    .with_whatever_context(|_| format!("Invalid queue config {}", path.display()))?
            }
            None => QueueConfig::default(),
        };
        config.dir.clone_from(&self.dir);
        if let Some(size) = self.max_segment_size {
            config.max_segment_size = size;
        }
        if let Some(size) = self.max_record_size {
            config.max_record_size = size;
        }
        if let Some(size) = self.max_total_size {
            config.max_total_size = Some(size);
        }
        Ok(QueueBuilder::from_config(config))
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Append one record. The payload is --data, or stdin when --data is absent.
Examples:

spool push /var/lib/agent/queue --label tenant=a --data 'cpu=0.4'
cat batch.bin | spool push /var/lib/agent/queue --label kind=logs
spool push /var/lib/agent/queue --config agent-queue.json --data 'cpu=0.4'

")]
struct PushArgs {
    #[command(flatten)]
    queue:  QueueArgs,
    /// Metadata label as key=value. May be repeated.
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,
    #[arg(long)]
    data:   Option<String>,
}

impl PushArgs {
    fn run(&self, input: &mut dyn Read, out: &mut dyn Write) -> Result<(), Whatever> {
        let data = match &self.data {
            Some(data) => data.clone().into_bytes(),
            None => {
                let mut buf = Vec::new();
                input
                    .read_to_end(&mut buf)
                    .whatever_context("Failed to read payload from stdin")?;
                buf
            }
        };
        let record = self
            .labels
            .iter()
            .fold(Record::new(data), |record, (key, value)| {
                record.with_label(key.as_str(), value.as_str())
            });

        let mut queue = self
            .queue
            .builder()?
            .flush_mode(FlushMode::Sync)
            .build()
            .with_whatever_context(|_| {
                format!("Failed to open queue at {}", self.queue.dir.display())
            })?;
        let position = queue
            .writer()
            .enqueue(&record)
            .whatever_context("Failed to enqueue record")?;
        queue.shutdown().whatever_context("Failed to close queue")?;

        info!(%position, "Pushed record");
        writeln!(out, "{position}").whatever_context("Failed to write output")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print pending records as JSON lines and commit them.
Examples:

spool drain /var/lib/agent/queue --max 10
spool drain /var/lib/agent/queue --no-commit
spool drain /var/lib/agent/queue --max-segment-size 1048576

")]
struct DrainArgs {
    #[command(flatten)]
    queue:     QueueArgs,
    /// Stop after this many records.
    #[arg(long)]
    max:       Option<u64>,
    /// Print without advancing the checkpoint.
    #[arg(long)]
    no_commit: bool,
}

#[derive(Serialize)]
struct DrainedRecord<'a> {
    position: Position,
    labels:   BTreeMap<&'a str, &'a str>,
    data:     Cow<'a, str>,
}

impl DrainArgs {
    fn run(&self, out: &mut dyn Write) -> Result<(), Whatever> {
        let queue = self.queue.builder()?.build().with_whatever_context(|_| {
            format!("Failed to open queue at {}", self.queue.dir.display())
        })?;
        let (writer, mut reader) = queue.split();

        let mut drained = 0u64;
        while self.max.is_none_or(|max| drained < max) {
            let Some(entry) = reader.next().whatever_context("Failed to read record")? else {
                break;
            };
            let line = DrainedRecord {
                position: entry.position,
                labels:   entry
                    .record
                    .meta
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect(),
                data:     String::from_utf8_lossy(&entry.record.data),
            };
            serde_json::to_writer(&mut *out, &line).whatever_context("Failed to serialize record")?;
            writeln!(out).whatever_context("Failed to write output")?;

            if !self.no_commit {
                reader
                    .commit(entry.next)
                    .whatever_context("Failed to commit record")?;
            }
            drained += 1;
        }

        writer.close().whatever_context("Failed to close queue")?;
        info!(drained, committed = !self.no_commit, "Drain finished");
        Ok(())
    }
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

fn print_report(report: &QueueReport, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "queue: {}", report.dir.display())?;
    match (&report.checkpoint, &report.checkpoint_error) {
        (_, Some(error)) => writeln!(out, "checkpoint: invalid ({error})")?,
        (Some(position), None) => writeln!(out, "checkpoint: {position}")?,
        (None, None) => writeln!(out, "checkpoint: none")?,
    }
    for segment in &report.segments {
        write!(
            out,
            "  {}  {:>10} bytes  {:>8} frames",
            segment.id, segment.file_len, segment.frames
        )?;
        match &segment.corruption {
            Some(c) => writeln!(out, "  CORRUPT at {}: {}", c.offset, c.reason)?,
            None => writeln!(out)?,
        }
    }
    for path in &report.unknown_files {
        writeln!(out, "  ignored: {}", path.display())?;
    }
    writeln!(
        out,
        "total: {} segments, {} frames, {} bytes",
        report.segments.len(),
        report.total_frames(),
        report.total_bytes()
    )
}

fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref(), cli.log_format)?;

    let mut stdout = io::stdout().lock();
    match cli.commands {
        Commands::Inspect(args) => args.run(&mut stdout),
        Commands::Verify(args) => args.run(&mut stdout),
        Commands::Push(args) => args.run(&mut io::stdin().lock(), &mut stdout),
        Commands::Drain(args) => args.run(&mut stdout),
    }
}
