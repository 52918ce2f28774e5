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

//! Tracing subscriber for the `spool` binary.
//!
//! Logs go to stderr so command output on stdout stays machine readable.
//! The filter comes from `--log-level`, then `RUST_LOG`, then
//! [`DEFAULT_LOG_TARGETS`].

use std::{env, io::IsTerminal};

use clap::ValueEnum;
use snafu::{ResultExt, Whatever, whatever};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_TARGETS: &str = "warn,spool_queue=info";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

pub fn init_logging(level: Option<&str>, format: LogFormat) -> Result<(), Whatever> {
    let targets = level
        .map(str::to_owned)
        .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_owned());
    let filter = EnvFilter::try_new(&targets)
        .with_whatever_context(|_| format!("Invalid log filter '{targets}'"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Text => builder
            .with_ansi(std::io::stderr().is_terminal())
            .try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    if let Err(e) = installed {
        whatever!("Failed to install tracing subscriber: {e}");
    }
    Ok(())
}
