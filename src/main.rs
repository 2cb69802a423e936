// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Main entry point for the connection fuzz harness
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};

use sctp_conn_fuzz::harness_core::constants::fuzz;
use sctp_conn_fuzz::{Harness, HarnessConfig, HarnessError, LoopbackEngine, Side};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// File whose bytes are injected (defaults to a built-in string)
    input: Option<PathBuf>,

    /// Keep the association alive between iterations
    #[arg(long)]
    reuse_association: bool,

    /// Number of bootstrap + inject iterations
    #[arg(long, default_value_t = 1)]
    iterations: u32,

    /// Side that receives the injected packet
    #[arg(long, default_value = "server", value_parser = parse_side)]
    target: Side,

    /// Enable explicit end-of-record on both sockets
    #[arg(long)]
    explicit_eor: bool,

    /// Enable fragment interleaving and I-DATA support
    #[arg(long)]
    interleaving: bool,

    /// Enable stream reset and change-association requests
    #[arg(long)]
    stream_reset: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut HarnessConfig) {
        config.reuse_association |= self.reuse_association;
        config.explicit_eor |= self.explicit_eor;
        config.interleaving |= self.interleaving;
        config.stream_reset |= self.stream_reset;
    }
}

fn parse_side(s: &str) -> Result<Side, String> {
    Side::parse_safe(s).ok_or_else(|| format!("unknown side '{}', expected client or server", s))
}

fn main() {
    let cli = Cli::parse();

    install_panic_hook();

    let mut config = HarnessConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from env, using defaults: {}", e);
        HarnessConfig::default()
    });
    cli.apply(&mut config);

    if cli.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Failed to serialize config: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = init_tracing(&config) {
        eprintln!("Failed to init tracing: {}", e);
    }

    if let Err(e) = run(&cli, config) {
        let setup_failure = e
            .downcast_ref::<HarnessError>()
            .is_some_and(HarnessError::is_setup_failure);
        error!("{:#}", e);
        if setup_failure {
            std::process::abort();
        }
        std::process::exit(1);
    }
}

fn run(cli: &Cli, config: HarnessConfig) -> anyhow::Result<()> {
    let input = match &cli.input {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read fuzz input {}", path.display()))?,
        None => fuzz::DEFAULT_INPUT.to_vec(),
    };

    info!(
        "Injecting {} bytes into the {} side, {} iteration(s), reuse={}",
        input.len(),
        cli.target,
        cli.iterations,
        config.reuse_association
    );

    let engine = Arc::new(LoopbackEngine::default());
    let mut harness = Harness::new(engine, config)?;

    for iteration in 1..=cli.iterations {
        let delivered = harness.run_iteration(cli.target, &input)?;
        debug!("Iteration {}: {} bytes delivered", iteration, delivered);
    }

    info!("Done");
    Ok(())
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC: {} at {}", message, location);
    }));
}

fn init_tracing(config: &HarnessConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if config.log_format == "json" {
        subscriber.json().try_init()?;
    } else {
        subscriber.try_init()?;
    }

    Ok(())
}
