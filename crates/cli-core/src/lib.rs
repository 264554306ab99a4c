// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! CLI core: reusable argument parsing and engine launcher.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;
use subflow_config::{SourceConfig, SubscriptionName};
use subflow_controller::{Controller, ControllerSettings, DemoFeed};

/// Parsed engine arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineArgs {
    /// Path to the source configuration file. Defaults apply when absent.
    pub config: Option<PathBuf>,
    /// Subscription used when no configuration file is given.
    pub subscription: String,
    /// Demo messages to publish (0 publishes until Ctrl-C).
    pub messages: usize,
    /// Pause between demo publications, in milliseconds.
    pub publish_interval_ms: u64,
    /// Tokio worker threads (0 uses one per CPU core).
    pub runtime_threads: usize,
    /// Cap on the configured batch size (0 keeps the configured value).
    pub batch_size_limit: usize,
    /// Print the configuration JSON schema and exit.
    pub print_schema: bool,
}

/// Build the base clap Command.
#[must_use]
pub fn base_command(bin_name: &'static str) -> Command {
    Command::new(bin_name)
        .about("Backpressured pub/sub batch ingestion")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Path to the source configuration file (.json, .yaml, or .yml)"),
        )
        .arg(
            Arg::new("subscription")
                .long("subscription")
                .num_args(1)
                .default_value("demo")
                .help("Subscription name used when no configuration file is given"),
        )
        .arg(
            Arg::new("messages")
                .short('n')
                .long("messages")
                .num_args(1)
                .value_parser(clap::value_parser!(usize))
                .default_value("1000")
                .help("Number of demo messages to publish (0 for an endless feed)"),
        )
        .arg(
            Arg::new("publish-interval-ms")
                .long("publish-interval-ms")
                .num_args(1)
                .value_parser(clap::value_parser!(u64))
                .default_value("1")
                .help("Pause between demo publications in milliseconds"),
        )
        .arg(
            Arg::new("runtime-threads")
                .long("runtime-threads")
                .num_args(1)
                .value_parser(clap::value_parser!(usize))
                .default_value("0")
                .help("Number of runtime threads (0 for one per CPU core)"),
        )
        .arg(
            Arg::new("batch-size-limit")
                .long("batch-size-limit")
                .num_args(1)
                .value_parser(clap::value_parser!(usize))
                .default_value("0")
                .help("Upper bound on the configured max_batch_size (0 for no bound)"),
        )
        .arg(
            Arg::new("print-schema")
                .long("print-schema")
                .action(ArgAction::SetTrue)
                .help("Print the JSON schema of the configuration file and exit"),
        )
        .after_help(format!(
            "Examples:\n  {bin_name} --config configs/demo.yaml\n  {bin_name} -n 0 --publish-interval-ms 10"
        ))
}

/// Parse [`EngineArgs`] from matches produced by [`base_command`].
#[must_use]
pub fn parse_engine_args(m: &ArgMatches) -> EngineArgs {
    EngineArgs {
        config: m.get_one::<PathBuf>("config").cloned(),
        subscription: m
            .get_one::<String>("subscription")
            .cloned()
            .unwrap_or_else(|| "demo".to_owned()),
        messages: m.get_one::<usize>("messages").copied().unwrap_or(1000),
        publish_interval_ms: m.get_one::<u64>("publish-interval-ms").copied().unwrap_or(1),
        runtime_threads: m.get_one::<usize>("runtime-threads").copied().unwrap_or(0),
        batch_size_limit: m.get_one::<usize>("batch-size-limit").copied().unwrap_or(0),
        print_schema: m.get_flag("print-schema"),
    }
}

/// Loads the configuration named by `args`, or builds a default one.
pub fn load_config(args: &EngineArgs) -> Result<SourceConfig, Box<dyn std::error::Error>> {
    match &args.config {
        Some(path) => Ok(SourceConfig::from_file(path)?),
        None => {
            let subscription = SubscriptionName::parse(&args.subscription)
                .map_err(|error| subflow_config::Error::InvalidUserConfig { error })?;
            Ok(SourceConfig::new(subscription))
        }
    }
}

/// Run the engine given already parsed [`EngineArgs`].
pub fn run_engine(args: &EngineArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    config.validate()?;
    let controller = Controller::new(ControllerSettings {
        worker_threads: (args.runtime_threads > 0).then_some(args.runtime_threads),
        batch_size_limit: (args.batch_size_limit > 0).then_some(args.batch_size_limit),
        ..ControllerSettings::default()
    });
    let feed = DemoFeed {
        messages: (args.messages > 0).then_some(args.messages),
        interval: Duration::from_millis(args.publish_interval_ms),
    };
    let stats = controller.run_forever(config, feed)?;
    tracing::info!(
        acked = stats.acked,
        nacked = stats.nacked,
        parse_errors = stats.parse_errors,
        "engine stopped"
    );
    Ok(())
}
