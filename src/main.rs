// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Run a subscription source pipeline against the in-memory broker.

use subflow_cli_core::{base_command, parse_engine_args, run_engine};
use subflow_config::SourceConfig;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = base_command(env!("CARGO_PKG_NAME")).get_matches();
    let engine_args = parse_engine_args(&matches);

    if engine_args.print_schema {
        let schema = schemars::schema_for!(SourceConfig);
        #[allow(clippy::print_stdout)]
        {
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let res = run_engine(&engine_args);
    if let Err(e) = &res {
        tracing::error!(error = %e, "engine failed");
    }
    res
}
