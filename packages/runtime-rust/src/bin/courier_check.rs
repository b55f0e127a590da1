//! Resolve and validate a runtime configuration, then print it as JSON.
//!
//! Reads the file named by `--config` / `COURIER_CONFIG`, applies the
//! `COURIER_*` overrides, and exits non-zero when the result is invalid.

use clap::Parser;
use courier_runtime::service::RuntimeArgs;
use courier_runtime::telemetry::init_tracing;

fn main() -> anyhow::Result<()> {
    let config = RuntimeArgs::parse().resolve()?;
    init_tracing(config.log_format)?;

    tracing::info!(
        node_id = %config.node_id,
        prefix = ?config.naming.prefix,
        dead_letters = config.naming.dead_letter_enabled,
        "configuration valid"
    );
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
