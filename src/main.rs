use anyhow::Result;
use log::error;

use furnace_cal::cli::{build_cli, commands};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let matches = build_cli().get_matches();

    match commands::handle_subcommands(&matches).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("❌ {} ({})", e, e.kind());
            Err(e.into())
        }
    }
}
