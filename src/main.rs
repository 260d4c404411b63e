use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use hk_bus_data::{
    config::{Cli, Config},
    error::Error,
    fetch::FetchClient,
    service::Service,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let config = match Config::try_from(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Ok(ExitCode::from(2));
        }
    };

    let client = Arc::new(FetchClient::new(&config)?);
    if cli.clear_cache {
        client.cache().clear().await?;
        info!(dir = ?client.cache().dir(), "cleared response cache");
    }

    info!(
        source = ?cli.source,
        output = ?config.output_dir,
        requests_per_second = client.rate_limiter().rate(),
        concurrency = config.concurrency,
        cache = client.cache().is_enabled(),
        "starting"
    );

    let service = Service::new(config, client);
    let mut failed = false;

    if cli.source.includes_ctb() {
        failed |= report(service.run(&service.ctb()).await);
    }
    if cli.source.includes_kmb() {
        failed |= report(service.run(&service.kmb()).await);
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Logs a fatal run error. Returns whether the run failed.
fn report<T>(result: Result<T, Error>) -> bool {
    match result {
        Ok(_) => false,
        Err(e) => {
            error!(error = %e, "collection failed");
            true
        }
    }
}
