use clap::{Command, CommandFactory, Parser};
use clap_complete::{generate, Generator};
use region_latency::aggregator::compute;
use region_latency::cli::Cli;
use region_latency::cli::Commands;
use region_latency::cli::Commands::GenerateAutoComplete;
use region_latency::dataset;
use region_latency::error::TelemetryResult;
use region_latency::server::{publish_dataset_metrics, LatencyServer};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> TelemetryResult<()> {
    let mut cmd = Cli::command();
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into());
    let subscriber = fmt()
        .pretty()
        .with_file(true)
        .with_line_number(true)
        .with_writer(io::stderr)
        .with_env_filter(filter);

    subscriber.init();

    match cli.command {
        GenerateAutoComplete { shell } => {
            eprintln!("Generating completion file for {shell}...");
            print_completions(shell, &mut cmd);
        }

        Commands::Serve { data, bind } => {
            let addr: SocketAddr = bind.parse()?;
            // published to handlers only once loading has finished, successfully or not
            let dataset = Arc::new(dataset::load(&data));
            publish_dataset_metrics(&dataset);
            if !dataset.is_available() {
                info!("Serving in degraded mode, every query will report unavailable telemetry");
            }
            let server = LatencyServer::start(addr, dataset)?;
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl-C, shutting down");
            server.stop().await;
        }

        Commands::Query {
            data,
            threshold_ms,
            regions,
        } => {
            let dataset = dataset::load(&data);
            let outcome = compute(&dataset, &regions, threshold_ms);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}

fn print_completions<G: Generator>(
    gen: G,
    cmd: &mut Command,
) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
}
