use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

pub const DEFAULT_DATA_PATH: &str = "api/q-vercel-latency.json";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

#[derive(Parser, Debug)]
#[command(name = "region-latency", version, about="region latency and uptime statistics", long_about = None, arg_required_else_help(true), propagate_version(true))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(arg_required_else_help = true)]
    GenerateAutoComplete { shell: Shell },

    Serve {
        #[arg(
            short,
            long,
            env = "TELEMETRY_DATA",
            default_value = DEFAULT_DATA_PATH,
            help = "Path of the JSON telemetry source, read once at startup"
        )]
        data: PathBuf,
        #[arg(
            short,
            long,
            env = "TELEMETRY_BIND",
            default_value = DEFAULT_BIND_ADDR,
            help = "Address the HTTP server listens on"
        )]
        bind: String,
    },

    #[command(arg_required_else_help = true)]
    Query {
        #[arg(
            short,
            long,
            env = "TELEMETRY_DATA",
            default_value = DEFAULT_DATA_PATH,
            help = "Path of the JSON telemetry source"
        )]
        data: PathBuf,
        #[arg(
            short,
            long,
            allow_negative_numbers = true,
            help = "Latency above which a record counts as a breach"
        )]
        threshold_ms: f64,
        #[arg(required = false, help = "Region names to summarize")]
        regions: Vec<String>,
    },
}
