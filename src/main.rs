use anyhow::Context;
use clap::{Arg, Command};
use onfocus_api::{AppConfig, logging};
use std::process;

mod cli;

#[tokio::main]
async fn main() {
    cli::load_env_files();

    let matches = build_cli().get_matches();

    if let Err(e) = run_command(matches).await {
        tracing::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn build_cli() -> Command {
    Command::new("onfocus")
        .version(env!("CARGO_PKG_VERSION"))
        .about("OnFocus API - HTTP service backed by a pooled MySQL connection")
        .subcommand_required(false)
        .subcommand(
            Command::new("serve")
                .about("Start the HTTP API (default)")
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .help("Port to listen on (overrides PORT)")
                        .value_parser(clap::value_parser!(u16).range(1..)),
                )
                .arg(
                    Arg::new("host")
                        .long("host")
                        .help("Host to bind to"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Check database connectivity and pool settings")
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .help("Show pool details")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration with secrets redacted")
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .help("Output format")
                        .value_parser(["json", "plain"])
                        .default_value("json"),
                ),
        )
}

async fn run_command(matches: clap::ArgMatches) -> anyhow::Result<()> {
    let config = AppConfig::load().context("invalid configuration")?;
    logging::init(&config.logging, config.environment);

    match matches.subcommand() {
        Some(("status", sub_matches)) => {
            cli::commands::status::handle_status(sub_matches, config).await?
        }
        Some(("config", sub_matches)) => cli::commands::config::handle_config(sub_matches, &config)?,
        Some(("serve", sub_matches)) => cli::commands::serve::handle_serve(sub_matches, config).await?,
        _ => {
            let defaults = build_cli().get_matches_from(["onfocus", "serve"]);
            let serve_matches = defaults
                .subcommand_matches("serve")
                .context("serve subcommand missing")?;
            cli::commands::serve::handle_serve(serve_matches, config).await?
        }
    }

    Ok(())
}
