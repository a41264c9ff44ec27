use anyhow::Result;
use clap::ArgMatches;

use onfocus_api::AppConfig;

/// Print the effective configuration with secrets masked
pub fn handle_config(matches: &ArgMatches, config: &AppConfig) -> Result<()> {
    let redacted = config.redacted();

    match matches.get_one::<String>("format").map(String::as_str) {
        Some("plain") => println!("{:#?}", redacted),
        _ => println!("{}", serde_json::to_string_pretty(&redacted)?),
    }
    Ok(())
}
