pub mod watch;

use anyhow::{Context, Result};
use stream_mux::{ChannelSource, StaticChannelSource, StreamFileConfig};

use crate::config::resolve;

/// List the channels offered by the configured channel source.
pub async fn channels_command(file_config: &StreamFileConfig, json: bool) -> Result<()> {
    let config = resolve(file_config)?;
    let source = StaticChannelSource::from_config(&config);
    let channels = source.channels().await.context("Failed to list channels")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&channels)?);
    } else if channels.is_empty() {
        println!("No channels configured. Add `channels = [..]` to config.toml.");
    } else {
        for channel in &channels {
            println!("{channel}");
        }
        println!("\n{} channel(s)", channels.len());
    }
    Ok(())
}

/// Print the layered configuration after validating it.
pub fn config_command(file_config: &StreamFileConfig, json: bool) -> Result<()> {
    resolve(file_config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(file_config)?);
    } else {
        print!(
            "{}",
            toml::to_string_pretty(file_config).context("Failed to render configuration")?
        );
    }
    Ok(())
}
