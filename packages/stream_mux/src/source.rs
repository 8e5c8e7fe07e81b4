//! Where the list of selectable channels comes from.

use futures::future::BoxFuture;

use crate::config::StreamConfig;
use crate::error::StreamError;

/// Lists the channels a consumer may pick from.
pub trait ChannelSource: Send + Sync {
    fn channels(&self) -> BoxFuture<'_, Result<Vec<String>, StreamError>>;
}

/// A fixed list, usually taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticChannelSource {
    channels: Vec<String>,
}

impl StaticChannelSource {
    /// Blank entries are skipped and duplicates collapse to their first
    /// occurrence.
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list: Vec<String> = Vec::new();
        for channel in channels {
            let channel = channel.as_ref().trim();
            if !channel.is_empty() && !list.iter().any(|c| c == channel) {
                list.push(channel.to_string());
            }
        }
        Self { channels: list }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(&config.channels)
    }
}

impl ChannelSource for StaticChannelSource {
    fn channels(&self) -> BoxFuture<'_, Result<Vec<String>, StreamError>> {
        Box::pin(async move { Ok(self.channels.clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamFileConfig;

    #[tokio::test]
    async fn static_source_cleans_list() {
        let source = StaticChannelSource::new(["task/1", " task/2 ", "", "task/1"]);
        assert_eq!(source.channels().await.unwrap(), ["task/1", "task/2"]);
    }

    #[tokio::test]
    async fn built_from_config() {
        let file = StreamFileConfig {
            channels: vec!["dock".into(), "gate".into()],
            ..StreamFileConfig::default()
        };
        let config = StreamConfig::from_file(&file).unwrap();
        let source = StaticChannelSource::from_config(&config);
        assert_eq!(source.channels().await.unwrap(), ["dock", "gate"]);
    }
}
