//! `bmview watch`: stream channels and print a status line per channel.

use anyhow::{Context, Result, bail};
use futures::future::try_join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use stream_mux::{Frame, SessionStatus, SharedSink, StreamFacade, StreamFileConfig};
use tokio::sync::watch;
use tracing::info;

use crate::WatchArgs;
use crate::config::resolve;

/// One watched channel as shown on screen.
struct Watched {
    consumer_id: String,
    channel: String,
    frames: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    status: watch::Receiver<SessionStatus>,
}

impl Watched {
    fn line(&self) -> String {
        let status = self.status.borrow();
        format_line(
            &self.channel,
            &status,
            self.frames.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

pub async fn watch_command(mut file_config: StreamFileConfig, args: WatchArgs) -> Result<()> {
    if let Some(mode) = args.mode {
        file_config.mode = mode.into();
    }
    let config = resolve(&file_config)?;

    let channels = if args.channels.is_empty() {
        config.channels.clone()
    } else {
        args.channels.clone()
    };
    if channels.is_empty() {
        bail!("No channels given and none configured");
    }
    if args.label.is_some() && channels.len() > 1 {
        bail!("--label only applies when watching a single channel");
    }

    info!(mode = ?config.mode, endpoint = %config.endpoint.template(), "starting watch");
    let facade = StreamFacade::with_websocket(config);

    let watched = try_join_all(channels.iter().enumerate().map(|(i, channel)| {
        let facade = &facade;
        let label = args.label.clone();
        async move {
            let frames = Arc::new(AtomicU64::new(0));
            let bytes = Arc::new(AtomicU64::new(0));
            let sink: SharedSink = {
                let frames = frames.clone();
                let bytes = bytes.clone();
                Arc::new(move |frame: &Frame| {
                    frames.fetch_add(1, Ordering::Relaxed);
                    bytes.fetch_add(frame.data.len() as u64, Ordering::Relaxed);
                })
            };
            let consumer_id = format!("watch-{i}");
            let status = facade
                .subscribe(&consumer_id, channel, sink, label)
                .await
                .with_context(|| format!("Failed to subscribe to {channel}"))?;
            Ok::<_, anyhow::Error>(Watched {
                consumer_id,
                channel: channel.clone(),
                frames,
                bytes,
                status,
            })
        }
    }))
    .await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = args.seconds.map(Duration::from_secs);
    let started = tokio::time::Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                break;
            }
            _ = ticker.tick() => {
                for w in &watched {
                    println!("{}", w.line());
                }
                if deadline.is_some_and(|d| started.elapsed() >= d) {
                    break;
                }
            }
        }
    }

    if let Some(metrics) = facade.mux_metrics() {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }
    for w in &watched {
        facade.unsubscribe(&w.consumer_id).await;
    }
    facade.shutdown().await;
    Ok(())
}

fn format_line(channel: &str, status: &SessionStatus, frames: u64, bytes: u64) -> String {
    let mut line = format!(
        "{:<24} {:<12} {:>3} fps {:>8} frames {:>10} KiB",
        channel,
        status.state,
        status.fps,
        frames,
        bytes / 1024
    );
    if status.retry_count > 0 {
        line.push_str(&format!("  retry {}", status.retry_count));
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!("  ({error})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_mux::SessionState;

    fn nil_status() -> SessionStatus {
        SessionStatus::new(Default::default(), Some("task/1".into()))
    }

    #[test]
    fn line_shows_state_and_counts() {
        let status = SessionStatus {
            state: SessionState::Playing,
            fps: 12,
            ..nil_status()
        };
        let line = format_line("task/1", &status, 340, 4096);
        assert!(line.starts_with("task/1"));
        assert!(line.contains("playing"));
        assert!(line.contains("12 fps"));
        assert!(line.contains("340 frames"));
        assert!(line.contains("4 KiB"));
        assert!(!line.contains("retry"));
    }

    #[test]
    fn line_shows_retries_and_errors() {
        let status = SessionStatus {
            state: SessionState::Reconnecting,
            retry_count: 2,
            last_error: Some("connection refused".into()),
            ..nil_status()
        };
        let line = format_line("task/1", &status, 0, 0);
        assert!(line.contains("reconnecting"));
        assert!(line.contains("retry 2"));
        assert!(line.contains("(connection refused)"));
    }
}
