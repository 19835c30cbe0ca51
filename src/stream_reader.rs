use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::readings::{flatten_stream_frame, Reading};
use crate::token_manager::TokenManager;

pub const STREAM_PATH: &str = "/stream/meter";
const STREAM_DATA_PREFIX: &str = "data: ";
const STREAM_DECIMATION: usize = 6;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Background task holding the one live-data connection. Reconnects
/// forever on failure; exits only when cancelled or when the consumer side
/// of the channel goes away.
pub struct EnvoyStreamReader {
    base_url: String,
    tokens: Arc<TokenManager>,
    session: reqwest::Client,
    output: Sender<Reading>,
}

impl EnvoyStreamReader {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<TokenManager>,
        session: reqwest::Client,
        output: Sender<Reading>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            tokens,
            session,
            output,
        }
    }

    pub async fn run(self) {
        info!("starting envoy live stream reader");
        loop {
            match self.stream_once().await {
                // A cleanly ended body reconnects right away.
                Ok(()) => debug!("live stream ended, reconnecting"),
                Err(err) => {
                    warn!(
                        %err,
                        delay_secs = RECONNECT_DELAY.as_secs(),
                        "live stream failed, backing off before reconnect"
                    );
                    sleep(RECONNECT_DELAY).await;
                }
            }
            if self.output.is_closed() {
                debug!("live stream consumer gone, exiting");
                return;
            }
        }
    }

    /// One connection lifetime: open the stream, re-assemble lines across
    /// chunk boundaries, decimate, parse, forward.
    async fn stream_once(&self) -> Result<()> {
        let credential = self.tokens.ensure_valid(&self.session).await?;
        let url = format!("{}{}", self.base_url, STREAM_PATH);
        debug!(url, "opening live stream");

        let response = self
            .session
            .get(&url)
            .bearer_auth(credential.token())
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // Drop the dead token so the next cycle performs a full login.
            self.tokens.invalidate().await;
            return Err(Error::Auth { url });
        }
        if !status.is_success() {
            return Err(Error::Http { status, url });
        }

        let mut body = response.bytes_stream();
        let mut pending = String::new();
        let mut decimator = FrameDecimator::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                if let Some(reading) = decimator.accept(line.trim_end()) {
                    if self.output.send(reading).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Forwards every Nth raw line to parsing and discards the rest unread.
/// The device emits far more lines than downstream consumers need.
#[derive(Debug, Default)]
pub(crate) struct FrameDecimator {
    seen: usize,
}

impl FrameDecimator {
    pub(crate) fn new() -> Self {
        Self { seen: 0 }
    }

    pub(crate) fn accept(&mut self, line: &str) -> Option<Reading> {
        let forward = self.seen % STREAM_DECIMATION == 0;
        self.seen += 1;
        if !forward {
            return None;
        }
        parse_stream_line(line)
    }
}

/// Strips the data marker, rewrites the device's single-quote convention
/// into real JSON, and flattens the frame. Undecodable lines are dropped.
pub(crate) fn parse_stream_line(line: &str) -> Option<Reading> {
    let payload = line
        .strip_prefix(STREAM_DATA_PREFIX)
        .unwrap_or(line)
        .trim()
        .replace('\'', "\"");
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str(&payload) {
        Ok(frame) => Some(flatten_stream_frame(frame)),
        Err(err) => {
            debug!(%err, "dropping undecodable stream line");
            None
        }
    }
}
