use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EnvoyConfig;
use crate::envoy_api::EnvoyApi;
use crate::error::Result;
use crate::readings::Reading;
use crate::stream_reader::EnvoyStreamReader;
use crate::token_manager::{TokenManager, LOGIN_URL, TOKEN_URL};

/// Lifecycle state of the background stream: both handles present while
/// running, both empty while idle.
#[derive(Default)]
struct StreamSession {
    task: Option<JoinHandle<()>>,
    shutdown_hook: Option<JoinHandle<()>>,
}

/// The externally visible unit: identity lookup, one-shot snapshots, and
/// the optional live stream, all against a caller-owned HTTP client.
pub struct EnvoyReader {
    api: EnvoyApi,
    stream: Mutex<StreamSession>,
}

impl EnvoyReader {
    pub fn new(config: &EnvoyConfig) -> Self {
        Self::with_endpoints(config, LOGIN_URL, TOKEN_URL)
    }

    /// Same as [`EnvoyReader::new`] with the Enlighten endpoints
    /// overridden, for tests against a local mock.
    pub fn with_endpoints(
        config: &EnvoyConfig,
        login_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::with_endpoints(login_url, token_url, config));
        Self {
            api: EnvoyApi::new(config.base_url(), tokens),
            stream: Mutex::new(StreamSession::default()),
        }
    }

    /// Device serial number, reachable without credentials. Used for
    /// identity during initial setup.
    pub async fn identify(&self, session: &reqwest::Client) -> Result<String> {
        self.api.serial_number(session).await
    }

    /// One authenticated poll, normalized.
    pub async fn snapshot(&self, session: &reqwest::Client) -> Result<Reading> {
        self.api.readings_snapshot(session).await
    }

    /// Spawns the live stream task pushing normalized frames into
    /// `output`. At most one task runs per reader; calling this while one
    /// is already running is a no-op. A process stop signal (Ctrl-C) also
    /// stops the task, best effort.
    pub fn start_stream(&self, session: &reqwest::Client, output: Sender<Reading>) {
        let mut stream = self.stream.lock().expect("stream session lock poisoned");
        if let Some(task) = stream.task.as_ref() {
            if !task.is_finished() {
                warn!("stream task already running");
                return;
            }
        }

        let reader = EnvoyStreamReader::new(
            self.api.base_url(),
            Arc::clone(self.api.tokens()),
            session.clone(),
            output,
        );
        let task = tokio::spawn(reader.run());

        let abort = task.abort_handle();
        stream.shutdown_hook = Some(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("stop signal received, stopping stream task");
                abort.abort();
            }
        }));
        stream.task = Some(task);
    }

    /// Cancels the stream task and abandons its connection. Never blocks on
    /// the network; stopping an already-stopped reader is a no-op.
    pub fn stop_stream(&self) {
        let mut stream = self.stream.lock().expect("stream session lock poisoned");
        if let Some(task) = stream.task.take() {
            task.abort();
            debug!("stream task stopped");
        }
        if let Some(hook) = stream.shutdown_hook.take() {
            hook.abort();
        }
    }
}

impl Drop for EnvoyReader {
    fn drop(&mut self) {
        self.stop_stream();
    }
}
