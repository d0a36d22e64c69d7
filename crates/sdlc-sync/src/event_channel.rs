//! Reconnecting push connection feeding the shared [`EventLog`].

use crate::event_log::EventLog;
use crate::scheduler::Poller;
use futures_util::StreamExt;
use sdlc_core::events::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

pub struct EventChannel {
    url: Url,
    reconnect_delay: Duration,
    log: Arc<EventLog>,
    connected: Arc<watch::Sender<bool>>,
    poller: Poller,
}

impl EventChannel {
    pub fn new(url: Url, capacity: usize, reconnect_delay: Duration) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            url,
            reconnect_delay,
            log: Arc::new(EventLog::new(capacity)),
            connected: Arc::new(connected),
            poller: Poller::new("event_channel"),
        }
    }

    /// Opens the connection in the background. Calling it again restarts the
    /// loop; the buffered events are kept.
    pub fn start(&mut self) {
        let url = self.url.clone();
        let delay = self.reconnect_delay;
        let log = self.log.clone();
        let connected = self.connected.clone();
        self.poller.spawn(run_channel(url, delay, log, connected));
    }

    pub fn stop(&mut self) {
        self.poller.stop();
        self.connected.send_replace(false);
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }

    pub fn log(&self) -> Arc<EventLog> {
        self.log.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Empties the buffer without touching the connection.
    pub fn clear_events(&self) {
        self.log.clear();
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

async fn run_channel(
    url: Url,
    reconnect_delay: Duration,
    log: Arc<EventLog>,
    connected: Arc<watch::Sender<bool>>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                info!("event_channel_open: {url}");
                connected.send_replace(true);
                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(Message::Text(text)) => append_frame(&log, text.as_bytes()),
                        Ok(Message::Binary(bytes)) => append_frame(&log, &bytes),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!("event_channel_read_error: {err}");
                            break;
                        }
                    }
                }
                connected.send_replace(false);
                info!("event_channel_closed: {url}");
            }
            Err(err) => {
                connected.send_replace(false);
                warn!("event_channel_connect_error: {err}");
            }
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

fn append_frame(log: &EventLog, bytes: &[u8]) {
    match Event::decode_slice(bytes) {
        Ok(event) => {
            log.push(event);
        }
        Err(err) => debug!("event_channel_drop_frame: {err}"),
    }
}
