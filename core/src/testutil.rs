//! Shared fakes for unit tests.

use crate::error::Result;
use crate::media::{EngineEvent, MediaNegotiator};
use crate::models::CallType;
use crate::transport::{Transport, TransportLink};
use crate::wire::{ClientEvent, IceCandidate, ServerEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How the fake signaling server answers the auth handshake.
#[derive(Clone)]
pub enum AckMode {
    Accept,
    Reject(String),
    Silent,
}

/// Test side of one opened link.
pub struct LinkHandle {
    pub to_client: mpsc::UnboundedSender<ServerEvent>,
    pub from_client: mpsc::UnboundedReceiver<ClientEvent>,
}

/// In-memory transport. Each `open` yields a fresh link whose far end the
/// test drives through [`LinkHandle`].
pub struct FakeTransport {
    mode: AckMode,
    links: Mutex<Vec<LinkHandle>>,
}

impl FakeTransport {
    pub fn new(mode: AckMode) -> Self {
        Self {
            mode,
            links: Mutex::new(Vec::new()),
        }
    }

    /// Hand the newest link to the test.
    pub fn take_link(&self) -> LinkHandle {
        self.links.lock().pop().expect("no link opened")
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _url: &str) -> Result<TransportLink> {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

        match &self.mode {
            AckMode::Accept => {
                let _ = in_tx.send(ServerEvent::Connected);
            }
            AckMode::Reject(message) => {
                let _ = in_tx.send(ServerEvent::ConnectError {
                    message: message.clone(),
                });
            }
            AckMode::Silent => {}
        }

        self.links.lock().push(LinkHandle {
            to_client: in_tx,
            from_client: out_rx,
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Scripted negotiator for call controller tests. Records every command and
/// lets the test inject engine events by keeping the event sender around.
pub struct ScriptedNegotiator {
    pub started: AtomicBool,
    pub shut_down: AtomicBool,
    pub offers_created: AtomicBool,
    pub commands: Mutex<Vec<String>>,
    pub events: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    /// Answer returned by handle_offer.
    pub answer_sdp: String,
}

impl ScriptedNegotiator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            offers_created: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            answer_sdp: "v=0 answer".to_string(),
        })
    }

    pub fn send_event(&self, event: EngineEvent) {
        if let Some(tx) = &*self.events.lock() {
            let _ = tx.send(event);
        }
    }

    fn record(&self, command: &str) {
        self.commands.lock().push(command.to_string());
    }
}

#[async_trait]
impl MediaNegotiator for ScriptedNegotiator {
    async fn start(
        &self,
        _call_type: CallType,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        self.record("start");
        self.started.store(true, Ordering::SeqCst);
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        self.record("create_offer");
        self.offers_created.store(true, Ordering::SeqCst);
        Ok("v=0 offer".to_string())
    }

    async fn handle_offer(&self, _sdp: String) -> Result<String> {
        self.record("handle_offer");
        Ok(self.answer_sdp.clone())
    }

    async fn handle_answer(&self, _sdp: String) -> Result<()> {
        self.record("handle_answer");
        Ok(())
    }

    async fn handle_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.record("handle_candidate");
        Ok(())
    }

    async fn shutdown(&self) {
        self.record("shutdown");
        self.shut_down.store(true, Ordering::SeqCst);
    }

    fn set_muted(&self, _muted: bool) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shut_down.load(Ordering::SeqCst)
    }

    fn set_video_enabled(&self, _enabled: bool) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shut_down.load(Ordering::SeqCst)
    }

    fn switch_camera(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shut_down.load(Ordering::SeqCst)
    }
}
