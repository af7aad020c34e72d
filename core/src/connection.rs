//! Connection manager: owns the one live signaling socket.
//!
//! Exactly one transport connection exists per process. The manager performs
//! the authenticated handshake, tracks [`ConnectionState`], gates every
//! outbound emit on `Connected`, and fans inbound wire events out to
//! registered subscribers. It never retries on its own; reconnection policy
//! belongs to the caller.

use crate::config::ClientConfig;
use crate::events::{CoreEvent, EventBus};
use crate::models::ConnectionState;
use crate::transport::Transport;
use crate::wire::{ClientEvent, ServerEvent, ServerEventKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type WireHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync + 'static>;

#[derive(Default)]
struct WireRegistry {
    handlers: HashMap<ServerEventKind, Vec<(u64, WireHandler)>>,
}

pub struct ConnectionManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<ConnectionState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    connect_waiter: Arc<Mutex<Option<oneshot::Sender<bool>>>>,
    registry: Arc<Mutex<WireRegistry>>,
    next_token: AtomicU64,
    /// Serializes connect attempts; a new attempt tears down the old socket.
    connect_gate: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            transport,
            bus,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            outbound: Arc::new(Mutex::new(None)),
            dispatch_task: Mutex::new(None),
            connect_waiter: Arc::new(Mutex::new(None)),
            registry: Arc::new(Mutex::new(WireRegistry::default())),
            next_token: AtomicU64::new(1),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the socket and run the authenticated handshake. Resolves `true`
    /// only once the server acknowledges the connection; `false` on a
    /// connect error or when neither outcome arrives within the bound.
    pub async fn connect(&self, token: &str, user_id: &str) -> bool {
        let _gate = self.connect_gate.lock().await;

        self.teardown_link();
        set_state(&self.state, &self.bus, ConnectionState::Connecting);

        let link = match self.transport.open(&self.config.ws_url()).await {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Failed to open signaling socket: {}", e);
                set_state(&self.state, &self.bus, ConnectionState::Disconnected);
                return false;
            }
        };

        let (result_tx, result_rx) = oneshot::channel();
        *self.connect_waiter.lock() = Some(result_tx);
        *self.outbound.lock() = Some(link.outbound.clone());
        *self.dispatch_task.lock() = Some(self.spawn_dispatch(link.inbound));

        let auth = ClientEvent::Authenticate {
            token: token.to_string(),
            user_id: user_id.to_string(),
        };
        if link.outbound.send(auth).is_err() {
            self.teardown_link();
            set_state(&self.state, &self.bus, ConnectionState::Disconnected);
            return false;
        }

        match tokio::time::timeout(self.config.connect_timeout, result_rx).await {
            Ok(Ok(true)) => true,
            Ok(_) => {
                self.teardown_link();
                set_state(&self.state, &self.bus, ConnectionState::Disconnected);
                false
            }
            Err(_) => {
                log::warn!("Connect handshake timed out");
                self.teardown_link();
                set_state(&self.state, &self.bus, ConnectionState::Disconnected);
                false
            }
        }
    }

    pub fn disconnect(&self) {
        self.teardown_link();
        set_state(&self.state, &self.bus, ConnectionState::Disconnected);
    }

    /// Queue an event for the wire. Returns `false` whenever the connection
    /// is not up; this is the single enforcement point for "no send while
    /// disconnected".
    pub fn emit(&self, event: ClientEvent) -> bool {
        if self.state() != ConnectionState::Connected {
            log::debug!("Dropping emit while not connected");
            return false;
        }
        match &*self.outbound.lock() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Register a handler for one inbound event kind. Handlers run on the
    /// dispatch task, in arrival order.
    pub fn subscribe<F>(&self, kind: ServerEventKind, handler: F) -> u64
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .handlers
            .entry(kind)
            .or_default()
            .push((token, Arc::new(handler)));
        token
    }

    pub fn unsubscribe(&self, token: u64) {
        let mut registry = self.registry.lock();
        for list in registry.handlers.values_mut() {
            list.retain(|(t, _)| *t != token);
        }
        registry.handlers.retain(|_, list| !list.is_empty());
    }

    pub fn unsubscribe_all(&self) {
        self.registry.lock().handlers.clear();
    }

    fn spawn_dispatch(&self, mut inbound: mpsc::UnboundedReceiver<ServerEvent>) -> JoinHandle<()> {
        let state = self.state.clone();
        let bus = self.bus.clone();
        let waiter = self.connect_waiter.clone();
        let registry = self.registry.clone();
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                match &event {
                    ServerEvent::Connected => {
                        set_state(&state, &bus, ConnectionState::Connected);
                        if let Some(tx) = waiter.lock().take() {
                            let _ = tx.send(true);
                        }
                    }
                    ServerEvent::ConnectError { message } => {
                        log::warn!("Connect rejected: {}", message);
                        if let Some(tx) = waiter.lock().take() {
                            let _ = tx.send(false);
                        }
                    }
                    ServerEvent::Disconnected => {
                        log::warn!("Signaling socket lost");
                        *outbound.lock() = None;
                        set_state(&state, &bus, ConnectionState::Disconnected);
                        if let Some(tx) = waiter.lock().take() {
                            let _ = tx.send(false);
                        }
                    }
                    _ => {}
                }

                let handlers: Vec<WireHandler> = {
                    let registry = registry.lock();
                    registry
                        .handlers
                        .get(&event.kind())
                        .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                        .unwrap_or_default()
                };
                for handler in handlers {
                    handler(&event);
                }

                if matches!(event, ServerEvent::Disconnected) {
                    break;
                }
            }
        })
    }

    fn teardown_link(&self) {
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        // Dropping the sender closes the socket on the transport side.
        *self.outbound.lock() = None;
        *self.connect_waiter.lock() = None;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown_link();
    }
}

fn set_state(state: &Mutex<ConnectionState>, bus: &EventBus, new: ConnectionState) {
    let changed = {
        let mut state = state.lock();
        if *state != new {
            *state = new;
            true
        } else {
            false
        }
    };
    if changed {
        bus.publish(&CoreEvent::ConnectionChanged(new));
    }
}
