//! Message pipeline: optimistic sends, echo suppression, typing state.
//!
//! The pipeline is the only component that emits message traffic. Outbound
//! sends are appended locally before the wire is touched and rolled to
//! Failed, never silently removed, when the transport refuses them. Inbound
//! events are reconciled so the sender's own traffic is never rendered
//! twice. The pipeline also owns reconnection policy: the connection
//! manager reports a drop, the pipeline decides whether and when to redial.

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::models::{ChatEntry, DeliveryState, InboundMessage, MessageType, OutboundMessage};
use crate::services::AuthTokenProvider;
use crate::wire::{ClientEvent, ServerEvent, ServerEventKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
struct PipelineState {
    peer_id: Option<String>,
    entries: Vec<ChatEntry>,
    /// Bumped on every conversation switch; timers check it before acting.
    epoch: u64,
    typing_active: bool,
    typing_stop_task: Option<JoinHandle<()>>,
    peer_typing: bool,
    peer_typing_task: Option<JoinHandle<()>>,
    peer_online: bool,
    foreground: bool,
    reconnect_task: Option<JoinHandle<()>>,
}

pub struct MessagePipeline {
    connection: Arc<ConnectionManager>,
    bus: Arc<EventBus>,
    tokens: Arc<dyn AuthTokenProvider>,
    local_user_id: String,
    typing_stop_delay: Duration,
    typing_expiry: Duration,
    reconnect_delay: Duration,
    inner: Arc<Mutex<PipelineState>>,
    wire_tokens: Mutex<Vec<u64>>,
}

impl MessagePipeline {
    pub fn new(
        connection: Arc<ConnectionManager>,
        bus: Arc<EventBus>,
        tokens: Arc<dyn AuthTokenProvider>,
        local_user_id: &str,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            connection,
            bus,
            tokens,
            local_user_id: local_user_id.to_string(),
            typing_stop_delay: config.typing_stop_delay,
            typing_expiry: config.typing_expiry,
            reconnect_delay: config.reconnect_delay,
            inner: Arc::new(Mutex::new(PipelineState {
                foreground: true,
                ..PipelineState::default()
            })),
            wire_tokens: Mutex::new(Vec::new()),
        });
        Self::register_wire_handlers(&pipeline);
        pipeline
    }

    pub fn shutdown(&self) {
        let tokens: Vec<u64> = self.wire_tokens.lock().drain(..).collect();
        for token in tokens {
            self.connection.unsubscribe(token);
        }
        let mut state = self.inner.lock();
        for task in [
            state.typing_stop_task.take(),
            state.peer_typing_task.take(),
            state.reconnect_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }

    // ============= Conversation =============

    pub fn open_conversation(&self, peer_id: &str) {
        let mut state = self.inner.lock();
        state.epoch += 1;
        state.peer_id = Some(peer_id.to_string());
        state.entries.clear();
        state.typing_active = false;
        state.peer_typing = false;
        state.peer_online = false;
        if let Some(task) = state.typing_stop_task.take() {
            task.abort();
        }
        if let Some(task) = state.peer_typing_task.take() {
            task.abort();
        }
    }

    pub fn close_conversation(&self) {
        let peer_id = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            if let Some(task) = state.typing_stop_task.take() {
                task.abort();
            }
            if let Some(task) = state.peer_typing_task.take() {
                task.abort();
            }
            state.typing_active = false;
            state.peer_typing = false;
            state.peer_id.take()
        };
        if let Some(peer_id) = peer_id {
            self.connection
                .emit(ClientEvent::LeaveConversation { recipient_id: peer_id });
        }
    }

    /// Foreground drives the reconnect policy; backgrounding sends the
    /// courtesy leave so the peer's presence view stays honest.
    pub fn set_foreground(&self, foreground: bool) {
        let peer_id = {
            let mut state = self.inner.lock();
            state.foreground = foreground;
            state.peer_id.clone()
        };

        if foreground {
            if !self.connection.is_connected() {
                self.schedule_reconnect();
            }
        } else if let Some(peer_id) = peer_id {
            self.connection
                .emit(ClientEvent::LeaveConversation { recipient_id: peer_id });
        }
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn peer_typing(&self) -> bool {
        self.inner.lock().peer_typing
    }

    pub fn peer_online(&self) -> bool {
        self.inner.lock().peer_online
    }

    // ============= Sending =============

    /// Send to the open conversation. The optimistic entry is appended
    /// before the wire is attempted; a refused emit marks it Failed and
    /// surfaces the error.
    pub fn send(&self, message_type: MessageType, content: &str) -> Result<OutboundMessage> {
        let peer_id = self
            .inner
            .lock()
            .peer_id
            .clone()
            .ok_or(Error::NoConversation)?;
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        if message_type == MessageType::Text && content.trim().is_empty() {
            return Err(Error::EmptyContent);
        }

        let mut message = OutboundMessage::new(
            message_type,
            content.to_string(),
            &self.local_user_id,
            &peer_id,
        );
        self.inner
            .lock()
            .entries
            .push(ChatEntry::Outbound(message.clone()));
        self.bus.publish(&CoreEvent::MessageAppended(message.clone()));

        let accepted = self.connection.emit(ClientEvent::SendMessage {
            recipient_id: peer_id,
            content: content.to_string(),
            message_type,
        });

        let delivery = if accepted {
            DeliveryState::Sent
        } else {
            DeliveryState::Failed
        };
        message.delivery = delivery;
        self.update_delivery(&message.local_id, delivery);

        if accepted {
            Ok(message)
        } else {
            log::warn!("Send refused by transport; message marked failed");
            Err(Error::NotConnected)
        }
    }

    fn update_delivery(&self, local_id: &str, delivery: DeliveryState) {
        let snapshot = {
            let mut state = self.inner.lock();
            let mut snapshot = None;
            for entry in state.entries.iter_mut() {
                if let ChatEntry::Outbound(out) = entry {
                    if out.local_id == local_id {
                        out.delivery = delivery;
                        snapshot = Some(out.clone());
                        break;
                    }
                }
            }
            snapshot
        };
        if let Some(message) = snapshot {
            self.bus.publish(&CoreEvent::MessageUpdated(message));
        }
    }

    // ============= Typing =============

    /// Call on every keystroke. First non-empty content emits typing_start
    /// once; the stop is debounced behind the configured quiet period, or
    /// emitted immediately when the input empties.
    pub fn on_text_changed(&self, text: &str) {
        let mut state = self.inner.lock();
        let peer_id = match state.peer_id.clone() {
            Some(peer_id) => peer_id,
            None => return,
        };

        if text.trim().is_empty() {
            if state.typing_active {
                state.typing_active = false;
                if let Some(task) = state.typing_stop_task.take() {
                    task.abort();
                }
                drop(state);
                self.connection
                    .emit(ClientEvent::TypingStop { recipient_id: peer_id });
            }
            return;
        }

        if !state.typing_active {
            state.typing_active = true;
            self.connection.emit(ClientEvent::TypingStart {
                recipient_id: peer_id.clone(),
            });
        }
        if let Some(task) = state.typing_stop_task.take() {
            task.abort();
        }
        let epoch = state.epoch;
        state.typing_stop_task = Some(self.spawn_typing_stop(peer_id, epoch));
    }

    fn spawn_typing_stop(&self, peer_id: String, epoch: u64) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let connection = self.connection.clone();
        let delay = self.typing_stop_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = inner.lock();
                if state.epoch != epoch || !state.typing_active {
                    return;
                }
                state.typing_active = false;
                state.typing_stop_task = None;
            }
            connection.emit(ClientEvent::TypingStop { recipient_id: peer_id });
        })
    }

    fn spawn_typing_expiry(&self, user_id: String, epoch: u64) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let bus = self.bus.clone();
        let expiry = self.typing_expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            {
                let mut state = inner.lock();
                if state.epoch != epoch || !state.peer_typing {
                    return;
                }
                state.peer_typing = false;
                state.peer_typing_task = None;
            }
            bus.publish(&CoreEvent::TypingChanged {
                user_id,
                is_typing: false,
            });
        })
    }

    // ============= Inbound =============

    fn register_wire_handlers(this: &Arc<Self>) {
        let mut tokens = this.wire_tokens.lock();

        let pipeline = this.clone();
        tokens.push(this.connection.subscribe(
            ServerEventKind::ReceiveMessage,
            move |event| {
                if let ServerEvent::ReceiveMessage {
                    sender_id,
                    recipient_id,
                    content,
                    message_type,
                    timestamp,
                } = event
                {
                    pipeline.on_receive(InboundMessage {
                        sender_id: sender_id.clone(),
                        recipient_id: recipient_id.clone(),
                        content: content.clone(),
                        message_type: *message_type,
                        timestamp: *timestamp,
                    });
                }
            },
        ));

        let pipeline = this.clone();
        tokens.push(
            this.connection
                .subscribe(ServerEventKind::UserTyping, move |event| {
                    if let ServerEvent::UserTyping { user_id, is_typing } = event {
                        pipeline.on_peer_typing(user_id.clone(), *is_typing);
                    }
                }),
        );

        let pipeline = this.clone();
        tokens.push(
            this.connection
                .subscribe(ServerEventKind::MessageSent, move |event| {
                    if let ServerEvent::MessageSent { recipient_online } = event {
                        // Bookkeeping only; absence of this ack means nothing.
                        pipeline.inner.lock().peer_online = *recipient_online;
                    }
                }),
        );

        let pipeline = this.clone();
        tokens.push(
            this.connection
                .subscribe(ServerEventKind::ConversationJoined, move |event| {
                    if let ServerEvent::ConversationJoined {
                        is_other_user_online,
                    } = event
                    {
                        pipeline.set_peer_online(*is_other_user_online);
                    }
                }),
        );

        let pipeline = this.clone();
        tokens.push(this.connection.subscribe(
            ServerEventKind::UserJoinedConversation,
            move |event| {
                if let ServerEvent::UserJoinedConversation { connected_users } = event {
                    let peer_id = pipeline.inner.lock().peer_id.clone();
                    if let Some(peer_id) = peer_id {
                        if connected_users.iter().any(|u| *u == peer_id) {
                            pipeline.set_peer_online(true);
                        }
                    }
                }
            },
        ));

        let pipeline = this.clone();
        tokens.push(this.connection.subscribe(
            ServerEventKind::UserLeftConversation,
            move |event| {
                if let ServerEvent::UserLeftConversation { user_id } = event {
                    let matches = pipeline.inner.lock().peer_id.as_deref() == Some(user_id.as_str());
                    if matches {
                        pipeline.set_peer_online(false);
                    }
                }
            },
        ));

        let pipeline = this.clone();
        tokens.push(
            this.connection
                .subscribe(ServerEventKind::Disconnected, move |_| {
                    pipeline.schedule_reconnect();
                }),
        );
    }

    fn set_peer_online(&self, online: bool) {
        let user_id = {
            let mut state = self.inner.lock();
            state.peer_online = online;
            state.peer_id.clone()
        };
        if let Some(user_id) = user_id {
            self.bus
                .publish(&CoreEvent::PresenceChanged { user_id, online });
        }
    }

    fn on_receive(&self, msg: InboundMessage) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.lock();
            let current_peer = state.peer_id.clone();

            if msg.sender_id == self.local_user_id {
                // Our own traffic reflected back. If it belongs to some other
                // conversation it is a cross-device echo: drop it outright.
                if current_peer.as_deref() != Some(msg.recipient_id.as_str()) {
                    log::debug!("Discarding cross-conversation echo");
                    return;
                }

                // Same conversation: fold into the optimistic entry.
                let idx = state.entries.iter().rposition(|entry| {
                    matches!(entry, ChatEntry::Outbound(out)
                        if out.content == msg.content
                            && out.recipient_id == msg.recipient_id
                            && matches!(out.delivery, DeliveryState::Pending | DeliveryState::Sent))
                });
                match idx {
                    Some(idx) => {
                        if let ChatEntry::Outbound(out) = &mut state.entries[idx] {
                            out.delivery = DeliveryState::Echoed;
                            events.push(CoreEvent::MessageUpdated(out.clone()));
                        }
                    }
                    None => {
                        // Sent from another of our devices into this very
                        // conversation; keep history consistent.
                        let mut out = OutboundMessage::new(
                            msg.message_type,
                            msg.content.clone(),
                            &msg.sender_id,
                            &msg.recipient_id,
                        );
                        out.created_at = msg.timestamp;
                        out.delivery = DeliveryState::Echoed;
                        state.entries.push(ChatEntry::Outbound(out.clone()));
                        events.push(CoreEvent::MessageAppended(out));
                    }
                }
            } else {
                // A peer message implies the peer stopped typing.
                if state.peer_typing && current_peer.as_deref() == Some(msg.sender_id.as_str()) {
                    state.peer_typing = false;
                    if let Some(task) = state.peer_typing_task.take() {
                        task.abort();
                    }
                    events.push(CoreEvent::TypingChanged {
                        user_id: msg.sender_id.clone(),
                        is_typing: false,
                    });
                }
                state.entries.push(ChatEntry::Inbound(msg.clone()));
                events.push(CoreEvent::MessageReceived(msg));
            }
        }

        for event in &events {
            self.bus.publish(event);
        }
    }

    fn on_peer_typing(&self, user_id: String, is_typing: bool) {
        let changed = {
            let mut state = self.inner.lock();
            if state.peer_id.as_deref() != Some(user_id.as_str()) {
                return;
            }
            if let Some(task) = state.peer_typing_task.take() {
                task.abort();
            }
            let changed = state.peer_typing != is_typing;
            state.peer_typing = is_typing;
            if is_typing {
                // Self-expiring: an explicit stop may never arrive.
                let epoch = state.epoch;
                state.peer_typing_task = Some(self.spawn_typing_expiry(user_id.clone(), epoch));
            }
            changed
        };

        if changed {
            self.bus
                .publish(&CoreEvent::TypingChanged { user_id, is_typing });
        }
    }

    // ============= Reconnect policy =============

    /// Fixed-delay redial while foregrounded with a live conversation and a
    /// usable token. No backoff and no cap, matching the historical client.
    fn schedule_reconnect(&self) {
        let mut state = self.inner.lock();
        if !state.foreground || state.peer_id.is_none() {
            return;
        }
        if state
            .reconnect_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
        {
            return;
        }

        let inner = self.inner.clone();
        let connection = self.connection.clone();
        let tokens = self.tokens.clone();
        let user_id = self.local_user_id.clone();
        let delay = self.reconnect_delay;
        state.reconnect_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                {
                    let state = inner.lock();
                    if !state.foreground || state.peer_id.is_none() {
                        break;
                    }
                }
                let token = match tokens.current_token() {
                    Some(token) if !token.is_expired() => token,
                    _ => {
                        log::warn!("No usable auth token; giving up on reconnect");
                        break;
                    }
                };
                log::info!("Reconnecting to signaling server");
                if connection.connect(&token.token, &user_id).await {
                    break;
                }
            }
        }));
    }
}
