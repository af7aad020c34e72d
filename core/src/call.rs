//! Call session controller.
//!
//! Owns the single live [`CallSession`] and every transition on it. Wire
//! events, the ring timer, and media engine reports all funnel into one
//! control queue, so transitions are applied strictly in arrival order. The
//! controller is the only component allowed to command the media negotiator.

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::media::{EngineEvent, MediaNegotiator};
use crate::models::{CallPhase, CallSession, CallType, CallerMeta};
use crate::wire::{ClientEvent, IceCandidate, ServerEvent, ServerEventKind, SignalPayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum ControlMsg {
    Wire(ServerEvent),
    RingTimeout { call_id: String },
    MediaConnected { call_id: String },
    MediaDisconnected { call_id: String },
}

#[derive(Default)]
struct CallSlot {
    session: Option<CallSession>,
    ring_timer: Option<JoinHandle<()>>,
    engine_pump: Option<JoinHandle<()>>,
}

pub struct CallController {
    connection: Arc<ConnectionManager>,
    bus: Arc<EventBus>,
    media: Arc<dyn MediaNegotiator>,
    local_user_id: String,
    caller_meta: CallerMeta,
    ring_timeout: Duration,
    slot: tokio::sync::Mutex<CallSlot>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    loop_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    wire_tokens: parking_lot::Mutex<Vec<u64>>,
}

impl CallController {
    pub fn new(
        connection: Arc<ConnectionManager>,
        bus: Arc<EventBus>,
        media: Arc<dyn MediaNegotiator>,
        local_user_id: &str,
        caller_meta: CallerMeta,
        ring_timeout: Duration,
    ) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let controller = Arc::new(Self {
            connection,
            bus,
            media,
            local_user_id: local_user_id.to_string(),
            caller_meta,
            ring_timeout,
            slot: tokio::sync::Mutex::new(CallSlot::default()),
            control_tx,
            loop_task: parking_lot::Mutex::new(None),
            wire_tokens: parking_lot::Mutex::new(Vec::new()),
        });

        controller.register_wire_handlers();
        let task = tokio::spawn(Self::run_loop(controller.clone(), control_rx));
        *controller.loop_task.lock() = Some(task);

        controller
    }

    /// Release wire subscriptions and stop the control loop.
    pub fn shutdown(&self) {
        let tokens: Vec<u64> = self.wire_tokens.lock().drain(..).collect();
        for token in tokens {
            self.connection.unsubscribe(token);
        }
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
    }

    pub async fn current_call(&self) -> Option<CallSession> {
        self.slot.lock().await.session.clone()
    }

    // ============= Commands =============

    /// Start an outbound call. At most one session may be live.
    pub async fn initiate(&self, recipient_id: &str, call_type: CallType) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if slot.session.is_some() {
            return Err(Error::CallInProgress);
        }
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }

        let accepted = self.connection.emit(ClientEvent::CallInitiate {
            recipient_id: recipient_id.to_string(),
            call_type,
            caller_meta: self.caller_meta.clone(),
        });
        if !accepted {
            return Err(Error::NotConnected);
        }

        let session = CallSession::outbound(call_type, &self.local_user_id, recipient_id);
        slot.session = Some(session.clone());
        self.bus.publish(&CoreEvent::CallChanged(session));
        log::info!("Call to {} initiated ({:?})", recipient_id, call_type);
        Ok(())
    }

    /// Answer the ringing inbound call and start negotiating.
    pub async fn accept(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let (call_id, caller_id, call_type) = match slot.session.as_mut() {
            Some(s)
                if s.phase == CallPhase::Ringing && !s.is_initiator(&self.local_user_id) =>
            {
                let call_id = s.call_id.clone().ok_or(Error::NoActiveCall)?;
                s.phase = CallPhase::Accepted;
                (call_id, s.caller_id.clone(), s.call_type)
            }
            _ => return Err(Error::NoActiveCall),
        };
        // A pending timer must die before the transition is visible anywhere.
        if let Some(timer) = slot.ring_timer.take() {
            timer.abort();
        }
        if let Some(s) = slot.session.as_ref() {
            self.bus.publish(&CoreEvent::CallChanged(s.clone()));
        }

        let accepted = self.connection.emit(ClientEvent::CallAccept {
            call_id: call_id.clone(),
            caller_id: caller_id.clone(),
        });
        if !accepted {
            self.finish(&mut slot, CallPhase::Failed).await;
            return Err(Error::NotConnected);
        }

        self.begin_negotiation(&mut slot, call_id, caller_id, call_type, false)
            .await;
        Ok(())
    }

    /// Turn the ringing inbound call away.
    pub async fn reject(&self, reason: Option<String>) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let (call_id, caller_id) = match slot.session.as_ref() {
            Some(s)
                if s.phase == CallPhase::Ringing && !s.is_initiator(&self.local_user_id) =>
            {
                (s.call_id.clone().ok_or(Error::NoActiveCall)?, s.caller_id.clone())
            }
            _ => return Err(Error::NoActiveCall),
        };

        self.connection.emit(ClientEvent::CallReject {
            call_id,
            caller_id,
            reason,
        });
        self.finish(&mut slot, CallPhase::Rejected).await;
        Ok(())
    }

    /// End the live call, whatever phase it is in.
    pub async fn hang_up(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let session = match slot.session.as_ref() {
            Some(s) if !s.phase.is_terminal() => s.clone(),
            _ => return Err(Error::NoActiveCall),
        };

        if let Some(call_id) = session.call_id.clone() {
            self.connection.emit(ClientEvent::CallEnd {
                call_id,
                other_participant_id: session.peer_id(&self.local_user_id),
            });
        }
        self.finish(&mut slot, CallPhase::Ended).await;
        Ok(())
    }

    // Track controls pass straight through; without local media they are
    // no-ops returning false.
    pub fn set_muted(&self, muted: bool) -> bool {
        self.media.set_muted(muted)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.media.set_video_enabled(enabled)
    }

    pub fn switch_camera(&self) -> bool {
        self.media.switch_camera()
    }

    // ============= Control loop =============

    fn register_wire_handlers(&self) {
        let kinds = [
            ServerEventKind::CallInitiated,
            ServerEventKind::CallIncoming,
            ServerEventKind::CallAccepted,
            ServerEventKind::CallRejected,
            ServerEventKind::CallEnded,
            ServerEventKind::CallTimeout,
            ServerEventKind::WebrtcOffer,
            ServerEventKind::WebrtcAnswer,
            ServerEventKind::WebrtcIce,
            ServerEventKind::Disconnected,
        ];
        let mut tokens = self.wire_tokens.lock();
        for kind in kinds {
            let tx = self.control_tx.clone();
            let token = self.connection.subscribe(kind, move |event| {
                let _ = tx.send(ControlMsg::Wire(event.clone()));
            });
            tokens.push(token);
        }
    }

    async fn run_loop(controller: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ControlMsg>) {
        while let Some(msg) = rx.recv().await {
            controller.handle_control(msg).await;
        }
    }

    async fn handle_control(&self, msg: ControlMsg) {
        match msg {
            ControlMsg::Wire(event) => self.handle_wire(event).await,
            ControlMsg::RingTimeout { call_id } => self.on_ring_timeout(call_id).await,
            ControlMsg::MediaConnected { call_id } => self.on_media_connected(call_id).await,
            ControlMsg::MediaDisconnected { call_id } => {
                self.on_media_disconnected(call_id).await
            }
        }
    }

    async fn handle_wire(&self, event: ServerEvent) {
        match event {
            ServerEvent::CallInitiated { call_id } => self.on_initiated(call_id).await,
            ServerEvent::CallIncoming {
                call_id,
                caller_id,
                call_type,
                caller_meta,
            } => self.on_incoming(call_id, caller_id, call_type, caller_meta).await,
            ServerEvent::CallAccepted { call_id, .. } => self.on_peer_accepted(call_id).await,
            ServerEvent::CallRejected { call_id, reason } => {
                self.on_peer_rejected(call_id, reason).await
            }
            ServerEvent::CallEnded { call_id } => self.on_peer_ended(call_id).await,
            ServerEvent::CallTimeout { call_id } => self.on_peer_timeout(call_id).await,
            ServerEvent::WebrtcOffer {
                call_id, payload, ..
            } => self.on_offer(call_id, payload).await,
            ServerEvent::WebrtcAnswer {
                call_id, payload, ..
            } => self.on_answer(call_id, payload).await,
            ServerEvent::WebrtcIce {
                call_id, candidate, ..
            } => self.on_ice(call_id, candidate).await,
            ServerEvent::Disconnected => self.on_transport_lost().await,
            _ => {}
        }
    }

    /// Server acknowledged the initiation and assigned the call id.
    async fn on_initiated(&self, call_id: String) {
        let mut slot = self.slot.lock().await;
        let snapshot = match slot.session.as_mut() {
            Some(s) if s.phase == CallPhase::Initiating => {
                s.call_id = Some(call_id.clone());
                s.phase = CallPhase::Ringing;
                s.clone()
            }
            _ => {
                log::debug!("Ignoring call_initiated for stale call {}", call_id);
                return;
            }
        };
        slot.ring_timer = Some(self.spawn_ring_timer(call_id));
        drop(slot);
        self.bus.publish(&CoreEvent::CallChanged(snapshot));
    }

    async fn on_incoming(
        &self,
        call_id: String,
        caller_id: String,
        call_type: CallType,
        caller_meta: CallerMeta,
    ) {
        let mut slot = self.slot.lock().await;
        if slot.session.is_some() {
            log::info!("Rejecting incoming call {} while busy", call_id);
            self.connection.emit(ClientEvent::CallReject {
                call_id,
                caller_id,
                reason: Some("busy".to_string()),
            });
            return;
        }

        let session = CallSession::inbound(call_id, call_type, &caller_id, &self.local_user_id);
        slot.session = Some(session.clone());
        drop(slot);

        self.bus.publish(&CoreEvent::CallChanged(session.clone()));
        self.bus.publish(&CoreEvent::IncomingCall {
            session,
            caller_meta,
        });
    }

    async fn on_peer_accepted(&self, call_id: String) {
        let mut slot = self.slot.lock().await;
        let (peer_id, call_type) = match slot.session.as_mut() {
            Some(s)
                if s.call_id.as_deref() == Some(call_id.as_str())
                    && s.phase == CallPhase::Ringing
                    && s.is_initiator(&self.local_user_id) =>
            {
                s.phase = CallPhase::Accepted;
                (s.recipient_id.clone(), s.call_type)
            }
            _ => {
                log::debug!("Ignoring call_accepted for stale call {}", call_id);
                return;
            }
        };
        // Cancel before acting on the transition; the timer may never fire
        // once acceptance has been applied.
        if let Some(timer) = slot.ring_timer.take() {
            timer.abort();
        }
        if let Some(s) = slot.session.as_ref() {
            self.bus.publish(&CoreEvent::CallChanged(s.clone()));
        }

        self.begin_negotiation(&mut slot, call_id, peer_id, call_type, true)
            .await;
    }

    async fn on_peer_rejected(&self, call_id: String, reason: Option<String>) {
        let mut slot = self.slot.lock().await;
        if !session_matches(&slot, &call_id) {
            return;
        }
        log::info!(
            "Call {} rejected by peer ({})",
            call_id,
            reason.as_deref().unwrap_or("no reason")
        );
        self.finish(&mut slot, CallPhase::Rejected).await;
    }

    async fn on_peer_ended(&self, call_id: String) {
        let mut slot = self.slot.lock().await;
        if !session_matches(&slot, &call_id) {
            return;
        }
        self.finish(&mut slot, CallPhase::Ended).await;
    }

    async fn on_peer_timeout(&self, call_id: String) {
        let mut slot = self.slot.lock().await;
        if !session_matches(&slot, &call_id) {
            return;
        }
        self.finish(&mut slot, CallPhase::TimedOut).await;
    }

    async fn on_transport_lost(&self) {
        let mut slot = self.slot.lock().await;
        if slot.session.as_ref().map_or(true, |s| s.phase.is_terminal()) {
            return;
        }
        log::warn!("Transport lost mid-call");
        self.finish(&mut slot, CallPhase::Failed).await;
    }

    async fn on_ring_timeout(&self, call_id: String) {
        let mut slot = self.slot.lock().await;
        let recipient_id = match slot.session.as_ref() {
            Some(s)
                if s.call_id.as_deref() == Some(call_id.as_str())
                    && s.phase == CallPhase::Ringing =>
            {
                s.recipient_id.clone()
            }
            // The session moved on; the timer is stale and does nothing.
            _ => return,
        };

        log::info!("Call {} rang out", call_id);
        // Best effort; the receiver also clears on its own.
        self.connection.emit(ClientEvent::CallTimeout {
            call_id,
            recipient_id,
        });
        self.finish(&mut slot, CallPhase::TimedOut).await;
    }

    async fn on_media_connected(&self, call_id: String) {
        let mut slot = self.slot.lock().await;
        let snapshot = match slot.session.as_mut() {
            Some(s)
                if s.call_id.as_deref() == Some(call_id.as_str())
                    && s.phase == CallPhase::Negotiating =>
            {
                s.phase = CallPhase::Active;
                s.clone()
            }
            _ => return,
        };
        drop(slot);
        log::info!("Call {} active", call_id);
        self.bus.publish(&CoreEvent::CallChanged(snapshot));
    }

    async fn on_media_disconnected(&self, call_id: String) {
        let mut slot = self.slot.lock().await;
        if !session_matches(&slot, &call_id) {
            return;
        }
        log::warn!("Media path lost for call {}; ending", call_id);
        let peer_id = slot
            .session
            .as_ref()
            .map(|s| s.peer_id(&self.local_user_id));
        if let Some(peer_id) = peer_id {
            self.connection.emit(ClientEvent::CallEnd {
                call_id,
                other_participant_id: peer_id,
            });
        }
        self.finish(&mut slot, CallPhase::Ended).await;
    }

    // ============= Negotiation plumbing =============

    async fn on_offer(&self, call_id: String, sdp: String) {
        // Snapshot only; handle_offer may wait for start() on another task,
        // so the slot lock must not be held across it.
        let target_id = {
            let slot = self.slot.lock().await;
            match slot.session.as_ref() {
                Some(s)
                    if s.call_id.as_deref() == Some(call_id.as_str())
                        && !s.is_initiator(&self.local_user_id)
                        && !s.phase.is_terminal() =>
                {
                    s.caller_id.clone()
                }
                _ => {
                    log::debug!("Ignoring offer for stale call {}", call_id);
                    return;
                }
            }
        };

        match self.media.handle_offer(sdp).await {
            Ok(answer) => {
                self.connection.emit(ClientEvent::WebrtcAnswer(SignalPayload {
                    call_id,
                    target_id,
                    payload: answer,
                }));
            }
            Err(e) => {
                log::error!("Offer handling failed: {}", e);
                self.fail_negotiation(call_id).await;
            }
        }
    }

    async fn on_answer(&self, call_id: String, sdp: String) {
        {
            let slot = self.slot.lock().await;
            if !session_matches(&slot, &call_id) {
                log::debug!("Ignoring answer for stale call {}", call_id);
                return;
            }
        }

        if let Err(e) = self.media.handle_answer(sdp).await {
            log::error!("Answer handling failed: {}", e);
            self.fail_negotiation(call_id).await;
        }
    }

    async fn on_ice(&self, call_id: String, candidate: IceCandidate) {
        {
            let slot = self.slot.lock().await;
            if !session_matches(&slot, &call_id) {
                log::debug!("Ignoring candidate for stale call {}", call_id);
                return;
            }
        }

        if let Err(e) = self.media.handle_candidate(candidate).await {
            log::warn!("Candidate handling failed: {}", e);
        }
    }

    /// Ordering defects in negotiation are fatal to the current call.
    async fn fail_negotiation(&self, call_id: String) {
        let mut slot = self.slot.lock().await;
        if !session_matches(&slot, &call_id) {
            return;
        }
        let peer_id = slot
            .session
            .as_ref()
            .map(|s| s.peer_id(&self.local_user_id));
        if let Some(peer_id) = peer_id {
            self.connection.emit(ClientEvent::CallEnd {
                call_id,
                other_participant_id: peer_id,
            });
        }
        self.finish(&mut slot, CallPhase::Failed).await;
    }

    async fn begin_negotiation(
        &self,
        slot: &mut CallSlot,
        call_id: String,
        peer_id: String,
        call_type: CallType,
        initiator: bool,
    ) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.media.start(call_type, engine_tx).await {
            log::error!("Failed to start local media: {}", e);
            self.connection.emit(ClientEvent::CallEnd {
                call_id,
                other_participant_id: peer_id,
            });
            self.finish(slot, CallPhase::Failed).await;
            return;
        }
        slot.engine_pump = Some(self.spawn_engine_pump(call_id.clone(), peer_id.clone(), engine_rx));

        if let Some(s) = slot.session.as_mut() {
            s.phase = CallPhase::Negotiating;
            self.bus.publish(&CoreEvent::CallChanged(s.clone()));
        }

        if initiator {
            match self.media.create_offer().await {
                Ok(offer) => {
                    self.connection.emit(ClientEvent::WebrtcOffer(SignalPayload {
                        call_id,
                        target_id: peer_id,
                        payload: offer,
                    }));
                }
                Err(e) => {
                    log::error!("Offer creation failed: {}", e);
                    self.connection.emit(ClientEvent::CallEnd {
                        call_id,
                        other_participant_id: peer_id,
                    });
                    self.finish(slot, CallPhase::Failed).await;
                }
            }
        }
    }

    fn spawn_ring_timer(&self, call_id: String) -> JoinHandle<()> {
        let tx = self.control_tx.clone();
        let timeout = self.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(ControlMsg::RingTimeout { call_id });
        })
    }

    fn spawn_engine_pump(
        &self,
        call_id: String,
        peer_id: String,
        mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let connection = self.connection.clone();
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    EngineEvent::LocalCandidate(candidate) => {
                        connection.emit(ClientEvent::WebrtcIce {
                            call_id: call_id.clone(),
                            target_id: peer_id.clone(),
                            candidate,
                        });
                    }
                    EngineEvent::Connected => {
                        let _ = control_tx.send(ControlMsg::MediaConnected {
                            call_id: call_id.clone(),
                        });
                    }
                    EngineEvent::Disconnected => {
                        let _ = control_tx.send(ControlMsg::MediaDisconnected {
                            call_id: call_id.clone(),
                        });
                    }
                }
            }
        })
    }

    /// Tear the session down into a terminal phase. Media goes first, then
    /// the terminal event; no capture device may outlive the call.
    async fn finish(&self, slot: &mut CallSlot, terminal: CallPhase) {
        if let Some(timer) = slot.ring_timer.take() {
            timer.abort();
        }
        if let Some(pump) = slot.engine_pump.take() {
            pump.abort();
        }
        self.media.shutdown().await;

        if let Some(mut session) = slot.session.take() {
            session.phase = terminal;
            self.bus.publish(&CoreEvent::CallChanged(session));
        }
    }
}

fn session_matches(slot: &CallSlot, call_id: &str) -> bool {
    slot.session
        .as_ref()
        .map_or(false, |s| s.call_id.as_deref() == Some(call_id) && !s.phase.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::testutil::{AckMode, FakeTransport, LinkHandle, ScriptedNegotiator};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Rig {
        controller: Arc<CallController>,
        negotiator: Arc<ScriptedNegotiator>,
        link: LinkHandle,
        phases: Arc<Mutex<Vec<CallPhase>>>,
        _bus: Arc<EventBus>,
        _sub: crate::events::BusSubscription,
    }

    async fn rig(ring_timeout: Duration) -> Rig {
        let mut config = ClientConfig::new("localhost", 1, false);
        config.connect_timeout = Duration::from_millis(200);

        let transport = Arc::new(FakeTransport::new(AckMode::Accept));
        let bus = Arc::new(EventBus::new());
        let connection = Arc::new(ConnectionManager::new(
            config,
            transport.clone(),
            bus.clone(),
        ));
        assert!(connection.connect("token", "alice").await);

        let phases = Arc::new(Mutex::new(Vec::new()));
        let phases_clone = phases.clone();
        let sub = bus.subscribe(crate::events::EventKind::CallChanged, move |event| {
            if let CoreEvent::CallChanged(session) = event {
                phases_clone.lock().push(session.phase);
            }
        });

        let negotiator = ScriptedNegotiator::new();
        let controller = CallController::new(
            connection,
            bus.clone(),
            negotiator.clone(),
            "alice",
            CallerMeta::default(),
            ring_timeout,
        );

        let mut link = transport.take_link();
        // Drain the handshake frame.
        let _ = link.from_client.recv().await;

        Rig {
            controller,
            negotiator,
            link,
            phases,
            _bus: bus,
            _sub: sub,
        }
    }

    async fn next_frame(link: &mut LinkHandle) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(1), link.from_client.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed")
    }

    fn settle() -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(60))
    }

    #[tokio::test]
    async fn test_initiate_rings_after_server_ack() {
        let mut r = rig(Duration::from_secs(5)).await;

        r.controller.initiate("bob", CallType::Audio).await.unwrap();
        match next_frame(&mut r.link).await {
            ClientEvent::CallInitiate { recipient_id, .. } => assert_eq!(recipient_id, "bob"),
            other => panic!("expected call_initiate, got {:?}", other),
        }
        assert_eq!(
            r.controller.current_call().await.map(|s| s.phase),
            Some(CallPhase::Initiating)
        );

        r.link
            .to_client
            .send(ServerEvent::CallInitiated {
                call_id: "c1".into(),
            })
            .unwrap();
        settle().await;

        let session = r.controller.current_call().await.expect("live session");
        assert_eq!(session.phase, CallPhase::Ringing);
        assert_eq!(session.call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_second_initiate_is_rejected() {
        let r = rig(Duration::from_secs(5)).await;

        r.controller.initiate("bob", CallType::Audio).await.unwrap();
        let result = r.controller.initiate("carol", CallType::Video).await;
        assert!(matches!(result, Err(Error::CallInProgress)));
    }

    #[tokio::test]
    async fn test_timeout_wins_and_late_accept_is_ignored() {
        let mut r = rig(Duration::from_millis(80)).await;

        r.controller.initiate("bob", CallType::Audio).await.unwrap();
        let _ = next_frame(&mut r.link).await;
        r.link
            .to_client
            .send(ServerEvent::CallInitiated {
                call_id: "c1".into(),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(r.controller.current_call().await.is_none());
        assert!(r.phases.lock().contains(&CallPhase::TimedOut));

        // The give-up notice went out.
        match next_frame(&mut r.link).await {
            ClientEvent::CallTimeout { call_id, .. } => assert_eq!(call_id, "c1"),
            other => panic!("expected call_timeout, got {:?}", other),
        }

        // Acceptance after the fact does nothing.
        r.link
            .to_client
            .send(ServerEvent::CallAccepted {
                call_id: "c1".into(),
                recipient_id: "bob".into(),
            })
            .unwrap();
        settle().await;
        assert!(r.controller.current_call().await.is_none());
        assert!(!r.negotiator.started.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_accept_beats_timeout() {
        let mut r = rig(Duration::from_millis(400)).await;

        r.controller.initiate("bob", CallType::Video).await.unwrap();
        let _ = next_frame(&mut r.link).await;
        r.link
            .to_client
            .send(ServerEvent::CallInitiated {
                call_id: "c1".into(),
            })
            .unwrap();
        settle().await;

        r.link
            .to_client
            .send(ServerEvent::CallAccepted {
                call_id: "c1".into(),
                recipient_id: "bob".into(),
            })
            .unwrap();
        settle().await;

        // Negotiation kicked off and the offer went to the peer.
        assert!(r.negotiator.started.load(std::sync::atomic::Ordering::SeqCst));
        match next_frame(&mut r.link).await {
            ClientEvent::WebrtcOffer(signal) => {
                assert_eq!(signal.call_id, "c1");
                assert_eq!(signal.target_id, "bob");
            }
            other => panic!("expected webrtc_offer, got {:?}", other),
        }

        r.negotiator.send_event(EngineEvent::Connected);
        settle().await;
        assert_eq!(
            r.controller.current_call().await.map(|s| s.phase),
            Some(CallPhase::Active)
        );

        // Long after the would-be timeout, the call is still up.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            r.controller.current_call().await.map(|s| s.phase),
            Some(CallPhase::Active)
        );
        assert!(!r.phases.lock().contains(&CallPhase::TimedOut));
    }

    #[tokio::test]
    async fn test_incoming_accept_to_active_and_hang_up() {
        let mut r = rig(Duration::from_secs(5)).await;

        r.link
            .to_client
            .send(ServerEvent::CallIncoming {
                call_id: "c7".into(),
                caller_id: "bob".into(),
                call_type: CallType::Video,
                caller_meta: CallerMeta::default(),
            })
            .unwrap();
        settle().await;
        assert_eq!(
            r.controller.current_call().await.map(|s| s.phase),
            Some(CallPhase::Ringing)
        );

        r.controller.accept().await.unwrap();
        match next_frame(&mut r.link).await {
            ClientEvent::CallAccept { call_id, caller_id } => {
                assert_eq!(call_id, "c7");
                assert_eq!(caller_id, "bob");
            }
            other => panic!("expected call_accept, got {:?}", other),
        }
        assert_eq!(
            r.controller.current_call().await.map(|s| s.phase),
            Some(CallPhase::Negotiating)
        );

        // The initiator's offer arrives; we answer.
        r.link
            .to_client
            .send(ServerEvent::WebrtcOffer {
                call_id: "c7".into(),
                sender_id: "bob".into(),
                payload: "v=0 offer".into(),
            })
            .unwrap();
        match next_frame(&mut r.link).await {
            ClientEvent::WebrtcAnswer(signal) => {
                assert_eq!(signal.call_id, "c7");
                assert_eq!(signal.target_id, "bob");
                assert_eq!(signal.payload, "v=0 answer");
            }
            other => panic!("expected webrtc_answer, got {:?}", other),
        }

        r.negotiator.send_event(EngineEvent::Connected);
        settle().await;
        assert_eq!(
            r.controller.current_call().await.map(|s| s.phase),
            Some(CallPhase::Active)
        );

        r.controller.hang_up().await.unwrap();
        match next_frame(&mut r.link).await {
            ClientEvent::CallEnd {
                call_id,
                other_participant_id,
            } => {
                assert_eq!(call_id, "c7");
                assert_eq!(other_participant_id, "bob");
            }
            other => panic!("expected call_end, got {:?}", other),
        }
        assert!(r.negotiator.shut_down.load(std::sync::atomic::Ordering::SeqCst));
        assert!(r.controller.current_call().await.is_none());
        assert!(r.phases.lock().contains(&CallPhase::Ended));
    }

    #[tokio::test]
    async fn test_incoming_while_busy_is_auto_rejected() {
        let mut r = rig(Duration::from_secs(5)).await;

        r.controller.initiate("bob", CallType::Audio).await.unwrap();
        let _ = next_frame(&mut r.link).await;

        r.link
            .to_client
            .send(ServerEvent::CallIncoming {
                call_id: "c9".into(),
                caller_id: "carol".into(),
                call_type: CallType::Audio,
                caller_meta: CallerMeta::default(),
            })
            .unwrap();

        match next_frame(&mut r.link).await {
            ClientEvent::CallReject {
                call_id, reason, ..
            } => {
                assert_eq!(call_id, "c9");
                assert_eq!(reason.as_deref(), Some("busy"));
            }
            other => panic!("expected call_reject, got {:?}", other),
        }

        // The original session is untouched.
        let session = r.controller.current_call().await.expect("live session");
        assert_eq!(session.recipient_id, "bob");
    }

    #[tokio::test]
    async fn test_reject_releases_media_before_terminal() {
        let mut r = rig(Duration::from_secs(5)).await;

        r.link
            .to_client
            .send(ServerEvent::CallIncoming {
                call_id: "c3".into(),
                caller_id: "bob".into(),
                call_type: CallType::Audio,
                caller_meta: CallerMeta::default(),
            })
            .unwrap();
        settle().await;

        r.controller.reject(None).await.unwrap();
        match next_frame(&mut r.link).await {
            ClientEvent::CallReject { call_id, .. } => assert_eq!(call_id, "c3"),
            other => panic!("expected call_reject, got {:?}", other),
        }
        assert!(r.negotiator.shut_down.load(std::sync::atomic::Ordering::SeqCst));
        assert!(r.controller.current_call().await.is_none());
        assert!(r.phases.lock().contains(&CallPhase::Rejected));
    }

    #[tokio::test]
    async fn test_media_loss_ends_call() {
        let mut r = rig(Duration::from_secs(5)).await;

        r.link
            .to_client
            .send(ServerEvent::CallIncoming {
                call_id: "c4".into(),
                caller_id: "bob".into(),
                call_type: CallType::Audio,
                caller_meta: CallerMeta::default(),
            })
            .unwrap();
        settle().await;
        r.controller.accept().await.unwrap();
        let _ = next_frame(&mut r.link).await; // call_accept
        r.negotiator.send_event(EngineEvent::Connected);
        settle().await;
        assert_eq!(
            r.controller.current_call().await.map(|s| s.phase),
            Some(CallPhase::Active)
        );

        r.negotiator.send_event(EngineEvent::Disconnected);
        settle().await;
        assert!(r.controller.current_call().await.is_none());
        assert!(r.phases.lock().contains(&CallPhase::Ended));
    }

    #[tokio::test]
    async fn test_transport_loss_fails_live_call() {
        let mut r = rig(Duration::from_secs(5)).await;

        r.controller.initiate("bob", CallType::Audio).await.unwrap();
        let _ = next_frame(&mut r.link).await;
        r.link
            .to_client
            .send(ServerEvent::CallInitiated {
                call_id: "c5".into(),
            })
            .unwrap();
        settle().await;

        r.link.to_client.send(ServerEvent::Disconnected).unwrap();
        settle().await;
        assert!(r.controller.current_call().await.is_none());
        assert!(r.phases.lock().contains(&CallPhase::Failed));
    }

    #[tokio::test]
    async fn test_stale_candidate_is_dropped() {
        let mut r = rig(Duration::from_secs(5)).await;

        r.controller.initiate("bob", CallType::Audio).await.unwrap();
        let _ = next_frame(&mut r.link).await;
        r.link
            .to_client
            .send(ServerEvent::CallInitiated {
                call_id: "c6".into(),
            })
            .unwrap();
        settle().await;

        r.link
            .to_client
            .send(ServerEvent::WebrtcIce {
                call_id: "other-call".into(),
                sender_id: "bob".into(),
                candidate: IceCandidate {
                    candidate: "candidate:1 1 udp 1 127.0.0.1 1 typ host".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            })
            .unwrap();
        settle().await;

        assert!(!r
            .negotiator
            .commands
            .lock()
            .iter()
            .any(|c| c == "handle_candidate"));
    }
}
