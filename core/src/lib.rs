//! Parley Core Library
//!
//! Realtime communication core for the Parley messenger: signaling
//! transport, message pipeline, call state machine, and peer media
//! negotiation. UI, persistence, and media storage live elsewhere and talk
//! to this crate through the event bus and the service traits.

pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod media;
pub mod messaging;
pub mod models;
pub mod services;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

pub use call::*;
pub use config::*;
pub use connection::*;
pub use error::*;
pub use events::*;
pub use media::*;
pub use messaging::*;
pub use models::*;
pub use services::*;
pub use transport::*;
pub use wire::*;

/// The assembled realtime core: one connection, one call slot, one message
/// pipeline, all reporting through one bus.
///
/// Construction wires every component with single-owner lifetimes and spawns
/// the controller's event loop, so it must happen inside a tokio runtime.
pub struct RealtimeClient {
    local_user_id: String,
    bus: Arc<EventBus>,
    connection: Arc<ConnectionManager>,
    calls: Arc<CallController>,
    messages: Arc<MessagePipeline>,
    tokens: Arc<dyn AuthTokenProvider>,
}

impl RealtimeClient {
    /// Production stack: WebSocket transport and WebRTC negotiation.
    pub fn new(
        config: ClientConfig,
        local_user_id: &str,
        caller_meta: CallerMeta,
        tokens: Arc<dyn AuthTokenProvider>,
        turn: Option<TurnCredentials>,
    ) -> Self {
        let negotiator: Arc<dyn MediaNegotiator> = Arc::new(WebRtcNegotiator::new(&config, turn));
        Self::with_parts(
            config,
            local_user_id,
            caller_meta,
            tokens,
            Arc::new(WsTransport),
            negotiator,
        )
    }

    /// Assemble around injected transport/negotiation implementations.
    pub fn with_parts(
        config: ClientConfig,
        local_user_id: &str,
        caller_meta: CallerMeta,
        tokens: Arc<dyn AuthTokenProvider>,
        transport: Arc<dyn Transport>,
        negotiator: Arc<dyn MediaNegotiator>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let connection = Arc::new(ConnectionManager::new(
            config.clone(),
            transport,
            bus.clone(),
        ));
        let calls = CallController::new(
            connection.clone(),
            bus.clone(),
            negotiator,
            local_user_id,
            caller_meta,
            config.ring_timeout,
        );
        let messages = MessagePipeline::new(
            connection.clone(),
            bus.clone(),
            tokens.clone(),
            local_user_id,
            &config,
        );

        Self {
            local_user_id: local_user_id.to_string(),
            bus,
            connection,
            calls,
            messages,
            tokens,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn calls(&self) -> &Arc<CallController> {
        &self.calls
    }

    pub fn messages(&self) -> &Arc<MessagePipeline> {
        &self.messages
    }

    /// Dial the signaling server with the current token.
    pub async fn connect(&self) -> Result<bool> {
        let token = match self.tokens.current_token() {
            Some(token) if !token.is_expired() => token,
            _ => return Err(Error::AuthExpired),
        };
        Ok(self
            .connection
            .connect(&token.token, &self.local_user_id)
            .await)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Upload a blob, then send the resulting URL as a media message.
    pub async fn send_media(
        &self,
        upload: &dyn MediaUploadService,
        message_type: MessageType,
        data: Vec<u8>,
        file_name: &str,
        mime_type: &str,
    ) -> Result<OutboundMessage> {
        let url = upload.upload(data, file_name, mime_type).await?;
        self.messages.send(message_type, &url)
    }

    /// Release subscriptions and tasks. The client is unusable afterwards.
    pub fn shutdown(&self) {
        self.calls.shutdown();
        self.messages.shutdown();
        self.connection.unsubscribe_all();
        self.connection.disconnect();
    }
}
