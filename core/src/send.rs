/// Outbound messages: envelope construction and optimistic insert
use crate::connection::{ConnectionState, Transport};
use crate::error::{SendError, ValidationError};
use crate::identity::Identity;
use crate::message::{Message, MessageKind};
use crate::message_store::MessageStore;
use crate::protocol::Envelope;
use tracing::{debug, info};
use uuid::Uuid;

/// Client-generated message id, independent of wall-clock time
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Envelope from the local identity to its peer.
///
/// `body` is the text for text messages and the media URL otherwise.
pub fn build_envelope(identity: &Identity, kind: MessageKind, body: String) -> Envelope {
    let (message, image_data) = if kind.is_media() {
        (None, Some(body))
    } else {
        (Some(body), None)
    };
    Envelope {
        id: new_message_id(),
        from: identity.local_id().to_string(),
        to: identity.peer_id().to_string(),
        pair_id: identity.pair_id().to_string(),
        kind,
        message,
        image_data,
        role: identity.role(),
    }
}

/// Transmit `envelope` and insert its optimistic log entry (`pending`).
///
/// Nothing is inserted when the transport refuses the envelope.
pub async fn send_envelope<T>(
    store: &MessageStore,
    transport: &T,
    envelope: Envelope,
) -> Result<Message, SendError>
where
    T: Transport + ?Sized,
{
    if transport.state() != ConnectionState::Open {
        debug!("Refusing to send {}: connection is {:?}", envelope.id, transport.state());
        return Err(SendError::NotReady);
    }

    let message = envelope.to_local_message();
    let sent = store
        .append_local_after(message, || transport.send(&envelope).map_err(SendError::from))
        .await?;
    info!("Sent {} message {} to {}", sent.kind, sent.id, sent.to);
    Ok(sent)
}

/// Send a text message to the peer
pub async fn send_text<T>(
    store: &MessageStore,
    transport: &T,
    text: &str,
    identity: &Identity,
) -> Result<Message, SendError>
where
    T: Transport + ?Sized,
{
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyText.into());
    }
    let envelope = build_envelope(identity, MessageKind::Text, text.to_string());
    send_envelope(store, transport, envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotReadyError;
    use crate::identity::Role;
    use crate::message::DeliveryState;
    use std::sync::Mutex;

    struct RecordingTransport {
        state: ConnectionState,
        sent: Mutex<Vec<Envelope>>,
    }

    impl RecordingTransport {
        fn new(state: ConnectionState) -> Self {
            Self {
                state,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, envelope: &Envelope) -> Result<(), NotReadyError> {
            if self.state != ConnectionState::Open {
                return Err(NotReadyError);
            }
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }

    #[tokio::test]
    async fn test_send_text_inserts_pending_entry() {
        let store = MessageStore::new();
        let transport = RecordingTransport::new(ConnectionState::Open);
        let identity = Identity::new(Role::Elder, "42");

        let msg = send_text(&store, &transport, "hello", &identity).await.unwrap();

        let log = store.get().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].from, "elder_42");
        assert_eq!(log[0].payload, "hello");
        assert_eq!(log[0].delivery, DeliveryState::Pending);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, msg.id);
        assert_eq!(sent[0].to, "young_42");
        assert_eq!(sent[0].pair_id, "42");
        assert_eq!(sent[0].message.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_text_rejects_blank_and_closed() {
        let store = MessageStore::new();
        let identity = Identity::new(Role::Young, "7");

        let open = RecordingTransport::new(ConnectionState::Open);
        assert_eq!(
            send_text(&store, &open, "   ", &identity).await,
            Err(SendError::Validation(ValidationError::EmptyText))
        );

        let closed = RecordingTransport::new(ConnectionState::Closed);
        assert_eq!(
            send_text(&store, &closed, "hi", &identity).await,
            Err(SendError::NotReady)
        );
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let identity = Identity::new(Role::Elder, "1");
        let a = build_envelope(&identity, MessageKind::Text, "a".to_string());
        let b = build_envelope(&identity, MessageKind::Text, "a".to_string());
        assert_ne!(a.id, b.id);
    }
}
