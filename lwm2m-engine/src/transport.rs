//! Outbound transport seam
//!
//! The engine never encodes or sends anything itself. Each exchange it
//! wants to run is described by an `OutboundMessage`; the transport
//! collaborator carries it out and reports whether the peer accepted it.

use async_trait::async_trait;

use lwm2m_core::{Lwm2mResult, ResourceRecord, ShortServerId, Uri};
use lwm2m_registration::{ActionKind, ExchangeOutcome};

/// Message the engine wants delivered to a server
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Bootstrap {
        ssid: ShortServerId,
        endpoint: String,
    },
    Register {
        ssid: ShortServerId,
        endpoint: String,
        lifetime: u64,
        binding: String,
        queue_mode: bool,
        /// CoRE link list of objects and instances
        links: String,
    },
    Update {
        ssid: ShortServerId,
        lifetime: u64,
        binding: String,
        links: String,
    },
    Deregister {
        ssid: ShortServerId,
    },
    Notify {
        ssid: ShortServerId,
        uri: Uri,
        records: Vec<ResourceRecord>,
    },
}

impl OutboundMessage {
    pub fn server(&self) -> ShortServerId {
        match self {
            OutboundMessage::Bootstrap { ssid, .. }
            | OutboundMessage::Register { ssid, .. }
            | OutboundMessage::Update { ssid, .. }
            | OutboundMessage::Deregister { ssid }
            | OutboundMessage::Notify { ssid, .. } => *ssid,
        }
    }

    /// Registration exchange this message belongs to; `None` for notifications
    pub fn kind(&self) -> Option<ActionKind> {
        match self {
            OutboundMessage::Bootstrap { .. } => Some(ActionKind::Bootstrap),
            OutboundMessage::Register { .. } => Some(ActionKind::Register),
            OutboundMessage::Update { .. } => Some(ActionKind::Update),
            OutboundMessage::Deregister { .. } => Some(ActionKind::Deregister),
            OutboundMessage::Notify { .. } => None,
        }
    }
}

/// Exchange handed out by a tick, to be reported back through `complete`
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundAction {
    pub message: OutboundMessage,
}

impl OutboundAction {
    pub fn new(message: OutboundMessage) -> Self {
        Self { message }
    }

    pub fn server(&self) -> ShortServerId {
        self.message.server()
    }

    pub fn kind(&self) -> Option<ActionKind> {
        self.message.kind()
    }
}

/// Delivery of outbound messages
///
/// Implementations block until the peer answered or the exchange timed out.
/// A returned error is treated like a failed exchange.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message
    ///
    /// # Arguments
    /// * `message` - Exchange to run
    ///
    /// # Returns
    /// Whether the peer accepted the exchange
    async fn send(&self, message: OutboundMessage) -> Lwm2mResult<ExchangeOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind() {
        let message = OutboundMessage::Deregister { ssid: 4 };
        assert_eq!(message.kind(), Some(ActionKind::Deregister));
        assert_eq!(message.server(), 4);

        let action = OutboundAction::new(OutboundMessage::Notify {
            ssid: 2,
            uri: Uri::resource(3, 0, 9),
            records: Vec::new(),
        });
        assert_eq!(action.kind(), None);
        assert_eq!(action.server(), 2);
    }

    #[tokio::test]
    async fn test_mock_transport() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|m| matches!(m, OutboundMessage::Deregister { ssid: 1 }))
            .times(1)
            .returning(|_| Ok(ExchangeOutcome::Success));

        let outcome = transport.send(OutboundMessage::Deregister { ssid: 1 }).await;
        assert_eq!(outcome, Ok(ExchangeOutcome::Success));
    }
}
