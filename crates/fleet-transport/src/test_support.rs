//! In-memory connection for exercising handlers without a network

use super::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Mock connection that records every message sent to it
#[derive(Debug)]
pub struct MockConnection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    sent: Mutex<Vec<ServerToAgent>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            remote_addr: None,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Make subsequent sends fail with a connection error
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ServerToAgent> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_sent(&self) -> Option<ServerToAgent> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Type-erased handle, as a transport would hand it to the handler
    pub fn handle(self: &Arc<Self>) -> ConnectionRef {
        self.clone()
    }
}

#[async_trait]
impl AgentConnection for MockConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn send(&self, message: &ServerToAgent) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError("simulated send failure".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_connection_records_messages() {
        let connection = MockConnection::new();
        connection
            .send(&ServerToAgent::for_instance("a"))
            .await
            .unwrap();

        assert_eq!(connection.sent().len(), 1);
        assert_eq!(connection.last_sent().unwrap().instance_uid, "a");
    }

    #[tokio::test]
    async fn test_mock_connection_send_after_close() {
        let connection = MockConnection::new();
        connection.close().await.unwrap();
        assert!(connection.is_closed());

        let result = connection.send(&ServerToAgent::default()).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_mock_connection_failing_sends() {
        let connection = MockConnection::new();
        connection.set_fail_sends(true);

        let result = connection.send(&ServerToAgent::default()).await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
        assert!(connection.sent().is_empty());
        assert!(!connection.is_closed());
    }
}
