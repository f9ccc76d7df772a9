//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use msgrelay_protocol::{
    ClientId, MessageType, PendingMessage, PublicKey, PublicKeyRequest, RegisterRequest, Request,
    RequestBody, RequestCode, Response, ResponseCode, SendMessageRequest, UserEntry,
};

/// High-level client for a relay server.
///
/// Every call opens a fresh connection. Calls other than [`Client::register`]
/// identify the caller with the client id set through
/// [`Client::with_client_id`].
///
/// Lookups and pulls that fail in transit are retried up to
/// [`ConnectionConfig::max_retries`] times. Registration and sending are
/// never retried, since the server may already have applied them.
#[derive(Debug, Clone)]
pub struct Client {
    config: ConnectionConfig,
    client_id: Option<ClientId>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            client_id: None,
        }
    }

    /// Sets the id sent with every request.
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn request(&self, client_id: ClientId, body: RequestBody) -> Result<Response, ClientError> {
        let code = body.code();
        let request = Request::new(client_id, body);
        let retries = if may_retry(code) {
            self.config.max_retries
        } else {
            0
        };

        let mut attempt = 0;
        let mut backoff = self.config.retry_backoff;
        let response = loop {
            match self.exchange(&request).await {
                Ok(response) => break response,
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(
                        "{} request failed ({}), retry {} of {}",
                        code.name(),
                        e,
                        attempt,
                        retries
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        };

        if response.is_error() {
            tracing::debug!("{} request answered with a general error", code.name());
            return Err(ClientError::GeneralError);
        }
        Ok(response)
    }

    async fn exchange(&self, request: &Request) -> Result<Response, ClientError> {
        Connection::open(&self.config)
            .await?
            .exchange(request)
            .await
    }

    fn identity(&self) -> Result<ClientId, ClientError> {
        self.client_id.ok_or(ClientError::NotRegistered)
    }

    fn unexpected(expected: ResponseCode, got: &Response) -> ClientError {
        ClientError::UnexpectedResponse {
            expected,
            got: got.code(),
        }
    }

    /// Registers `name` with `public_key` and returns the new client id.
    ///
    /// The returned id is not stored; use [`Client::with_client_id`].
    pub async fn register(
        &self,
        name: impl Into<String>,
        public_key: PublicKey,
    ) -> Result<ClientId, ClientError> {
        let body = RequestBody::Register(RegisterRequest {
            name: name.into(),
            public_key,
        });

        // The header id is ignored for registration.
        match self
            .request(self.client_id.unwrap_or_default(), body)
            .await?
        {
            Response::Registered { client_id } => Ok(client_id),
            other => Err(Self::unexpected(ResponseCode::Registered, &other)),
        }
    }

    /// Lists every other registered client.
    pub async fn users_list(&self) -> Result<Vec<UserEntry>, ClientError> {
        match self
            .request(self.identity()?, RequestBody::UsersList)
            .await?
        {
            Response::UsersList { users } => Ok(users),
            other => Err(Self::unexpected(ResponseCode::UsersList, &other)),
        }
    }

    /// Fetches the public key of `target`.
    pub async fn public_key(&self, target: ClientId) -> Result<PublicKey, ClientError> {
        let body = RequestBody::PublicKey(PublicKeyRequest { target });
        match self.request(self.identity()?, body).await? {
            Response::PublicKey { public_key, .. } => Ok(public_key),
            other => Err(Self::unexpected(ResponseCode::PublicKey, &other)),
        }
    }

    /// Queues a message for `target` and returns its message id.
    pub async fn send_message(
        &self,
        target: ClientId,
        message_type: MessageType,
        content: impl Into<Bytes>,
    ) -> Result<u32, ClientError> {
        let body = RequestBody::SendMessage(SendMessageRequest {
            target,
            message_type,
            content: content.into(),
        });
        match self.request(self.identity()?, body).await? {
            Response::MessageSent { message_id, .. } => Ok(message_id),
            other => Err(Self::unexpected(ResponseCode::MessageSent, &other)),
        }
    }

    /// Pulls every message queued for this client. The server removes them
    /// once this response has been sent.
    pub async fn pull_pending(&self) -> Result<Vec<PendingMessage>, ClientError> {
        match self
            .request(self.identity()?, RequestBody::PullPending)
            .await?
        {
            Response::PendingMessages { messages } => Ok(messages),
            other => Err(Self::unexpected(ResponseCode::PendingMessages, &other)),
        }
    }
}

/// Requests that change nothing on the server when repeated.
fn may_retry(code: RequestCode) -> bool {
    matches!(
        code,
        RequestCode::UsersList | RequestCode::PublicKey | RequestCode::PullPending
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgrelay_protocol::PUBLIC_KEY_SIZE;
    use msgrelay_server::{Server, ServerConfig};
    use msgrelay_storage::{ClientRecord, RelayStore, Storage};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn start_server() -> (Arc<Server>, ConnectionConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(
            ServerConfig::new(addr),
            Arc::new(Storage::in_memory()),
        ));

        let running = server.clone();
        tokio::spawn(async move { running.run_on(listener).await });

        let config = ConnectionConfig::new(addr).with_request_timeout(Duration::from_secs(5));
        (server, config)
    }

    fn key(fill: u8) -> PublicKey {
        PublicKey::from_bytes([fill; PUBLIC_KEY_SIZE])
    }

    #[tokio::test]
    async fn test_requires_registration() {
        let client = Client::new(ConnectionConfig::default());
        let err = client.users_list().await.unwrap_err();
        assert!(matches!(err, ClientError::NotRegistered));
    }

    #[tokio::test]
    async fn test_full_conversation() {
        let (server, config) = start_server().await;
        let anonymous = Client::new(config.clone());

        let alice_id = anonymous.register("alice", key(1)).await.unwrap();
        let bob_id = anonymous.register("bob", key(2)).await.unwrap();
        let alice = Client::new(config.clone()).with_client_id(alice_id);
        let bob = Client::new(config).with_client_id(bob_id);

        let users = alice.users_list().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "bob");
        assert_eq!(users[0].client_id, bob_id);

        assert_eq!(alice.public_key(bob_id).await.unwrap(), key(2));

        let request_id = alice
            .send_message(bob_id, MessageType::SYMMETRIC_KEY_REQUEST, Bytes::new())
            .await
            .unwrap();
        let text_id = alice
            .send_message(bob_id, MessageType::TEXT, "hi bob")
            .await
            .unwrap();
        assert!(text_id > request_id);

        let pending = bob.pull_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].message_type, MessageType::SYMMETRIC_KEY_REQUEST);
        assert!(pending[0].content.is_empty());
        assert_eq!(pending[1].source, alice_id);
        assert_eq!(&pending[1].content[..], b"hi bob");

        assert!(bob.pull_pending().await.unwrap().is_empty());
        assert!(alice.pull_pending().await.unwrap().is_empty());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_general_errors_surface() {
        let (server, config) = start_server().await;
        let anonymous = Client::new(config.clone());

        anonymous.register("taken", key(3)).await.unwrap();
        let err = anonymous.register("taken", key(4)).await.unwrap_err();
        assert!(matches!(err, ClientError::GeneralError));

        let err = anonymous.register("not valid!", key(4)).await.unwrap_err();
        assert!(matches!(err, ClientError::GeneralError));

        let stranger = Client::new(config).with_client_id(ClientId::generate());
        let err = stranger.users_list().await.unwrap_err();
        assert!(matches!(err, ClientError::GeneralError));
        let err = stranger.public_key(ClientId::generate()).await.unwrap_err();
        assert!(matches!(err, ClientError::GeneralError));

        server.shutdown();
    }

    /// Starts a server whose listener drops the first `dropped` connections
    /// without answering.
    async fn start_flaky_server(dropped: usize) -> (Arc<Server>, Arc<Storage>, ConnectionConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Storage::in_memory());
        let server = Arc::new(Server::new(ServerConfig::new(addr), store.clone()));

        let running = server.clone();
        tokio::spawn(async move {
            for _ in 0..dropped {
                let (stream, _) = listener.accept().await.unwrap();
                drop(stream);
            }
            running.run_on(listener).await
        });

        let config = ConnectionConfig::new(addr)
            .with_request_timeout(Duration::from_secs(5))
            .with_retry_backoff(Duration::from_millis(10));
        (server, store, config)
    }

    #[test]
    fn test_only_repeatable_requests_retry() {
        assert!(may_retry(RequestCode::UsersList));
        assert!(may_retry(RequestCode::PublicKey));
        assert!(may_retry(RequestCode::PullPending));
        assert!(!may_retry(RequestCode::Register));
        assert!(!may_retry(RequestCode::SendMessage));
    }

    #[tokio::test]
    async fn test_lookup_retried_after_dropped_connection() {
        let (server, store, config) = start_flaky_server(1).await;
        let peggy = ClientId::generate();
        let quentin = ClientId::generate();
        store
            .insert_client(ClientRecord::new(peggy, "peggy".to_string(), key(5)))
            .unwrap();
        store
            .insert_client(ClientRecord::new(quentin, "quentin".to_string(), key(6)))
            .unwrap();

        let users = Client::new(config)
            .with_client_id(peggy)
            .users_list()
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].client_id, quentin);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_not_retried_after_dropped_connection() {
        let (server, store, config) = start_flaky_server(1).await;
        let rita = ClientId::generate();
        store
            .insert_client(ClientRecord::new(rita, "rita".to_string(), key(7)))
            .unwrap();

        let client = Client::new(config).with_client_id(rita);
        let err = client
            .send_message(ClientId::generate(), MessageType::TEXT, "once")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.stats().queued_messages, 0);

        // The next call gets through, so the failure above was not retried.
        assert!(client.users_list().await.unwrap().is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_retries_give_up() {
        let (server, _store, config) = start_flaky_server(3).await;
        let client = Client::new(config.with_max_retries(1)).with_client_id(ClientId::generate());

        let err = client.public_key(ClientId::generate()).await.unwrap_err();
        assert!(err.is_retryable());
        server.shutdown();
    }
}
