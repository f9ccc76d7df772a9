//! Request dispatch and handlers.
//!
//! Every request code maps to exactly one handler through a table built once
//! in [`RequestHandler::new`]. Handlers either produce a complete [`Reply`] or
//! fail with a [`HandlerError`]; the dispatcher turns every failure into a
//! general error response, so no handler ever writes a partial response.
//!
//! Store mutations may touch the disk, so they run on the blocking pool and
//! never stall the connection tasks.

use crate::connection::IncomingRequest;
use crate::error::HandlerError;
use crate::metrics::Metrics;
use dashmap::DashMap;
use msgrelay_protocol::{
    ClientId, PendingMessage, PublicKeyRequest, RegisterRequest, RequestCode, Response,
    SendMessageRequest, UserEntry, NAME_SIZE,
};
use msgrelay_storage::{ClientRecord, NewMessage, RelayStore, StorageError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Reply, HandlerError>> + Send + 'a>>;

type HandlerFn = for<'a> fn(&'a RequestHandler, &'a IncomingRequest) -> HandlerFuture<'a>;

/// Messages handed to a client that must be removed once the response carrying
/// them has been fully written.
///
/// Holds the client's pull lock until it is acknowledged or dropped. Dropping
/// it without [`RequestHandler::acknowledge`] leaves the messages queued.
pub struct DeliveryAck {
    pub target: ClientId,
    pub message_ids: Vec<u32>,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for DeliveryAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryAck")
            .field("target", &self.target)
            .field("message_ids", &self.message_ids)
            .finish()
    }
}

/// A handler's result: the response plus anything to finish after sending it.
#[derive(Debug)]
pub struct Reply {
    pub response: Response,
    pub ack: Option<DeliveryAck>,
}

impl Reply {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            ack: None,
        }
    }

    pub fn general_error() -> Self {
        Self::new(Response::GeneralError)
    }

    /// Splits off the delivery ack, if any.
    pub fn into_parts(self) -> (Response, Option<DeliveryAck>) {
        (self.response, self.ack)
    }
}

/// Request handler.
pub struct RequestHandler {
    store: Arc<dyn RelayStore>,
    routes: HashMap<RequestCode, HandlerFn>,
    /// One lock per client that has pulled, held from listing its queue until
    /// the delivered messages are removed.
    pull_locks: DashMap<ClientId, Arc<Mutex<()>>>,
    /// Metrics for request tracking.
    metrics: Option<Arc<Metrics>>,
}

impl RequestHandler {
    /// Creates a handler backed by `store`.
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        let mut routes: HashMap<RequestCode, HandlerFn> = HashMap::new();
        routes.insert(RequestCode::Register, Self::handle_register);
        routes.insert(RequestCode::UsersList, Self::handle_users_list);
        routes.insert(RequestCode::PublicKey, Self::handle_public_key);
        routes.insert(RequestCode::SendMessage, Self::handle_send_message);
        routes.insert(RequestCode::PullPending, Self::handle_pull_pending);

        Self {
            store,
            routes,
            pull_locks: DashMap::new(),
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self.update_gauge_metrics();
        self
    }

    pub fn store(&self) -> &Arc<dyn RelayStore> {
        &self.store
    }

    /// Returns a reference to the metrics, if set.
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Updates gauge metrics from the store.
    pub fn update_gauge_metrics(&self) {
        if let Some(ref metrics) = self.metrics {
            let stats = self.store.stats();
            metrics.clients_total.set(stats.clients as f64);
            metrics.queued_messages.set(stats.queued_messages as f64);
        }
    }

    /// Counts a request that was answered with a general error.
    pub fn record_error(&self, reason: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.errors_total.with_label_values(&[reason]).inc();
        }
    }

    /// Runs the handler for `request` and returns its reply.
    pub async fn dispatch(&self, request: &IncomingRequest) -> Reply {
        let client_id = request.header.client_id;
        let code = request.header.request_code().ok();
        let op_name = code.map(RequestCode::name).unwrap_or("UNKNOWN");

        let timer = self.metrics.as_ref().map(|m| {
            m.request_duration
                .with_label_values(&[op_name])
                .start_timer()
        });
        if let Some(ref metrics) = self.metrics {
            metrics.requests_total.with_label_values(&[op_name]).inc();
        }

        let Some(route) = code.and_then(|c| self.routes.get(&c)) else {
            tracing::warn!(
                "Unknown request code {} from {}",
                request.header.code,
                client_id
            );
            self.record_error("unknown_code");
            return Reply::general_error();
        };

        tracing::info!(
            "{} request from {} ({} payload bytes)",
            op_name,
            client_id,
            request.payload.len()
        );

        let result = route(self, request).await;
        drop(timer);

        match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("{} from {} failed: {}", op_name, client_id, e);
                self.record_error(e.reason());
                Reply::general_error()
            }
        }
    }

    /// Removes messages whose delivery has completed and releases the pull lock.
    ///
    /// The delivered ids are removed in one store call, so either all of them
    /// leave the queue or, on failure, all of them stay for the next pull.
    pub async fn acknowledge(&self, ack: DeliveryAck) {
        let ids = ack.message_ids.clone();
        match self.with_store(move |store| store.delete_messages(&ids)).await {
            Ok(removed) => {
                if removed < ack.message_ids.len() {
                    tracing::debug!(
                        "{} of {} delivered messages were already removed",
                        ack.message_ids.len() - removed,
                        ack.message_ids.len()
                    );
                }
                tracing::info!("Delivered {} messages to {}", removed, ack.target);
            }
            Err(e) => tracing::error!(
                "Failed to remove {} delivered messages for {}; they stay queued: {}",
                ack.message_ids.len(),
                ack.target,
                e
            ),
        }
        self.update_gauge_metrics();
        drop(ack);
    }

    /// Runs a store call on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T, HandlerError>
    where
        F: FnOnce(&dyn RelayStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| HandlerError::Task(e.to_string()))?;
        Ok(result?)
    }

    async fn pull_lock(&self, client_id: ClientId) -> OwnedMutexGuard<()> {
        let lock = self.pull_locks.entry(client_id).or_default().value().clone();
        lock.lock_owned().await
    }

    fn require_client(&self, client_id: &ClientId) -> Result<(), HandlerError> {
        if self.store.client_id_exists(client_id)? {
            Ok(())
        } else {
            Err(HandlerError::UnknownClient(*client_id))
        }
    }

    fn handle_register<'a>(&'a self, request: &'a IncomingRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            let body = RegisterRequest::decode(&request.payload)?;
            validate_name(&body.name)?;

            if self.store.client_name_exists(&body.name)? {
                return Err(HandlerError::Invalid(format!(
                    "name '{}' is already registered",
                    body.name
                )));
            }

            let client_id = ClientId::generate();
            let record = ClientRecord::new(client_id, body.name.clone(), body.public_key);
            self.with_store(move |store| store.insert_client(record))
                .await?;
            self.update_gauge_metrics();

            tracing::info!("Registered '{}' as {}", body.name, client_id);
            Ok(Reply::new(Response::Registered { client_id }))
        })
    }

    fn handle_users_list<'a>(&'a self, request: &'a IncomingRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            let requester = request.header.client_id;
            self.require_client(&requester)?;

            let users: Vec<UserEntry> = self
                .store
                .list_clients()?
                .into_iter()
                .filter(|(id, _)| *id != requester)
                .map(|(client_id, name)| UserEntry { client_id, name })
                .collect();

            Ok(Reply::new(Response::UsersList { users }))
        })
    }

    fn handle_public_key<'a>(&'a self, request: &'a IncomingRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            let body = PublicKeyRequest::decode(&request.payload)?;
            let public_key = self
                .store
                .public_key(&body.target)?
                .ok_or(HandlerError::UnknownClient(body.target))?;

            Ok(Reply::new(Response::PublicKey {
                client_id: body.target,
                public_key,
            }))
        })
    }

    fn handle_send_message<'a>(&'a self, request: &'a IncomingRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            let body = SendMessageRequest::decode(&request.payload)?;
            if !body.message_type.is_valid() {
                return Err(HandlerError::Invalid("message type 0".to_string()));
            }

            let target = body.target;
            let message = NewMessage {
                source: request.header.client_id,
                target,
                message_type: body.message_type,
                content: body.content,
            };
            let message_id = self
                .with_store(move |store| store.insert_message(message))
                .await?;
            self.update_gauge_metrics();

            tracing::info!(
                "Queued message {} from {} to {}",
                message_id,
                request.header.client_id,
                target
            );
            Ok(Reply::new(Response::MessageSent { target, message_id }))
        })
    }

    fn handle_pull_pending<'a>(&'a self, request: &'a IncomingRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            let requester = request.header.client_id;
            self.require_client(&requester)?;

            let guard = self.pull_lock(requester).await;
            let queued = self.store.pending_for(&requester)?;

            let message_ids: Vec<u32> = queued.iter().map(|m| m.id).collect();
            let messages = queued
                .into_iter()
                .map(|m| PendingMessage {
                    source: m.source,
                    message_id: m.id,
                    message_type: m.message_type,
                    content: m.content,
                })
                .collect();

            tracing::debug!("{} pending messages for {}", message_ids.len(), requester);

            let ack = (!message_ids.is_empty()).then(|| DeliveryAck {
                target: requester,
                message_ids,
                _guard: guard,
            });
            Ok(Reply {
                response: Response::PendingMessages { messages },
                ack,
            })
        })
    }
}

/// Accepts names of 1 to 254 bytes made of ASCII letters, digits and `_`.
fn validate_name(name: &str) -> Result<(), HandlerError> {
    if name.is_empty() {
        return Err(HandlerError::Invalid("empty name".to_string()));
    }
    if name.len() >= NAME_SIZE {
        return Err(HandlerError::Invalid(format!(
            "name is {} bytes (max {})",
            name.len(),
            NAME_SIZE - 1
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(HandlerError::Invalid(format!("name contains {:?}", c)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use msgrelay_protocol::{
        MessageType, PublicKey, Request, RequestBody, RequestHeader, PUBLIC_KEY_SIZE,
        REQUEST_HEADER_SIZE,
    };
    use msgrelay_storage::Storage;
    use std::time::Duration;

    fn test_handler() -> RequestHandler {
        RequestHandler::new(Arc::new(Storage::in_memory()))
    }

    fn incoming(client_id: ClientId, body: RequestBody) -> IncomingRequest {
        let bytes = Request::new(client_id, body).encode().unwrap();
        IncomingRequest {
            header: RequestHeader::decode(&bytes).unwrap(),
            payload: Bytes::copy_from_slice(&bytes[REQUEST_HEADER_SIZE..]),
        }
    }

    fn key(fill: u8) -> PublicKey {
        PublicKey::from_bytes([fill; PUBLIC_KEY_SIZE])
    }

    async fn register(handler: &RequestHandler, name: &str) -> ClientId {
        let reply = handler
            .dispatch(&incoming(
                ClientId::default(),
                RequestBody::Register(RegisterRequest {
                    name: name.to_string(),
                    public_key: key(7),
                }),
            ))
            .await;
        match reply.response {
            Response::Registered { client_id } => client_id,
            other => panic!("unexpected response: {:?}", other),
        }
    }

    async fn send(handler: &RequestHandler, from: ClientId, to: ClientId, text: &str) -> u32 {
        let reply = handler
            .dispatch(&incoming(
                from,
                RequestBody::SendMessage(SendMessageRequest {
                    target: to,
                    message_type: MessageType::TEXT,
                    content: Bytes::copy_from_slice(text.as_bytes()),
                }),
            ))
            .await;
        match reply.response {
            Response::MessageSent { target, message_id } => {
                assert_eq!(target, to);
                message_id
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("alice_01").is_ok());
        assert!(validate_name(&"a".repeat(254)).is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(255)).is_err());
        assert!(validate_name("bad-name").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name("caf\u{e9}").is_err());
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let handler = test_handler();
        let alice = register(&handler, "alice").await;
        let bob = register(&handler, "bob").await;
        assert_ne!(alice, bob);
        assert!(handler.store().client_id_exists(&alice).unwrap());

        let reply = handler
            .dispatch(&incoming(alice, RequestBody::UsersList))
            .await;
        match reply.response {
            Response::UsersList { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].client_id, bob);
                assert_eq!(users[0].name, "bob");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let handler = test_handler();
        register(&handler, "carol").await;

        let reply = handler
            .dispatch(&incoming(
                ClientId::default(),
                RequestBody::Register(RegisterRequest {
                    name: "carol".to_string(),
                    public_key: key(1),
                }),
            ))
            .await;
        assert_eq!(reply.response, Response::GeneralError);
        assert_eq!(handler.store().stats().clients, 1);
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let handler = test_handler();
        for name in ["", "no-dash", "two words", "semi;colon"] {
            let reply = handler
                .dispatch(&incoming(
                    ClientId::default(),
                    RequestBody::Register(RegisterRequest {
                        name: name.to_string(),
                        public_key: key(1),
                    }),
                ))
                .await;
            assert_eq!(reply.response, Response::GeneralError, "name {:?}", name);
        }
        assert_eq!(handler.store().stats().clients, 0);
    }

    #[tokio::test]
    async fn test_users_list_unknown_requester() {
        let handler = test_handler();
        register(&handler, "dave").await;

        let reply = handler
            .dispatch(&incoming(ClientId::generate(), RequestBody::UsersList))
            .await;
        assert!(reply.response.is_error());
    }

    #[tokio::test]
    async fn test_public_key_lookup() {
        let handler = test_handler();
        let erin = register(&handler, "erin").await;

        let reply = handler
            .dispatch(&incoming(
                ClientId::generate(),
                RequestBody::PublicKey(PublicKeyRequest { target: erin }),
            ))
            .await;
        assert_eq!(
            reply.response,
            Response::PublicKey {
                client_id: erin,
                public_key: key(7)
            }
        );

        let missing = handler
            .dispatch(&incoming(
                erin,
                RequestBody::PublicKey(PublicKeyRequest {
                    target: ClientId::generate(),
                }),
            ))
            .await;
        assert!(missing.response.is_error());
    }

    #[tokio::test]
    async fn test_send_then_pull() {
        let handler = test_handler();
        let frank = register(&handler, "frank").await;
        let grace = register(&handler, "grace").await;

        let first = send(&handler, frank, grace, "hello").await;
        let second = send(&handler, frank, grace, "again").await;
        assert!(second > first);

        let reply = handler
            .dispatch(&incoming(grace, RequestBody::PullPending))
            .await;
        let (response, ack) = reply.into_parts();
        match response {
            Response::PendingMessages { messages } => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].source, frank);
                assert_eq!(messages[0].message_id, first);
                assert_eq!(messages[0].message_type, MessageType::TEXT);
                assert_eq!(&messages[0].content[..], b"hello");
                assert_eq!(&messages[1].content[..], b"again");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let ack = ack.unwrap();
        assert_eq!(ack.message_ids, vec![first, second]);
        handler.acknowledge(ack).await;

        let reply = handler
            .dispatch(&incoming(grace, RequestBody::PullPending))
            .await;
        assert_eq!(
            reply.response,
            Response::PendingMessages { messages: vec![] }
        );
        assert!(reply.ack.is_none());
    }

    #[tokio::test]
    async fn test_unacknowledged_pull_keeps_messages() {
        let handler = test_handler();
        let heidi = register(&handler, "heidi").await;
        let ivan = register(&handler, "ivan").await;
        send(&handler, heidi, ivan, "keep me").await;

        let reply = handler
            .dispatch(&incoming(ivan, RequestBody::PullPending))
            .await;
        assert!(reply.ack.is_some());
        drop(reply);

        let retry = handler
            .dispatch(&incoming(ivan, RequestBody::PullPending))
            .await;
        match retry.response {
            Response::PendingMessages { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(&messages[0].content[..], b"keep me");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_pull_waits_for_ack() {
        let handler = Arc::new(test_handler());
        let judy = register(&handler, "judy").await;
        let mallory = register(&handler, "mallory").await;
        send(&handler, mallory, judy, "once").await;

        let first = handler
            .dispatch(&incoming(judy, RequestBody::PullPending))
            .await;

        let second = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .dispatch(&incoming(judy, RequestBody::PullPending))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        handler.acknowledge(first.ack.unwrap()).await;
        let second = second.await.unwrap();
        assert_eq!(
            second.response,
            Response::PendingMessages { messages: vec![] }
        );
    }

    #[tokio::test]
    async fn test_message_sent_during_delivery_survives_ack() {
        let handler = test_handler();
        let kim = register(&handler, "kim").await;
        let lee = register(&handler, "lee").await;
        let early = send(&handler, kim, lee, "early").await;

        let reply = handler
            .dispatch(&incoming(lee, RequestBody::PullPending))
            .await;
        let ack = reply.ack.unwrap();
        assert_eq!(ack.message_ids, vec![early]);

        // Sending does not wait for the target's pull lock.
        let late = send(&handler, kim, lee, "late").await;
        handler.acknowledge(ack).await;

        let reply = handler
            .dispatch(&incoming(lee, RequestBody::PullPending))
            .await;
        match reply.response {
            Response::PendingMessages { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message_id, late);
                assert_eq!(&messages[0].content[..], b"late");
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(reply.ack.unwrap().message_ids, vec![late]);
    }

    #[tokio::test]
    async fn test_ack_removes_batch_from_persistent_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let handler = RequestHandler::new(Arc::new(Storage::open(dir.path()).unwrap()));
        let nia = register(&handler, "nia").await;
        let oscar = register(&handler, "oscar").await;
        for i in 0..20 {
            send(&handler, nia, oscar, &format!("note {}", i)).await;
        }

        let reply = handler
            .dispatch(&incoming(oscar, RequestBody::PullPending))
            .await;
        handler.acknowledge(reply.ack.unwrap()).await;
        assert_eq!(handler.store().stats().queued_messages, 0);
        drop(handler);

        let reopened = Storage::open(dir.path()).unwrap();
        assert_eq!(reopened.stats().queued_messages, 0);
        assert_eq!(reopened.stats().clients, 2);
    }

    #[tokio::test]
    async fn test_send_type_zero_rejected() {
        let handler = test_handler();
        let reply = handler
            .dispatch(&incoming(
                ClientId::generate(),
                RequestBody::SendMessage(SendMessageRequest {
                    target: ClientId::generate(),
                    message_type: MessageType(0),
                    content: Bytes::from_static(b"x"),
                }),
            ))
            .await;
        assert!(reply.response.is_error());
        assert_eq!(handler.store().stats().queued_messages, 0);
    }

    #[tokio::test]
    async fn test_unknown_code_and_short_payload() {
        let handler = test_handler();

        let unknown = IncomingRequest {
            header: RequestHeader {
                client_id: ClientId::generate(),
                version: 2,
                code: 999,
                payload_size: 0,
            },
            payload: Bytes::new(),
        };
        assert!(handler.dispatch(&unknown).await.response.is_error());

        let short = IncomingRequest {
            header: RequestHeader::new(ClientId::default(), RequestCode::Register, 3),
            payload: Bytes::from_static(b"abc"),
        };
        assert!(handler.dispatch(&short).await.response.is_error());
    }

    #[tokio::test]
    async fn test_metrics_track_requests() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let handler = test_handler().with_metrics(metrics.clone());
        register(&handler, "olivia").await;
        handler
            .dispatch(&incoming(ClientId::generate(), RequestBody::UsersList))
            .await;

        assert_eq!(
            metrics
                .requests_total
                .with_label_values(&["REGISTER"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics
                .errors_total
                .with_label_values(&["unknown_client"])
                .get(),
            1.0
        );
        assert_eq!(metrics.clients_total.get(), 1.0);
    }
}
