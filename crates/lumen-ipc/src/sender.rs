//! Response sender
//!
//! Responses for one connection are written one at a time under a send
//! lock, so the bytes and fd groups of two responses never interleave even
//! when handlers complete concurrently on different threads.

use lumen_protocol::{ResultEnvelope, ResultMessage};
use lumen_util::ConnectionId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::{IpcError, IpcResult, Resource, ResourceCache, ResourceKey, StreamTransport};

/// Called with the connection id when a response cannot be written
pub type SendFailureHook = Arc<dyn Fn(ConnectionId) + Send + Sync>;

pub struct ResponseSender {
    connection_id: ConnectionId,
    transport: Arc<StreamTransport>,
    cache: Arc<ResourceCache>,
    send_lock: Mutex<()>,
    next_token: AtomicU64,
    in_flight: TaskTracker,
    runtime: Handle,
    closed: AtomicBool,
    on_failure: Option<SendFailureHook>,
}

impl ResponseSender {
    pub fn new(
        connection_id: ConnectionId,
        transport: Arc<StreamTransport>,
        cache: Arc<ResourceCache>,
        runtime: Handle,
    ) -> Self {
        Self {
            connection_id,
            transport,
            cache,
            send_lock: Mutex::new(()),
            next_token: AtomicU64::new(1),
            in_flight: TaskTracker::new(),
            runtime,
            closed: AtomicBool::new(false),
            on_failure: None,
        }
    }

    pub fn with_failure_hook(mut self, hook: SendFailureHook) -> Self {
        self.on_failure = Some(hook);
        self
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Responder for one request
    pub fn responder(self: &Arc<Self>, invocation_id: u32) -> Responder {
        let key = ResourceKey {
            connection: self.connection_id,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        };
        Responder {
            invocation_id,
            key,
            sender: Arc::clone(self),
            answered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting responses. Pending writes fail against the closed
    /// transport.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Responses queued or being written
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Serialize and write one response.
    ///
    /// Descriptors are moved out of the result in nesting order, the body is
    /// wrapped in its envelope and framed, and everything goes out under the
    /// send lock. Resources saved under `key` are released afterwards whether
    /// or not the write succeeded.
    pub async fn send_response<R: ResultMessage>(
        &self,
        invocation_id: u32,
        key: ResourceKey,
        mut result: R,
    ) -> IpcResult<()> {
        let outcome = self.write_response(invocation_id, &mut result).await;
        self.cache.release(key);
        outcome
    }

    async fn write_response<R: ResultMessage>(
        &self,
        invocation_id: u32,
        result: &mut R,
    ) -> IpcResult<()> {
        let fd_groups = result.extract_fds();
        if fd_groups.len() > R::SHAPE.max_groups() {
            return Err(IpcError::InvalidMessage(format!(
                "result carries {} fd groups, its shape allows {}",
                fd_groups.len(),
                R::SHAPE.max_groups()
            )));
        }
        if result.declared_fd_groups() != fd_groups.group_sizes() {
            return Err(IpcError::InvalidMessage(
                "declared fd counts disagree with extracted descriptors".into(),
            ));
        }
        let frame = ResultEnvelope::new(invocation_id, &*result)?.to_frame()?;

        let _lock = self.send_lock.lock().await;
        if self.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }
        self.transport.send(&frame, &fd_groups).await?;
        trace!(
            connection_id = %self.connection_id,
            invocation_id,
            bytes = frame.len(),
            fd_groups = fd_groups.len(),
            "Sent response"
        );
        Ok(())
    }

    /// Queue a response write on the runtime. A write failure tears the
    /// connection down through the failure hook.
    pub fn submit<R: ResultMessage>(
        self: &Arc<Self>,
        invocation_id: u32,
        key: ResourceKey,
        result: R,
    ) {
        if self.is_closed() {
            debug!(
                connection_id = %self.connection_id,
                invocation_id,
                "Dropping response for closed connection"
            );
            self.cache.release(key);
            return;
        }

        let sender = Arc::clone(self);
        self.in_flight.spawn_on(
            async move {
                if let Err(e) = sender.send_response(invocation_id, key, result).await {
                    if sender.is_closed() {
                        debug!(
                            connection_id = %sender.connection_id,
                            error = %e,
                            "Response abandoned"
                        );
                    } else {
                        warn!(
                            connection_id = %sender.connection_id,
                            error = %e,
                            "Failed to send response"
                        );
                        if let Some(hook) = &sender.on_failure {
                            hook(sender.connection_id);
                        }
                    }
                }
            },
            &self.runtime,
        );
    }

    /// Wait for queued responses to be written, at most `timeout`
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.in_flight.close();
        let flushed = tokio::time::timeout(timeout, self.in_flight.wait())
            .await
            .is_ok();
        self.in_flight.reopen();
        if !flushed {
            debug!(connection_id = %self.connection_id, "Timed out flushing responses");
        }
        flushed
    }
}

/// Right to answer one request
#[derive(Clone)]
pub struct Responder {
    invocation_id: u32,
    key: ResourceKey,
    sender: Arc<ResponseSender>,
    answered: Arc<AtomicBool>,
}

impl Responder {
    pub fn invocation_id(&self) -> u32 {
        self.invocation_id
    }

    /// Keep `resource` alive until this request's response has been written
    pub fn retain(&self, resource: Resource) {
        self.sender.cache.save(self.key, resource);
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }

    /// Queue the response. Only the first call for a request sends anything.
    pub fn respond<R: ResultMessage>(&self, result: R) -> bool {
        if self.answered.swap(true, Ordering::AcqRel) {
            warn!(
                connection_id = %self.sender.connection_id,
                invocation_id = self.invocation_id,
                "Request already answered"
            );
            return false;
        }
        self.sender.submit(self.invocation_id, self.key, result);
        true
    }

    /// Drop whatever was retained for this request without answering it
    pub fn release_resources(&self) {
        self.sender.cache.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportSettings;
    use lumen_protocol::{Buffer, CarriesFds, HEADER_LEN, SideChannel, Void, body_len};
    use lumen_util::FdIdentity;
    use std::os::fd::OwnedFd;

    struct Harness {
        client: StreamTransport,
        sender: Arc<ResponseSender>,
        cache: Arc<ResourceCache>,
    }

    fn harness() -> Harness {
        let (client, server) = StreamTransport::pair(TransportSettings::default()).unwrap();
        let cache = Arc::new(ResourceCache::new());
        let sender = Arc::new(ResponseSender::new(
            ConnectionId::from_raw(1),
            Arc::new(server),
            cache.clone(),
            Handle::current(),
        ));
        Harness {
            client,
            sender,
            cache,
        }
    }

    async fn read_envelope(client: &StreamTransport) -> ResultEnvelope {
        let mut header = [0u8; HEADER_LEN];
        client.receive(&mut header).await.unwrap();
        let mut body = vec![0u8; body_len(header)];
        client.receive(&mut body).await.unwrap();
        ResultEnvelope::decode(&body).unwrap()
    }

    #[tokio::test]
    async fn response_carries_invocation_id() {
        let h = harness();
        let responder = h.sender.responder(17);
        assert!(responder.respond(Void::default()));

        let envelope = read_envelope(&h.client).await;
        assert_eq!(envelope.id, 17);
        let void: Void = envelope.result().unwrap();
        assert!(void.error.is_none());
    }

    #[tokio::test]
    async fn second_answer_is_ignored() {
        let h = harness();
        let responder = h.sender.responder(1);
        assert!(responder.respond(Void::default()));
        assert!(!responder.respond(Void::failed("late")));
        assert!(h.sender.flush(Duration::from_secs(1)).await);

        read_envelope(&h.client).await;
        let mut extra = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(50), h.client.receive(&mut extra));
        assert!(pending.await.is_err());
    }

    #[tokio::test]
    async fn buffer_fds_follow_the_body() {
        let h = harness();
        let file: OwnedFd = tempfile::tempfile().unwrap().into();
        let identity = FdIdentity::of(&file).unwrap();
        let buffer = Buffer {
            buffer_id: 5,
            side_channel: SideChannel::with_fds(vec![file]),
            ..Default::default()
        };
        h.sender.responder(2).respond(buffer);

        let envelope = read_envelope(&h.client).await;
        let mut received: Buffer = envelope.result().unwrap();
        assert_eq!(received.declared_fd_groups(), vec![1]);

        let mut carrier = [0u8; 1];
        let fds = h.client.receive_with_fds(&mut carrier, 1).await.unwrap();
        received.attach_fds(vec![fds]).unwrap();
        assert_eq!(
            FdIdentity::of(&received.side_channel.fds[0]).unwrap(),
            identity
        );
    }

    #[tokio::test]
    async fn declared_but_missing_fds_are_not_sent() {
        let h = harness();
        let responder = h.sender.responder(6);
        let buffer = Buffer {
            buffer_id: 6,
            side_channel: SideChannel {
                fds_on_side_channel: 1,
                fds: Vec::new(),
            },
            ..Default::default()
        };

        let err = h
            .sender
            .send_response(6, responder.key, buffer)
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::InvalidMessage(_)));

        let mut byte = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(50), h.client.receive(&mut byte));
        assert!(pending.await.is_err());
    }

    #[tokio::test]
    async fn retained_resources_are_released_after_send() {
        let h = harness();
        let backing: Arc<Vec<u8>> = Arc::new(vec![0; 64]);
        let responder = h.sender.responder(3);
        responder.retain(backing.clone());
        assert_eq!(h.cache.len(), 1);

        responder.respond(Void::default());
        assert!(h.sender.flush(Duration::from_secs(1)).await);
        assert!(h.cache.is_empty());
        assert_eq!(Arc::strong_count(&backing), 1);
    }

    #[tokio::test]
    async fn released_request_can_still_be_answered() {
        let h = harness();
        let responder = h.sender.responder(3);
        responder.retain(Arc::new(0u8));
        responder.release_resources();
        assert!(h.cache.is_empty());
        assert!(responder.respond(Void::failed("gone")));
        assert_eq!(read_envelope(&h.client).await.id, 3);
    }

    #[tokio::test]
    async fn closed_sender_drops_responses() {
        let h = harness();
        let responder = h.sender.responder(4);
        responder.retain(Arc::new(0u8));
        h.sender.close();
        responder.respond(Void::default());
        assert_eq!(h.sender.in_flight(), 0);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn write_failure_runs_the_hook() {
        let (client, server) = StreamTransport::pair(TransportSettings::default()).unwrap();
        let failed = Arc::new(std::sync::Mutex::new(None));
        let seen = failed.clone();
        let sender = Arc::new(
            ResponseSender::new(
                ConnectionId::from_raw(9),
                Arc::new(server),
                Arc::new(ResourceCache::new()),
                Handle::current(),
            )
            .with_failure_hook(Arc::new(move |id| {
                *seen.lock().unwrap() = Some(id);
            })),
        );
        drop(client);

        sender.responder(1).respond(Void::default());
        assert!(sender.flush(Duration::from_secs(1)).await);
        assert_eq!(*failed.lock().unwrap(), Some(ConnectionId::from_raw(9)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_responses_never_interleave() {
        let h = harness();
        let count = 32u32;
        let mut joins = Vec::new();
        for id in 0..count {
            let sender = h.sender.clone();
            joins.push(std::thread::spawn(move || {
                let buffer = Buffer {
                    buffer_id: id as i32,
                    side_channel: SideChannel::with_fds(vec![
                        tempfile::tempfile().unwrap().into(),
                    ]),
                    ..Default::default()
                };
                sender.responder(id).respond(buffer);
            }));
        }
        for join in joins {
            join.join().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..count {
            let envelope = read_envelope(&h.client).await;
            let buffer: Buffer = envelope.result().unwrap();
            assert_eq!(buffer.buffer_id as u32, envelope.id);
            let mut carrier = [0u8; 1];
            let fds = h.client.receive_with_fds(&mut carrier, 1).await.unwrap();
            assert_eq!(fds.len(), 1);
            seen.push(envelope.id);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..count).collect::<Vec<_>>());
    }
}
