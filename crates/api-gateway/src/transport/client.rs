//! Multiplexed binary RPC client, one persistent link per backend.
//!
//! Calls share a single TCP connection and are matched to responses by id.
//! A writer task pings after `keepalive_interval` of outbound silence and the
//! reader drops the link after `idle_timeout` of inbound silence. A dead link
//! is redialled on the next call; only a failed redial surfaces as an error.

use crate::domain::config::BackendDescriptor;
use crate::domain::value::Value;
use crate::ports::outbound::{BackendClient, BackendRequest, CallError};
use crate::transport::frame::{Frame, FrameCodec, RpcRequest};
use crate::transport::pending::{PendingCalls, PendingGuard};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 1024;

/// One live connection and its I/O tasks.
struct Link {
    outbound: mpsc::Sender<Frame>,
    pending: Arc<PendingCalls>,
    /// Cancelled when the link dies for any reason
    alive: CancellationToken,
}

impl Link {
    fn is_dead(&self) -> bool {
        self.alive.is_cancelled() || self.outbound.is_closed()
    }
}

/// Client for one backend service.
pub struct RpcClient {
    descriptor: BackendDescriptor,
    max_frame_size: usize,
    link: Mutex<Option<Arc<Link>>>,
    closed: AtomicBool,
    dials: AtomicU64,
}

impl RpcClient {
    /// Dial the backend now. Fails if the first connection cannot be made.
    pub async fn connect(
        descriptor: BackendDescriptor,
        max_frame_size: usize,
    ) -> Result<Self, CallError> {
        let client = Self::lazy(descriptor, max_frame_size);
        let link = client.dial().await?;
        *client.link.lock().await = Some(link);
        Ok(client)
    }

    /// Create without dialing; the first call connects.
    pub fn lazy(descriptor: BackendDescriptor, max_frame_size: usize) -> Self {
        Self {
            descriptor,
            max_frame_size,
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
            dials: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// Number of successful dials so far, reconnects included.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    async fn dial(&self) -> Result<Arc<Link>, CallError> {
        let address = &self.descriptor.address;
        let connect = TcpStream::connect(address.as_str());
        let stream = match tokio::time::timeout(self.descriptor.dial.connect_timeout, connect).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(CallError::ConnectionRefused(format!("{address}: {e}"))),
            Err(_) => {
                return Err(CallError::ConnectionRefused(format!(
                    "{address}: connect timed out"
                )))
            }
        };
        let _ = stream.set_nodelay(true);

        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let link = Arc::new(Link {
            outbound: tx,
            pending: Arc::new(PendingCalls::new()),
            alive: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(write, FrameCodec::new(self.max_frame_size)),
            rx,
            self.descriptor.dial.keepalive_interval,
            link.alive.clone(),
        ));
        tokio::spawn(read_loop(
            FramedRead::new(read, FrameCodec::new(self.max_frame_size)),
            Arc::clone(&link),
            self.descriptor.dial.idle_timeout,
            self.descriptor.name.clone(),
        ));

        let dials = self.dials.fetch_add(1, Ordering::Relaxed) + 1;
        if dials > 1 {
            info!(backend = %self.descriptor.name, %address, "Reconnected to backend");
        } else {
            debug!(backend = %self.descriptor.name, %address, "Connected to backend");
        }
        Ok(link)
    }

    /// Current link, redialling if it died.
    async fn live_link(&self) -> Result<Arc<Link>, CallError> {
        let mut slot = self.link.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::Closed);
        }
        if let Some(link) = slot.as_ref() {
            if !link.is_dead() {
                return Ok(Arc::clone(link));
            }
            debug!(backend = %self.descriptor.name, "Link is down, redialling");
        }
        let link = self.dial().await?;
        *slot = Some(Arc::clone(&link));
        Ok(link)
    }

    /// Link acquisition, send and response wait for one call.
    async fn exchange(&self, mut outgoing: RpcRequest) -> Result<Value, CallError> {
        // A frame that never left the queue was not delivered, so one
        // transparent redial is safe.
        for _ in 0..2 {
            let link = self.live_link().await?;
            let (id, rx) = link.pending.register(&outgoing.method);
            let guard = PendingGuard::new(&link.pending, id);
            outgoing.id = id;

            match link.outbound.send(Frame::Request(outgoing)).await {
                Ok(()) => {
                    let outcome = match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(CallError::ConnectionReset("link closed".into())),
                    };
                    drop(guard);
                    return outcome;
                }
                Err(mpsc::error::SendError(frame)) => {
                    drop(guard);
                    link.alive.cancel();
                    let Frame::Request(unsent) = frame else {
                        break;
                    };
                    outgoing = unsent;
                }
            }
        }

        Err(CallError::ConnectionReset("link closed before send".into()))
    }
}

#[async_trait]
impl BackendClient for RpcClient {
    fn backend(&self) -> &str {
        &self.descriptor.name
    }

    async fn call(&self, request: BackendRequest) -> Result<Value, CallError> {
        let timeout = request.timeout;
        let deadline = Instant::now() + timeout;
        let outgoing = RpcRequest {
            id: 0,
            method: request.method,
            metadata: request.metadata,
            payload: request.payload,
            timeout_ms: timeout.as_millis() as u64,
        };

        // Waiting for the link and redialling count against the attempt
        match tokio::time::timeout_at(deadline, self.exchange(outgoing)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::DeadlineExceeded(timeout)),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(link) = self.link.lock().await.take() {
            link.pending.fail_all(CallError::Closed);
            link.alive.cancel();
        }
        debug!(backend = %self.descriptor.name, "Client closed");
    }
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
    keepalive: std::time::Duration,
    alive: CancellationToken,
) {
    let mut last_write = Instant::now();
    loop {
        tokio::select! {
            _ = alive.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "Write failed, dropping link");
                    break;
                }
                last_write = Instant::now();
            }
            _ = tokio::time::sleep_until(last_write + keepalive) => {
                if sink.send(Frame::Ping).await.is_err() {
                    break;
                }
                last_write = Instant::now();
            }
        }
    }
    alive.cancel();
}

async fn read_loop(
    mut stream: FramedRead<OwnedReadHalf, FrameCodec>,
    link: Arc<Link>,
    idle_timeout: std::time::Duration,
    backend: String,
) {
    loop {
        let next = tokio::select! {
            _ = link.alive.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };

        match next {
            Ok(Some(Ok(Frame::Response(response)))) => {
                link.pending
                    .complete(response.id, response.result.map_err(CallError::Status));
            }
            Ok(Some(Ok(Frame::Ping))) => {
                let _ = link.outbound.try_send(Frame::Pong);
            }
            Ok(Some(Ok(Frame::Pong))) => {}
            Ok(Some(Ok(Frame::Request(req)))) => {
                warn!(%backend, id = req.id, "Backend sent a request frame, ignoring");
            }
            Ok(Some(Err(e))) => {
                warn!(%backend, error = %e, "Read failed, dropping link");
                break;
            }
            Ok(None) => {
                debug!(%backend, "Backend closed the link");
                break;
            }
            Err(_) => {
                debug!(%backend, "Link idle, closing");
                break;
            }
        }
    }

    link.alive.cancel();
    let failed = link
        .pending
        .fail_all(CallError::ConnectionReset("link closed".into()));
    if failed > 0 {
        warn!(%backend, failed, "Link dropped with calls in flight");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::DialOptions;
    use crate::domain::status::RpcStatus;
    use crate::transport::frame::{RpcResponse, MAX_FRAME_SIZE};
    use crate::transport::server::{RpcHandler, RpcServer};
    use tokio_util::codec::Framed;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, request: RpcRequest) -> Result<Value, RpcStatus> {
            match request.method.as_str() {
                "echo" => Ok(request.payload),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }
                other => Err(RpcStatus::not_found(format!("no method {other}"))),
            }
        }
    }

    async fn spawn_server() -> (std::net::SocketAddr, CancellationToken) {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(Echo), MAX_FRAME_SIZE)
            .await
            .unwrap();
        let addr = server.local_addr();
        let stop = server.abort_token();
        tokio::spawn(server.serve());
        (addr, stop)
    }

    fn descriptor(addr: std::net::SocketAddr) -> BackendDescriptor {
        BackendDescriptor {
            name: "echo".into(),
            address: addr.to_string(),
            dial: DialOptions {
                connect_timeout: Duration::from_secs(1),
                keepalive_interval: Duration::from_millis(200),
                idle_timeout: Duration::from_secs(2),
            },
        }
    }

    fn request(method: &str, timeout: Duration) -> BackendRequest {
        BackendRequest {
            method: method.into(),
            metadata: Default::default(),
            payload: Value::from("hello"),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (addr, _stop) = spawn_server().await;
        let client = RpcClient::connect(descriptor(addr), MAX_FRAME_SIZE)
            .await
            .unwrap();

        let value = client
            .call(request("echo", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(value, Value::from("hello"));

        let err = client
            .call(request("missing", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Status(s) if s.message.contains("missing")));
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_link() {
        let (addr, _stop) = spawn_server().await;
        let client = Arc::new(
            RpcClient::connect(descriptor(addr), MAX_FRAME_SIZE)
                .await
                .unwrap(),
        );

        let calls = (0..20).map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let mut req = request("echo", Duration::from_secs(2));
                req.payload = Value::Int(i);
                client.call(req).await
            })
        });
        for (i, handle) in futures::future::join_all(calls).await.into_iter().enumerate() {
            assert_eq!(handle.unwrap().unwrap(), Value::Int(i as i64));
        }
        assert_eq!(client.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let (addr, _stop) = spawn_server().await;
        let client = RpcClient::connect(descriptor(addr), MAX_FRAME_SIZE)
            .await
            .unwrap();

        let err = client
            .call(request("slow", Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::DeadlineExceeded(Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_covers_waiting_for_link() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = RpcClient::lazy(descriptor(listener.local_addr().unwrap()), MAX_FRAME_SIZE);

        // Another caller holds the slot, as during a slow redial
        let _slot = client.link.lock().await;
        let started = Instant::now();
        let err = client
            .call(request("echo", Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert_eq!(err, CallError::DeadlineExceeded(Duration::from_millis(100)));
        // Bounded by the call timeout, not by connect_timeout
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_dial() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RpcClient::connect(descriptor(addr), MAX_FRAME_SIZE).await;
        assert!(matches!(result, Err(CallError::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn test_redials_after_link_drop() {
        // Backend that hangs up after answering one call per connection
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let mut framed = Framed::new(socket, FrameCodec::default());
                if let Some(Ok(Frame::Request(req))) = framed.next().await {
                    let _ = framed
                        .send(Frame::Response(RpcResponse {
                            id: req.id,
                            result: Ok(req.payload),
                        }))
                        .await;
                }
            }
        });

        let client = RpcClient::connect(descriptor(addr), MAX_FRAME_SIZE)
            .await
            .unwrap();
        client
            .call(request("echo", Duration::from_secs(1)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let value = client
            .call(request("echo", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(value, Value::from("hello"));
        assert_eq!(client.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_close_rejects_later_calls() {
        let (addr, _stop) = spawn_server().await;
        let client = RpcClient::connect(descriptor(addr), MAX_FRAME_SIZE)
            .await
            .unwrap();
        client.close().await;
        assert_eq!(
            client
                .call(request("echo", Duration::from_secs(1)))
                .await
                .unwrap_err(),
            CallError::Closed
        );
    }
}
