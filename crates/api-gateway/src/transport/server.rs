//! Binary RPC server.
//!
//! Each connection gets a reader loop and a writer task; each request runs
//! on its own task. When a connection goes away its in-flight requests are
//! cancelled, so work for a disconnected caller stops immediately.

use crate::domain::status::RpcStatus;
use crate::domain::value::Value;
use crate::transport::frame::{Frame, FrameCodec, RpcRequest, RpcResponse};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const REPLY_QUEUE: usize = 1024;

/// Serves requests arriving on the binary transport.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest) -> Result<Value, RpcStatus>;
}

/// Listener plus the tokens that stop it.
pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    max_frame_size: usize,
    /// Stop accepting new connections
    stop: CancellationToken,
    /// Tear down open connections and cancel their requests
    abort: CancellationToken,
}

impl RpcServer {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        handler: Arc<dyn RpcHandler>,
        max_frame_size: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, handler, max_frame_size))
    }

    pub fn from_listener(
        listener: TcpListener,
        handler: Arc<dyn RpcHandler>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            listener,
            handler,
            max_frame_size,
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        // A bound listener always has an address
        self.listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Cancelling this stops the accept loop; open connections stay up.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Cancelling this closes every connection and cancels their requests.
    /// It also stops the accept loop.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Accept connections until stopped.
    pub async fn serve(self) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.abort.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "Accepted RPC connection");
                    tokio::spawn(serve_connection(
                        socket,
                        Arc::clone(&self.handler),
                        self.max_frame_size,
                        self.abort.child_token(),
                    ));
                }
                Err(e) => {
                    // Per-connection accept errors (e.g. fd exhaustion) are transient
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
        debug!("RPC listener stopped");
        Ok(())
    }
}

async fn serve_connection(
    socket: TcpStream,
    handler: Arc<dyn RpcHandler>,
    max_frame_size: usize,
    conn: CancellationToken,
) {
    let _ = socket.set_nodelay(true);
    let (read, write) = socket.into_split();
    let mut frames = FramedRead::new(read, FrameCodec::new(max_frame_size));
    let mut sink = FramedWrite::new(write, FrameCodec::new(max_frame_size));
    let (reply_tx, mut reply_rx) = mpsc::channel::<Frame>(REPLY_QUEUE);

    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_conn.cancelled() => break,
                frame = reply_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(frame).await {
                        debug!(error = %e, "Reply write failed");
                        break;
                    }
                }
            }
        }
        writer_conn.cancel();
    });

    loop {
        let next = tokio::select! {
            _ = conn.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(Frame::Request(request))) => {
                let handler = Arc::clone(&handler);
                let reply_tx = reply_tx.clone();
                let request_conn = conn.clone();
                tokio::spawn(async move {
                    let id = request.id;
                    let result = tokio::select! {
                        _ = request_conn.cancelled() => return,
                        result = handler.handle(request) => result,
                    };
                    let _ = reply_tx
                        .send(Frame::Response(RpcResponse { id, result }))
                        .await;
                });
            }
            Some(Ok(Frame::Ping)) => {
                let _ = reply_tx.send(Frame::Pong).await;
            }
            Some(Ok(Frame::Pong)) => {}
            Some(Ok(Frame::Response(response))) => {
                warn!(id = response.id, "Client sent a response frame, ignoring");
            }
            Some(Err(e)) => {
                warn!(error = %e, "Malformed frame, closing connection");
                break;
            }
            None => break,
        }
    }

    // Caller is gone: cancel everything still running for it
    conn.cancel();
    let _ = writer.await;
    debug!("RPC connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::MAX_FRAME_SIZE;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio_util::codec::Framed;

    /// Records whether a slow request ran to completion.
    struct Slow {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RpcHandler for Slow {
        async fn handle(&self, request: RpcRequest) -> Result<Value, RpcStatus> {
            if request.method == "slow" {
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.finished.store(true, Ordering::SeqCst);
            }
            Ok(request.payload)
        }
    }

    async fn start(finished: Arc<AtomicBool>) -> (SocketAddr, CancellationToken) {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(Slow { finished }), MAX_FRAME_SIZE)
            .await
            .unwrap();
        let addr = server.local_addr();
        let stop = server.stop_token();
        tokio::spawn(server.serve());
        (addr, stop)
    }

    fn request(id: u64, method: &str) -> Frame {
        Frame::Request(RpcRequest {
            id,
            method: method.into(),
            metadata: Default::default(),
            payload: Value::Int(id as i64),
            timeout_ms: 0,
        })
    }

    #[tokio::test]
    async fn test_answers_requests_and_pings() {
        let (addr, _stop) = start(Arc::new(AtomicBool::new(false))).await;
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(socket, FrameCodec::default());

        framed.send(Frame::Ping).await.unwrap();
        assert_eq!(framed.next().await.unwrap().unwrap(), Frame::Pong);

        framed.send(request(5, "echo")).await.unwrap();
        match framed.next().await.unwrap().unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.id, 5);
                assert_eq!(resp.result, Ok(Value::Int(5)));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_cancels_in_flight_requests() {
        let finished = Arc::new(AtomicBool::new(false));
        let (addr, _stop) = start(Arc::clone(&finished)).await;

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(socket, FrameCodec::default());
        framed.send(request(1, "slow")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(framed);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_refuses_new_connections() {
        let (addr, stop) = start(Arc::new(AtomicBool::new(false))).await;
        stop.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
