//! Binary RPC transport: framing, multiplexed client, server.

pub mod client;
pub mod frame;
pub mod pending;
pub mod server;

pub use client::RpcClient;
pub use frame::{Frame, FrameCodec, FrameError, RpcRequest, RpcResponse, MAX_FRAME_SIZE};
pub use pending::{PendingCalls, PendingGuard};
pub use server::{RpcHandler, RpcServer};
