//! JSON-RPC 2.0 over a Unix domain socket.
//!
//! - `protocol`: request/response types and error mapping
//! - `transport`: listener, peer credentials, descriptor passing
//! - `methods`: the method table
//! - `client`: used by the CLI subcommands

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::{MethodHandler, ObjectSummary};
pub use protocol::{Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    pub fn new(ctx: AppContext, socket_path: PathBuf) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            transport: Transport::new(socket_path, MethodHandler::new(ctx)),
            shutdown_tx,
        }
    }

    /// Serve until [`RpcServer::shutdown`] is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transport.listen(self.shutdown_tx.subscribe()).await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
