//! Unix socket transport with newline-delimited JSON framing.
//!
//! The caller's identity is taken from the socket's peer credentials. Replies
//! that carry a descriptor send it as `SCM_RIGHTS` on the same `sendmsg` as
//! the response line.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nix::sys::socket::{ControlMessage, MsgFlags, UnixAddr, sendmsg};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::methods::{MethodHandler, Reply};
use super::protocol::{Request, Response};
use crate::core::Caller;

pub struct Transport {
    socket_path: PathBuf,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(socket_path: PathBuf, handler: MethodHandler) -> Self {
        Self {
            socket_path,
            handler: Arc::new(handler),
        }
    }

    fn bind(&self) -> anyhow::Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        // A stale socket from a previous run blocks bind().
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to remove stale socket"),
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;
        // Any local user may connect; authorization happens per method.
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o666))?;
        Ok(listener)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = self.bind()?;
        info!(path = %self.socket_path.display(), "RPC server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let caller = match peer_caller(&stream) {
                            Ok(c) => c,
                            Err(e) => {
                                warn!(error = %e, "Rejecting connection without peer credentials");
                                continue;
                            }
                        };
                        debug!(uid = caller.uid, pid = caller.pid, "Client connected");
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, caller, handler).await {
                                debug!(uid = caller.uid, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

fn peer_caller(stream: &UnixStream) -> std::io::Result<Caller> {
    let cred = stream.peer_cred()?;
    Ok(Caller {
        uid: cred.uid(),
        gid: cred.gid(),
        pid: cred.pid().unwrap_or(0),
    })
}

async fn handle_connection(
    stream: UnixStream,
    caller: Caller,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                if let Err(msg) = request.validate() {
                    warn!(uid = caller.uid, error = msg, "Invalid request");
                    Response::invalid_request(request.id.clone().unwrap_or_default()).into()
                } else if request.is_notification() {
                    handler.handle(request, caller).await;
                    continue;
                } else {
                    debug!(uid = caller.uid, method = %request.method, "Request");
                    handler.handle(request, caller).await
                }
            }
            Err(e) => {
                warn!(uid = caller.uid, error = %e, "Parse error");
                Response::parse_error().into()
            }
        };

        write_reply(reader.get_mut(), reply).await?;
    }

    Ok(())
}

async fn write_reply(stream: &mut UnixStream, reply: Reply) -> anyhow::Result<()> {
    let mut bytes = serde_json::to_vec(&reply.response)?;
    bytes.push(b'\n');

    let Some(file) = reply.fd else {
        stream.write_all(&bytes).await?;
        return Ok(());
    };

    let fd = file.as_raw_fd();
    let socket = stream.as_raw_fd();
    let sent = loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || send_with_fd(socket, &bytes, fd)) {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    };
    // The descriptor went with the first chunk; the rest is plain data.
    if sent < bytes.len() {
        stream.write_all(&bytes[sent..]).await?;
    }
    drop(file);
    Ok(())
}

fn send_with_fd(socket: RawFd, bytes: &[u8], fd: RawFd) -> std::io::Result<usize> {
    let fds = [fd];
    sendmsg::<UnixAddr>(
        socket,
        &[IoSlice::new(bytes)],
        &[ControlMessage::ScmRights(&fds)],
        MsgFlags::empty(),
        None,
    )
    .map_err(std::io::Error::from)
}
