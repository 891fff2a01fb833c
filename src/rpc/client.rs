//! Client side of the daemon socket. One connection per call.

use std::fs::File;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::socket::{ControlMessageOwned, MsgFlags, UnixAddr, recvmsg};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Interest};
use tokio::net::UnixStream;

use super::protocol::{Request, Response, RpcError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{}", .0.message)]
    Rpc(RpcError),
    #[error("Daemon did not pass a file descriptor")]
    MissingFd,
}

pub struct RpcClient {
    socket_path: PathBuf,
}

impl RpcClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    async fn send(&self, method: &str, params: Option<Value>) -> Result<UnixStream, ClientError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        let mut line = serde_json::to_vec(&Request::new(method, params))?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        Ok(stream)
    }

    fn decode<T: DeserializeOwned>(line: &[u8]) -> Result<T, ClientError> {
        let response: Response = serde_json::from_slice(line)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let stream = self.send(method, params).await?;
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await?;
        Self::decode(&line)
    }

    /// Call a method whose reply carries a descriptor, as the `open_for_*`
    /// methods do.
    pub async fn call_with_fd(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<File, ClientError> {
        let stream = self.send(method, params).await?;
        let socket = stream.as_raw_fd();
        let mut line = Vec::new();
        let mut received: Option<File> = None;

        while !line.ends_with(b"\n") {
            stream.readable().await?;
            let chunk = match stream.try_io(Interest::READABLE, || recv_with_fd(socket)) {
                Ok(chunk) => chunk,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            };
            if chunk.0.is_empty() {
                break;
            }
            line.extend_from_slice(&chunk.0);
            if let Some(fd) = chunk.1 {
                // SAFETY: the kernel installed a fresh descriptor that nothing else owns.
                received = Some(unsafe { File::from_raw_fd(fd) });
            }
        }

        let _: Value = Self::decode(&line)?;
        received.ok_or(ClientError::MissingFd)
    }
}

fn recv_with_fd(socket: RawFd) -> std::io::Result<(Vec<u8>, Option<RawFd>)> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut cmsg = nix::cmsg_space!([RawFd; 1]);
    let mut iov = [IoSliceMut::new(&mut buf)];
    let msg = recvmsg::<UnixAddr>(socket, &mut iov, Some(&mut cmsg), MsgFlags::MSG_CMSG_CLOEXEC)
        .map_err(std::io::Error::from)?;
    let fd = msg
        .cmsgs()
        .into_iter()
        .flatten()
        .find_map(|c| match c {
            ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
            _ => None,
        });
    let len = msg.bytes;
    buf.truncate(len);
    Ok((buf, fd))
}
