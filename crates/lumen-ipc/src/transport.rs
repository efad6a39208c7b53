//! Stream transport over a connected Unix domain socket
//!
//! Carries raw bytes in both directions and passes file descriptors through
//! SCM_RIGHTS control messages. The socket is non-blocking; reads and writes
//! park on tokio readiness and retry interrupted or would-block system calls.

use lumen_protocol::FdSets;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, Shutdown, UnixAddr, getsockopt, recvmsg,
    sendmsg, setsockopt, sockopt,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::{debug, trace};

use crate::{ObserverId, ObserverList, SessionCredentials, TransportObserver};

/// Most descriptors the kernel passes in a single control message (SCM_MAX_FD)
pub const MAX_FDS_PER_MESSAGE: usize = 253;

/// Data byte that carries each fd group
const FD_CARRIER_BYTE: u8 = 0;

/// Default bound on how long a single send may stall on a full socket
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Send buffer requested for every socket. The kernel clamps it to
/// `net.core.wmem_max`.
pub const DEFAULT_SEND_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Socket I/O failed: {0}")]
    Io(#[source] io::Error),

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Failed to receive file descriptors: {0}")]
    FdReception(String),

    #[error("Send did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Transport is closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub send_timeout: Duration,
    /// Kernel send buffer size requested with SO_SNDBUF
    pub send_buffer_bytes: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            send_buffer_bytes: DEFAULT_SEND_BUFFER_BYTES,
        }
    }
}

/// What one `recvmsg` produced
struct Chunk {
    bytes: usize,
    fds: Vec<OwnedFd>,
    truncated: bool,
    unexpected_control: bool,
}

fn recv_chunk(socket: RawFd, buf: &mut [u8], cmsg: Option<&mut Vec<u8>>) -> io::Result<Chunk> {
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<UnixAddr>(socket, &mut iov, cmsg, MsgFlags::MSG_CMSG_CLOEXEC)
        .map_err(io::Error::from)?;

    let bytes = msg.bytes;
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Ok(Chunk {
            bytes,
            fds: Vec::new(),
            truncated: true,
            unexpected_control: false,
        });
    }

    let mut fds = Vec::new();
    let mut unexpected_control = false;
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        match cmsg {
            ControlMessageOwned::ScmRights(raw) => {
                // SAFETY: SCM_RIGHTS installs fresh descriptors owned by us.
                fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
            _ => unexpected_control = true,
        }
    }

    Ok(Chunk {
        bytes,
        fds,
        truncated: false,
        unexpected_control,
    })
}

fn send_chunk(socket: RawFd, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &rights };
    sendmsg::<()>(socket, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None).map_err(io::Error::from)
}

pub struct StreamTransport {
    stream: UnixStream,
    settings: TransportSettings,
    observers: ObserverList,
    disconnected: AtomicBool,
    closed: AtomicBool,
}

impl StreamTransport {
    pub fn new(stream: UnixStream, settings: TransportSettings) -> TransportResult<Self> {
        setsockopt(&stream.as_fd(), sockopt::SndBuf, &settings.send_buffer_bytes)
            .map_err(|e| TransportError::Io(e.into()))?;

        Ok(Self {
            stream,
            settings,
            observers: ObserverList::new(),
            disconnected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn connect(
        path: impl AsRef<Path>,
        settings: TransportSettings,
    ) -> TransportResult<Self> {
        let stream = UnixStream::connect(path.as_ref())
            .await
            .map_err(TransportError::Io)?;
        Self::new(stream, settings)
    }

    /// Connected pair of transports
    pub fn pair(settings: TransportSettings) -> TransportResult<(Self, Self)> {
        let (a, b) = UnixStream::pair().map_err(TransportError::Io)?;
        Ok((Self::new(a, settings.clone())?, Self::new(b, settings)?))
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Credentials of the process on the other end, as recorded by the kernel
    pub fn peer_credentials(&self) -> TransportResult<SessionCredentials> {
        let creds = getsockopt(&self.stream.as_fd(), sockopt::PeerCredentials)
            .map_err(|e| TransportError::Io(e.into()))?;
        Ok(SessionCredentials::new(creds.pid(), creds.uid(), creds.gid()))
    }

    pub fn register_observer(&self, observer: Arc<dyn TransportObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Wait until the socket has something to read, then notify observers
    pub async fn wait_readable(&self) -> TransportResult<()> {
        self.ensure_open()?;
        self.stream.readable().await.map_err(TransportError::Io)?;
        if !self.is_closed() {
            self.observers.for_each(|o| o.on_data_available());
        }
        Ok(())
    }

    fn notify_disconnected(&self) {
        if self.is_closed() || self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Transport peer disconnected");
        self.observers.for_each(|o| o.on_disconnected());
    }

    fn classify(&self, error: io::Error) -> TransportError {
        match error.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => {
                self.notify_disconnected();
                TransportError::PeerDisconnected
            }
            _ => TransportError::Io(error),
        }
    }

    async fn recv_some(
        &self,
        buf: &mut [u8],
        mut cmsg: Option<&mut Vec<u8>>,
    ) -> TransportResult<Chunk> {
        let socket = self.stream.as_raw_fd();
        loop {
            let result = self.stream.try_io(Interest::READABLE, || {
                recv_chunk(socket, buf, cmsg.as_deref_mut())
            });
            match result {
                Ok(chunk) if chunk.bytes == 0 && !chunk.truncated => {
                    self.notify_disconnected();
                    return Err(TransportError::PeerDisconnected);
                }
                Ok(chunk) => return Ok(chunk),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ensure_open()?;
                    self.stream.readable().await.map_err(TransportError::Io)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.classify(e)),
            }
        }
    }

    /// Fill `buf` completely. Descriptors arriving here are an error.
    pub async fn receive(&self, buf: &mut [u8]) -> TransportResult<()> {
        self.ensure_open()?;
        let mut read = 0;
        while read < buf.len() {
            let chunk = self.recv_some(&mut buf[read..], None).await?;
            if chunk.truncated || !chunk.fds.is_empty() {
                return Err(TransportError::FdReception(
                    "descriptors arrived with ordinary data".into(),
                ));
            }
            read += chunk.bytes;
        }
        trace!(bytes = buf.len(), "Received bytes");
        Ok(())
    }

    /// Fill `buf` completely and collect exactly `expected_fds` descriptors
    /// sent alongside it
    pub async fn receive_with_fds(
        &self,
        buf: &mut [u8],
        expected_fds: usize,
    ) -> TransportResult<Vec<OwnedFd>> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Err(TransportError::FdReception(
                "descriptors need at least one data byte to travel with".into(),
            ));
        }

        let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
        let mut fds = Vec::with_capacity(expected_fds);
        let mut read = 0;
        while read < buf.len() {
            let chunk = self.recv_some(&mut buf[read..], Some(&mut cmsg)).await?;
            if chunk.truncated {
                return Err(TransportError::FdReception(
                    "control message truncated".into(),
                ));
            }
            if chunk.unexpected_control {
                return Err(TransportError::FdReception(
                    "invalid control message for receiving file descriptors".into(),
                ));
            }
            if fds.len() + chunk.fds.len() > expected_fds {
                return Err(TransportError::FdReception(format!(
                    "received more fds than expected ({} > {expected_fds})",
                    fds.len() + chunk.fds.len()
                )));
            }
            fds.extend(chunk.fds);
            read += chunk.bytes;
        }

        if fds.len() < expected_fds {
            return Err(TransportError::FdReception(format!(
                "received fewer fds than expected ({} < {expected_fds})",
                fds.len()
            )));
        }
        trace!(bytes = buf.len(), fds = fds.len(), "Received bytes with fds");
        Ok(fds)
    }

    /// Write `bytes`, then each non-empty fd group with one carrier byte.
    ///
    /// Fails with `Timeout` if the peer stops draining the socket for longer
    /// than the configured send timeout.
    pub async fn send(&self, bytes: &[u8], fd_groups: &FdSets) -> TransportResult<()> {
        self.ensure_open()?;
        let timeout = self.settings.send_timeout;
        match tokio::time::timeout(timeout, self.send_all(bytes, fd_groups)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn send_all(&self, bytes: &[u8], fd_groups: &FdSets) -> TransportResult<()> {
        self.write_with_fds(bytes, &[]).await?;
        for group in fd_groups.groups() {
            let raw: Vec<RawFd> = group.iter().map(|fd| fd.as_raw_fd()).collect();
            self.write_with_fds(&[FD_CARRIER_BYTE], &raw).await?;
        }
        trace!(
            bytes = bytes.len(),
            groups = fd_groups.len(),
            "Sent message"
        );
        Ok(())
    }

    async fn write_with_fds(&self, bytes: &[u8], fds: &[RawFd]) -> TransportResult<()> {
        let socket = self.stream.as_raw_fd();
        let mut written = 0;
        // Descriptors ride with the first chunk the kernel accepts
        let mut pending_fds = fds;
        while written < bytes.len() {
            let result = self.stream.try_io(Interest::WRITABLE, || {
                send_chunk(socket, &bytes[written..], pending_fds)
            });
            match result {
                Ok(n) => {
                    written += n;
                    pending_fds = &[];
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ensure_open()?;
                    self.stream.writable().await.map_err(TransportError::Io)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.classify(e)),
            }
        }
        Ok(())
    }

    /// Shut the socket down. Idempotent; no observer fires afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.observers.clear();
        if let Err(e) = nix::sys::socket::shutdown(self.stream.as_raw_fd(), Shutdown::Both) {
            debug!(error = %e, "Socket shutdown failed");
        }
    }
}
