use std::net::SocketAddr;

use crate::error::{SocketError, SocketResult};
use crate::stack::{Request, StackHandle};
use crate::transport::tcp::{Received, SocketId};

/// A connected TCP stream
///
/// Dropping the stream closes it gracefully; use [`TcpStream::abort`] to
/// reset the peer instead.
#[derive(Debug)]
pub struct TcpStream {
    id: SocketId,
    handle: StackHandle,
    closed: bool,
}

impl TcpStream {
    /// Open a connection and wait until it is established or fails
    pub fn connect(handle: &StackHandle, remote: SocketAddr) -> SocketResult<Self> {
        let id = handle.call(|reply| Request::Connect { remote, reply })?;
        Ok(TcpStream::from_id(id, handle.clone()))
    }

    fn from_id(id: SocketId, handle: StackHandle) -> Self {
        TcpStream {
            id,
            handle,
            closed: false,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn local_addr(&self) -> SocketResult<SocketAddr> {
        self.addrs().map(|(local, _)| local)
    }

    pub fn peer_addr(&self) -> SocketResult<SocketAddr> {
        self.addrs().map(|(_, peer)| peer)
    }

    fn addrs(&self) -> SocketResult<(SocketAddr, SocketAddr)> {
        let id = self.id;
        self.handle.call(|reply| Request::PeerAddr { id, reply })
    }

    /// Queue bytes for sending, waiting while the send buffer is full.
    /// Returns how many bytes were accepted.
    pub fn send(&self, data: &[u8]) -> SocketResult<usize> {
        let id = self.id;
        let data = data.to_vec();
        self.handle.call(|reply| Request::Send { id, data, reply })
    }

    pub fn send_all(&self, mut data: &[u8]) -> SocketResult<()> {
        while !data.is_empty() {
            let n = self.send(data)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Wait for up to `max` bytes. `None` means the peer closed the stream
    /// and everything has been read.
    pub fn recv(&self, max: usize) -> SocketResult<Option<Vec<u8>>> {
        let id = self.id;
        match self.handle.call(|reply| Request::Recv { id, max, reply })? {
            Received::Data(data) => Ok(Some(data)),
            Received::Eof => Ok(None),
            // The loop only answers once data or end of stream is there.
            Received::Empty => Err(SocketError::InvalidState("receive woke without data")),
        }
    }

    /// Read until the peer closes the stream
    pub fn recv_to_end(&self) -> SocketResult<Vec<u8>> {
        let mut all = Vec::new();
        while let Some(data) = self.recv(64 * 1024)? {
            all.extend_from_slice(&data);
        }
        Ok(all)
    }

    /// Send FIN after any queued data
    pub fn close(mut self) -> SocketResult<()> {
        self.closed = true;
        let id = self.id;
        self.handle.call(|reply| Request::Close { id, reply })
    }

    /// Discard buffers and reset the peer
    pub fn abort(mut self) -> SocketResult<()> {
        self.closed = true;
        let id = self.id;
        self.handle.call(|reply| Request::Abort { id, reply })
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        if !self.closed {
            let id = self.id;
            self.handle.post(|reply| Request::Close { id, reply });
        }
    }
}

/// A passive TCP socket accepting connections on one port
#[derive(Debug)]
pub struct TcpListener {
    id: SocketId,
    port: u16,
    handle: StackHandle,
}

impl TcpListener {
    pub fn bind(handle: &StackHandle, port: u16, backlog: Option<usize>) -> SocketResult<Self> {
        let id = handle.call(|reply| Request::Listen {
            port,
            backlog,
            reply,
        })?;
        Ok(TcpListener {
            id,
            port,
            handle: handle.clone(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next established connection
    pub fn accept(&self) -> SocketResult<TcpStream> {
        let listener = self.id;
        let id = self
            .handle
            .call(|reply| Request::Accept { listener, reply })?;
        Ok(TcpStream::from_id(id, self.handle.clone()))
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let id = self.id;
        self.handle.post(|reply| Request::Close { id, reply });
    }
}
