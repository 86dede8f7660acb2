use std::net::SocketAddr;

use crate::error::SocketResult;
use crate::stack::{Request, StackHandle};

/// A bound UDP port
#[derive(Debug)]
pub struct UdpSocket {
    port: u16,
    handle: StackHandle,
}

impl UdpSocket {
    /// Bind `port`, or a free ephemeral port when it is 0
    pub fn bind(handle: &StackHandle, port: u16) -> SocketResult<Self> {
        let port = handle.call(|reply| Request::UdpBind { port, reply })?;
        Ok(UdpSocket {
            port,
            handle: handle.clone(),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn send_to(&self, data: &[u8], remote: SocketAddr) -> SocketResult<usize> {
        let port = self.port;
        let data = data.to_vec();
        self.handle.call(|reply| Request::UdpSendTo {
            port,
            remote,
            data,
            reply,
        })
    }

    /// Wait for the next datagram
    pub fn recv_from(&self) -> SocketResult<(Vec<u8>, SocketAddr)> {
        let port = self.port;
        let datagram = self
            .handle
            .call(|reply| Request::UdpRecvFrom { port, reply })?;
        Ok((datagram.payload, datagram.remote))
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        let port = self.port;
        self.handle.post(|reply| Request::UdpClose { port, reply });
    }
}
