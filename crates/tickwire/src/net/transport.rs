use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

/// Datagram I/O the protocol runs over. Receiving never blocks: `Ok(None)`
/// means nothing is waiting.
pub trait Transport {
    fn send_datagram(&mut self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize>;

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_datagram(&mut self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        (**self).send_datagram(peer, bytes)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        (**self).recv_datagram(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn send_datagram(&mut self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, peer)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok(received) => return Ok(Some(received)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_socket_would_block() {
        let mut transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut buf = [0u8; 16];
        assert!(transport.recv_datagram(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_loopback_datagram() {
        let mut a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();

        assert_eq!(a.send_datagram(b_addr, b"ping").unwrap(), 4);

        let mut buf = [0u8; 16];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            if let Some((len, from)) = b.recv_datagram(&mut buf).unwrap() {
                assert_eq!(&buf[..len], b"ping");
                assert_eq!(from, a.local_addr().unwrap());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "datagram never arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}
