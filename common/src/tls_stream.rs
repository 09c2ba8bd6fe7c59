use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
};

use rustls::ClientConnection;

/// Synchronous TLS client stream over TCP
pub struct TlsStream {
    socket: TcpStream,
    tls:    ClientConnection,
}

impl TlsStream {
    /// Pair a TLS client session with its socket. No I/O happens until
    /// [`complete_handshake`](Self::complete_handshake) or the first read or
    /// write.
    pub fn new(socket: TcpStream, tls: ClientConnection) -> Self {
        Self { socket, tls }
    }

    /// Run the TLS handshake to completion, blocking on the socket.
    ///
    /// Pending alerts are flushed to the peer before a handshake error is
    /// returned.
    pub fn complete_handshake(&mut self) -> io::Result<()> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.tls.write_tls(&mut self.socket)?;
                continue;
            }
            if !self.tls.wants_read() {
                return Err(io::Error::other("TLS handshake stalled"));
            }
            if self.tls.read_tls(&mut self.socket)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during TLS handshake",
                ));
            }
            if let Err(e) = self.tls.process_new_packets() {
                let _ = self.tls.write_tls(&mut self.socket);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("TLS handshake error: {e}"),
                ));
            }
        }

        // The final client flight can still be buffered once the session
        // reports the handshake as done
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket)?;
        }
        self.socket.flush()
    }

    /// Send close_notify and shut the socket down in both directions.
    pub fn close(&mut self) -> io::Result<()> {
        self.tls.send_close_notify();
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(e) => {
                    tracing::trace!("Failed to deliver close_notify: {}", e);
                    break;
                }
            }
        }
        self.socket.shutdown(Shutdown::Both)
    }

    /// The underlying TCP socket
    pub fn get_ref(&self) -> &TcpStream {
        &self.socket
    }

    /// The TLS session
    pub fn connection(&self) -> &ClientConnection {
        &self.tls
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        rustls::Stream::new(&mut self.tls, &mut self.socket).read(buf)
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        rustls::Stream::new(&mut self.tls, &mut self.socket).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        rustls::Stream::new(&mut self.tls, &mut self.socket).flush()
    }
}
