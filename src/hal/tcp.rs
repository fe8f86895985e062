//! LocoNet-over-TCP I/O handler.
//!
//! Several LocoNet interfaces expose the raw bus as a binary TCP stream
//! (LbServer-style bridges, DR5000, Z21 LAN). This handler connects to
//! such a bridge, feeds received bytes through a [`FrameDecoder`], and
//! writes outgoing frames verbatim. The socket is non-blocking so the
//! handler never stalls the kernel's loop; bytes that cannot be written
//! immediately are buffered and flushed on the next pump.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;

use crate::codec::{DecodeError, FrameDecoder};
use crate::message::Message;
use crate::traits::{IoError, IoHandler};

/// TCP transport for a LocoNet bridge.
pub struct TcpIoHandler {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    decoder: FrameDecoder,
    rx: VecDeque<Message>,
    pending_tx: Vec<u8>,
    framing_errors: u32,
    checksum_errors: u32,
}

impl TcpIoHandler {
    /// Create a handler that will connect to `host:port` on start.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            decoder: FrameDecoder::new(),
            rx: VecDeque::new(),
            pending_tx: Vec::new(),
            framing_errors: 0,
            checksum_errors: 0,
        }
    }

    /// True while the connection is up.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn flush_tx(&mut self) {
        while !self.pending_tx.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.write(&self.pending_tx) {
                Ok(0) => {
                    log::error!("connection closed while writing");
                    self.stream = None;
                    return;
                }
                Ok(n) => {
                    self.pending_tx.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::error!("write failed: {e}");
                    self.stream = None;
                    return;
                }
            }
        }
    }

    fn pump_rx(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::error!("connection closed by peer");
                    self.stream = None;
                    return;
                }
                Ok(n) => {
                    let rx = &mut self.rx;
                    let framing = &mut self.framing_errors;
                    let checksum = &mut self.checksum_errors;
                    self.decoder.push_all(
                        &buf[..n],
                        |msg| rx.push_back(msg),
                        |error| match error {
                            DecodeError::Framing => *framing += 1,
                            DecodeError::Checksum => *checksum += 1,
                        },
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::error!("read failed: {e}");
                    self.stream = None;
                    return;
                }
            }
        }
    }
}

impl IoHandler for TcpIoHandler {
    fn start(&mut self) -> Result<(), IoError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        self.decoder.reset();
        self.rx.clear();
        self.pending_tx.clear();
        Ok(())
    }

    fn stop(&mut self) {
        self.stream = None;
        self.rx.clear();
        self.pending_tx.clear();
    }

    fn send(&mut self, message: &Message) -> bool {
        if self.stream.is_none() {
            return false;
        }
        self.pending_tx.extend_from_slice(message.as_bytes());
        self.flush_tx();
        self.stream.is_some()
    }

    fn recv(&mut self) -> Option<Message> {
        self.flush_tx();
        self.pump_rx();
        self.rx.pop_front()
    }

    fn take_decode_errors(&mut self) -> (u32, u32) {
        (
            core::mem::take(&mut self.framing_errors),
            core::mem::take(&mut self.checksum_errors),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connects_and_round_trips_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut handler = TcpIoHandler::new("127.0.0.1", port);
        handler.start().unwrap();
        assert!(handler.is_connected());

        let (mut peer, _) = listener.accept().unwrap();

        // Outbound: the peer sees the raw frame bytes.
        assert!(handler.send(&Message::gpon()));
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, Message::gpon().as_bytes());

        // Inbound: bytes from the peer come back as frames.
        peer.write_all(Message::idle().as_bytes()).unwrap();
        let frame = loop {
            if let Some(frame) = handler.recv() {
                break frame;
            }
        };
        assert_eq!(frame, Message::idle());
    }

    #[test]
    fn corrupted_bytes_are_counted_not_surfaced() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut handler = TcpIoHandler::new("127.0.0.1", port);
        handler.start().unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        // Bad checksum, then a valid frame.
        peer.write_all(&[0xB0, 0x00, 0x30, 0x7E]).unwrap();
        peer.write_all(Message::gpon().as_bytes()).unwrap();

        let frame = loop {
            if let Some(frame) = handler.recv() {
                break frame;
            }
        };
        assert_eq!(frame, Message::gpon());
        assert_eq!(handler.take_decode_errors(), (0, 1));
        assert_eq!(handler.take_decode_errors(), (0, 0));
    }

    #[test]
    fn send_without_connection_fails() {
        let mut handler = TcpIoHandler::new("127.0.0.1", 1);
        assert!(!handler.send(&Message::gpon()));
    }

    #[test]
    fn start_failure_is_reported() {
        // Port 1 on localhost is essentially never listening.
        let mut handler = TcpIoHandler::new("127.0.0.1", 1);
        assert!(handler.start().is_err());
        assert!(!handler.is_connected());
    }
}
