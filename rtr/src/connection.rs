// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::messages::{ErrorCode, Pdu, HEADER_SIZE, MAX_PDU_SIZE};
use crate::session::{FsmEvent, MalformedPdu};
use slog::{trace, Logger};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// A transport listener producing RTR connections. TLS and SSH wrap the
/// transport only; once their handshake completes the byte stream served to
/// the session engine is identical.
pub trait RtrListener<Cnx: RtrConnection> {
    fn accept(&self) -> Result<Cnx, Error>;
    fn local(&self) -> SocketAddr;
}

/// One accepted client connection. The session engine sends whole PDUs and
/// receives [`FsmEvent`]s produced by a per-connection receive loop.
pub trait RtrConnection: Send + Sync + 'static {
    /// Spawn the receive loop, feeding decoded PDUs into `event_tx`.
    fn start_recv_loop(&self, event_tx: Sender<FsmEvent>) -> Result<(), Error>;

    /// Serialize and write one PDU.
    fn send(&self, pdu: &Pdu) -> Result<(), Error>;

    fn peer(&self) -> SocketAddr;

    /// Tear the connection down. Idempotent; the receive loop notices via
    /// its dropped flag.
    fn close(&self);
}

pub(crate) enum Decoded {
    Pdu(Pdu),
    Malformed(MalformedPdu),
}

/// Incremental PDU framer. Transports feed raw bytes in, complete PDUs (or a
/// malformed classification carrying the offending bytes) come out.
pub(crate) struct PduBuffer {
    buf: Vec<u8>,
}

impl PduBuffer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn next(&mut self) -> Option<Decoded> {
        if self.buf.len() < HEADER_SIZE {
            return None;
        }
        let length = u32::from_be_bytes([
            self.buf[4],
            self.buf[5],
            self.buf[6],
            self.buf[7],
        ]);
        if length < HEADER_SIZE as u32 || length > MAX_PDU_SIZE {
            // Framing is lost, no point trying to resynchronize.
            let raw = std::mem::take(&mut self.buf);
            return Some(Decoded::Malformed(MalformedPdu {
                code: ErrorCode::CorruptData,
                raw,
                text: format!("corrupt pdu length {length}"),
            }));
        }
        if self.buf.len() < length as usize {
            return None;
        }
        let raw: Vec<u8> = self.buf.drain(..length as usize).collect();
        match Pdu::from_wire(&raw) {
            Ok(pdu) => Some(Decoded::Pdu(pdu)),
            Err(e) => {
                let code = match e {
                    Error::UnsupportedPduType(_) => ErrorCode::UnsupportedPduType,
                    Error::UnsupportedVersion(_) => {
                        ErrorCode::UnsupportedProtocolVersion
                    }
                    _ => ErrorCode::CorruptData,
                };
                Some(Decoded::Malformed(MalformedPdu {
                    code,
                    raw,
                    text: e.to_string(),
                }))
            }
        }
    }
}

/// Shared receive loop body. `read_some` blocks for at most a short timeout
/// so the dropped flag is observed promptly; WouldBlock/TimedOut are the
/// normal idle condition.
pub(crate) fn recv_loop<F>(
    peer: SocketAddr,
    mut read_some: F,
    event_tx: Sender<FsmEvent>,
    dropped: Arc<AtomicBool>,
    log: Logger,
) where
    F: FnMut(&mut [u8]) -> std::io::Result<usize>,
{
    let mut pdus = PduBuffer::new();
    let mut buf = [0u8; 4096];
    loop {
        if dropped.load(Ordering::Relaxed) {
            break;
        }
        let n = match read_some(&mut buf) {
            Ok(0) => {
                let _ = event_tx.send(FsmEvent::Disconnected);
                break;
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                trace!(log, "[{peer}] read error: {e}");
                let _ = event_tx.send(FsmEvent::Disconnected);
                break;
            }
        };
        pdus.extend(&buf[..n]);
        while let Some(decoded) = pdus.next() {
            match decoded {
                Decoded::Pdu(pdu) => {
                    trace!(log, "[{peer}] recv: {pdu:?}");
                    if event_tx.send(FsmEvent::Pdu(pdu)).is_err() {
                        return;
                    }
                }
                Decoded::Malformed(m) => {
                    let _ = event_tx.send(FsmEvent::Malformed(m));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
    use std::sync::Mutex;
    use std::thread::spawn;
    use std::time::Duration;

    lazy_static! {
        static ref NET: Network = Network::new();
    }

    /// A combined mpsc sender/receiver carrying whole PDUs.
    pub struct Endpoint {
        pub tx: Sender<Pdu>,
        pub rx: Receiver<Pdu>,
    }

    impl Endpoint {
        pub fn send(&self, pdu: Pdu) {
            self.tx.send(pdu).expect("endpoint send");
        }

        pub fn recv(&self) -> Pdu {
            self.rx
                .recv_timeout(Duration::from_secs(5))
                .expect("endpoint recv")
        }

        /// Wait for the peer to go away (or for an unexpected PDU).
        pub fn recv_err(&self) -> Result<Pdu, RecvTimeoutError> {
            self.rx.recv_timeout(Duration::from_secs(5))
        }
    }

    /// Analogous to std::sync::mpsc::channel for bidirectional endpoints.
    pub fn endpoint_pair() -> (Endpoint, Endpoint) {
        let (tx_a, rx_b) = channel();
        let (tx_b, rx_a) = channel();
        (Endpoint { tx: tx_a, rx: rx_a }, Endpoint { tx: tx_b, rx: rx_b })
    }

    /// An in-memory transport fabric for exercising the server and session
    /// engine without sockets.
    pub struct Network {
        #[allow(clippy::type_complexity)]
        endpoints:
            Mutex<HashMap<SocketAddr, Sender<(SocketAddr, Endpoint)>>>,
    }

    impl Network {
        fn new() -> Self {
            Self {
                endpoints: Mutex::new(HashMap::new()),
            }
        }

        fn bind(&self, sa: SocketAddr) -> Receiver<(SocketAddr, Endpoint)> {
            let (tx, rx) = channel();
            self.endpoints.lock().unwrap().insert(sa, tx);
            rx
        }

        fn connect(
            &self,
            from: SocketAddr,
            to: SocketAddr,
        ) -> Result<Endpoint, Error> {
            let (local, remote) = endpoint_pair();
            match self.endpoints.lock().unwrap().get(&to) {
                None => Err(Error::InvalidAddress(to.to_string())),
                Some(listener) => {
                    listener
                        .send((from, remote))
                        .map_err(|e| Error::ChannelSend(e.to_string()))?;
                    Ok(local)
                }
            }
        }
    }

    /// Connect to a listening channel transport, as a router would.
    pub fn connect(from: SocketAddr, to: SocketAddr) -> Endpoint {
        NET.connect(from, to).expect("channel connect")
    }

    pub struct RtrListenerChannel {
        addr: SocketAddr,
        listener: Receiver<(SocketAddr, Endpoint)>,
    }

    impl RtrListenerChannel {
        pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
            Ok(Self {
                addr,
                listener: NET.bind(addr),
            })
        }
    }

    impl RtrListener<RtrConnectionChannel> for RtrListenerChannel {
        fn accept(&self) -> Result<RtrConnectionChannel, Error> {
            let (peer, endpoint) = self
                .listener
                .recv()
                .map_err(|_| Error::Disconnected)?;
            Ok(RtrConnectionChannel {
                peer,
                tx: endpoint.tx,
                rx: Mutex::new(Some(endpoint.rx)),
                dropped: Arc::new(AtomicBool::new(false)),
            })
        }

        fn local(&self) -> SocketAddr {
            self.addr
        }
    }

    pub struct RtrConnectionChannel {
        peer: SocketAddr,
        tx: Sender<Pdu>,
        rx: Mutex<Option<Receiver<Pdu>>>,
        dropped: Arc<AtomicBool>,
    }

    impl RtrConnection for RtrConnectionChannel {
        fn start_recv_loop(
            &self,
            event_tx: Sender<FsmEvent>,
        ) -> Result<(), Error> {
            let rx = self
                .rx
                .lock()
                .unwrap()
                .take()
                .ok_or(Error::Disconnected)?;
            let dropped = self.dropped.clone();
            spawn(move || loop {
                if dropped.load(Ordering::Relaxed) {
                    break;
                }
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(pdu) => {
                        if event_tx.send(FsmEvent::Pdu(pdu)).is_err() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        let _ = event_tx.send(FsmEvent::Disconnected);
                        break;
                    }
                }
            });
            Ok(())
        }

        fn send(&self, pdu: &Pdu) -> Result<(), Error> {
            self.tx
                .send(pdu.clone())
                .map_err(|_| Error::Disconnected)
        }

        fn peer(&self) -> SocketAddr {
            self.peer
        }

        fn close(&self) {
            self.dropped.store(true, Ordering::Relaxed);
        }
    }
}
