// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{recv_loop, RtrConnection, RtrListener};
use crate::error::Error;
use crate::messages::Pdu;
use crate::session::FsmEvent;
use rtr_common::lock;
use slog::Logger;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;

/// Read timeout on client sockets. The recv loop wakes at this cadence to
/// observe the dropped flag; hitting it is the normal idle condition.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct RtrListenerTcp {
    addr: SocketAddr,
    listener: TcpListener,
    log: Logger,
}

impl RtrListenerTcp {
    pub fn bind<A: ToSocketAddrs>(addr: A, log: Logger) -> Result<Self, Error> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress(
                "at least one address required".into(),
            ))?;
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            addr: listener.local_addr()?,
            listener,
            log,
        })
    }
}

impl RtrListener<RtrConnectionTcp> for RtrListenerTcp {
    fn accept(&self) -> Result<RtrConnectionTcp, Error> {
        let (conn, peer) = self.listener.accept()?;
        RtrConnectionTcp::with_conn(peer, conn, self.log.clone())
    }

    fn local(&self) -> SocketAddr {
        self.addr
    }
}

pub struct RtrConnectionTcp {
    peer: SocketAddr,
    conn: Mutex<TcpStream>,
    reader: Mutex<Option<TcpStream>>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl RtrConnectionTcp {
    fn with_conn(
        peer: SocketAddr,
        conn: TcpStream,
        log: Logger,
    ) -> Result<Self, Error> {
        conn.set_read_timeout(Some(READ_TIMEOUT))?;
        let reader = conn.try_clone()?;
        Ok(Self {
            peer,
            conn: Mutex::new(conn),
            reader: Mutex::new(Some(reader)),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        })
    }
}

impl RtrConnection for RtrConnectionTcp {
    fn start_recv_loop(&self, event_tx: Sender<FsmEvent>) -> Result<(), Error> {
        let mut reader =
            lock!(self.reader).take().ok_or(Error::Disconnected)?;
        let dropped = self.dropped.clone();
        let log = self.log.clone();
        let peer = self.peer;
        spawn(move || {
            recv_loop(peer, move |buf| reader.read(buf), event_tx, dropped, log)
        });
        Ok(())
    }

    fn send(&self, pdu: &Pdu) -> Result<(), Error> {
        let buf = pdu.to_wire()?;
        lock!(self.conn).write_all(&buf)?;
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        let _ = lock!(self.conn).shutdown(Shutdown::Both);
    }
}

pub struct RtrListenerTls {
    addr: SocketAddr,
    listener: TcpListener,
    tls: Arc<rustls::ServerConfig>,
    log: Logger,
}

impl RtrListenerTls {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        tls: Arc<rustls::ServerConfig>,
        log: Logger,
    ) -> Result<Self, Error> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress(
                "at least one address required".into(),
            ))?;
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            addr: listener.local_addr()?,
            listener,
            tls,
            log,
        })
    }
}

impl RtrListener<RtrConnectionTls> for RtrListenerTls {
    fn accept(&self) -> Result<RtrConnectionTls, Error> {
        let (conn, peer) = self.listener.accept()?;
        conn.set_read_timeout(Some(READ_TIMEOUT))?;
        let session = rustls::ServerConnection::new(self.tls.clone())?;
        Ok(RtrConnectionTls {
            peer,
            stream: Arc::new(Mutex::new(rustls::StreamOwned::new(
                session, conn,
            ))),
            dropped: Arc::new(AtomicBool::new(false)),
            log: self.log.clone(),
        })
    }

    fn local(&self) -> SocketAddr {
        self.addr
    }
}

/// A TLS wrapped client connection. The handshake completes lazily as the
/// recv loop drives reads; the server only ever writes after the client's
/// first query, so writes never race the handshake.
pub struct RtrConnectionTls {
    peer: SocketAddr,
    stream: Arc<Mutex<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl RtrConnection for RtrConnectionTls {
    fn start_recv_loop(&self, event_tx: Sender<FsmEvent>) -> Result<(), Error> {
        let stream = self.stream.clone();
        let dropped = self.dropped.clone();
        let log = self.log.clone();
        let peer = self.peer;
        spawn(move || {
            recv_loop(
                peer,
                move |buf| lock!(stream).read(buf),
                event_tx,
                dropped,
                log,
            )
        });
        Ok(())
    }

    fn send(&self, pdu: &Pdu) -> Result<(), Error> {
        let buf = pdu.to_wire()?;
        let mut guard = lock!(self.stream);
        guard.write_all(&buf)?;
        guard.flush()?;
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        let _ = lock!(self.stream).sock.shutdown(Shutdown::Both);
    }
}
