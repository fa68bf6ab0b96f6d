// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{RtrConnection, RtrListener};
use crate::error::Error;
use crate::messages::PduType;
use crate::session::{FsmEvent, SessionConfig, SessionRunner};
use rtr_common::lock;
use slog::{error, info, warn, Logger};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;
use vdb::Db;

/// Observer for connection and PDU level events. The daemon hangs its
/// metrics off this; the server itself has no metrics dependency.
pub trait ServerEventHandler: Send + Sync {
    fn client_connected(&self, bind: SocketAddr, peer: SocketAddr);
    fn client_disconnected(&self, bind: SocketAddr, peer: SocketAddr);
    fn pdu_received(&self, typ: PduType);
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub session: SessionConfig,

    /// Concurrent client cap. Zero means unbounded.
    pub maxconn: usize,
}

struct ClientHandle {
    peer: SocketAddr,
    event_tx: Sender<FsmEvent>,
}

/// The RTR server: a registry of live client sessions fed by one accept
/// loop per enabled transport.
pub struct Server {
    db: Db,
    config: ServerConfig,
    clients: Mutex<BTreeMap<u64, ClientHandle>>,
    next_client: AtomicU64,
    handler: Option<Arc<dyn ServerEventHandler>>,
    shutdown: AtomicBool,
    log: Logger,
}

impl Server {
    pub fn new(
        db: Db,
        config: ServerConfig,
        handler: Option<Arc<dyn ServerEventHandler>>,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            clients: Mutex::new(BTreeMap::new()),
            next_client: AtomicU64::new(0),
            handler,
            shutdown: AtomicBool::new(false),
            log,
        })
    }

    /// Accept clients on `listener` until shutdown. One thread per enabled
    /// transport runs this.
    pub fn serve<L, Cnx>(self: Arc<Self>, listener: L)
    where
        L: RtrListener<Cnx>,
        Cnx: RtrConnection,
    {
        let bind = listener.local();
        info!(self.log, "listening for rtr clients on {bind}");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok(conn) => {
                    if let Err(e) = self.clone().start_session(bind, conn) {
                        warn!(self.log, "session on {bind} not started: {e}");
                    }
                }
                Err(e) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    error!(self.log, "accept on {bind}: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn start_session<Cnx: RtrConnection>(
        self: Arc<Self>,
        bind: SocketAddr,
        conn: Cnx,
    ) -> Result<(), Error> {
        if self.config.maxconn > 0
            && lock!(self.clients).len() >= self.config.maxconn
        {
            warn!(
                self.log,
                "[{}] connection limit {} reached, rejecting",
                conn.peer(),
                self.config.maxconn
            );
            conn.close();
            return Err(Error::TooManyClients);
        }

        let conn = Arc::new(conn);
        let peer = conn.peer();
        let (event_tx, event_rx) = channel();
        conn.start_recv_loop(event_tx.clone())?;

        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        lock!(self.clients).insert(id, ClientHandle { peer, event_tx });
        if let Some(h) = &self.handler {
            h.client_connected(bind, peer);
        }
        info!(self.log, "[{peer}] client connected on {bind}");

        let server = self.clone();
        let runner = SessionRunner::new(
            conn,
            self.db.clone(),
            self.config.session.clone(),
            event_rx,
            self.handler.clone(),
            self.log.clone(),
        );
        spawn(move || {
            runner.start();
            lock!(server.clients).remove(&id);
            if let Some(h) = &server.handler {
                h.client_disconnected(bind, peer);
            }
            info!(server.log, "[{peer}] client disconnected");
        });
        Ok(())
    }

    /// Broadcast a Serial Notify for the current serial to every session.
    /// Sessions mid-response pick the notification up once they are back to
    /// waiting, and consecutive notifications coalesce there.
    pub fn notify_clients_latest(&self) {
        let Some(serial) = self.db.current_serial() else {
            return;
        };
        let txs: Vec<Sender<FsmEvent>> = {
            let clients = lock!(self.clients);
            clients.values().map(|c| c.event_tx.clone()).collect()
        };
        for tx in txs {
            let _ = tx.send(FsmEvent::Notify(serial));
        }
    }

    pub fn client_count(&self) -> usize {
        lock!(self.clients).len()
    }

    pub fn client_peers(&self) -> Vec<SocketAddr> {
        lock!(self.clients).values().map(|c| c.peer).collect()
    }

    /// Stop accepting and close all sessions. In-flight writes may be
    /// dropped.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let clients = lock!(self.clients);
        for client in clients.values() {
            let _ = client.event_tx.send(FsmEvent::Shutdown);
        }
    }
}
