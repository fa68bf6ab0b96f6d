// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SSH transport. An SSH server accepts clients, authenticates them per the
//! configured policy, and each opened session channel is bridged into the
//! same blocking byte stream the other transports present. Auth contract:
//! key match means accept, no match means reject.

use crate::connection::{recv_loop, RtrConnection, RtrListener};
use crate::error::Error;
use crate::messages::Pdu;
use crate::session::FsmEvent;
use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelStream, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use rtr_common::lock;
use slog::{debug, error, info, warn, Logger};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::io::SyncIoBridge;

#[derive(Debug, Clone)]
pub struct PasswordAuth {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct KeyAuth {
    /// Authorized key lines, `<algo> <base64> [comment]`.
    pub authorized: Vec<String>,

    /// Accept any presented key.
    pub bypass: bool,
}

/// Which client authentications the SSH listener offers. With neither
/// configured, clients are accepted without authentication.
#[derive(Debug, Clone, Default)]
pub struct SshAuthConfig {
    pub password: Option<PasswordAuth>,
    pub key: Option<KeyAuth>,
}

impl SshAuthConfig {
    fn methods(&self) -> MethodSet {
        let mut methods = MethodSet::NONE;
        if self.password.is_some() {
            methods |= MethodSet::PASSWORD;
        }
        if self.key.is_some() {
            methods |= MethodSet::PUBLICKEY;
        }
        methods
    }

    fn auth_required(&self) -> bool {
        self.password.is_some() || self.key.is_some()
    }
}

/// SSH listener. The russh acceptor runs on its own tokio runtime in a
/// background thread; accepted session channels are handed to the blocking
/// accept loop through a channel.
pub struct RtrListenerSsh {
    addr: SocketAddr,
    conns: Mutex<Receiver<RtrConnectionSsh>>,
}

impl RtrListenerSsh {
    pub fn bind(
        addr: SocketAddr,
        host_key: KeyPair,
        auth: SshAuthConfig,
        log: Logger,
    ) -> Result<Self, Error> {
        let (conn_tx, conn_rx) = channel();
        let (bound_tx, bound_rx) = channel();

        spawn(move || {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = bound_tx.send(Err(Error::Io(e)));
                    return;
                }
            };
            rt.block_on(acceptor(
                addr, host_key, auth, conn_tx, bound_tx, log,
            ));
        });

        let addr = bound_rx
            .recv()
            .map_err(|_| Error::Ssh("ssh acceptor thread died".into()))??;
        Ok(Self {
            addr,
            conns: Mutex::new(conn_rx),
        })
    }
}

impl RtrListener<RtrConnectionSsh> for RtrListenerSsh {
    fn accept(&self) -> Result<RtrConnectionSsh, Error> {
        lock!(self.conns).recv().map_err(|_| Error::Disconnected)
    }

    fn local(&self) -> SocketAddr {
        self.addr
    }
}

async fn acceptor(
    addr: SocketAddr,
    host_key: KeyPair,
    auth: SshAuthConfig,
    conn_tx: Sender<RtrConnectionSsh>,
    bound_tx: Sender<Result<SocketAddr, Error>>,
    log: Logger,
) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            let _ = bound_tx.send(Err(Error::Io(e)));
            return;
        }
    };
    let local = listener.local_addr().unwrap_or(addr);
    let _ = bound_tx.send(Ok(local));

    let config = Arc::new(russh::server::Config {
        methods: auth.methods(),
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        ..Default::default()
    });
    let auth = Arc::new(auth);
    let handle = tokio::runtime::Handle::current();

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(log, "ssh accept on {local}: {e}");
                continue;
            }
        };
        let handler = SshHandler {
            peer,
            auth: auth.clone(),
            conn_tx: conn_tx.clone(),
            handle: handle.clone(),
            log: log.clone(),
        };
        let config = config.clone();
        let log = log.clone();
        tokio::spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!(log, "ssh session with {peer} ended: {e}");
                    }
                }
                Err(e) => {
                    warn!(log, "ssh handshake with {peer}: {e}");
                }
            }
        });
    }
}

struct SshHandler {
    peer: SocketAddr,
    auth: Arc<SshAuthConfig>,
    conn_tx: Sender<RtrConnectionSsh>,
    handle: tokio::runtime::Handle,
    log: Logger,
}

#[async_trait]
impl russh::server::Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.auth.auth_required() {
            return Ok(Auth::Reject {
                proceed_with_methods: Some(self.auth.methods()),
            });
        }
        info!(self.log, "connected (ssh-none): {}/{}", user, self.peer);
        Ok(Auth::Accept)
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<Auth, Self::Error> {
        match &self.auth.password {
            Some(p) if p.user == user && p.password == password => {
                info!(
                    self.log,
                    "connected (ssh-password): {}/{}", user, self.peer
                );
                Ok(Auth::Accept)
            }
            _ => {
                warn!(
                    self.log,
                    "wrong user or password for {}/{}, disconnecting",
                    user,
                    self.peer
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Some(key_auth) = &self.auth.key else {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        };
        let presented = format!("{} {}", key.name(), key.public_key_base64());
        if key_auth.bypass {
            info!(
                self.log,
                "connected (ssh-key): {}/{} with key {presented}",
                user,
                self.peer
            );
            return Ok(Auth::Accept);
        }
        let matched = key_auth
            .authorized
            .iter()
            .position(|line| {
                !line.is_empty() && line.starts_with(&presented)
            });
        match matched {
            Some(i) => {
                info!(
                    self.log,
                    "connected (ssh-key): {}/{} with key {presented} \
                     (matched line {})",
                    user,
                    self.peer,
                    i + 1
                );
                Ok(Auth::Accept)
            }
            None => {
                warn!(
                    self.log,
                    "no authorized key for {}/{} {presented}, disconnecting",
                    user,
                    self.peer
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (r, w) = tokio::io::split(channel.into_stream());
        let conn = RtrConnectionSsh {
            peer: self.peer,
            reader: Mutex::new(Some(SyncIoBridge::new_with_handle(
                r,
                self.handle.clone(),
            ))),
            writer: Mutex::new(SyncIoBridge::new_with_handle(
                w,
                self.handle.clone(),
            )),
            dropped: Arc::new(AtomicBool::new(false)),
            log: self.log.clone(),
        };
        Ok(self.conn_tx.send(conn).is_ok())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Routers request the rpki-rtr subsystem before speaking RTR.
        if name == "rpki-rtr" {
            session.channel_success(channel_id);
        } else {
            session.channel_failure(channel_id);
        }
        Ok(())
    }
}

type SshReader = SyncIoBridge<ReadHalf<ChannelStream<Msg>>>;
type SshWriter = SyncIoBridge<WriteHalf<ChannelStream<Msg>>>;

pub struct RtrConnectionSsh {
    peer: SocketAddr,
    reader: Mutex<Option<SshReader>>,
    writer: Mutex<SshWriter>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl RtrConnection for RtrConnectionSsh {
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
        let mut writer = lock!(self.writer);
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        // Closing the write half tears the channel down, which also
        // unblocks the reader.
        let _ = lock!(self.writer).shutdown();
    }
}
