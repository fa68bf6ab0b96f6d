// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::RtrConnection;
use crate::error::Error;
use crate::messages::{
    CacheResetPdu, CacheResponsePdu, EndOfDataPdu, ErrorCode, ErrorReportPdu,
    Pdu, SerialNotifyPdu, SerialQueryPdu, FLAG_ANNOUNCE, FLAG_WITHDRAW,
    VERSION_1,
};
use crate::server::ServerEventHandler;
use rtr_common::lock;
use slog::{debug, info, warn, Logger};
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use vdb::db::DiffResult;
use vdb::Db;

/// Outbound PDUs queue up here while the writer drains them to the wire. A
/// full cache dump fits comfortably below this; a client that stops reading
/// overflows it and is closed.
pub const SESSION_QUEUE_DEPTH: usize = 0x10000;

/// How much of an offending PDU is echoed back in an Error Report.
const ERROR_PDU_COPY_MAX: usize = 1024;

/// The states a client session may be in.
///
/// A session starts in AwaitingQuery once the transport handshake is done,
/// passes through Serving while a response streams, and returns to
/// AwaitingQuery on End of Data. Closed is terminal.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FsmState {
    AwaitingQuery,
    Serving,
    Closed,
}

impl FsmState {
    fn as_str(&self) -> &str {
        match self {
            FsmState::AwaitingQuery => "awaiting query",
            FsmState::Serving => "serving",
            FsmState::Closed => "closed",
        }
    }
}

impl Display for FsmState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A PDU the codec could not accept, with the raw bytes for the Error Report
/// echo and the code it classified as.
#[derive(Debug)]
pub struct MalformedPdu {
    pub code: ErrorCode,
    pub raw: Vec<u8>,
    pub text: String,
}

/// Events driving a client session.
#[derive(Debug)]
pub enum FsmEvent {
    /// A PDU arrived from the client.
    Pdu(Pdu),

    /// Bytes arrived that do not decode; the session answers with an Error
    /// Report and closes.
    Malformed(MalformedPdu),

    /// The history advanced; tell the client the latest serial. Multiple
    /// pending notifications collapse to the newest.
    Notify(u32),

    /// The transport went away.
    Disconnected,

    /// The server is shutting the session down.
    Shutdown,
}

/// Per-session protocol settings, shared by all sessions of one server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Highest protocol version the server speaks.
    pub version_max: u8,

    /// Version 1 End of Data timers.
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version_max: VERSION_1,
            refresh: 3600,
            retry: 600,
            expire: 7200,
        }
    }
}

/// The per-client protocol engine. A reader task (the connection recv loop)
/// and a writer task cooperate with the FSM through channels; the FSM itself
/// runs on its own thread via [`SessionRunner::start`].
pub struct SessionRunner<Cnx: RtrConnection> {
    conn: Arc<Cnx>,
    db: Db,
    config: SessionConfig,

    /// Protocol version observed in the client's first PDU.
    client_version: Mutex<Option<u8>>,

    state: Mutex<FsmState>,

    event_rx: Receiver<FsmEvent>,
    outbox: SyncSender<Pdu>,
    outbox_rx: Mutex<Option<Receiver<Pdu>>>,

    handler: Option<Arc<dyn ServerEventHandler>>,
    log: Logger,
}

impl<Cnx: RtrConnection> SessionRunner<Cnx> {
    pub fn new(
        conn: Arc<Cnx>,
        db: Db,
        config: SessionConfig,
        event_rx: Receiver<FsmEvent>,
        handler: Option<Arc<dyn ServerEventHandler>>,
        log: Logger,
    ) -> Self {
        let (outbox, outbox_rx) =
            std::sync::mpsc::sync_channel(SESSION_QUEUE_DEPTH);
        Self {
            conn,
            db,
            config,
            client_version: Mutex::new(None),
            state: Mutex::new(FsmState::AwaitingQuery),
            event_rx,
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            handler,
            log,
        }
    }

    pub fn state(&self) -> FsmState {
        *lock!(self.state)
    }

    /// Run the session to completion. Returns once the session is closed by
    /// either side or by a protocol error.
    pub fn start(&self) {
        let peer = self.conn.peer();
        self.spawn_writer();

        let mut queued = VecDeque::new();
        loop {
            let event = match queued.pop_front() {
                Some(e) => e,
                None => match self.event_rx.recv() {
                    Ok(e) => e,
                    Err(_) => break,
                },
            };
            match event {
                FsmEvent::Pdu(pdu) => {
                    if let Some(h) = &self.handler {
                        h.pdu_received(pdu.typ());
                    }
                    if let Err(e) = self.handle_pdu(pdu) {
                        match e {
                            Error::Backpressure => {
                                warn!(
                                    self.log,
                                    "[{peer}] closing session: {e}"
                                );
                                // A stalled client would also stall the
                                // drain, tear the transport down now.
                                self.conn.close();
                            }
                            Error::Disconnected => {
                                debug!(self.log, "[{peer}] session closed")
                            }
                            e => warn!(
                                self.log,
                                "[{peer}] closing session: {e}"
                            ),
                        }
                        break;
                    }
                }
                FsmEvent::Malformed(m) => {
                    self.handle_malformed(m);
                    break;
                }
                FsmEvent::Notify(serial) => {
                    // Coalesce a burst of notifications to the newest serial.
                    let mut latest = serial;
                    while let Ok(ev) = self.event_rx.try_recv() {
                        match ev {
                            FsmEvent::Notify(s) => latest = s,
                            other => {
                                queued.push_back(other);
                                break;
                            }
                        }
                    }
                    if self.handle_notify(latest).is_err() {
                        break;
                    }
                }
                FsmEvent::Disconnected => {
                    debug!(self.log, "[{peer}] disconnected");
                    break;
                }
                FsmEvent::Shutdown => {
                    debug!(self.log, "[{peer}] shutdown");
                    break;
                }
            }
        }

        // Dropping the runner drops the outbox sender; the writer drains
        // what is queued (a final Error Report included) and then closes
        // the transport.
        *lock!(self.state) = FsmState::Closed;
    }

    fn spawn_writer(&self) {
        let rx = lock!(self.outbox_rx).take().expect("writer started twice");
        let conn = self.conn.clone();
        let log = self.log.clone();
        let peer = self.conn.peer();
        spawn(move || {
            while let Ok(pdu) = rx.recv() {
                if let Err(e) = conn.send(&pdu) {
                    debug!(log, "[{peer}] write failed: {e}");
                    break;
                }
            }
            conn.close();
        });
    }

    fn enqueue(&self, pdu: Pdu) -> Result<(), Error> {
        self.outbox.try_send(pdu).map_err(|e| match e {
            TrySendError::Full(_) => Error::Backpressure,
            TrySendError::Disconnected(_) => Error::Disconnected,
        })
    }

    /// The version the server frames its replies with: the client's version
    /// capped at what the server supports.
    fn reply_version(&self, observed: u8) -> u8 {
        observed.min(self.config.version_max)
    }

    /// The first client PDU fixes the session's version; drift afterwards is
    /// a protocol error.
    fn negotiate(&self, observed: u8) -> Result<u8, Error> {
        let mut guard = lock!(self.client_version);
        match *guard {
            None => {
                *guard = Some(observed);
                Ok(self.reply_version(observed))
            }
            Some(v) if v == observed => Ok(self.reply_version(v)),
            Some(v) => {
                drop(guard);
                let report = self.error_report(
                    self.reply_version(v),
                    ErrorCode::UnexpectedProtocolVersion,
                    Vec::new(),
                    "protocol version changed mid-session",
                );
                let _ = self.enqueue(report);
                Err(Error::VersionMismatch {
                    want: v,
                    got: observed,
                })
            }
        }
    }

    fn handle_pdu(&self, pdu: Pdu) -> Result<(), Error> {
        let version = self.negotiate(pdu.version())?;
        match pdu {
            Pdu::ResetQuery(_) => self.handle_reset_query(version),
            Pdu::SerialQuery(q) => self.handle_serial_query(version, q),
            Pdu::ErrorReport(report) => {
                warn!(
                    self.log,
                    "[{}] client error report {:?}: {}",
                    self.conn.peer(),
                    report.code,
                    report.text
                );
                Err(Error::Disconnected)
            }
            other => {
                // Cache-originated PDU types are not valid requests.
                let copy = other.to_wire().unwrap_or_default();
                let report = self.error_report(
                    version,
                    ErrorCode::InvalidRequest,
                    copy,
                    "pdu type not valid from a router",
                );
                let _ = self.enqueue(report);
                Err(Error::InvalidRequest(other.typ() as u8))
            }
        }
    }

    fn handle_reset_query(&self, version: u8) -> Result<(), Error> {
        *lock!(self.state) = FsmState::Serving;
        let result = match self.db.full_dump() {
            None => self.no_data(version),
            Some((serial, vrps)) => {
                info!(
                    self.log,
                    "[{}] reset query, serving full snapshot",
                    self.conn.peer();
                    "serial" => serial,
                    "vrps" => vrps.len(),
                );
                self.enqueue(Pdu::CacheResponse(CacheResponsePdu {
                    version,
                    session: self.db.session_id(),
                }))?;
                for vrp in vrps.iter().filter(|v| v.prefix.is_v4()) {
                    self.enqueue(Pdu::prefix(version, vrp, FLAG_ANNOUNCE))?;
                }
                for vrp in vrps.iter().filter(|v| !v.prefix.is_v4()) {
                    self.enqueue(Pdu::prefix(version, vrp, FLAG_ANNOUNCE))?;
                }
                self.enqueue(self.end_of_data(version, serial))
            }
        };
        *lock!(self.state) = FsmState::AwaitingQuery;
        result
    }

    fn handle_serial_query(
        &self,
        version: u8,
        query: SerialQueryPdu,
    ) -> Result<(), Error> {
        *lock!(self.state) = FsmState::Serving;
        let result = if query.session != self.db.session_id() {
            debug!(
                self.log,
                "[{}] session id mismatch ({} != {}), cache reset",
                self.conn.peer(),
                query.session,
                self.db.session_id()
            );
            self.enqueue(Pdu::CacheReset(CacheResetPdu { version }))
        } else {
            match self.db.diff_since(query.serial) {
                DiffResult::NoData => self.no_data(version),
                DiffResult::ResetRequired => {
                    debug!(
                        self.log,
                        "[{}] serial {} out of window, cache reset",
                        self.conn.peer(),
                        query.serial
                    );
                    self.enqueue(Pdu::CacheReset(CacheResetPdu { version }))
                }
                DiffResult::Delta { serial, delta } => {
                    debug!(
                        self.log,
                        "[{}] serial query {} -> {}",
                        self.conn.peer(),
                        query.serial,
                        serial;
                        "announced" => delta.announced.len(),
                        "withdrawn" => delta.withdrawn.len(),
                    );
                    self.enqueue(Pdu::CacheResponse(CacheResponsePdu {
                        version,
                        session: self.db.session_id(),
                    }))?;
                    for vrp in &delta.announced {
                        self.enqueue(Pdu::prefix(
                            version,
                            vrp,
                            FLAG_ANNOUNCE,
                        ))?;
                    }
                    for vrp in &delta.withdrawn {
                        self.enqueue(Pdu::prefix(
                            version,
                            vrp,
                            FLAG_WITHDRAW,
                        ))?;
                    }
                    self.enqueue(self.end_of_data(version, serial))
                }
            }
        };
        *lock!(self.state) = FsmState::AwaitingQuery;
        result
    }

    fn handle_notify(&self, serial: u32) -> Result<(), Error> {
        // Nothing to notify until the client has spoken and fixed a version.
        let Some(observed) = *lock!(self.client_version) else {
            return Ok(());
        };
        self.enqueue(Pdu::SerialNotify(SerialNotifyPdu {
            version: self.reply_version(observed),
            session: self.db.session_id(),
            serial,
        }))
    }

    fn handle_malformed(&self, m: MalformedPdu) {
        warn!(
            self.log,
            "[{}] malformed pdu ({:?}): {}",
            self.conn.peer(),
            m.code,
            m.text
        );
        let version = lock!(self.client_version)
            .map(|v| self.reply_version(v))
            .unwrap_or(self.config.version_max);
        let mut copy = m.raw;
        copy.truncate(ERROR_PDU_COPY_MAX);
        let report = self.error_report(version, m.code, copy, &m.text);
        let _ = self.enqueue(report);
    }

    fn no_data(&self, version: u8) -> Result<(), Error> {
        // The only non-fatal error code: the client is expected to retry.
        self.enqueue(self.error_report(
            version,
            ErrorCode::NoDataAvailable,
            Vec::new(),
            "no data available",
        ))
    }

    fn end_of_data(&self, version: u8, serial: u32) -> Pdu {
        Pdu::EndOfData(EndOfDataPdu {
            version,
            session: self.db.session_id(),
            serial,
            refresh: self.config.refresh,
            retry: self.config.retry,
            expire: self.config.expire,
        })
    }

    fn error_report(
        &self,
        version: u8,
        code: ErrorCode,
        pdu_copy: Vec<u8>,
        text: &str,
    ) -> Pdu {
        Pdu::ErrorReport(ErrorReportPdu {
            version,
            code,
            pdu_copy,
            text: text.to_string(),
        })
    }
}
