// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Prometheus instruments and the HTTP endpoints serving them alongside the
//! JSON export of the currently installed VRP set.

use chrono::{DateTime, Utc};
use dropshot::{
    endpoint, ApiDescription, ConfigDropshot, HttpError, HttpResponseOk,
    HttpServer, HttpServerStarter, RequestContext,
};
use http::Response;
use hyper::Body;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use rtr::messages::PduType;
use rtr::server::ServerEventHandler;
use rtr_common::read_lock;
use slog::Logger;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use vdb::json::VrpDocument;

use crate::refresh::ProcessCounts;

pub struct Metrics {
    registry: Registry,

    /// rpki_vrps{ip_version, filtered, path}. "unfiltered" carries the raw
    /// per-family counts after SLURM, "filtered" the deduped counts after
    /// ingest.
    vrps: IntGaugeVec,

    /// rpki_refresh{path}: unix time of the last successful request.
    last_refresh: IntGaugeVec,

    /// rpki_change{path}: unix time of the last installed change.
    last_change: IntGaugeVec,

    /// refresh_requests_total{path, code}
    refresh_status: IntCounterVec,

    /// rtr_clients{bind}
    clients: IntGaugeVec,

    /// rtr_pdus{type}
    pdus: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let vrps = IntGaugeVec::new(
            Opts::new("rpki_vrps", "Number of VRPs."),
            &["ip_version", "filtered", "path"],
        )?;
        let last_refresh = IntGaugeVec::new(
            Opts::new(
                "rpki_refresh",
                "Last successful request for the given URL.",
            ),
            &["path"],
        )?;
        let last_change = IntGaugeVec::new(
            Opts::new("rpki_change", "Last change."),
            &["path"],
        )?;
        let refresh_status = IntCounterVec::new(
            Opts::new(
                "refresh_requests_total",
                "Total number of HTTP requests by status code.",
            ),
            &["path", "code"],
        )?;
        let clients = IntGaugeVec::new(
            Opts::new("rtr_clients", "Number of clients connected."),
            &["bind"],
        )?;
        let pdus = IntCounterVec::new(
            Opts::new("rtr_pdus", "PDUs received."),
            &["type"],
        )?;

        registry.register(Box::new(vrps.clone()))?;
        registry.register(Box::new(last_refresh.clone()))?;
        registry.register(Box::new(last_change.clone()))?;
        registry.register(Box::new(refresh_status.clone()))?;
        registry.register(Box::new(clients.clone()))?;
        registry.register(Box::new(pdus.clone()))?;

        Ok(Self {
            registry,
            vrps,
            last_refresh,
            last_change,
            refresh_status,
            clients,
            pdus,
        })
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    pub fn observe_refresh_status(&self, path: &str, code: u16) {
        self.refresh_status
            .with_label_values(&[path, &code.to_string()])
            .inc();
    }

    pub fn observe_refresh_time(&self, path: &str, when: DateTime<Utc>) {
        self.last_refresh
            .with_label_values(&[path])
            .set(when.timestamp());
    }

    pub fn observe_change_time(&self, path: &str, when: DateTime<Utc>) {
        self.last_change
            .with_label_values(&[path])
            .set(when.timestamp());
    }

    pub fn update_vrp_counts(&self, path: &str, counts: &ProcessCounts) {
        let set = |family: &str, filtered: &str, value: usize| {
            self.vrps
                .with_label_values(&[family, filtered, path])
                .set(value as i64);
        };
        set("ipv4", "unfiltered", counts.v4);
        set("ipv6", "unfiltered", counts.v6);
        set("ipv4", "filtered", counts.v4_unique);
        set("ipv6", "filtered", counts.v6_unique);
    }

    #[cfg(test)]
    pub fn vrp_count(&self, family: &str, filtered: &str, path: &str) -> i64 {
        self.vrps.with_label_values(&[family, filtered, path]).get()
    }
}

impl ServerEventHandler for Metrics {
    fn client_connected(&self, bind: SocketAddr, _peer: SocketAddr) {
        self.clients.with_label_values(&[&bind.to_string()]).inc();
    }

    fn client_disconnected(&self, bind: SocketAddr, _peer: SocketAddr) {
        self.clients.with_label_values(&[&bind.to_string()]).dec();
    }

    fn pdu_received(&self, typ: PduType) {
        self.pdus.with_label_values(&[typ.as_str()]).inc();
    }
}

pub struct ApiContext {
    pub metrics: Arc<Metrics>,
    pub exported: Arc<RwLock<VrpDocument>>,
}

#[endpoint { method = GET, path = "/metrics" }]
async fn get_metrics(
    rqctx: RequestContext<ApiContext>,
) -> Result<Response<Body>, HttpError> {
    let ctx = rqctx.context();
    Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(ctx.metrics.render().into())
        .map_err(|e| HttpError::for_internal_error(e.to_string()))
}

#[endpoint { method = GET, path = "/rpki.json" }]
async fn get_export(
    rqctx: RequestContext<ApiContext>,
) -> Result<HttpResponseOk<VrpDocument>, HttpError> {
    let ctx = rqctx.context();
    let document = read_lock!(ctx.exported).clone();
    Ok(HttpResponseOk(document))
}

pub fn start_server(
    log: Logger,
    addr: SocketAddr,
    context: ApiContext,
) -> Result<HttpServer<ApiContext>, String> {
    let config = ConfigDropshot {
        bind_address: addr,
        ..Default::default()
    };

    let mut api = ApiDescription::new();
    api.register(get_metrics).map_err(|e| e.to_string())?;
    api.register(get_export).map_err(|e| e.to_string())?;

    let server = HttpServerStarter::new(&config, api, context, &log)
        .map_err(|e| format!("create metrics server: {e}"))?
        .start();

    Ok(server)
}
