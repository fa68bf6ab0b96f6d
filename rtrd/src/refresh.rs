// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The refresh pipeline: fetch the upstream document, short-circuit on
//! unchanged content, apply SLURM, validate and dedup, install the result
//! and notify connected routers. Any failure leaves the previously
//! installed state untouched.

use crate::fetch::{FetchData, FetchError, Fetcher};
use crate::metrics::Metrics;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rtr::server::Server;
use rtr_common::write_lock;
use sha2::{Digest, Sha256};
use slog::{debug, error, info, warn, Logger};
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use vdb::db::Install;
use vdb::json::{Metadata, VrpDocument, VrpJson};
use vdb::slurm::SlurmConfig;
use vdb::types::family_counts;
use vdb::{Db, VrpSet};

/// Until the first snapshot lands, retry at this cadence instead of the
/// configured interval.
const INITIAL_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// A document older than this fails the cycle when checktime is on.
const MAX_DOCUMENT_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub cache_url: String,
    pub slurm_path: Option<String>,
    pub slurm_refresh: bool,
    pub interval: Duration,
    pub checktime: bool,
    pub send_notifs: bool,
}

/// Raw and deduped per-family counts out of one ingest pass.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ProcessCounts {
    pub total: usize,
    pub v4: usize,
    pub v6: usize,
    pub v4_unique: usize,
    pub v6_unique: usize,
}

/// Validate and dedup upstream entries. Entries with a bad prefix, ASN or
/// max length are skipped with a log line; raw counts cover everything that
/// validated, unique counts what survived dedup.
pub fn process_data(
    entries: &[VrpJson],
    log: &Logger,
) -> (VrpSet, ProcessCounts) {
    let mut set = VrpSet::new();
    let mut counts = ProcessCounts::default();
    for entry in entries {
        let vrp = match entry.to_vrp() {
            Ok(vrp) => vrp,
            Err(e) => {
                error!(log, "skipping vrp entry: {e}");
                continue;
            }
        };
        if vrp.prefix.is_v4() {
            counts.v4 += 1;
        } else {
            counts.v6 += 1;
        }
        set.insert(vrp);
    }
    counts.total = counts.v4 + counts.v6;
    let (v4_unique, v6_unique) = family_counts(&set);
    counts.v4_unique = v4_unique;
    counts.v6_unique = v6_unique;
    (set, counts)
}

pub struct RefreshState {
    config: RefreshConfig,
    fetcher: Fetcher,
    db: Db,
    server: Arc<Server>,
    metrics: Option<Arc<Metrics>>,
    exported: Arc<RwLock<VrpDocument>>,

    hashes: HashMap<String, [u8; 32]>,
    last_data: Option<VrpDocument>,
    slurm: Option<SlurmConfig>,

    log: Logger,
}

impl RefreshState {
    pub fn new(
        config: RefreshConfig,
        fetcher: Fetcher,
        db: Db,
        server: Arc<Server>,
        metrics: Option<Arc<Metrics>>,
        exported: Arc<RwLock<VrpDocument>>,
        log: Logger,
    ) -> Self {
        Self {
            config,
            fetcher,
            db,
            server,
            metrics,
            exported,
            hashes: HashMap::new(),
            last_data: None,
            slurm: None,
            log,
        }
    }

    /// Fetch `path`, with the identical-content short-circuit. Returns the
    /// body only when it differs from the last one seen for this path.
    fn fetch_changed(&mut self, path: &str) -> Option<Vec<u8>> {
        let body = match self.fetcher.fetch(path) {
            Ok(FetchData::Modified { body, status }) => {
                if let Some(code) = status {
                    self.record_status(path, code);
                }
                if let Some(m) = &self.metrics {
                    m.observe_refresh_time(path, Utc::now());
                }
                body
            }
            Ok(FetchData::NotModified { status }) => {
                self.record_status(path, status);
                info!(self.log, "{path} not modified since the last fetch");
                return None;
            }
            Err(e) => {
                if let FetchError::Status { code } = &e {
                    self.record_status(path, *code);
                }
                error!(self.log, "error fetching {path}: {e}");
                return None;
            }
        };

        let hash: [u8; 32] = Sha256::digest(&body).into();
        if self.hashes.get(path) == Some(&hash) {
            info!(self.log, "{path} is identical to the previous version");
            return None;
        }
        info!(
            self.log,
            "new content for {path}: updating sha256 hash to {}",
            hex(&hash)
        );
        self.hashes.insert(path.to_string(), hash);
        Some(body)
    }

    fn record_status(&self, path: &str, code: u16) {
        if let Some(m) = &self.metrics {
            m.observe_refresh_status(path, code);
        }
    }

    /// Fetch and decode the upstream VRP document. True if new content was
    /// staged for installation.
    pub fn update_cache(&mut self) -> bool {
        debug!(self.log, "refreshing cache from {}", self.config.cache_url);
        let url = self.config.cache_url.clone();
        let Some(body) = self.fetch_changed(&url) else {
            return false;
        };
        match VrpDocument::from_slice(&body) {
            Ok(document) => {
                self.last_data = Some(document);
                true
            }
            Err(e) => {
                error!(self.log, "error decoding {url}: {e}");
                false
            }
        }
    }

    /// Fetch and decode the SLURM file. True if the policy changed.
    pub fn update_slurm(&mut self, path: &str) -> bool {
        debug!(self.log, "refreshing slurm from {path}");
        let Some(body) = self.fetch_changed(path) else {
            return false;
        };
        match SlurmConfig::from_slice(&body) {
            Ok(slurm) => {
                self.slurm = Some(slurm);
                true
            }
            Err(e) => {
                error!(self.log, "error decoding slurm {path}: {e}");
                false
            }
        }
    }

    /// Run the staged document through SLURM and ingest, install the result
    /// and publish the export view.
    pub fn update_from_new_state(&mut self) -> Result<()> {
        let Some(document) = self.last_data.clone() else {
            return Ok(());
        };

        if self.config.checktime {
            let buildtime = document
                .metadata
                .buildtime()
                .context("cache buildtime")?;
            let notafter =
                buildtime + chrono::Duration::hours(MAX_DOCUMENT_AGE_HOURS);
            if Utc::now() > notafter {
                bail!("vrp json file is older than 24 hours: {buildtime}");
            }
        }

        let mut vrpsjson = document.data;
        if let Some(slurm) = &self.slurm {
            let (kept, removed) = slurm.filter_on_vrps(vrpsjson);
            let asserted = slurm.assert_vrps();
            info!(
                self.log,
                "slurm filtering: {} kept, {} removed, {} asserted",
                kept.len(),
                removed.len(),
                asserted.len()
            );
            vrpsjson = kept;
            vrpsjson.extend(asserted);
        }

        let (vrps, counts) = process_data(&vrpsjson, &self.log);
        info!(
            self.log,
            "new update ({} uniques, {} total prefixes)",
            vrps.len(),
            counts.total
        );

        match self.db.install(vrps) {
            Install::Updated { serial } => {
                info!(self.log, "update added, new serial {serial}");
                if let Some(m) = &self.metrics {
                    m.observe_change_time(&self.config.cache_url, Utc::now());
                }
                if self.config.send_notifs {
                    debug!(self.log, "sending notifications to clients");
                    self.server.notify_clients_latest();
                }
            }
            Install::Unchanged => {
                debug!(self.log, "vrp set unchanged, serial stays");
            }
        }

        *write_lock!(self.exported) = VrpDocument {
            metadata: Metadata {
                counts: vrpsjson.len(),
                buildtime: document.metadata.buildtime.clone(),
            },
            data: vrpsjson,
        };

        if let Some(m) = &self.metrics {
            m.update_vrp_counts(&self.config.cache_url, &counts);
        }
        Ok(())
    }

    /// One full cycle: SLURM (when configured and refreshing), cache, then
    /// state recomputation if either changed.
    fn cycle(&mut self, refresh_slurm: bool) {
        let slurm_updated = match self.config.slurm_path.clone() {
            Some(path) if refresh_slurm => self.update_slurm(&path),
            _ => false,
        };
        let cache_updated = self.update_cache();
        if cache_updated || slurm_updated {
            if let Err(e) = self.update_from_new_state() {
                error!(self.log, "error updating from new state: {e}");
            }
        }
    }

    /// Synchronous startup pass: cache, SLURM, then state, in that order, so
    /// listeners come up with data when the upstream is reachable.
    pub fn initial(&mut self) {
        self.update_cache();
        if let Some(path) = self.config.slurm_path.clone() {
            self.update_slurm(&path);
        }
        if let Err(e) = self.update_from_new_state() {
            warn!(self.log, "error setting up initial state: {e}");
        }
    }

    /// The refresh loop. Ticks at the configured interval (30 s until the
    /// first install), or immediately when the trigger channel fires.
    pub fn run(mut self, trigger_rx: Receiver<()>) {
        debug!(
            self.log,
            "starting refresh routine (cache: {}, interval: {}s, slurm: {:?})",
            self.config.cache_url,
            self.config.interval.as_secs(),
            self.config.slurm_path
        );
        loop {
            let interval = if self.db.current_serial().is_none() {
                warn!(
                    self.log,
                    "initial sync not complete, refreshing every {} seconds",
                    INITIAL_SYNC_INTERVAL.as_secs()
                );
                INITIAL_SYNC_INTERVAL
            } else {
                self.config.interval
            };
            match trigger_rx.recv_timeout(interval) {
                Ok(()) => debug!(self.log, "refresh triggered"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.cycle(self.config.slurm_refresh);
        }
    }
}

fn hex(hash: &[u8]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rtr::server::ServerConfig;
    use vdb::json::AsnJson;

    const CACHE_URL: &str = "https://cache.example.net/vrps.json";

    fn entry(prefix: &str, asn: u32, max_length: u8) -> VrpJson {
        VrpJson {
            prefix: prefix.into(),
            asn: AsnJson::Number(asn),
            max_length,
        }
    }

    fn test_state(checktime: bool) -> RefreshState {
        let log = rtr_common::log::init_logger();
        let db = Db::new(7, vdb::db::DEFAULT_RETENTION, log.clone());
        let server =
            Server::new(db.clone(), ServerConfig::default(), None, log.clone());
        RefreshState::new(
            RefreshConfig {
                cache_url: CACHE_URL.into(),
                slurm_path: None,
                slurm_refresh: true,
                interval: Duration::from_secs(600),
                checktime,
                send_notifs: false,
            },
            Fetcher::new("test", "application/json", true, true)
                .expect("fetcher"),
            db,
            server,
            Some(Arc::new(Metrics::new().expect("metrics"))),
            Arc::new(RwLock::new(VrpDocument::default())),
            log,
        )
    }

    fn document(buildtime: chrono::DateTime<Utc>, data: Vec<VrpJson>) -> VrpDocument {
        VrpDocument {
            metadata: Metadata {
                counts: data.len(),
                buildtime: buildtime.to_rfc3339(),
            },
            data,
        }
    }

    #[test]
    fn dedup_keeps_distinct_triples() {
        let log = rtr_common::log::init_logger();
        let entries = vec![
            entry("10.0.0.0/24", 1, 24),
            entry("10.0.0.0/24", 1, 24),
            entry("10.0.0.0/24", 1, 25),
        ];
        let (set, counts) = process_data(&entries, &log);
        assert_eq!(set.len(), 2);
        assert_eq!(counts.v4, 3);
        assert_eq!(counts.v4_unique, 2);
        assert_eq!(counts.v6, 0);
        assert_eq!(counts.total, 3);
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let log = rtr_common::log::init_logger();
        let entries = vec![
            entry("10.0.0.0/24", 1, 24),
            // max length below the network length
            entry("10.0.0.0/24", 1, 20),
            // not a prefix at all
            entry("banana", 1, 24),
            // max length wider than the family
            entry("2001:db8::/32", 2, 129),
        ];
        let (set, counts) = process_data(&entries, &log);
        assert_eq!(set.len(), 1);
        assert_eq!(counts.total, 1);
    }

    #[test]
    fn stale_document_is_rejected_and_state_kept() {
        let mut state = test_state(true);

        // A good install first.
        state.last_data = Some(document(
            Utc::now(),
            vec![entry("10.0.0.0/24", 1, 24)],
        ));
        state.update_from_new_state().expect("fresh install");
        assert_eq!(state.db.current_serial(), Some(0));

        // Now a document 25 hours stale.
        state.last_data = Some(document(
            Utc::now() - chrono::Duration::hours(25),
            vec![entry("10.0.1.0/24", 1, 24)],
        ));
        assert!(state.update_from_new_state().is_err());
        assert_eq!(state.db.current_serial(), Some(0));
        let exported = state.exported.read().unwrap();
        assert_eq!(exported.data, vec![entry("10.0.0.0/24", 1, 24)]);
    }

    #[test]
    fn stale_document_accepted_without_checktime() {
        let mut state = test_state(false);
        state.last_data = Some(document(
            Utc::now() - chrono::Duration::hours(25),
            vec![entry("10.0.0.0/24", 1, 24)],
        ));
        state.update_from_new_state().expect("install");
        assert_eq!(state.db.current_serial(), Some(0));
    }

    #[test]
    fn metric_counts_raw_unfiltered_and_deduped_filtered() {
        let mut state = test_state(true);
        state.last_data = Some(document(
            Utc::now(),
            vec![
                entry("10.0.0.0/24", 1, 24),
                entry("10.0.0.0/24", 1, 24),
                entry("10.0.0.0/24", 1, 25),
                entry("2001:db8::/32", 2, 48),
            ],
        ));
        state.update_from_new_state().expect("install");

        let metrics = state.metrics.as_ref().unwrap();
        assert_eq!(metrics.vrp_count("ipv4", "unfiltered", CACHE_URL), 3);
        assert_eq!(metrics.vrp_count("ipv4", "filtered", CACHE_URL), 2);
        assert_eq!(metrics.vrp_count("ipv6", "unfiltered", CACHE_URL), 1);
        assert_eq!(metrics.vrp_count("ipv6", "filtered", CACHE_URL), 1);
    }

    #[test]
    fn unchanged_set_does_not_advance_serial() {
        let mut state = test_state(true);
        state.last_data =
            Some(document(Utc::now(), vec![entry("10.0.0.0/24", 1, 24)]));
        state.update_from_new_state().expect("install");
        assert_eq!(state.db.current_serial(), Some(0));

        // Same content again, e.g. only the buildtime moved.
        state.last_data = Some(document(
            Utc::now(),
            vec![entry("10.0.0.0/24", 1, 24)],
        ));
        state.update_from_new_state().expect("reinstall");
        assert_eq!(state.db.current_serial(), Some(0));
    }

    #[test]
    fn slurm_applies_before_ingest() {
        let mut state = test_state(true);
        state.slurm = Some(
            SlurmConfig::from_slice(
                br#"{
                    "slurmVersion": 1,
                    "validationOutputFilters": {
                        "prefixFilters": [ { "prefix": "10.0.0.0/8" } ]
                    },
                    "locallyAddedAssertions": {
                        "prefixAssertions": [
                            { "prefix": "198.51.100.0/24", "asn": 64496 }
                        ]
                    }
                }"#,
            )
            .expect("slurm"),
        );
        state.last_data = Some(document(
            Utc::now(),
            vec![
                entry("10.0.0.0/24", 1, 24),
                entry("192.0.2.0/24", 2, 24),
            ],
        ));
        state.update_from_new_state().expect("install");

        let (_, dump) = state.db.full_dump().expect("dump");
        let prefixes: Vec<String> =
            dump.iter().map(|v| v.prefix.to_string()).collect();
        assert_eq!(prefixes, vec!["192.0.2.0/24", "198.51.100.0/24"]);

        // The export is the post-slurm view.
        let exported = state.exported.read().unwrap();
        assert_eq!(exported.metadata.counts, 2);
        assert_eq!(
            exported.data,
            vec![
                entry("192.0.2.0/24", 2, 24),
                entry("198.51.100.0/24", 64496, 24),
            ]
        );
    }
}
