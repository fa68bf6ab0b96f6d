// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The serial-versioned VRP history. One writer (the refresh pipeline)
//! installs snapshots; many readers (RTR sessions) answer Reset and Serial
//! queries against them. Only the most recent `retention` deltas are kept,
//! clients further behind are told to reset.

use crate::types::{Delta, Vrp, VrpSet};
use rtr_common::{read_lock, write_lock};
use slog::{info, Logger};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// How many deltas are retained by default.
pub const DEFAULT_RETENTION: usize = 3;

/// Serial numbers advance mod 2^32. `distance(a, b)` is the number of
/// installs between serial `a` and the later serial `b`.
fn distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

struct History {
    /// Current snapshot and its serial, none until the first install.
    current: Option<(u32, Arc<VrpSet>)>,

    /// Deltas leading up to the current snapshot, oldest first. The delta at
    /// the back transforms serial `current - 1` into `current`.
    deltas: VecDeque<Delta>,
}

/// The central VRP store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Db {
    history: Arc<RwLock<History>>,
    session_id: u16,
    retention: usize,
    log: Logger,
}

/// Outcome of an install.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Install {
    /// The new set equals the current one; serial unchanged.
    Unchanged,

    /// A new snapshot was installed under `serial`.
    Updated { serial: u32 },
}

/// Answer to `diff_since`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DiffResult {
    /// Nothing has been installed yet.
    NoData,

    /// The client serial is outside the retained window.
    ResetRequired,

    /// The compacted change from the client serial up to `serial`. Empty
    /// when the client is already current.
    Delta { serial: u32, delta: Delta },
}

impl Db {
    pub fn new(session_id: u16, retention: usize, log: Logger) -> Self {
        Self {
            history: Arc::new(RwLock::new(History {
                current: None,
                deltas: VecDeque::new(),
            })),
            session_id,
            retention,
            log,
        }
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn current_serial(&self) -> Option<u32> {
        read_lock!(self.history).current.as_ref().map(|(s, _)| *s)
    }

    /// Atomically replace the current snapshot. Allocates the next serial and
    /// records the delta, unless the new set equals the current one.
    pub fn install(&self, vrps: VrpSet) -> Install {
        let mut history = write_lock!(self.history);
        match history.current.take() {
            None => {
                let serial = 0;
                history.current = Some((serial, Arc::new(vrps)));
                info!(self.log, "installed initial snapshot"; "serial" => serial);
                Install::Updated { serial }
            }
            Some((serial, current)) => {
                if *current == vrps {
                    history.current = Some((serial, current));
                    return Install::Unchanged;
                }
                let delta = Delta::compute(&current, &vrps);
                let serial = serial.wrapping_add(1);
                history.deltas.push_back(delta);
                while history.deltas.len() > self.retention {
                    history.deltas.pop_front();
                }
                history.current = Some((serial, Arc::new(vrps)));
                info!(self.log, "installed new snapshot"; "serial" => serial);
                Install::Updated { serial }
            }
        }
    }

    /// Current serial and snapshot as one consistent pair.
    pub fn full_dump(&self) -> Option<(u32, Arc<VrpSet>)> {
        read_lock!(self.history).current.clone()
    }

    /// The compacted change a client at `client_serial` is missing. Walks the
    /// retained deltas into a private buffer so the caller never holds the
    /// read lock while streaming.
    pub fn diff_since(&self, client_serial: u32) -> DiffResult {
        let history = read_lock!(self.history);
        let Some((serial, _)) = history.current else {
            return DiffResult::NoData;
        };
        let behind = distance(client_serial, serial) as usize;
        if behind > history.deltas.len() {
            return DiffResult::ResetRequired;
        }
        let start = history.deltas.len() - behind;
        let delta = compact(history.deltas.range(start..));
        DiffResult::Delta { serial, delta }
    }
}

/// Concatenate consecutive deltas, cancelling announce/withdraw pairs so the
/// result reflects only membership in the two endpoint snapshots.
fn compact<'a, I: Iterator<Item = &'a Delta>>(deltas: I) -> Delta {
    let mut announced = VrpSet::new();
    let mut withdrawn = VrpSet::new();
    for delta in deltas {
        for vrp in &delta.announced {
            if !withdrawn.remove(vrp) {
                announced.insert(*vrp);
            }
        }
        for vrp in &delta.withdrawn {
            if !announced.remove(vrp) {
                withdrawn.insert(*vrp);
            }
        }
    }
    Delta {
        announced: announced.into_iter().collect(),
        withdrawn: withdrawn.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Prefix;
    use pretty_assertions::assert_eq;

    fn vrp(s: &str, asn: u32, max_length: u8) -> Vrp {
        Vrp {
            prefix: s.parse::<Prefix>().unwrap(),
            asn,
            max_length,
        }
    }

    fn set(vrps: &[Vrp]) -> VrpSet {
        vrps.iter().copied().collect()
    }

    fn test_db(retention: usize) -> Db {
        let log = rtr_common::log::init_logger();
        Db::new(0x1701, retention, log)
    }

    #[test]
    fn first_install_is_serial_zero() {
        let db = test_db(DEFAULT_RETENTION);
        assert_eq!(db.current_serial(), None);
        assert_eq!(db.diff_since(0), DiffResult::NoData);

        let a = set(&[vrp("10.0.0.0/24", 1, 24)]);
        assert_eq!(db.install(a.clone()), Install::Updated { serial: 0 });
        assert_eq!(db.current_serial(), Some(0));

        let (serial, dump) = db.full_dump().expect("dump");
        assert_eq!(serial, 0);
        assert_eq!(*dump, a);
    }

    #[test]
    fn identical_install_is_a_noop() {
        let db = test_db(DEFAULT_RETENTION);
        let a = set(&[vrp("10.0.0.0/24", 1, 24)]);
        db.install(a.clone());
        assert_eq!(db.install(a), Install::Unchanged);
        assert_eq!(db.current_serial(), Some(0));
    }

    #[test]
    fn serial_advances_by_one_per_change() {
        let db = test_db(DEFAULT_RETENTION);
        db.install(set(&[vrp("10.0.0.0/24", 1, 24)]));
        db.install(set(&[vrp("10.0.1.0/24", 1, 24)]));
        db.install(set(&[vrp("10.0.2.0/24", 1, 24)]));
        assert_eq!(db.current_serial(), Some(2));
    }

    #[test]
    fn diff_since_walks_the_window() {
        let db = test_db(DEFAULT_RETENTION);
        let s0 = set(&[vrp("10.0.0.0/24", 1, 24), vrp("2001:db8::/32", 2, 48)]);
        let s1 = set(&[vrp("10.0.0.0/24", 1, 24), vrp("10.0.1.0/24", 1, 24)]);
        db.install(s0.clone());
        db.install(s1.clone());

        match db.diff_since(0) {
            DiffResult::Delta { serial, delta } => {
                assert_eq!(serial, 1);
                assert_eq!(delta.announced, vec![vrp("10.0.1.0/24", 1, 24)]);
                assert_eq!(delta.withdrawn, vec![vrp("2001:db8::/32", 2, 48)]);
                assert_eq!(delta.apply(&s0), s1);
            }
            other => panic!("expected delta, got {other:?}"),
        }

        // Already current: an empty delta, not a reset.
        match db.diff_since(1) {
            DiffResult::Delta { serial, delta } => {
                assert_eq!(serial, 1);
                assert!(delta.is_empty());
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn out_of_window_requires_reset() {
        let db = test_db(1);
        db.install(set(&[vrp("10.0.0.0/24", 1, 24)]));
        db.install(set(&[vrp("10.0.1.0/24", 1, 24)]));
        db.install(set(&[vrp("10.0.2.0/24", 1, 24)]));
        db.install(set(&[vrp("10.0.3.0/24", 1, 24)]));
        assert_eq!(db.current_serial(), Some(3));

        assert_eq!(db.diff_since(0), DiffResult::ResetRequired);
        assert_eq!(db.diff_since(1), DiffResult::ResetRequired);
        assert!(matches!(db.diff_since(2), DiffResult::Delta { .. }));
        // A serial from the future is also outside the window.
        assert_eq!(db.diff_since(4), DiffResult::ResetRequired);
    }

    #[test]
    fn compaction_cancels_bounced_vrps() {
        let db = test_db(DEFAULT_RETENTION);
        let stable = vrp("192.0.2.0/24", 9, 24);
        let bounced = vrp("10.0.0.0/24", 1, 24);

        // bounced is withdrawn at serial 1 and re-announced at serial 2, so
        // a client at serial 0 sees no net change for it.
        db.install(set(&[stable, bounced]));
        db.install(set(&[stable]));
        db.install(set(&[stable, bounced]));

        match db.diff_since(0) {
            DiffResult::Delta { serial, delta } => {
                assert_eq!(serial, 2);
                assert!(delta.is_empty());
            }
            other => panic!("expected delta, got {other:?}"),
        }

        match db.diff_since(1) {
            DiffResult::Delta { delta, .. } => {
                assert_eq!(delta.announced, vec![bounced]);
                assert!(delta.withdrawn.is_empty());
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn retained_deltas_reconstruct_the_current_snapshot() {
        let db = test_db(DEFAULT_RETENTION);
        let snapshots = [
            set(&[vrp("10.0.0.0/24", 1, 24)]),
            set(&[vrp("10.0.0.0/24", 1, 24), vrp("10.0.1.0/24", 1, 24)]),
            set(&[vrp("10.0.1.0/24", 1, 24), vrp("2001:db8::/32", 2, 48)]),
            set(&[vrp("2001:db8::/32", 2, 48)]),
        ];
        for s in &snapshots {
            db.install(s.clone());
        }
        for (i, s) in snapshots.iter().enumerate() {
            match db.diff_since(i as u32) {
                DiffResult::Delta { delta, .. } => {
                    assert_eq!(delta.apply(s), snapshots[snapshots.len() - 1]);
                }
                other => panic!("expected delta, got {other:?}"),
            }
        }
    }
}
