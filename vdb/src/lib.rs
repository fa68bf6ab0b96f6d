// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VRP database (vdb).
//!
//! This crate holds the data model for Validated ROA Payloads: the wire-level
//! record types, the upstream JSON document and SLURM overlay decoders, and
//! the serial-versioned history that RTR sessions answer queries from. All
//! state is volatile and rebuilt from the upstream fetch.

pub mod db;
pub mod error;
pub mod json;
pub mod slurm;
pub mod types;

pub use db::{Db, DiffResult, Install};
pub use types::{Delta, Prefix, Prefix4, Prefix6, Vrp, VrpSet};
