// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid prefix {0}")]
    InvalidPrefix(String),

    #[error("invalid asn {0}")]
    InvalidAsn(String),

    #[error("invalid max length {max_length} for {prefix}")]
    InvalidMaxLength { prefix: String, max_length: u8 },

    #[error("invalid buildtime {0}")]
    InvalidBuildtime(String),

    #[error("unsupported slurm version {0}")]
    UnsupportedSlurmVersion(u8),

    #[error("json {0}")]
    Json(#[from] serde_json::Error),
}
