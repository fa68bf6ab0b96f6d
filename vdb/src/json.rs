// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The upstream VRP document: the JSON shape produced by RPKI validators
//! (`{"metadata": {...}, "roas": [...]}`). The same shape is served back out
//! on the export endpoint.

use crate::error::Error;
use crate::types::{Prefix, Vrp};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct VrpDocument {
    #[serde(default)]
    pub metadata: Metadata,

    #[serde(rename = "roas", default)]
    pub data: Vec<VrpJson>,
}

impl VrpDocument {
    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Metadata {
    #[serde(default)]
    pub counts: usize,

    #[serde(default)]
    pub buildtime: String,
}

impl Metadata {
    pub fn buildtime(&self) -> Result<DateTime<Utc>, Error> {
        DateTime::parse_from_rfc3339(&self.buildtime)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| Error::InvalidBuildtime(self.buildtime.clone()))
    }
}

/// One `roas` entry. The prefix is kept as text and the ASN in either of the
/// two forms validators emit; both are interpreted on demand.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VrpJson {
    pub prefix: String,

    pub asn: AsnJson,

    #[serde(rename = "maxLength")]
    pub max_length: u8,
}

/// ASNs appear either as a bare number or as an "AS"-prefixed string.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum AsnJson {
    Number(u32),
    Text(String),
}

impl VrpJson {
    pub fn prefix(&self) -> Result<Prefix, Error> {
        self.prefix.parse()
    }

    pub fn asn(&self) -> Result<u32, Error> {
        match &self.asn {
            AsnJson::Number(n) => Ok(*n),
            AsnJson::Text(s) => {
                let digits = s
                    .strip_prefix("AS")
                    .or_else(|| s.strip_prefix("as"))
                    .unwrap_or(s);
                digits
                    .parse()
                    .map_err(|_| Error::InvalidAsn(s.clone()))
            }
        }
    }

    /// Interpret this entry as a VRP, enforcing the max-length invariant.
    pub fn to_vrp(&self) -> Result<Vrp, Error> {
        let vrp = Vrp {
            prefix: self.prefix()?,
            asn: self.asn()?,
            max_length: self.max_length,
        };
        if !vrp.is_valid() {
            return Err(Error::InvalidMaxLength {
                prefix: self.prefix.clone(),
                max_length: self.max_length,
            });
        }
        Ok(vrp)
    }
}
