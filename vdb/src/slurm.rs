// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SLURM (RFC 8416) prefix filters and assertions. Filters remove matching
//! VRPs from the upstream data, assertions add locally configured ones.
//! Filtering runs before assertions and asserted entries are never
//! re-filtered.

use crate::error::Error;
use crate::json::{AsnJson, VrpJson};
use crate::types::Prefix;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlurmConfig {
    #[serde(default)]
    pub slurm_version: u8,

    #[serde(default)]
    pub validation_output_filters: ValidationOutputFilters,

    #[serde(default)]
    pub locally_added_assertions: LocallyAddedAssertions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutputFilters {
    #[serde(default)]
    pub prefix_filters: Vec<PrefixFilter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocallyAddedAssertions {
    #[serde(default)]
    pub prefix_assertions: Vec<PrefixAssertion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixFilter {
    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub asn: Option<u32>,

    #[serde(default)]
    pub comment: Option<String>,
}

impl PrefixFilter {
    fn matches(&self, vrp: &VrpJson) -> bool {
        if self.prefix.is_none() && self.asn.is_none() {
            return false;
        }
        if let Some(filter_prefix) = &self.prefix {
            let covered = match (
                filter_prefix.parse::<Prefix>(),
                vrp.prefix(),
            ) {
                (Ok(fp), Ok(vp)) => fp.covers(&vp),
                _ => false,
            };
            if !covered {
                return false;
            }
        }
        if let Some(asn) = self.asn {
            if vrp.asn().map(|a| a != asn).unwrap_or(true) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixAssertion {
    pub prefix: String,

    pub asn: u32,

    #[serde(default)]
    pub max_prefix_length: Option<u8>,

    #[serde(default)]
    pub comment: Option<String>,
}

impl SlurmConfig {
    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let config: SlurmConfig = serde_json::from_slice(data)?;
        if config.slurm_version != 1 {
            return Err(Error::UnsupportedSlurmVersion(config.slurm_version));
        }
        Ok(config)
    }

    /// Partition `vrps` into those passing the filters and those removed.
    pub fn filter_on_vrps(
        &self,
        vrps: Vec<VrpJson>,
    ) -> (Vec<VrpJson>, Vec<VrpJson>) {
        let filters = &self.validation_output_filters.prefix_filters;
        vrps.into_iter()
            .partition(|vrp| !filters.iter().any(|f| f.matches(vrp)))
    }

    /// The locally asserted VRPs, in upstream entry form.
    pub fn assert_vrps(&self) -> Vec<VrpJson> {
        self.locally_added_assertions
            .prefix_assertions
            .iter()
            .map(|a| {
                let max_length = a.max_prefix_length.unwrap_or_else(|| {
                    a.prefix
                        .parse::<Prefix>()
                        .map(|p| p.length())
                        .unwrap_or(0)
                });
                VrpJson {
                    prefix: a.prefix.clone(),
                    asn: AsnJson::Number(a.asn),
                    max_length,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SLURM: &[u8] = br#"{
        "slurmVersion": 1,
        "validationOutputFilters": {
            "prefixFilters": [
                { "prefix": "10.0.0.0/8", "comment": "drop all of 10/8" },
                { "asn": 64499 },
                { "prefix": "192.0.2.0/24", "asn": 64511 }
            ]
        },
        "locallyAddedAssertions": {
            "prefixAssertions": [
                { "prefix": "198.51.100.0/24", "asn": 64496 },
                { "prefix": "2001:db8::/32", "asn": 64496, "maxPrefixLength": 48 }
            ]
        }
    }"#;

    fn entry(prefix: &str, asn: u32, max_length: u8) -> VrpJson {
        VrpJson {
            prefix: prefix.into(),
            asn: AsnJson::Number(asn),
            max_length,
        }
    }

    #[test]
    fn version_must_be_one() {
        assert!(SlurmConfig::from_slice(br#"{"slurmVersion": 2}"#).is_err());
        assert!(SlurmConfig::from_slice(br#"{}"#).is_err());
    }

    #[test]
    fn filters_partition_input() {
        let slurm = SlurmConfig::from_slice(SLURM).expect("decode slurm");

        let input = vec![
            entry("10.1.0.0/16", 64496, 16),
            entry("192.0.2.0/24", 64499, 24),
            entry("192.0.2.0/24", 64511, 24),
            entry("203.0.113.0/24", 64500, 24),
        ];
        let (kept, removed) = slurm.filter_on_vrps(input);

        assert_eq!(kept, vec![entry("203.0.113.0/24", 64500, 24)]);
        assert_eq!(removed.len(), 3);
    }

    #[test]
    fn prefix_and_asn_must_both_match() {
        let slurm = SlurmConfig::from_slice(SLURM).expect("decode slurm");

        // Covered by 192.0.2.0/24 but a different origin than 64511.
        let input = vec![entry("192.0.2.0/25", 64496, 25)];
        let (kept, removed) = slurm.filter_on_vrps(input);
        assert_eq!(kept.len(), 1);
        assert!(removed.is_empty());
    }

    #[test]
    fn assertions_default_max_length() {
        let slurm = SlurmConfig::from_slice(SLURM).expect("decode slurm");
        let asserted = slurm.assert_vrps();
        assert_eq!(
            asserted,
            vec![
                entry("198.51.100.0/24", 64496, 24),
                entry("2001:db8::/32", 64496, 48),
            ]
        );
    }
}
