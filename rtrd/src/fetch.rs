// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fetches the VRP and SLURM documents. HTTP sources get conditional
//! requests with cached ETag/Last-Modified validators; anything else is
//! treated as a local file path.

use rtr_common::lock;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("unexpected status {code}")]
    Status { code: u16 },

    #[error("transport {0}")]
    Transport(#[from] reqwest::Error),

    #[error("read {path}: {err}")]
    Io { path: String, err: std::io::Error },
}

pub enum FetchData {
    /// New content. The status is absent for file sources.
    Modified {
        body: Vec<u8>,
        status: Option<u16>,
    },

    /// The server reported our cached validators still hold.
    NotModified { status: u16 },
}

#[derive(Default, Clone)]
struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
}

pub struct Fetcher {
    client: reqwest::blocking::Client,
    mime: String,
    enable_etags: bool,
    enable_last_modified: bool,
    validators: Mutex<HashMap<String, Validators>>,
}

impl Fetcher {
    pub fn new(
        user_agent: &str,
        mime: &str,
        enable_etags: bool,
        enable_last_modified: bool,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            mime: mime.to_string(),
            enable_etags,
            enable_last_modified,
            validators: Mutex::new(HashMap::new()),
        })
    }

    pub fn fetch(&self, path: &str) -> Result<FetchData, FetchError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            self.fetch_http(path)
        } else {
            let body = std::fs::read(path).map_err(|err| FetchError::Io {
                path: path.to_string(),
                err,
            })?;
            Ok(FetchData::Modified { body, status: None })
        }
    }

    fn fetch_http(&self, url: &str) -> Result<FetchData, FetchError> {
        use reqwest::header::{
            ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
        };

        let mut request = self.client.get(url).header(ACCEPT, &self.mime);
        {
            let validators = lock!(self.validators);
            if let Some(v) = validators.get(url) {
                if self.enable_etags {
                    if let Some(etag) = &v.etag {
                        request = request.header(IF_NONE_MATCH, etag);
                    }
                }
                if self.enable_last_modified {
                    if let Some(last_modified) = &v.last_modified {
                        request =
                            request.header(IF_MODIFIED_SINCE, last_modified);
                    }
                }
            }
        }

        let response = request.send()?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(FetchData::NotModified {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
            });
        }

        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        let validators = Validators {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        };
        let code = status.as_u16();
        let body = response.bytes()?.to_vec();
        lock!(self.validators).insert(url.to_string(), validators);

        Ok(FetchData::Modified {
            body,
            status: Some(code),
        })
    }
}
