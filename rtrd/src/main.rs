use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser};
use rtr::connection_ssh::{
    KeyAuth, PasswordAuth, RtrListenerSsh, SshAuthConfig,
};
use rtr::connection_tcp::{RtrListenerTcp, RtrListenerTls};
use rtr::messages::{VERSION_0, VERSION_1};
use rtr::server::{Server, ServerConfig, ServerEventHandler};
use rtr::session::SessionConfig;
use slog::{error, info};
use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use vdb::json::VrpDocument;
use vdb::Db;

mod fetch;
mod metrics;
mod refresh;

use fetch::Fetcher;
use metrics::{start_server, ApiContext, Metrics};
use refresh::{RefreshConfig, RefreshState};

const ENV_SSH_PASSWORD: &str = "STAYRTR_SSH_PASSWORD";
const ENV_SSH_KEY: &str = "STAYRTR_SSH_AUTHORIZEDKEYS";

#[derive(Debug, Parser)]
#[command(name = "rtrd", version, about = "RPKI-to-Router cache server")]
struct Opt {
    /// URL or path of the cached VRP JSON data
    #[arg(
        long,
        default_value = "https://console.rpki-client.org/vrps.json"
    )]
    cache: String,

    /// Refresh interval in seconds
    #[arg(long, default_value_t = 600)]
    refresh: u64,

    /// Reject VRP documents older than 24 hours
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    checktime: bool,

    /// SLURM file (filters and assertions)
    #[arg(long, default_value = "")]
    slurm: String,

    /// Refresh the SLURM file along with the cache
    #[arg(long = "slurm.refresh", default_value_t = true, action = ArgAction::Set)]
    slurm_refresh: bool,

    /// Maximum RTR protocol version (0 or 1)
    #[arg(long, default_value_t = 1)]
    protocol: u8,

    /// Fixed session id; a negative value picks a random one
    #[arg(long = "rtr.sessionid", default_value_t = -1, allow_hyphen_values = true)]
    rtr_sessionid: i32,

    /// Refresh interval sent in version 1 End of Data
    #[arg(long = "rtr.refresh", default_value_t = 3600)]
    rtr_refresh: u32,

    /// Retry interval sent in version 1 End of Data
    #[arg(long = "rtr.retry", default_value_t = 600)]
    rtr_retry: u32,

    /// Expire interval sent in version 1 End of Data
    #[arg(long = "rtr.expire", default_value_t = 7200)]
    rtr_expire: u32,

    /// Bind address for plain TCP
    #[arg(long, default_value = ":8282")]
    bind: String,

    /// Bind address for TLS
    #[arg(long = "tls.bind", default_value = "")]
    tls_bind: String,

    /// TLS certificate path
    #[arg(long = "tls.cert", default_value = "")]
    tls_cert: String,

    /// TLS private key path
    #[arg(long = "tls.key", default_value = "")]
    tls_key: String,

    /// Bind address for SSH
    #[arg(long = "ssh.bind", default_value = "")]
    ssh_bind: String,

    /// SSH host key path
    #[arg(long = "ssh.key", default_value = "private.pem")]
    ssh_key: String,

    /// Enable SSH password auth
    #[arg(long = "ssh.method.password")]
    ssh_method_password: bool,

    /// SSH user
    #[arg(long = "ssh.auth.user", default_value = "rpki")]
    ssh_auth_user: String,

    /// SSH password (falls back to STAYRTR_SSH_PASSWORD)
    #[arg(long = "ssh.auth.password", default_value = "")]
    ssh_auth_password: String,

    /// Enable SSH public key auth
    #[arg(long = "ssh.method.key")]
    ssh_method_key: bool,

    /// Accept any SSH key
    #[arg(long = "ssh.auth.key.bypass")]
    ssh_auth_key_bypass: bool,

    /// Authorized SSH key file (falls back to STAYRTR_SSH_AUTHORIZEDKEYS)
    #[arg(long = "ssh.auth.key.file", default_value = "")]
    ssh_auth_key_file: String,

    /// Send Serial Notify to clients on new data
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    notifications: bool,

    /// Maximum simultaneous connections (0 to disable the limit)
    #[arg(long, default_value_t = 0)]
    maxconn: usize,

    /// Metrics and export address; empty disables the HTTP endpoints
    #[arg(long = "metrics.addr", default_value = ":9847")]
    metrics_addr: String,

    /// Send If-None-Match with the cached ETag
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    etag: bool,

    /// Send If-Modified-Since with the cached Last-Modified
    #[arg(long = "last.modified", default_value_t = true, action = ArgAction::Set)]
    last_modified: bool,

    /// User-Agent header on upstream requests
    #[arg(long, default_value = concat!("rtrd/", env!("CARGO_PKG_VERSION")))]
    useragent: String,

    /// Accept header on upstream requests
    #[arg(long, default_value = "application/json")]
    mime: String,

    /// Log level
    #[arg(long, default_value = "info")]
    loglevel: String,
}

fn main() {
    let opt = Opt::parse();
    if let Err(e) = run(opt) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(opt: Opt) -> Result<()> {
    let level = slog::Level::from_str(&opt.loglevel)
        .map_err(|_| anyhow!("invalid log level {}", opt.loglevel))?;
    let log = rtr_common::log::init_term_logger(level);

    if opt.bind.is_empty() && opt.tls_bind.is_empty() && opt.ssh_bind.is_empty()
    {
        bail!("specify at least one bind address");
    }
    let version_max = match opt.protocol {
        0 => VERSION_0,
        1 => VERSION_1,
        v => bail!("unsupported protocol version {v}"),
    };

    let session_id: u16 = if opt.rtr_sessionid < 0 {
        rand::random()
    } else {
        opt.rtr_sessionid as u16
    };

    let db = Db::new(session_id, vdb::db::DEFAULT_RETENTION, log.clone());
    let exported = Arc::new(RwLock::new(VrpDocument::default()));
    let metrics = if opt.metrics_addr.is_empty() {
        None
    } else {
        Some(Arc::new(Metrics::new().context("register metrics")?))
    };
    let handler = metrics
        .clone()
        .map(|m| m as Arc<dyn ServerEventHandler>);

    let server = Server::new(
        db.clone(),
        ServerConfig {
            session: SessionConfig {
                version_max,
                refresh: opt.rtr_refresh,
                retry: opt.rtr_retry,
                expire: opt.rtr_expire,
            },
            maxconn: opt.maxconn,
        },
        handler,
        log.clone(),
    );

    // Pull the initial state before the listeners come up, so routers
    // connecting right away have data to fetch. The blocking HTTP client
    // must be built and used off the async runtime.
    let refresh_config = RefreshConfig {
        cache_url: opt.cache.clone(),
        slurm_path: (!opt.slurm.is_empty()).then(|| opt.slurm.clone()),
        slurm_refresh: opt.slurm_refresh,
        interval: Duration::from_secs(opt.refresh),
        checktime: opt.checktime,
        send_notifs: opt.notifications,
    };
    let state = {
        let useragent = opt.useragent.clone();
        let mime = opt.mime.clone();
        let etag = opt.etag;
        let last_modified = opt.last_modified;
        let db = db.clone();
        let server = server.clone();
        let metrics = metrics.clone();
        let exported = exported.clone();
        let log = log.clone();
        tokio::task::spawn_blocking(move || -> Result<RefreshState> {
            let fetcher = Fetcher::new(&useragent, &mime, etag, last_modified)
                .context("build fetcher")?;
            let mut state = RefreshState::new(
                refresh_config,
                fetcher,
                db,
                server,
                metrics,
                exported,
                log,
            );
            state.initial();
            Ok(state)
        })
        .await
        .map_err(|e| anyhow!("initial sync: {e}"))??
    };

    info!(log, "rtr server started";
        "session_id" => session_id,
        "refresh" => opt.rtr_refresh,
        "retry" => opt.rtr_retry,
        "expire" => opt.rtr_expire,
    );

    if !opt.bind.is_empty() {
        let listener = RtrListenerTcp::bind(bind_addr(&opt.bind)?, log.clone())
            .context("bind rtr listener")?;
        let server = server.clone();
        std::thread::spawn(move || server.serve(listener));
    }
    if !opt.tls_bind.is_empty() {
        if opt.tls_cert.is_empty() || opt.tls_key.is_empty() {
            bail!("tls.bind requires tls.cert and tls.key");
        }
        let tls = load_tls_config(&opt.tls_cert, &opt.tls_key)?;
        let listener =
            RtrListenerTls::bind(bind_addr(&opt.tls_bind)?, tls, log.clone())
                .context("bind tls listener")?;
        let server = server.clone();
        std::thread::spawn(move || server.serve(listener));
    }
    if !opt.ssh_bind.is_empty() {
        let host_key = load_ssh_host_key(&opt.ssh_key)?;
        let auth = ssh_auth_config(&opt)?;
        info!(
            log,
            "enabling ssh with the following authentications: \
             password={}, key={}",
            opt.ssh_method_password,
            opt.ssh_method_key
        );
        let listener = RtrListenerSsh::bind(
            bind_addr(&opt.ssh_bind)?,
            host_key,
            auth,
            log.clone(),
        )
        .context("bind ssh listener")?;
        let server = server.clone();
        std::thread::spawn(move || server.serve(listener));
    }

    if let Some(metrics) = metrics {
        let api = start_server(
            log.clone(),
            bind_addr(&opt.metrics_addr)?,
            ApiContext {
                metrics,
                exported: exported.clone(),
            },
        )
        .map_err(|e| anyhow!(e))?;
        let log = log.clone();
        tokio::spawn(async move {
            if let Err(e) = api.await {
                error!(log, "metrics server exited: {e}");
            }
        });
    }

    // A HUP triggers an immediate refresh cycle.
    let (trigger_tx, trigger_rx) = std::sync::mpsc::channel();
    {
        let log = log.clone();
        tokio::spawn(async move {
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!(log, "install hup handler: {e}");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                slog::debug!(log, "received hup signal");
                if trigger_tx.send(()).is_err() {
                    break;
                }
            }
        });
    }

    tokio::task::spawn_blocking(move || state.run(trigger_rx))
        .await
        .map_err(|e| anyhow!("refresh loop: {e}"))?;
    Ok(())
}

/// Accept Go-style ":8282" binds by defaulting the host part.
fn bind_addr(s: &str) -> Result<SocketAddr> {
    let full = if s.starts_with(':') {
        format!("0.0.0.0{s}")
    } else {
        s.to_string()
    };
    full.to_socket_addrs()
        .with_context(|| format!("invalid bind address {s}"))?
        .next()
        .ok_or_else(|| anyhow!("invalid bind address {s}"))
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs: Vec<rustls::Certificate> = {
        let file = File::open(cert_path)
            .with_context(|| format!("open certificate {cert_path}"))?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::certs(&mut reader)
            .with_context(|| format!("read certificates from {cert_path}"))?
            .into_iter()
            .map(rustls::Certificate)
            .collect()
    };
    if certs.is_empty() {
        bail!("no certificates in {cert_path}");
    }

    let key = {
        let file = File::open(key_path)
            .with_context(|| format!("open private key {key_path}"))?;
        let mut reader = BufReader::new(file);
        let mut key = None;
        while let Some(item) = rustls_pemfile::read_one(&mut reader)
            .with_context(|| format!("read private key from {key_path}"))?
        {
            match item {
                rustls_pemfile::Item::PKCS8Key(der)
                | rustls_pemfile::Item::RSAKey(der)
                | rustls_pemfile::Item::ECKey(der) => {
                    key = Some(rustls::PrivateKey(der));
                    break;
                }
                _ => continue,
            }
        }
        key.ok_or_else(|| anyhow!("no private key in {key_path}"))?
    };

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build tls config")?;
    Ok(Arc::new(config))
}

fn load_ssh_host_key(path: &str) -> Result<russh_keys::key::KeyPair> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read ssh host key {path}"))?;
    russh_keys::decode_secret_key(&contents, None)
        .with_context(|| format!("parse ssh host key {path}"))
}

fn ssh_auth_config(opt: &Opt) -> Result<SshAuthConfig> {
    let mut auth = SshAuthConfig::default();
    if opt.ssh_method_password {
        let password = if opt.ssh_auth_password.is_empty() {
            std::env::var(ENV_SSH_PASSWORD).unwrap_or_default()
        } else {
            opt.ssh_auth_password.clone()
        };
        if password.is_empty() {
            bail!(
                "ssh password auth enabled but no password given \
                 (flag ssh.auth.password or ${ENV_SSH_PASSWORD})"
            );
        }
        auth.password = Some(PasswordAuth {
            user: opt.ssh_auth_user.clone(),
            password,
        });
    }
    if opt.ssh_method_key {
        let authorized: Vec<String> = if opt.ssh_auth_key_bypass {
            Vec::new()
        } else {
            let contents = if opt.ssh_auth_key_file.is_empty() {
                std::env::var(ENV_SSH_KEY).unwrap_or_default()
            } else {
                std::fs::read_to_string(&opt.ssh_auth_key_file).with_context(
                    || {
                        format!(
                            "read authorized keys {}",
                            opt.ssh_auth_key_file
                        )
                    },
                )?
            };
            contents.lines().map(str::to_owned).collect()
        };
        auth.key = Some(KeyAuth {
            authorized,
            bypass: opt.ssh_auth_key_bypass,
        });
    }
    Ok(auth)
}
