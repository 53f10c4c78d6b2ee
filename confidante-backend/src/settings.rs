use std::sync::Arc;
use std::{fs::File, io::BufReader};

use anyhow::{Error, anyhow};
use rustls_native_certs::load_native_certs;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::{Deserialize, Deserializer};
use tokio_rustls::rustls::pki_types::PrivateKeyDer::Pkcs8;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

use confidante_core::xmpp::jid::Jid;

#[derive(Debug, Clone, Deserialize)]
struct TlsConfig {
    #[serde(deserialize_with = "load_certificate_chain")]
    certificate_chain: Vec<CertificateDer<'static>>,
    #[serde(deserialize_with = "load_private_key")]
    private_key: PrivateKeyDer<'static>,
}

#[derive(Debug, Deserialize)]
struct RawTlsSettings {
    required_for_clients: bool,
    required_for_servers: bool,
    server_config: TlsConfig,
}

/// The certificate chain and key presented both to inbound connections and
/// when dialing other servers for s2s: a receiving server validates it to
/// decide whether to offer us SASL EXTERNAL.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub required_for_clients: bool,
    pub required_for_servers: bool,
    pub server_config: Arc<ServerConfig>,
    pub client_config: Arc<ClientConfig>,
}

impl<'d> Deserialize<'d> for TlsSettings {
    fn deserialize<D: Deserializer<'d>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawTlsSettings::deserialize(deserializer)?;

        Ok(TlsSettings {
            required_for_clients: raw.required_for_clients,
            required_for_servers: raw.required_for_servers,
            server_config: build_server_config(raw.server_config.clone()).map_err(serde::de::Error::custom)?,
            client_config: build_client_config(raw.server_config).map_err(serde::de::Error::custom)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggerSettings {
    #[serde(default)]
    pub level: LogLevel,
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DebugSettings {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Mysql,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MysqlSettings {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub pool_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSettings {
    #[serde(rename = "type", default)]
    pub kind: StorageKind,
    pub mysql: Option<MysqlSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostSettings {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModulesSettings {
    #[serde(default)]
    pub enabled: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceConflictPolicy {
    Reject,
    Override,
    Replace,
}

impl Default for ResourceConflictPolicy {
    fn default() -> Self {
        ResourceConflictPolicy::Reject
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sasl {
    #[serde(default)]
    pub mechanisms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct C2sSettings {
    pub id: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_stanza_size")]
    pub max_stanza_size: usize,
    #[serde(default)]
    pub resource_conflict: ResourceConflictPolicy,
    #[serde(default = "default_compression_enabled")]
    pub compression_enabled: bool,
    #[serde(default)]
    pub keepalive: KeepaliveSettings,
    pub port: u16,
}

/// Whitespace-ping-style keep-alive isn't enough once a stream sits idle
/// behind a NAT box that silently drops it; this arms an XEP-0199 ping after
/// `send_interval_secs` of inactivity and disconnects the stream if no pong
/// answers within a third of that interval.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct KeepaliveSettings {
    #[serde(default = "default_keepalive_send")]
    pub send: bool,
    #[serde(default = "default_keepalive_send_interval_secs")]
    pub send_interval_secs: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        KeepaliveSettings {
            send: default_keepalive_send(),
            send_interval_secs: default_keepalive_send_interval_secs(),
        }
    }
}

fn default_keepalive_send() -> bool {
    true
}

fn default_keepalive_send_interval_secs() -> u64 {
    300
}

fn default_compression_enabled() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_stanza_size() -> usize {
    262_144
}

#[derive(Debug, Clone, Deserialize)]
pub struct S2sSettings {
    pub dialback_secret: String,
    #[serde(default = "default_s2s_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_s2s_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_max_stanza_size")]
    pub max_stanza_size: usize,
}

fn default_s2s_timeout_secs() -> u64 {
    60
}

fn default_s2s_keep_alive_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    #[serde(deserialize_with = "deserialize_jid")]
    pub domain: Jid,
    pub tls: TlsSettings,
    pub pid_path: Option<String>,
    #[serde(default)]
    pub debug: DebugSettings,
    #[serde(default)]
    pub logger: LoggerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub hosts: Vec<HostSettings>,
    #[serde(default)]
    pub modules: ModulesSettings,
    #[serde(default)]
    pub c2s: Vec<C2sSettings>,
    pub s2s: Option<S2sSettings>,
}

impl Settings {
    pub fn init() -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/defaults"))
            .add_source(config::File::with_name("config/overrides"))
            .add_source(config::Environment::with_prefix("CONFIDANTE").separator("__"))
            .build()?;

        let settings = settings.try_deserialize().map_err(|e| anyhow!(e))?;

        Ok(settings)
    }
}

fn load_certificate_chain<'d, D: Deserializer<'d>>(
    deserializer: D,
) -> Result<Vec<CertificateDer<'static>>, D::Error> {
    let cert_path = String::deserialize(deserializer)?;
    let cert_file = &mut BufReader::new(File::open(cert_path).map_err(serde::de::Error::custom)?);
    let cert_chain = certs(cert_file).map(|result| result.unwrap()).collect();

    Ok(cert_chain)
}

fn load_private_key<'d, D: Deserializer<'d>>(
    deserializer: D,
) -> Result<PrivateKeyDer<'static>, D::Error> {
    let key_path = String::deserialize(deserializer)?;
    let key_file = &mut BufReader::new(File::open(key_path).map_err(serde::de::Error::custom)?);
    let key_der = pkcs8_private_keys(key_file)
        .map(|result| result.unwrap())
        .collect::<Vec<_>>()
        .remove(0);

    Ok(Pkcs8(key_der))
}

fn native_root_cert_store() -> Result<RootCertStore, Error> {
    let mut root_cert_store = RootCertStore::empty();
    for cert in load_native_certs().certs {
        root_cert_store.add(cert).map_err(|err| anyhow!(err))?;
    }
    Ok(root_cert_store)
}

fn build_server_config(config: TlsConfig) -> Result<Arc<ServerConfig>, Error> {
    let client_cert_verifier = WebPkiClientVerifier::builder(Arc::new(native_root_cert_store()?))
        .allow_unauthenticated()
        .build()
        .map_err(|err| anyhow!(err))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(config.certificate_chain, config.private_key)?;

    Ok(Arc::new(config))
}

fn build_client_config(config: TlsConfig) -> Result<Arc<ClientConfig>, Error> {
    let config = ClientConfig::builder()
        .with_root_certificates(native_root_cert_store()?)
        .with_client_auth_cert(config.certificate_chain, config.private_key)?;

    Ok(Arc::new(config))
}

fn deserialize_jid<'d, D: Deserializer<'d>>(
    deserializer: D,
) -> Result<Jid, D::Error> {
    let raw_jid = String::deserialize(deserializer)?;
    raw_jid
        .parse::<Jid>()
        .map_err(serde::de::Error::custom)
}

impl LoggerSettings {
    /// Installs the global tracing subscriber. Returns the file appender guard
    /// (if `log_path` is set); dropping it stops the non-blocking writer.
    pub fn init_tracing(&self) -> Option<tracing_appender::non_blocking::WorkerGuard> {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(match self.level {
                LogLevel::Debug => "debug",
                LogLevel::Info => "info",
                LogLevel::Warning => "warn",
                LogLevel::Error | LogLevel::Fatal => "error",
            })
        });

        match &self.log_path {
            Some(log_path) => {
                let file_appender = tracing_appender::rolling::daily(".", log_path);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
                Some(guard)
            }
            None => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
                None
            }
        }
    }
}
