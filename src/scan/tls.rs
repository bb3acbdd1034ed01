use crate::error::ScanError;
use crate::neighborhood::accumulate;
use crate::scanner::Scanner;
use crate::target::{Host, lookup_ipv4};
use crate::types::{AppState, OutcomeData, ScanKind, ScanStatus, ScanTask};
use async_trait::async_trait;
use futures::{StreamExt, future};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ProtocolVersion, SignatureScheme};
use serde::Serialize;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::parse_x509_certificate;

const DEFAULT_TLS_CONCURRENCY: usize = 64;
const ALPN_H2: &str = "h2";
const ALPN_HTTP11: &str = "http/1.1";
const ISSUER_SEPARATOR: &str = " | ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1.2")]
    V1_2,
    #[serde(rename = "TLSv1.3")]
    V1_3,
    #[serde(rename = "unknown")]
    Unknown,
}

impl TlsVersion {
    /// Newest protocol version the prober can negotiate.
    pub const LATEST: TlsVersion = TlsVersion::V1_3;

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::V1_2 => "TLSv1.2",
            TlsVersion::V1_3 => "TLSv1.3",
            TlsVersion::Unknown => "unknown",
        }
    }
}

impl From<ProtocolVersion> for TlsVersion {
    fn from(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::TLSv1_2 => TlsVersion::V1_2,
            ProtocolVersion::TLSv1_3 => TlsVersion::V1_3,
            _ => TlsVersion::Unknown,
        }
    }
}

/// Parameters read back from a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub version: Option<TlsVersion>,
    pub protocol: String,
    pub common_name: String,
    pub issuer_org: String,
}

impl NegotiatedSession {
    fn from_connection(conn: &rustls::ClientConnection, target: &str) -> Result<Self, ScanError> {
        let leaf = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| ScanError::handshake(target, "peer presented no certificate"))?;

        let (common_name, issuer_org) = certificate_names(leaf)
            .map_err(|reason| ScanError::handshake(target, reason))?;

        let protocol = conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();

        Ok(Self {
            version: conn.protocol_version().map(TlsVersion::from),
            protocol,
            common_name,
            issuer_org,
        })
    }

    /// Latest version, ALPN `h2`, and both certificate names populated.
    pub fn is_feasible(&self) -> bool {
        self.version == Some(TlsVersion::LATEST)
            && self.protocol == ALPN_H2
            && !self.common_name.is_empty()
            && !self.issuer_org.is_empty()
    }
}

/// Subject CN and issuer O values of a DER certificate.
fn certificate_names(der: &CertificateDer<'_>) -> Result<(String, String), String> {
    let (_, cert) = parse_x509_certificate(der.as_ref())
        .map_err(|e| format!("unparseable peer certificate: {}", e))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let issuer_org = cert
        .issuer()
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .collect::<Vec<_>>()
        .join(ISSUER_SEPARATOR);

    Ok((common_name, issuer_org))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub ip: Ipv4Addr,
    pub origin: String,
    pub port: u16,
    pub negotiated_protocol: String,
    pub tls_version: Option<TlsVersion>,
    pub peer_common_name: String,
    pub peer_issuer_org: String,
    pub feasible: bool,
    pub elapsed_ms: u64,
}

impl ProbeResult {
    pub fn from_session(host: &Host, ip: Ipv4Addr, session: NegotiatedSession, elapsed: Duration) -> Self {
        let feasible = session.is_feasible();
        Self {
            ip,
            origin: host.origin.clone(),
            port: host.port,
            negotiated_protocol: session.protocol,
            tls_version: session.version,
            peer_common_name: session.common_name,
            peer_issuer_org: session.issuer_org,
            feasible,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn to_data(&self) -> OutcomeData {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => OutcomeData::new(),
        }
    }
}

/// Accepts any server certificate.
///
/// Feasibility is about reachability and ALPN support, not trust, so the
/// chain is never validated. Handshake signatures are still checked so the
/// peer must hold the key for the certificate it sent.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// An IP server name makes rustls omit SNI.
fn server_name_for(ip: Ipv4Addr, sni: Option<&str>) -> Result<ServerName<'static>, String> {
    match sni {
        Some(name) => ServerName::try_from(name.to_string())
            .map_err(|e| format!("invalid server name {}: {}", name, e)),
        None => Ok(ServerName::IpAddress(IpAddr::V4(ip).into())),
    }
}

/// SNI for the `index`-th expanded host of `origin`.
///
/// The walk emits the resolved seed first, so a named origin keeps its name
/// on that handshake. Neighbours are not that name and go without SNI.
fn seed_server_name(origin: &Host, index: usize) -> Option<String> {
    (index == 0 && origin.is_named()).then(|| origin.origin.clone())
}

/// Running totals over the probes of one task.
#[derive(Debug, Default)]
struct ScanTally {
    probed: usize,
    reachable: usize,
    feasible_hosts: Vec<Ipv4Addr>,
}

impl ScanTally {
    fn add(mut self, result: &Result<ProbeResult, ScanError>) -> Self {
        self.probed += 1;
        if let Ok(probe) = result {
            self.reachable += 1;
            if probe.feasible {
                self.feasible_hosts.push(probe.ip);
            }
        }
        self
    }
}

/// Performs one TLS handshake per call and classifies the endpoint.
#[derive(Clone)]
pub struct TlsProber {
    connector: TlsConnector,
}

impl TlsProber {
    pub fn new() -> Result<Self, rustls::Error> {
        // X25519 is the only key exchange group offered.
        let provider = Arc::new(CryptoProvider {
            kx_groups: vec![ring::kx_group::X25519],
            ..ring::default_provider()
        });

        let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_H2.as_bytes().to_vec(), ALPN_HTTP11.as_bytes().to_vec()];

        log::debug!("[scan::tls] prober_created: alpn=[{}, {}] kx=x25519 verify=disabled",
            ALPN_H2, ALPN_HTTP11);
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Handshake with `host` and derive its feasibility.
    ///
    /// Feasible and infeasible endpoints are both `Ok`; only resolution,
    /// dial and handshake failures are errors.
    pub async fn probe(&self, host: &Host, timeout: Duration) -> Result<ProbeResult, ScanError> {
        let sni = match host.address {
            None => Some(host.origin.as_str()),
            Some(_) => None,
        };
        self.probe_as(host, sni, timeout).await
    }

    /// Same as [`TlsProber::probe`] but presents `sni` as the server name
    /// when given; otherwise the IP is used and no SNI is sent.
    pub async fn probe_as(&self, host: &Host, sni: Option<&str>, timeout: Duration) -> Result<ProbeResult, ScanError> {
        let start = Instant::now();

        let ip = match host.address {
            Some(ip) => ip,
            None => lookup_ipv4(&host.origin).await?,
        };
        let addr = SocketAddr::new(IpAddr::V4(ip), host.port);
        log::debug!("[scan::tls] probe: host={} addr={} timeout={}s", host.origin, addr, timeout.as_secs());

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ScanError::dial(addr, e)),
            Err(_) => return Err(ScanError::dial(addr, format!("timed out after {:?}", timeout))),
        };

        let deadline = tokio::time::Instant::now() + timeout;

        let server_name = server_name_for(ip, sni)
            .map_err(|reason| ScanError::handshake(addr, reason))?;

        let tls_stream = match tokio::time::timeout_at(deadline, self.connector.connect(server_name, stream)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => {
                log::debug!("[scan::tls] handshake_failed: addr={} error={}", addr, e);
                return Err(ScanError::handshake(addr, e));
            }
            Err(_) => return Err(ScanError::handshake(addr, format!("timed out after {:?}", timeout))),
        };

        let (_, connection) = tls_stream.get_ref();
        let session = NegotiatedSession::from_connection(connection, &addr.to_string())?;
        drop(tls_stream);

        let result = ProbeResult::from_session(host, ip, session, start.elapsed());
        if result.feasible {
            log::info!("[scan::tls] feasible: addr={} cn={} issuer={}",
                addr, result.peer_common_name, result.peer_issuer_org);
        } else {
            log::debug!("[scan::tls] not_feasible: addr={} version={:?} alpn={} cn={}",
                addr, result.tls_version, result.negotiated_protocol, result.peer_common_name);
        }
        Ok(result)
    }
}

/// Expands each task into its neighborhood and probes every host.
pub struct TlsScanner {
    prober: TlsProber,
    max_concurrent: usize,
    poll_interval: Duration,
}

impl TlsScanner {
    pub fn new(prober: TlsProber) -> Self {
        Self {
            prober,
            max_concurrent: DEFAULT_TLS_CONCURRENCY,
            poll_interval: Duration::from_secs(crate::scanner::DEFAULT_POLL_INTERVAL_SECS),
        }
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn follow_up(&self, state: &AppState, task: &ScanTask, result: &ProbeResult) {
        let host = task.host.with_address(result.ip);
        let ping = ScanTask {
            kind: ScanKind::Ping,
            host,
            timeout: task.timeout,
            depth: 0,
        };
        if let Err(e) = state.queues.enqueue(ScanKind::Ping, ping) {
            log::warn!("[scan::tls] follow_up_dropped: ip={} error={}", result.ip, e);
        }
    }
}

#[async_trait]
impl Scanner for TlsScanner {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn kind(&self) -> ScanKind {
        ScanKind::Tls
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn scan(&self, task: &ScanTask, state: &AppState) -> Result<OutcomeData, ScanError> {
        let start = Instant::now();
        let neighborhood = accumulate(&task.host.origin, task.host.port, task.depth).await?;

        let mut tally = neighborhood
            .enumerate()
            .map(|(index, host)| {
                let prober = self.prober.clone();
                let sni = seed_server_name(&task.host, index);
                async move { prober.probe_as(&host, sni.as_deref(), task.timeout).await }
            })
            .buffer_unordered(self.max_concurrent)
            .fold(ScanTally::default(), |tally, result| {
                match &result {
                    Ok(probe) => {
                        state.outcomes.record(self.name(), ScanStatus::Completed, probe.to_data());
                        if probe.feasible {
                            self.follow_up(state, task, probe);
                        }
                    }
                    Err(e) => log::debug!("[scan::tls] probe_failed: origin={} error={}", task.host.origin, e),
                }
                future::ready(tally.add(&result))
            })
            .await;

        tally.feasible_hosts.sort();
        let ScanTally { probed, reachable, feasible_hosts } = tally;

        log::info!("[scan::tls] scan_completed: origin={} probed={} reachable={} feasible={} duration={}ms",
            task.host.origin, probed, reachable, feasible_hosts.len(), start.elapsed().as_millis());

        let mut data = OutcomeData::new();
        data.insert("origin".to_string(), json!(task.host.origin));
        data.insert("probed".to_string(), json!(probed));
        data.insert("reachable".to_string(), json!(reachable));
        data.insert("failed".to_string(), json!(probed - reachable));
        data.insert("feasible".to_string(), json!(feasible_hosts.len()));
        data.insert("feasible_hosts".to_string(), json!(feasible_hosts));
        data.insert("elapsed_ms".to_string(), json!(start.elapsed().as_millis() as u64));
        Ok(data)
    }
}
