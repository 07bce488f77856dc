//! # Certificate authority
//!
//! [`CertificateAuthority`] owns the mesh's PKI root: a 4096-bit RSA key
//! and a ten-year self-signed root certificate, stored under
//! `<root>/{ca.key, ca.crt}` with issued certificates in `issued/<serial>.crt`
//! and the revocation list in `crl.pem`. All files are written atomically
//! (temp file + rename). A corrupted or missing key on a non-empty root
//! directory aborts startup.
//!
//! [`ChaskiCa`] exposes the authority over the mesh: it answers
//! `ca_request_certificate` (signing a provided CSR, or generating key and
//! certificate on the requester's behalf), `ca_revoke`, and `ca_get_crl`.
//! Issued certificates are valid one year and carry SAN entries for the
//! requester's IP and common name.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams,
    CertificateSigningRequestParams, DistinguishedName, DnType, DnValue, IsCa, KeyIdMethod,
    KeyPair, KeyUsagePurpose, RevokedCertParams, SanType, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{info, warn};
use x509_parser::prelude::FromDer;

use crate::address::{Address, ConnectTarget, NodeClass};
use crate::messages::{CaCertificateRequest, CaCertificateResponse, Command};
use crate::node::{ChaskiNode, NodeConfig, NodeError, NodeRole};
use crate::tls::TlsSettings;

/// Root key strength. Issued node keys use half of this.
pub const ROOT_KEY_BITS: usize = 4096;
const NODE_KEY_BITS: usize = 2048;

/// Root certificate lifetime: ten years.
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Issued certificate lifetime: one year.
const ISSUED_VALIDITY_DAYS: i64 = 365;

/// Subject attributes stamped into certificates. Keys of the wire-level
/// `subject` map use the same spelled-out names.
#[derive(Debug, Clone)]
pub struct CaAttributes {
    pub country: String,
    pub state_or_province: String,
    pub locality: String,
    pub organization: String,
    pub common_name: String,
}

impl Default for CaAttributes {
    fn default() -> Self {
        Self {
            country: "CO".into(),
            state_or_province: "Caldas".into(),
            locality: "Manizales".into(),
            organization: "DunderLab".into(),
            common_name: "Chaski-Confluent".into(),
        }
    }
}

impl CaAttributes {
    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, DnValue::Utf8String(self.country.clone()));
        dn.push(
            DnType::StateOrProvinceName,
            DnValue::Utf8String(self.state_or_province.clone()),
        );
        dn.push(DnType::LocalityName, DnValue::Utf8String(self.locality.clone()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(self.organization.clone()),
        );
        dn.push(DnType::CommonName, DnValue::Utf8String(self.common_name.clone()));
        dn
    }

    /// Wire form, as carried by `ca_request_certificate`.
    pub fn to_subject_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Country Name".to_string(), self.country.clone()),
            (
                "State or Province Name".to_string(),
                self.state_or_province.clone(),
            ),
            ("Locality Name".to_string(), self.locality.clone()),
            ("Organization Name".to_string(), self.organization.clone()),
            ("Common Name".to_string(), self.common_name.clone()),
        ])
    }
}

fn subject_to_distinguished_name(subject: &BTreeMap<String, String>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    for (key, value) in subject {
        let ty = match key.as_str() {
            "Country Name" => DnType::CountryName,
            "State or Province Name" => DnType::StateOrProvinceName,
            "Locality Name" => DnType::LocalityName,
            "Organization Name" => DnType::OrganizationName,
            "Common Name" => DnType::CommonName,
            _ => continue,
        };
        dn.push(ty, DnValue::Utf8String(value.clone()));
    }
    dn
}

struct RevokedEntry {
    serial: Vec<u8>,
    revoked_at: OffsetDateTime,
}

struct CrlState {
    revoked: Vec<RevokedEntry>,
    crl_number: u64,
}

/// The root of trust. Thread-safe: issuance and revocation may run from
/// blocking worker threads.
pub struct CertificateAuthority {
    root_dir: PathBuf,
    attributes: CaAttributes,
    issuer_key: KeyPair,
    issuer_cert: Certificate,
    root_pem: String,
    crl: Mutex<CrlState>,
}

impl CertificateAuthority {
    /// Load the CA from `root_dir`, generating the root key and certificate
    /// on first start. `key_bits` below 2048 is rejected.
    pub fn open(
        root_dir: impl Into<PathBuf>,
        attributes: CaAttributes,
        key_bits: usize,
    ) -> Result<Arc<Self>> {
        if key_bits < 2048 {
            bail!("CA key must be at least 2048 bits");
        }
        let root_dir = root_dir.into();
        std::fs::create_dir_all(root_dir.join("issued"))
            .with_context(|| format!("cannot create CA directory {}", root_dir.display()))?;

        let key_path = root_dir.join("ca.key");
        let cert_path = root_dir.join("ca.crt");

        let (issuer_key, issuer_cert, root_pem) = if key_path.exists() {
            let key_pem = std::fs::read_to_string(&key_path)
                .with_context(|| format!("cannot read {}", key_path.display()))?;
            let issuer_key = KeyPair::from_pem(&key_pem)
                .with_context(|| format!("corrupted CA key in {}", key_path.display()))?;
            let root_pem = std::fs::read_to_string(&cert_path)
                .with_context(|| format!("cannot read {}", cert_path.display()))?;
            let params = CertificateParams::from_ca_cert_pem(&root_pem)
                .with_context(|| format!("corrupted CA certificate in {}", cert_path.display()))?;
            // Re-derive an issuer handle for signing; subject and key match
            // the on-disk root, so issued chains validate against it.
            let issuer_cert = params
                .self_signed(&issuer_key)
                .context("cannot rebuild CA issuer state")?;
            info!(dir = %root_dir.display(), "loaded existing certificate authority");
            (issuer_key, issuer_cert, root_pem)
        } else {
            info!(
                dir = %root_dir.display(),
                bits = key_bits,
                "generating certificate authority root"
            );
            let rsa_key = RsaPrivateKey::new(&mut OsRng, key_bits)
                .context("RSA root key generation failed")?;
            let key_pem = rsa_key
                .to_pkcs8_pem(LineEnding::LF)
                .context("cannot serialize root key")?;
            let issuer_key =
                KeyPair::from_pem(&key_pem).context("generated root key rejected")?;

            let mut params = CertificateParams::new(Vec::new())
                .context("cannot build root certificate params")?;
            params.distinguished_name = attributes.distinguished_name();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            let now = OffsetDateTime::now_utc();
            params.not_before = now;
            params.not_after = now + TimeDuration::days(ROOT_VALIDITY_DAYS);
            params.serial_number = Some(random_serial());

            let issuer_cert = params
                .self_signed(&issuer_key)
                .context("cannot self-sign root certificate")?;
            let root_pem = issuer_cert.pem();

            write_atomic(&key_path, key_pem.as_bytes())?;
            write_atomic(&cert_path, root_pem.as_bytes())?;
            (issuer_key, issuer_cert, root_pem)
        };

        let crl = Mutex::new(load_crl_state(&root_dir.join("crl.pem"))?);
        let ca = Arc::new(Self {
            root_dir,
            attributes,
            issuer_key,
            issuer_cert,
            root_pem,
            crl,
        });
        // Make sure crl.pem exists even before the first revocation, so
        // nodes can fetch a (still empty) list right away.
        if !ca.crl_path().exists() {
            ca.rewrite_crl()?;
        }
        Ok(ca)
    }

    pub fn ca_certificate_path(&self) -> PathBuf {
        self.root_dir.join("ca.crt")
    }

    pub fn ca_private_key_path(&self) -> PathBuf {
        self.root_dir.join("ca.key")
    }

    pub fn crl_path(&self) -> PathBuf {
        self.root_dir.join("crl.pem")
    }

    pub fn root_certificate_pem(&self) -> &str {
        &self.root_pem
    }

    pub fn attributes(&self) -> &CaAttributes {
        &self.attributes
    }

    /// Serve one `ca_request_certificate`.
    pub fn issue(&self, request: CaCertificateRequest) -> Result<CaCertificateResponse> {
        let ip: IpAddr = request
            .ip
            .parse()
            .with_context(|| format!("malformed requester IP {:?}", request.ip))?;
        let serial = random_serial();
        let serial_hex = hex::encode(serial.as_ref());
        let now = OffsetDateTime::now_utc();
        let not_after = now + TimeDuration::days(ISSUED_VALIDITY_DAYS);

        let common_name = request
            .subject
            .get("Common Name")
            .cloned()
            .unwrap_or_else(|| self.attributes.common_name.clone());

        let (certificate_pem, private_key_pem) = match &request.csr_pem {
            Some(csr_pem) => {
                let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
                    .context("malformed CSR")?;
                csr.params.not_before = now;
                csr.params.not_after = not_after;
                csr.params.serial_number = Some(serial.clone());
                csr.params.subject_alt_names.push(SanType::IpAddress(ip));
                if let Ok(name) = common_name.clone().try_into() {
                    csr.params.subject_alt_names.push(SanType::DnsName(name));
                }
                let cert = csr
                    .signed_by(&self.issuer_cert, &self.issuer_key)
                    .context("CSR signing failed")?;
                (cert.pem(), None)
            }
            None => {
                // Generate the key on the requester's behalf.
                let rsa_key = RsaPrivateKey::new(&mut OsRng, NODE_KEY_BITS)
                    .context("node key generation failed")?;
                let key_pem = rsa_key
                    .to_pkcs8_pem(LineEnding::LF)
                    .context("cannot serialize node key")?;
                let key_pair =
                    KeyPair::from_pem(&key_pem).context("generated node key rejected")?;

                let mut params =
                    CertificateParams::new(Vec::new()).context("cannot build params")?;
                params.distinguished_name = subject_to_distinguished_name(&request.subject);
                params.not_before = now;
                params.not_after = not_after;
                params.serial_number = Some(serial.clone());
                params.subject_alt_names.push(SanType::IpAddress(ip));
                if let Ok(name) = common_name.clone().try_into() {
                    params.subject_alt_names.push(SanType::DnsName(name));
                }
                let cert = params
                    .signed_by(&key_pair, &self.issuer_cert, &self.issuer_key)
                    .context("certificate signing failed")?;
                (cert.pem(), Some(key_pem.to_string()))
            }
        };

        write_atomic(
            &self.root_dir.join("issued").join(format!("{serial_hex}.crt")),
            certificate_pem.as_bytes(),
        )?;
        info!(serial = %serial_hex, ip = %ip, "issued certificate");

        Ok(CaCertificateResponse {
            certificate_pem,
            root_certificate_pem: self.root_pem.clone(),
            private_key_pem,
            serial: serial_hex,
        })
    }

    /// Append `serial` (hex) to the CRL and re-serialize `crl.pem`.
    pub fn revoke(&self, serial_hex: &str) -> Result<()> {
        let serial = hex::decode(serial_hex)
            .with_context(|| format!("malformed serial {serial_hex:?}"))?;
        {
            let mut state = self.crl.lock().expect("CRL state poisoned");
            if state.revoked.iter().any(|r| r.serial == serial) {
                return Ok(()); // already revoked
            }
            state.revoked.push(RevokedEntry {
                serial,
                revoked_at: OffsetDateTime::now_utc(),
            });
        }
        self.rewrite_crl()?;
        warn!(serial = %serial_hex, "certificate revoked");
        Ok(())
    }

    /// Current CRL, PEM-encoded.
    pub fn crl_pem(&self) -> Result<String> {
        std::fs::read_to_string(self.crl_path()).context("cannot read crl.pem")
    }

    pub fn revoked_count(&self) -> usize {
        self.crl.lock().expect("CRL state poisoned").revoked.len()
    }

    fn rewrite_crl(&self) -> Result<()> {
        let pem = {
            let mut state = self.crl.lock().expect("CRL state poisoned");
            state.crl_number += 1;
            let now = OffsetDateTime::now_utc();
            let params = CertificateRevocationListParams {
                this_update: now,
                next_update: now + TimeDuration::days(30),
                crl_number: SerialNumber::from(state.crl_number),
                issuing_distribution_point: None,
                revoked_certs: state
                    .revoked
                    .iter()
                    .map(|entry| RevokedCertParams {
                        serial_number: SerialNumber::from(entry.serial.clone()),
                        revocation_time: entry.revoked_at,
                        reason_code: Some(rcgen::RevocationReason::CessationOfOperation),
                        invalidity_date: None,
                    })
                    .collect(),
                key_identifier_method: KeyIdMethod::Sha256,
            };
            params
                .signed_by(&self.issuer_cert, &self.issuer_key)
                .context("CRL signing failed")?
                .pem()
                .context("CRL serialization failed")?
        };
        write_atomic(&self.crl_path(), pem.as_bytes())
    }
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Clear the sign bit so the DER integer stays positive.
    bytes[0] &= 0x7F;
    SerialNumber::from(bytes.to_vec())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("cannot write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("cannot move {} into place", path.display()))?;
    Ok(())
}

fn load_crl_state(path: &Path) -> Result<CrlState> {
    let mut state = CrlState {
        revoked: Vec::new(),
        crl_number: 0,
    };
    let pem = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
    };
    let (_, parsed) =
        x509_parser::pem::parse_x509_pem(&pem).map_err(|e| anyhow::anyhow!("bad CRL PEM: {e}"))?;
    let (_, crl) =
        x509_parser::revocation_list::CertificateRevocationList::from_der(&parsed.contents)
            .map_err(|e| anyhow::anyhow!("bad CRL: {e}"))?;
    for revoked in crl.iter_revoked_certificates() {
        let revoked_at = OffsetDateTime::from_unix_timestamp(revoked.revocation_date.timestamp())
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        state.revoked.push(RevokedEntry {
            serial: revoked.raw_serial().to_vec(),
            revoked_at,
        });
    }
    state.crl_number = state.revoked.len() as u64;
    Ok(state)
}

/// A node serving the certificate authority over the mesh.
#[derive(Clone)]
pub struct ChaskiCa {
    node: ChaskiNode,
    ca: Arc<CertificateAuthority>,
}

impl ChaskiCa {
    pub async fn start(
        config: NodeConfig,
        ca_root: impl Into<PathBuf>,
        attributes: CaAttributes,
    ) -> Result<Self, NodeError> {
        Self::start_with_key_bits(config, ca_root, attributes, ROOT_KEY_BITS).await
    }

    /// Like [`start`](Self::start) with a configurable root key size
    /// (smaller keys keep tests fast).
    pub async fn start_with_key_bits(
        config: NodeConfig,
        ca_root: impl Into<PathBuf>,
        attributes: CaAttributes,
        key_bits: usize,
    ) -> Result<Self, NodeError> {
        let ca_root = ca_root.into();
        let ca = tokio::task::spawn_blocking(move || {
            CertificateAuthority::open(ca_root, attributes, key_bits)
        })
        .await
        .map_err(|e| NodeError::Startup(e.to_string()))?
        .map_err(|e| NodeError::Startup(format!("{e:#}")))?;

        let node =
            ChaskiNode::start_with_role(config, NodeClass::Ca, NodeRole::Ca(ca.clone())).await?;
        Ok(Self { node, ca })
    }

    pub fn node(&self) -> &ChaskiNode {
        &self.node
    }

    pub fn address(&self) -> &Address {
        self.node.address()
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub async fn stop(&self) {
        self.node.stop().await;
    }
}

impl ChaskiNode {
    /// Obtain TLS material from a CA node and store it under
    /// `<ssl_location>/{node.key, node.crt, ca.crt, crl.pem}`.
    pub async fn request_ssl_certificate(
        &self,
        ca_address: &str,
        ssl_location: impl AsRef<Path>,
    ) -> Result<TlsSettings, NodeError> {
        let target: ConnectTarget = ca_address
            .parse()
            .map_err(|e| NodeError::Other(format!("invalid CA address: {e}")))?;
        let ca_addr = target.address.clone();
        self.connect_target(target).await?;

        let request = CaCertificateRequest {
            subject: CaAttributes::default().to_subject_map(),
            ip: self.address().host.clone(),
            csr_pem: None,
        };
        let response = self
            .request(&ca_addr, Command::CaRequestCertificate(request))
            .await?;
        let issued = match response.command {
            Command::CaRequestCertificateResponse(r) if !r.certificate_pem.is_empty() => r,
            Command::CaRequestCertificateResponse(r) => {
                return Err(NodeError::Other(format!("CA refused: {}", r.serial)));
            }
            _ => return Err(NodeError::UnexpectedResponse("ca_request_certificate")),
        };

        let crl_response = self.request(&ca_addr, Command::CaGetCrl).await?;
        let crl_pem = match crl_response.command {
            Command::CaGetCrlResponse { crl_pem } => crl_pem,
            _ => return Err(NodeError::UnexpectedResponse("ca_get_crl")),
        };

        let settings = TlsSettings::from_location(&ssl_location);
        let write = |path: &Path, bytes: &[u8]| -> Result<(), NodeError> {
            write_atomic(path, bytes).map_err(|e| NodeError::Other(format!("{e:#}")))
        };
        std::fs::create_dir_all(ssl_location.as_ref())
            .map_err(|e| NodeError::Other(e.to_string()))?;
        let key_pem = issued
            .private_key_pem
            .ok_or(NodeError::UnexpectedResponse("missing private key"))?;
        write(&settings.key_path, key_pem.as_bytes())?;
        write(&settings.certificate_path, issued.certificate_pem.as_bytes())?;
        write(
            &settings.ca_certificate_path,
            issued.root_certificate_pem.as_bytes(),
        )?;
        write(&settings.crl_path, crl_pem.as_bytes())?;

        let _ = self.disconnect(&ca_addr).await;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_ca(dir: &Path) -> Arc<CertificateAuthority> {
        CertificateAuthority::open(dir, CaAttributes::default(), 2048).unwrap()
    }

    #[test]
    fn first_start_writes_root_material() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        assert!(ca.ca_certificate_path().exists());
        assert!(ca.ca_private_key_path().exists());
        assert!(ca.crl_path().exists());

        let (_, pem) =
            x509_parser::pem::parse_x509_pem(&std::fs::read(ca.ca_certificate_path()).unwrap())
                .unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(cert
            .subject()
            .iter_common_name()
            .any(|cn| cn.as_str().unwrap() == "Chaski-Confluent"));
        let is_ca = cert
            .basic_constraints()
            .unwrap()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);
        assert!(is_ca, "root certificate must carry CA basic constraints");
    }

    #[test]
    fn restart_loads_same_root() {
        let dir = tempfile::tempdir().unwrap();
        let first_pem = open_test_ca(dir.path()).root_certificate_pem().to_string();
        let second_pem = open_test_ca(dir.path()).root_certificate_pem().to_string();
        assert_eq!(first_pem, second_pem);
    }

    #[test]
    fn corrupted_key_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        open_test_ca(dir.path());
        std::fs::write(dir.path().join("ca.key"), b"not a key").unwrap();
        assert!(CertificateAuthority::open(dir.path(), CaAttributes::default(), 2048).is_err());
    }

    #[test]
    fn issues_certificate_with_generated_key() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());

        let response = ca
            .issue(CaCertificateRequest {
                subject: CaAttributes::default().to_subject_map(),
                ip: "127.0.0.1".into(),
                csr_pem: None,
            })
            .unwrap();

        assert!(response.private_key_pem.is_some());
        assert!(dir
            .path()
            .join("issued")
            .join(format!("{}.crt", response.serial))
            .exists());

        let (_, pem) =
            x509_parser::pem::parse_x509_pem(response.certificate_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(cert
            .issuer()
            .iter_common_name()
            .any(|cn| cn.as_str().unwrap() == "Chaski-Confluent"));
        assert_eq!(hex::encode(cert.raw_serial()), response.serial);
    }

    #[test]
    fn signs_provided_csr() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());

        let requester_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = CaAttributes::default().distinguished_name();
        let csr_pem = params
            .serialize_request(&requester_key)
            .unwrap()
            .pem()
            .unwrap();

        let response = ca
            .issue(CaCertificateRequest {
                subject: CaAttributes::default().to_subject_map(),
                ip: "10.0.0.9".into(),
                csr_pem: Some(csr_pem),
            })
            .unwrap();
        // Signing a provided CSR never discloses a key.
        assert!(response.private_key_pem.is_none());

        let (_, pem) =
            x509_parser::pem::parse_x509_pem(response.certificate_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let sans: Vec<String> = cert
            .subject_alternative_name()
            .unwrap()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .map(|n| format!("{n:?}"))
                    .collect()
            })
            .unwrap_or_default();
        assert!(sans.iter().any(|n| n.contains("10.0.0.9")), "sans: {sans:?}");
    }

    #[test]
    fn revocation_lands_in_crl() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        let response = ca
            .issue(CaCertificateRequest {
                subject: CaAttributes::default().to_subject_map(),
                ip: "127.0.0.1".into(),
                csr_pem: None,
            })
            .unwrap();

        ca.revoke(&response.serial).unwrap();
        assert_eq!(ca.revoked_count(), 1);
        // Revoking twice is a no-op.
        ca.revoke(&response.serial).unwrap();
        assert_eq!(ca.revoked_count(), 1);

        let crl_pem = ca.crl_pem().unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(crl_pem.as_bytes()).unwrap();
        let (_, crl) =
            x509_parser::revocation_list::CertificateRevocationList::from_der(&pem.contents)
                .unwrap();
        let serials: Vec<String> = crl
            .iter_revoked_certificates()
            .map(|r| hex::encode(r.raw_serial()))
            .collect();
        assert_eq!(serials, vec![response.serial]);
    }

    #[test]
    fn crl_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let serial = {
            let ca = open_test_ca(dir.path());
            let response = ca
                .issue(CaCertificateRequest {
                    subject: CaAttributes::default().to_subject_map(),
                    ip: "127.0.0.1".into(),
                    csr_pem: None,
                })
                .unwrap();
            ca.revoke(&response.serial).unwrap();
            response.serial
        };

        let reloaded = open_test_ca(dir.path());
        assert_eq!(reloaded.revoked_count(), 1);
        assert!(reloaded.crl_pem().unwrap().len() > 0);
        // The reloaded list still names the same serial.
        let crl_pem = reloaded.crl_pem().unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(crl_pem.as_bytes()).unwrap();
        let (_, crl) =
            x509_parser::revocation_list::CertificateRevocationList::from_der(&pem.contents)
                .unwrap();
        assert!(crl
            .iter_revoked_certificates()
            .any(|r| hex::encode(r.raw_serial()) == serial));
    }
}
