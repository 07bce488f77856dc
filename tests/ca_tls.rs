//! Certificate authority over the wire: issuance, CRL distribution, and
//! revocation-driven TLS rejection.
//!
//! The CA root key is 2048-bit here to keep key generation fast; the
//! production default is 4096.

use std::time::Duration;

use chaski::messages::Command;
use chaski::{CaAttributes, ChaskiCa, ChaskiNode, NodeConfig, TlsSettings};

mod util;
use util::wait_until;

fn node_config(name: &str) -> NodeConfig {
    let mut config = NodeConfig::default()
        .with_name(name)
        .with_reconnections(None);
    // RSA generation on the CA side can be slow in unoptimized builds.
    config.request_timeout = Duration::from_secs(120);
    config
}

async fn start_test_ca(dir: &std::path::Path) -> ChaskiCa {
    ChaskiCa::start_with_key_bits(
        node_config("ChaskiCA"),
        dir,
        CaAttributes::default(),
        2048,
    )
    .await
    .unwrap()
}

fn cert_serial_hex(cert_path: &std::path::Path) -> String {
    let pem = std::fs::read(cert_path).unwrap();
    let (_, parsed) = x509_parser::pem::parse_x509_pem(&pem).unwrap();
    let cert = parsed.parse_x509().unwrap();
    hex::encode(cert.raw_serial())
}

fn cert_issuer_cn(cert_path: &std::path::Path) -> String {
    let pem = std::fs::read(cert_path).unwrap();
    let (_, parsed) = x509_parser::pem::parse_x509_pem(&pem).unwrap();
    let cert = parsed.parse_x509().unwrap();
    let cn = cert
        .issuer()
        .iter_common_name()
        .next()
        .unwrap()
        .as_str()
        .unwrap()
        .to_string();
    cn
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn certificate_request_provisions_tls_material() {
    let ca_dir = tempfile::tempdir().unwrap();
    let ssl_dir = tempfile::tempdir().unwrap();
    let ca = start_test_ca(ca_dir.path()).await;

    let node = ChaskiNode::start(node_config("X")).await.unwrap();
    let settings = node
        .request_ssl_certificate(&ca.address().to_string(), ssl_dir.path())
        .await
        .unwrap();
    node.stop().await;

    for path in [
        &settings.key_path,
        &settings.certificate_path,
        &settings.ca_certificate_path,
        &settings.crl_path,
    ] {
        assert!(path.exists(), "{} must exist", path.display());
    }
    assert_eq!(cert_issuer_cn(&settings.certificate_path), "Chaski-Confluent");

    ca.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mutual_tls_connects_then_revocation_blocks() {
    let ca_dir = tempfile::tempdir().unwrap();
    let x_ssl = tempfile::tempdir().unwrap();
    let y_ssl = tempfile::tempdir().unwrap();
    let ca = start_test_ca(ca_dir.path()).await;
    let ca_address = ca.address().to_string();

    // Both peers obtain material from the CA over plain bootstrap nodes.
    let boot = ChaskiNode::start(node_config("XBoot")).await.unwrap();
    let x_settings = boot
        .request_ssl_certificate(&ca_address, x_ssl.path())
        .await
        .unwrap();
    boot.stop().await;

    let boot = ChaskiNode::start(node_config("YBoot")).await.unwrap();
    let y_settings = boot
        .request_ssl_certificate(&ca_address, y_ssl.path())
        .await
        .unwrap();
    boot.stop().await;

    // Mutual TLS handshake succeeds while both certificates are good.
    let y = ChaskiNode::start(node_config("Y").with_tls(y_settings)).await.unwrap();
    let x = ChaskiNode::start(node_config("X").with_tls(x_settings.clone()))
        .await
        .unwrap();
    let y_address = x.connect(&y.address().to_string()).await.unwrap();
    assert!(x.is_connected_to(&y_address).await.unwrap());
    let mutual = wait_until(Duration::from_secs(2), || async {
        y.is_connected_to(x.address()).await.unwrap()
    })
    .await;
    assert!(mutual, "both directions must validate while unrevoked");
    x.stop().await;
    y.stop().await;

    // Revoke X and give Y the fresh CRL.
    let x_serial = cert_serial_hex(&x_settings.certificate_path);
    ca.authority().revoke(&x_serial).unwrap();

    let fetcher = ChaskiNode::start(node_config("Fetcher")).await.unwrap();
    let ca_addr = fetcher.connect(&ca_address).await.unwrap();
    let response = fetcher.request(&ca_addr, Command::CaGetCrl).await.unwrap();
    let crl_pem = match response.command {
        Command::CaGetCrlResponse { crl_pem } => crl_pem,
        other => panic!("unexpected response: {other:?}"),
    };
    std::fs::write(y_ssl.path().join("crl.pem"), &crl_pem).unwrap();
    fetcher.stop().await;

    // A revoked X cannot complete a handshake against Y; no envelope from
    // X is ever processed.
    let y = ChaskiNode::start(
        node_config("Y").with_tls(TlsSettings::from_location(y_ssl.path())),
    )
    .await
    .unwrap();
    let x = ChaskiNode::start(node_config("X").with_tls(x_settings)).await.unwrap();

    let refused = x.connect(&y.address().to_string()).await;
    assert!(refused.is_err(), "revoked peer must be rejected, got {refused:?}");
    assert!(y.edges().await.unwrap().is_empty());

    x.stop().await;
    y.stop().await;
    ca.stop().await;
}
