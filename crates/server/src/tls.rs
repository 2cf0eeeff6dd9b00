use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// TLS state shared by the HTTPS listener and the SDP bridge: the certificate
/// also provides the DTLS fingerprint merged into outbound SDP.
pub struct TlsMaterial {
    pub server_config: ServerConfig,
    /// `sha-256 AA:BB:…` over the leaf certificate DER.
    pub fingerprint: String,
}

/// Build TLS material from the configured cert/key paths, falling back to a
/// self-signed certificate persisted under the configs folder.
pub fn load_or_generate(
    cert_path: Option<&str>,
    key_path: Option<&str>,
    state_dir: &str,
) -> Result<TlsMaterial> {
    let (certs, key) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => load_certs_from_files(cert, key)?,
        _ => self_signed_from_state_dir(state_dir)?,
    };

    let fingerprint = fingerprint(&certs[0]);
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;

    Ok(TlsMaterial {
        server_config,
        fingerprint,
    })
}

/// SHA-256 fingerprint of a certificate, in the SDP `a=fingerprint` format.
fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, cert.as_ref());
    let hex: Vec<String> = digest.as_ref().iter().map(|b| format!("{b:02X}")).collect();
    format!("sha-256 {}", hex.join(":"))
}

/// Reuse a previously generated self-signed pair if one is on disk,
/// otherwise generate and persist a new one.
fn self_signed_from_state_dir(
    state_dir: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem_path = format!("{state_dir}/gatehouse-cert.pem");
    let key_pem_path = format!("{state_dir}/gatehouse-key.pem");

    if Path::new(&cert_pem_path).exists() && Path::new(&key_pem_path).exists() {
        match load_certs_from_files(&cert_pem_path, &key_pem_path) {
            Ok(pair) => {
                tracing::info!("Loaded existing self-signed cert from {cert_pem_path}");
                return Ok(pair);
            }
            Err(e) => {
                tracing::warn!("Existing self-signed cert invalid, regenerating: {e}");
            }
        }
    }

    let (certs, priv_key) = generate_self_signed()?;

    // Persist so the DTLS fingerprint survives restarts. Failure to persist
    // is survivable; the gateway just regenerates next time.
    if let Err(e) = std::fs::create_dir_all(state_dir) {
        tracing::warn!("Failed to create {state_dir}: {e}");
        return Ok((certs, priv_key));
    }
    let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", certs[0].to_vec()));
    if let Err(e) = std::fs::write(&cert_pem_path, cert_pem.as_bytes()) {
        tracing::warn!("Failed to persist self-signed cert: {e}");
        return Ok((certs, priv_key));
    }
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let key_bytes = match &priv_key {
            PrivateKeyDer::Pkcs8(k) => k.secret_pkcs8_der().to_vec(),
            _ => Vec::new(),
        };
        let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", key_bytes));
        let written = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&key_pem_path)
            .and_then(|mut f| f.write_all(key_pem.as_bytes()));
        if let Err(e) = written {
            tracing::warn!("Failed to persist self-signed key: {e}");
            return Ok((certs, priv_key));
        }
    }
    tracing::info!("Generated self-signed cert: {cert_pem_path} + {key_pem_path}");

    Ok((certs, priv_key))
}

/// Load certificate chain and private key from PEM files on disk.
fn load_certs_from_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("Failed to read TLS key: {key_path}"))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate PEM")?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {cert_path}");
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("Failed to parse TLS private key PEM")?
        .context("No private key found in PEM file")?;

    tracing::info!("Loaded TLS cert from {cert_path}");
    Ok((certs, key))
}

/// Generate a self-signed certificate for localhost development.
fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    tracing::info!("Generating self-signed TLS certificate");

    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("Failed to create certificate params")?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V4(
            std::net::Ipv4Addr::LOCALHOST,
        )));
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V6(
            std::net::Ipv6Addr::LOCALHOST,
        )));

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((vec![cert_der], key_der))
}

/// Helper to create a `tokio_rustls::TlsAcceptor` from a `rustls::ServerConfig`.
pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}
