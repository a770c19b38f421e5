use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use rcgen::generate_simple_self_signed;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    server::WebPkiClientVerifier,
};

/// Several crates in the tree enable rustls providers; always pick ring explicitly.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("tls: parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificates found in {}", path.display());
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)
        .with_context(|| format!("tls: parse key in {}", path.display()))?;
    let Some(k) = key else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(k)
}

/// Trust anchors from a PEM bundle, or from every `.pem`/`.crt` file in a directory.
pub fn load_roots(path: &Path) -> anyhow::Result<rustls::RootCertStore> {
    let files = if path.is_dir() {
        let mut files = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("tls: read {}", path.display()))? {
            let p = entry?.path();
            let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
            if p.is_file() && matches!(ext, "pem" | "crt") {
                files.push(p);
            }
        }
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut roots = rustls::RootCertStore::empty();
    for f in &files {
        for cert in load_certs(f)? {
            roots
                .add(cert)
                .with_context(|| format!("tls: bad CA certificate in {}", f.display()))?;
        }
    }
    if roots.is_empty() {
        anyhow::bail!("tls: no CA certificates found in {}", path.display());
    }
    Ok(roots)
}

/// Development certificate for `names`; never written to disk.
pub fn self_signed(
    names: Vec<String>,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let rcgen::CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(names).context("tls: generate self-signed certificate")?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    Ok((vec![cert_der], key_der))
}

/// `client_ca` turns on mutual TLS: clients must present a certificate it issued.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_ca: Option<&Path>,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let builder = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("tls: protocol versions")?;
    let builder = match client_ca {
        None => builder.with_no_client_auth(),
        Some(path) => {
            let roots = load_roots(path)?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
                .build()
                .with_context(|| format!("tls: client verifier from {}", path.display()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };
    let mut cfg = builder
        .with_single_cert(certs, key)
        .context("tls: certificate/key mismatch")?;
    // upgrades are an HTTP/1.1 feature
    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(cfg))
}

#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    /// Extra PEM roots; replaces the bundled web roots when set.
    pub ca_file: Option<std::path::PathBuf>,
    pub insecure_skip_verify: bool,
    /// Certificate and key presented to servers that require client auth.
    pub client_cert: Option<(std::path::PathBuf, std::path::PathBuf)>,
}

pub fn client_config(opts: &ClientTlsOptions) -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("tls: protocol versions")?;

    let builder = if opts.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
    } else {
        let roots = match &opts.ca_file {
            Some(path) => load_roots(path)?,
            None => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        builder.with_root_certificates(roots)
    };
    let mut cfg = match &opts.client_cert {
        None => builder.with_no_client_auth(),
        Some((cert_file, key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)
            .context("tls: client certificate/key mismatch")?,
    };
    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(cfg))
}

/// Accepts any server certificate. Only for development setups.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("sluice-tls-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Pki {
        dir: std::path::PathBuf,
        ca: std::path::PathBuf,
        client_cert: std::path::PathBuf,
        client_key: std::path::PathBuf,
    }

    /// A CA plus one client certificate it issued, written as PEM files.
    fn pki(name: &str) -> Pki {
        let dir = temp_dir(name);
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "sluice test ca");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let issuer = Issuer::new(ca_params, ca_key);

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec!["client.local".to_string()]).unwrap();
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

        let p = Pki {
            ca: dir.join("ca.pem"),
            client_cert: dir.join("client.pem"),
            client_key: dir.join("client.key"),
            dir,
        };
        fs::write(&p.ca, ca_cert.pem()).unwrap();
        fs::write(&p.client_cert, leaf.pem()).unwrap();
        fs::write(&p.client_key, leaf_key.serialize_pem()).unwrap();
        p
    }

    /// Runs one handshake plus a byte exchange; `Err` if either side refused.
    async fn handshake(
        server: Arc<rustls::ServerConfig>,
        client: Arc<rustls::ClientConfig>,
    ) -> Result<(), String> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let srv = tokio::spawn(async move {
            let mut s = TlsAcceptor::from(server).accept(a).await.map_err(|e| e.to_string())?;
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.map_err(|e| e.to_string())?;
            s.write_all(&buf).await.map_err(|e| e.to_string())?;
            s.flush().await.map_err(|e| e.to_string())
        });
        let name = ServerName::try_from("localhost").unwrap();
        let res = async {
            let mut c = TlsConnector::from(client)
                .connect(name, b)
                .await
                .map_err(|e| e.to_string())?;
            c.write_all(b"ping").await.map_err(|e| e.to_string())?;
            let mut buf = [0u8; 4];
            c.read_exact(&mut buf).await.map_err(|e| e.to_string())?;
            Ok::<_, String>(())
        }
        .await;
        let srv = srv.await.unwrap();
        res.and(srv)
    }

    #[test]
    fn self_signed_cert_builds_server_and_client_configs() {
        let (certs, key) = self_signed(vec!["localhost".into()]).unwrap();
        assert_eq!(certs.len(), 1);
        let server = server_config(certs, key, None).unwrap();
        assert_eq!(server.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let client = client_config(&ClientTlsOptions {
            insecure_skip_verify: true,
            ..ClientTlsOptions::default()
        })
        .unwrap();
        assert_eq!(client.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(client_config(&ClientTlsOptions::default()).is_ok());
    }

    #[test]
    fn missing_files_are_errors() {
        let nowhere = std::env::temp_dir().join("sluice-no-such-cert.pem");
        assert!(load_certs(&nowhere).is_err());
        assert!(load_key(&nowhere).is_err());
        assert!(load_roots(&nowhere).is_err());
    }

    #[test]
    fn roots_load_from_a_directory() {
        let p = pki("rootsdir");
        let roots = load_roots(&p.dir).unwrap();
        // ca.pem and client.pem; client.key is skipped
        assert_eq!(roots.len(), 2);
        let empty = temp_dir("rootsempty");
        assert!(load_roots(&empty).is_err());
        let _ = fs::remove_dir_all(&p.dir);
        let _ = fs::remove_dir_all(&empty);
    }

    #[tokio::test]
    async fn client_ca_requires_a_certificate_it_issued() {
        let p = pki("mtls");
        let (certs, key) = self_signed(vec!["localhost".into()]).unwrap();
        let server = server_config(certs, key, Some(&p.ca)).unwrap();

        let anonymous = client_config(&ClientTlsOptions {
            insecure_skip_verify: true,
            ..ClientTlsOptions::default()
        })
        .unwrap();
        assert!(handshake(server.clone(), anonymous).await.is_err());

        let with_cert = client_config(&ClientTlsOptions {
            insecure_skip_verify: true,
            client_cert: Some((p.client_cert.clone(), p.client_key.clone())),
            ..ClientTlsOptions::default()
        })
        .unwrap();
        handshake(server.clone(), with_cert).await.unwrap();

        // a certificate from some other CA is refused
        let other_key = KeyPair::generate().unwrap();
        let other_cert = CertificateParams::new(vec!["client.local".to_string()])
            .unwrap()
            .self_signed(&other_key)
            .unwrap();
        let other_dir = temp_dir("mtls-other");
        let cert_pem = other_dir.join("c.pem");
        let key_pem = other_dir.join("c.key");
        fs::write(&cert_pem, other_cert.pem()).unwrap();
        fs::write(&key_pem, other_key.serialize_pem()).unwrap();
        let stranger = client_config(&ClientTlsOptions {
            insecure_skip_verify: true,
            client_cert: Some((cert_pem, key_pem)),
            ..ClientTlsOptions::default()
        })
        .unwrap();
        assert!(handshake(server, stranger).await.is_err());

        let _ = fs::remove_dir_all(&p.dir);
        let _ = fs::remove_dir_all(&other_dir);
    }
}
