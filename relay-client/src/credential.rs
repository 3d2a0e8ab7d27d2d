//! mTLS 凭据加载
//!
//! 读取 CA / 客户端证书 / 私钥，并在连接前校验其可解析，
//! 避免把错误推迟到 TLS 握手阶段。

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;

use crate::config::TlsCredentials;
use crate::error::ConnectError;

/// Validated PEM material, kept as raw PEM for the transport
#[derive(Clone)]
pub struct PemBundle {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    /// Number of CA certificates found in the trust bundle
    pub ca_count: usize,
}

impl std::fmt::Debug for PemBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PemBundle")
            .field("ca_count", &self.ca_count)
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl PemBundle {
    /// 从文件加载并校验
    pub async fn load(credentials: &TlsCredentials) -> Result<Self, ConnectError> {
        let ca = read_file(&credentials.ca_path, "CA bundle").await?;
        let cert = read_file(&credentials.cert_path, "client certificate").await?;
        let key = read_file(&credentials.key_path, "private key").await?;
        Self::from_pem(ca, cert, key)
    }

    /// 校验内存中的 PEM 内容
    pub fn from_pem(ca: Vec<u8>, cert: Vec<u8>, key: Vec<u8>) -> Result<Self, ConnectError> {
        // 1. CA 证书链 (支持多个证书)
        let ca_certs = parse_certs(&ca, "CA")?;
        if ca_certs.is_empty() {
            return Err(ConnectError::Credential(
                "No CA certificates found".to_string(),
            ));
        }

        // 2. 客户端证书
        let client_certs = parse_certs(&cert, "client")?;
        if client_certs.is_empty() {
            return Err(ConnectError::Credential(
                "No client certificate found".to_string(),
            ));
        }

        // 3. 私钥
        let mut key_reader = std::io::Cursor::new(key.as_slice());
        let private_key: Option<PrivateKeyDer<'static>> =
            rustls_pemfile::private_key(&mut key_reader).map_err(|e| {
                ConnectError::Credential(format!("Failed to parse private key: {}", e))
            })?;
        if private_key.is_none() {
            return Err(ConnectError::Credential("No private key found".to_string()));
        }

        Ok(Self {
            ca_count: ca_certs.len(),
            ca,
            cert,
            key,
        })
    }
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, ConnectError> {
    let mut reader = std::io::Cursor::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectError::Credential(format!("Failed to parse {} certs: {}", what, e)))
}

async fn read_file(path: &Path, what: &str) -> Result<Vec<u8>, ConnectError> {
    tokio::fs::read(path).await.map_err(|e| {
        ConnectError::Credential(format!("Failed to read {} {}: {}", what, path.display(), e))
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_pem_valid() {
        let ca = format!("{}{}", CERT_PEM, CERT_PEM);
        let bundle =
            PemBundle::from_pem(ca.into_bytes(), CERT_PEM.into(), KEY_PEM.into()).unwrap();
        assert_eq!(bundle.ca_count, 2);
    }

    #[test]
    fn test_from_pem_missing_key() {
        let err = PemBundle::from_pem(CERT_PEM.into(), CERT_PEM.into(), CERT_PEM.into())
            .unwrap_err();
        assert!(matches!(err, ConnectError::Credential(_)));
    }

    #[test]
    fn test_from_pem_empty_ca() {
        let err = PemBundle::from_pem(b"not a pem".to_vec(), CERT_PEM.into(), KEY_PEM.into())
            .unwrap_err();
        assert!(err.to_string().contains("No CA certificates"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let bundle = PemBundle::from_pem(CERT_PEM.into(), CERT_PEM.into(), KEY_PEM.into()).unwrap();
        let out = format!("{:?}", bundle);
        assert!(out.contains("<redacted>"));
        assert!(!out.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn test_load_from_files() {
        let dir = TempDir::new().unwrap();
        let ca = dir.path().join("ca.pem");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&ca, CERT_PEM).unwrap();
        std::fs::write(&cert, CERT_PEM).unwrap();
        std::fs::write(&key, KEY_PEM).unwrap();

        let bundle = PemBundle::load(&TlsCredentials::new(&ca, &cert, &key))
            .await
            .unwrap();
        assert_eq!(bundle.ca_count, 1);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.pem");
        let err = PemBundle::load(&TlsCredentials::new(&missing, &missing, &missing))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CA bundle"));
    }
}
