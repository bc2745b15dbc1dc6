// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Transport security from PEM-encoded certificate material.

use crate::error::Error;
use rustls_pemfile::Item;
use std::{
    fmt,
    io::{BufReader, Cursor},
    sync::Arc,
};
use tokio_rustls::rustls::{
    self, server::AllowAnyAuthenticatedClient, Certificate, PrivateKey, RootCertStore,
};

/// How a client channel secures its connection.
#[derive(Clone)]
pub enum ClientCredentials {
    /// Plaintext TCP.
    Insecure,
    /// TLS, authenticating the server and, if configured, the client.
    Tls(Arc<rustls::ClientConfig>),
}

impl ClientCredentials {
    /// Builds credentials from optional PEM strings.
    ///
    /// Without a root certificate the channel is plaintext and the other arguments are
    /// ignored. With a root certificate the server is authenticated, and if both a client
    /// certificate chain and its private key are given the client authenticates too.
    pub fn from_pem(
        root_cert: Option<&str>,
        client_cert: Option<&str>,
        private_key: Option<&str>,
    ) -> Result<Self, Error> {
        let root_cert = match root_cert.filter(|pem| !pem.is_empty()) {
            Some(root_cert) => root_cert,
            None => return Ok(ClientCredentials::Insecure),
        };
        let builder = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store(root_cert)?);
        let config = match (
            client_cert.filter(|pem| !pem.is_empty()),
            private_key.filter(|pem| !pem.is_empty()),
        ) {
            (Some(cert), Some(key)) => builder
                .with_single_cert(certificates(cert)?, private_key_from_pem(key)?)
                .map_err(|e| Error::InvalidCredentials(e.to_string()))?,
            _ => builder.with_no_client_auth(),
        };
        Ok(ClientCredentials::Tls(Arc::new(config)))
    }

    /// Returns true if connections are encrypted.
    pub fn is_secure(&self) -> bool {
        matches!(self, ClientCredentials::Tls(_))
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCredentials::Insecure => f.write_str("Insecure"),
            ClientCredentials::Tls(_) => f.write_str("Tls"),
        }
    }
}

/// How a server secures accepted connections.
#[derive(Clone)]
pub enum ServerCredentials {
    /// Plaintext TCP.
    Insecure,
    /// TLS with the server's certificate chain.
    Tls(Arc<rustls::ServerConfig>),
}

impl ServerCredentials {
    /// Builds credentials from optional PEM strings.
    ///
    /// With neither a certificate nor a key the server is plaintext. Giving only one of them
    /// is an error. If `client_root` is given, clients must present a certificate signed by it.
    pub fn from_pem(
        server_cert: Option<&str>,
        private_key: Option<&str>,
        client_root: Option<&str>,
    ) -> Result<Self, Error> {
        let (cert, key) = match (
            server_cert.filter(|pem| !pem.is_empty()),
            private_key.filter(|pem| !pem.is_empty()),
        ) {
            (None, None) => return Ok(ServerCredentials::Insecure),
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(Error::InvalidCredentials(
                    "a server certificate requires its private key and vice versa".into(),
                ))
            }
        };
        let builder = rustls::ServerConfig::builder().with_safe_defaults();
        let builder = match client_root.filter(|pem| !pem.is_empty()) {
            Some(root) => {
                builder.with_client_cert_verifier(AllowAnyAuthenticatedClient::new(root_store(root)?))
            }
            None => builder.with_no_client_auth(),
        };
        let config = builder
            .with_single_cert(certificates(cert)?, private_key_from_pem(key)?)
            .map_err(|e| Error::InvalidCredentials(e.to_string()))?;
        Ok(ServerCredentials::Tls(Arc::new(config)))
    }

    /// Returns true if connections are encrypted.
    pub fn is_secure(&self) -> bool {
        matches!(self, ServerCredentials::Tls(_))
    }
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerCredentials::Insecure => f.write_str("Insecure"),
            ServerCredentials::Tls(_) => f.write_str("Tls"),
        }
    }
}

fn certificates(pem: &str) -> Result<Vec<Certificate>, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(Cursor::new(pem)))
        .map_err(|e| Error::InvalidCredentials(format!("unreadable certificate: {e}")))?;
    if certs.is_empty() {
        return Err(Error::InvalidCredentials(
            "no certificate found in PEM".into(),
        ));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn private_key_from_pem(pem: &str) -> Result<PrivateKey, Error> {
    let items = rustls_pemfile::read_all(&mut BufReader::new(Cursor::new(pem)))
        .map_err(|e| Error::InvalidCredentials(format!("unreadable private key: {e}")))?;
    items
        .into_iter()
        .find_map(|item| match item {
            Item::RSAKey(key) | Item::PKCS8Key(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| Error::InvalidCredentials("no private key found in PEM".into()))
}

fn root_store(pem: &str) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in certificates(pem)? {
        roots
            .add(&cert)
            .map_err(|e| Error::InvalidCredentials(format!("bad root certificate: {e}")))?;
    }
    Ok(roots)
}
