//! Owned, parsed forms of DER certificates and CRLs.
//!
//! Records keep the raw DER as the source of truth; these types carry the
//! handful of fields the control plane inspects. Constructing one is the
//! validation step: a value that exists has parsed successfully.

use x509_parser::prelude::*;

use crate::error::{PkiError, PkiResult};

/// An X.509 certificate with its raw DER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    raw: Vec<u8>,
    common_name: String,
    serial: Vec<u8>,
    dns_names: Vec<String>,
    ip_addresses: Vec<std::net::IpAddr>,
    public_key: Vec<u8>,
    is_ca: bool,
}

impl ParsedCertificate {
    /// Parse a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> PkiResult<Self> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| PkiError::Parse {
            what: "certificate",
            reason: e.to_string(),
        })?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        let san = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::Parse {
                what: "subject alternative names",
                reason: e.to_string(),
            })?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_octets(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            raw: der.to_vec(),
            common_name,
            serial: cert.raw_serial().to_vec(),
            dns_names,
            ip_addresses,
            public_key: cert.public_key().subject_public_key.data.to_vec(),
            is_ca: cert.is_ca(),
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Subject common name, empty if the certificate has none.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Serial number as encoded in the certificate.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn ip_addresses(&self) -> &[std::net::IpAddr] {
        &self.ip_addresses
    }

    /// Subject public key bits, without the algorithm identifier.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }
}

fn ip_from_octets(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        _ => None,
    }
}

/// A certificate revocation list with its raw DER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crl {
    raw: Vec<u8>,
    revoked: Vec<Vec<u8>>,
}

impl Crl {
    /// Parse a DER-encoded CRL.
    pub fn from_der(der: &[u8]) -> PkiResult<Self> {
        let (_, crl) = CertificateRevocationList::from_der(der).map_err(|e| PkiError::Parse {
            what: "CRL",
            reason: e.to_string(),
        })?;
        let revoked = crl
            .iter_revoked_certificates()
            .map(|entry| entry.raw_serial().to_vec())
            .collect();
        Ok(Self {
            raw: der.to_vec(),
            revoked,
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Serials of every revoked certificate.
    pub fn revoked_serials(&self) -> &[Vec<u8>] {
        &self.revoked
    }

    pub fn is_revoked(&self, serial: &[u8]) -> bool {
        self.revoked.iter().any(|s| s == serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_a_parse_error() {
        let err = ParsedCertificate::from_der(b"not a certificate").unwrap_err();
        assert!(matches!(err, PkiError::Parse { what: "certificate", .. }));

        let err = Crl::from_der(&[0x30, 0x03, 0x02, 0x01]).unwrap_err();
        assert!(matches!(err, PkiError::Parse { what: "CRL", .. }));
    }

    #[test]
    fn ip_octets_decode() {
        assert_eq!(
            ip_from_octets(&[10, 0, 0, 1]),
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(ip_from_octets(&[1, 2, 3]), None);
    }
}
