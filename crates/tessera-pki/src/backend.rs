//! Certificate generation backends.
//!
//! A backend turns a [`Template`] into signed key material. The default
//! [`RcgenBackend`] generates ECDSA P-256 keys with rcgen for authorities
//! and signs peer certificates over the node's own Ed25519 key; tests swap
//! in wrappers that count or fail generation events.

use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose,
    RevokedCertParams, SanType, SerialNumber, SubjectPublicKeyInfo,
};
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::certificate::Template;
use crate::error::{PkiError, PkiResult};

const ORGANIZATION: &str = "Tessera";

const CA_VALIDITY_DAYS: i64 = 3650;
const PEER_VALIDITY_DAYS: i64 = 3650;
const CRL_VALIDITY_DAYS: i64 = 365;

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410), followed by
/// the 32 raw key bytes.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];
const ED25519_KEY_LEN: usize = 32;

/// Key material produced by a backend, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// DER-encoded certificate.
    pub cert_der: Vec<u8>,
    /// PEM-encoded private key. `None` when the subject holds its own key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
    /// Serial number bytes, as they appear in the certificate.
    pub serial: Vec<u8>,
}

/// One entry of a CRL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedEntry {
    /// Logical name of the revoked certificate.
    pub name: String,
    pub serial: Vec<u8>,
    /// Unix timestamp (seconds) of revocation.
    pub revoked_at: i64,
}

/// Generates certificates and CRLs.
pub trait CertificateBackend: Send + Sync {
    /// Generate a self-signed certificate for `name`.
    fn self_signed(&self, name: &str, template: &Template) -> PkiResult<IssuedCertificate>;

    /// Generate a certificate for `name` signed by `issuer`.
    fn signed_by(
        &self,
        name: &str,
        template: &Template,
        issuer: &IssuedCertificate,
    ) -> PkiResult<IssuedCertificate>;

    /// Sign a CRL with the given number and entries.
    fn sign_crl(
        &self,
        issuer: &IssuedCertificate,
        number: u64,
        revoked: &[RevokedEntry],
    ) -> PkiResult<Vec<u8>>;
}

/// The rcgen-backed generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenBackend;

impl CertificateBackend for RcgenBackend {
    fn self_signed(&self, name: &str, template: &Template) -> PkiResult<IssuedCertificate> {
        if let Template::Peer { .. } = template {
            return Err(PkiError::Generate(format!("peer certificate {name} needs an issuer")));
        }
        let (params, serial) = params_for(name, template)?;
        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        info!(%name, "generated self-signed certificate");

        Ok(IssuedCertificate {
            cert_der: cert.der().to_vec(),
            key_pem: Some(key_pair.serialize_pem()),
            serial,
        })
    }

    fn signed_by(
        &self,
        name: &str,
        template: &Template,
        issuer: &IssuedCertificate,
    ) -> PkiResult<IssuedCertificate> {
        let (ca_cert, ca_key) = load_issuer(issuer)?;
        let (params, serial) = params_for(name, template)?;
        let sans = params.subject_alt_names.len();

        let (cert, key_pem) = match template {
            Template::Peer { public_key, .. } => {
                let subject = SubjectPublicKeyInfo::from_der(&ed25519_spki(public_key)?)?;
                (params.signed_by(&subject, &ca_cert, &ca_key)?, None)
            }
            Template::Ca { .. } => {
                let key_pair = KeyPair::generate()?;
                let cert = params.signed_by(&key_pair, &ca_cert, &ca_key)?;
                (cert, Some(key_pair.serialize_pem()))
            }
        };

        info!(%name, sans, external_key = key_pem.is_none(), "generated signed certificate");

        Ok(IssuedCertificate {
            cert_der: cert.der().to_vec(),
            key_pem,
            serial,
        })
    }

    fn sign_crl(
        &self,
        issuer: &IssuedCertificate,
        number: u64,
        revoked: &[RevokedEntry],
    ) -> PkiResult<Vec<u8>> {
        let (ca_cert, ca_key) = load_issuer(issuer)?;
        let now = OffsetDateTime::now_utc();

        let revoked_certs = revoked
            .iter()
            .map(|entry| RevokedCertParams {
                serial_number: SerialNumber::from_slice(&entry.serial),
                revocation_time: OffsetDateTime::from_unix_timestamp(entry.revoked_at)
                    .unwrap_or(now),
                reason_code: None,
                invalidity_date: None,
            })
            .collect();

        let params = CertificateRevocationListParams {
            this_update: now,
            next_update: now + Duration::days(CRL_VALIDITY_DAYS),
            crl_number: SerialNumber::from(number),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params.signed_by(&ca_cert, &ca_key)?;

        info!(number, revoked = revoked.len(), "signed CRL");
        Ok(crl.der().to_vec())
    }
}

/// Build rcgen parameters for a template.
fn params_for(name: &str, template: &Template) -> PkiResult<(CertificateParams, Vec<u8>)> {
    let mut params = CertificateParams::default();
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);

    match template {
        Template::Ca { common_name } => {
            dn.push(DnType::CommonName, common_name.as_str());
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
        }
        Template::Peer {
            node_id,
            extra_names,
            ..
        } => {
            dn.push(DnType::CommonName, node_id.as_str());
            params
                .subject_alt_names
                .push(SanType::DnsName(node_id.clone().try_into()?));
            // Add IP SANs for address overrides, DNS SANs for anything else.
            for extra in extra_names {
                if let Ok(ip) = extra.parse::<std::net::IpAddr>() {
                    params.subject_alt_names.push(SanType::IpAddress(ip));
                } else {
                    params
                        .subject_alt_names
                        .push(SanType::DnsName(extra.clone().try_into()?));
                }
            }
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            params.extended_key_usages = vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ];
            params.not_after = now + Duration::days(PEER_VALIDITY_DAYS);
        }
    }
    params.distinguished_name = dn;

    let serial = serial_for(name);
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    Ok((params, serial))
}

/// Wrap a raw Ed25519 public key in a SubjectPublicKeyInfo.
fn ed25519_spki(public_key: &[u8]) -> PkiResult<Vec<u8>> {
    if public_key.len() != ED25519_KEY_LEN {
        return Err(PkiError::Parse {
            what: "Ed25519 public key",
            reason: format!("expected {ED25519_KEY_LEN} bytes, got {}", public_key.len()),
        });
    }
    let mut spki = ED25519_SPKI_PREFIX.to_vec();
    spki.extend_from_slice(public_key);
    Ok(spki)
}

/// Rebuild an issuer's rcgen handle from its stored record.
fn load_issuer(issuer: &IssuedCertificate) -> PkiResult<(rcgen::Certificate, KeyPair)> {
    let Some(key_pem) = &issuer.key_pem else {
        return Err(PkiError::Generate("issuer record holds no private key".to_string()));
    };
    let key = KeyPair::from_pem(key_pem)?;
    let der = CertificateDer::from(issuer.cert_der.clone());
    let params = CertificateParams::from_ca_cert_der(&der)?;
    let cert = params.self_signed(&key)?;
    Ok((cert, key))
}

/// A positive 16-byte serial with no leading zero byte, so it encodes
/// verbatim as a DER INTEGER.
fn serial_for(name: &str) -> Vec<u8> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let digest = Sha256::digest(format!("{name}/{nanos}").as_bytes());
    let mut serial = digest[..16].to_vec();
    serial[0] = (serial[0] & 0x7f) | 0x40;
    serial
}
