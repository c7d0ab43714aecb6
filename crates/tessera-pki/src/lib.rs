//! Tessera PKI: certificate authorities and peer certificates kept in the
//! cluster store.
//!
//! Issuance is idempotent across replicas: [`Certificate::ensure`] writes
//! with a put-if-absent transaction, so the first writer's certificate is
//! the one everybody returns. Authorities carry a CRL that can be watched
//! with [`CrlWatcher`] and extended with [`Certificate::revoke`].

pub mod backend;
pub mod certificate;
pub mod crl;
pub mod error;
pub mod parse;

pub use backend::{CertificateBackend, IssuedCertificate, RcgenBackend, RevokedEntry};
pub use certificate::{Certificate, Namespace, Template};
pub use crl::{Backoff, CrlRecord, CrlWatcher};
pub use error::{PkiError, PkiResult};
pub use parse::{Crl, ParsedCertificate};
