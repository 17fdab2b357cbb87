//! Package signing: the legacy JAR scheme (`v1`) and the modern
//! signing-block scheme (`v2`), both applied over the reassembled archive
//! with an externally supplied signing identity.

pub mod pkcs7;
pub mod v1;
pub mod v2;

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use log::info;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::{PaddingScheme, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::BuildError;

pub type Certificate = rasn_pkix::Certificate;

/// Signature algorithm id shared by both schemes: RSASSA-PKCS1-v1_5 with
/// SHA2-256.
pub const RSA_PKCS1V15_SHA2_256: u32 = 0x0103;

/// Private key plus certificate, parsed once per identity and shared
/// read-only between builds.
///
/// All derived encodings (public key, certificate, issuer and serial) are
/// computed up front: the identity doubles as the caller-owned key cache,
/// with its lifecycle tied to ownership instead of ambient static state.
/// Raw RSA operations run behind a mutex, since a hardware-backed key store
/// underneath may not be reentrant.
pub struct SigningIdentity {
    key: RsaPrivateKey,
    cert: Certificate,
    cert_der: Vec<u8>,
    public_key_der: Vec<u8>,
    issuer_der: Vec<u8>,
    serial_der: Vec<u8>,
    op_lock: Mutex<()>,
}

impl SigningIdentity {
    /// Parses a PEM bundle carrying a PKCS#8 private key and a certificate.
    pub fn from_pem(pem: &str) -> Result<Self, BuildError> {
        let invalid = |reason: String| BuildError::SigningIdentityInvalid { reason };

        let blocks = pem::parse_many(pem).map_err(|e| invalid(format!("not PEM: {e}")))?;
        let key = blocks
            .iter()
            .find(|block| block.tag == "PRIVATE KEY")
            .ok_or_else(|| invalid("no private key block".into()))?;
        let key = RsaPrivateKey::from_pkcs8_der(&key.contents)
            .map_err(|e| invalid(format!("bad private key: {e}")))?;
        let cert_block = blocks
            .iter()
            .find(|block| block.tag == "CERTIFICATE")
            .ok_or_else(|| invalid("no certificate block".into()))?;
        let cert = rasn::der::decode::<Certificate>(&cert_block.contents)
            .map_err(|e| invalid(format!("bad certificate: {e}")))?;

        let public_key_der = RsaPublicKey::from(&key)
            .to_public_key_der()
            .map_err(|e| invalid(format!("public key encoding: {e}")))?
            .as_ref()
            .to_vec();
        let spki_der = rasn::der::encode(&cert.tbs_certificate.subject_public_key_info)
            .map_err(|e| invalid(format!("certificate public key encoding: {e}")))?;
        if spki_der != public_key_der {
            return Err(invalid("certificate does not match the private key".into()));
        }

        let issuer_der = rasn::der::encode(&cert.tbs_certificate.issuer)
            .map_err(|e| invalid(format!("issuer encoding: {e}")))?;
        let serial_der = rasn::der::encode(&cert.tbs_certificate.serial_number)
            .map_err(|e| invalid(format!("serial encoding: {e}")))?;

        Ok(Self {
            key,
            cert,
            cert_der: cert_block.contents.clone(),
            public_key_der,
            issuer_der,
            serial_der,
            op_lock: Mutex::new(()),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, BuildError> {
        let pem = std::fs::read_to_string(path).map_err(|e| BuildError::SigningIdentityInvalid {
            reason: format!("reading `{}`: {e}", path.display()),
        })?;
        Self::from_pem(&pem)
    }

    /// Signs `bytes` with RSASSA-PKCS1-v1_5 over a SHA2-256 digest.
    pub fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>, BuildError> {
        let digest = Sha256::digest(bytes);
        let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
        let _guard = self.op_lock.lock().expect("signing lock poisoned");
        self.key
            .sign(padding, &digest)
            .map_err(BuildError::signing)
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    pub fn issuer_der(&self) -> &[u8] {
        &self.issuer_der
    }

    pub fn serial_der(&self) -> &[u8] {
        &self.serial_der
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("cert", &self.cert)
            .finish_non_exhaustive()
    }
}

/// One signing scheme applied over a finished archive file.
pub trait SignatureScheme {
    fn apply(&self, apk: &Path, identity: &SigningIdentity) -> Result<(), BuildError>;
}

/// Applies both schemes in order. The JAR scheme appends its `META-INF`
/// entries first; the signing block then covers the archive including them.
pub fn sign(apk: &Path, identity: &SigningIdentity) -> Result<(), BuildError> {
    v1::JarScheme.apply(apk, identity)?;
    v2::BlockScheme.apply(apk, identity)?;
    info!("signed `{}`", apk.display());
    Ok(())
}

/// Independently verifies the archive's signing block and returns the
/// signer certificates. Any byte of digested content changing after signing
/// makes this fail.
pub fn verify(apk: &Path) -> Result<Vec<Certificate>> {
    v2::verify(apk)
}
