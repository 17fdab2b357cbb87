//! Minimal DER builder for the PKCS#7 `SignedData` envelope carried in
//! `META-INF/CERT.RSA`.
//!
//! The envelope is detached (the signed content is the signature file, not
//! embedded here) and fixed-shape: one certificate, one signer, SHA2-256
//! with RSA. Only that shape is emitted, so the encoding is built directly
//! instead of through a general ASN.1 model; the certificate, issuer and
//! serial are spliced in as the DER the identity already carries.

use crate::sign::SigningIdentity;

// Tag numbers, DER.
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
/// Context-specific constructed tag 0.
const TAG_CONTEXT_0: u8 = 0xa0;

// Pre-encoded object identifiers (tag and length included).
const OID_SIGNED_DATA: &[u8] = &[
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02,
];
const OID_PKCS7_DATA: &[u8] = &[
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01,
];
const OID_SHA256: &[u8] = &[
    0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
];
const OID_RSA_ENCRYPTION: &[u8] = &[
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01,
];

/// Builds the full `ContentInfo` DER wrapping a `SignedData` with the
/// identity's certificate and the given PKCS#1 v1.5 signature.
pub fn signed_data(identity: &SigningIdentity, signature: &[u8]) -> Vec<u8> {
    let digest_algorithm = algorithm_identifier(OID_SHA256);
    let signature_algorithm = algorithm_identifier(OID_RSA_ENCRYPTION);

    let issuer_and_serial = tlv(
        TAG_SEQUENCE,
        &concat(&[identity.issuer_der(), identity.serial_der()]),
    );
    let signer_info = tlv(
        TAG_SEQUENCE,
        &concat(&[
            &small_integer(1),
            &issuer_and_serial,
            &digest_algorithm,
            &signature_algorithm,
            &tlv(TAG_OCTET_STRING, signature),
        ]),
    );

    let signed = tlv(
        TAG_SEQUENCE,
        &concat(&[
            &small_integer(1),
            &tlv(TAG_SET, &digest_algorithm),
            // Detached: the content info names the data type but carries
            // no content.
            &tlv(TAG_SEQUENCE, OID_PKCS7_DATA),
            // certificates [0] IMPLICIT
            &tlv(TAG_CONTEXT_0, identity.certificate_der()),
            &tlv(TAG_SET, &signer_info),
        ]),
    );

    tlv(
        TAG_SEQUENCE,
        &concat(&[OID_SIGNED_DATA, &tlv(TAG_CONTEXT_0, &signed)]),
    )
}

fn algorithm_identifier(oid: &[u8]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &concat(&[oid, &[TAG_NULL, 0x00]]))
}

fn small_integer(value: u8) -> Vec<u8> {
    tlv(TAG_INTEGER, &[value])
}

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

/// Emits one tag-length-value triple with a definite DER length.
fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let significant = &bytes[bytes.iter().position(|b| *b != 0).unwrap_or(7)..];
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
    out.extend_from_slice(content);
    out
}
