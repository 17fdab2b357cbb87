//! The legacy JAR signing scheme: a digest manifest, a signature file over
//! it, and a PKCS#7 envelope, appended as `META-INF` entries.
//!
//! Modern platforms validate the signing block instead, but installers on
//! older platform versions still require these entries, so both schemes are
//! always applied.

use std::fs::OpenOptions;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use sha2::{Digest, Sha256};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::BuildError;
use crate::sign::{pkcs7, SignatureScheme, SigningIdentity};

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
pub const CERT_SF_NAME: &str = "META-INF/CERT.SF";
pub const CERT_RSA_NAME: &str = "META-INF/CERT.RSA";

const CREATED_BY: &str = "1.0 (shellpack)";

/// Attribute lines may not exceed 72 bytes; longer values continue on lines
/// prefixed with a single space.
const LINE_LIMIT: usize = 70;

pub struct JarScheme;

impl SignatureScheme for JarScheme {
    fn apply(&self, apk: &Path, identity: &SigningIdentity) -> Result<(), BuildError> {
        sign(apk, identity).map_err(BuildError::signing)
    }
}

fn sign(path: &Path, identity: &SigningIdentity) -> Result<()> {
    let file = std::fs::File::open(path)?;
    let mut zip = ZipArchive::new(BufReader::new(file)).context("reading unsigned archive")?;

    let mut digests = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        digests.push((name, Sha256::digest(&data).into()));
    }
    drop(zip);

    let (manifest, sections) = build_manifest(&digests);
    let signature_file = build_signature_file(&manifest, &sections);
    let signature = identity.sign(signature_file.as_bytes())?;
    let envelope = pkcs7::signed_data(identity, &signature);

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut writer = ZipWriter::new_append(file).context("appending to unsigned archive")?;
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(MANIFEST_NAME, options)?;
    writer.write_all(manifest.as_bytes())?;
    writer.start_file(CERT_SF_NAME, options)?;
    writer.write_all(signature_file.as_bytes())?;
    writer.start_file(CERT_RSA_NAME, options)?;
    writer.write_all(&envelope)?;
    writer.finish()?;
    debug!("JAR signature entries appended ({} digested entries)", digests.len());
    Ok(())
}

/// Builds `MANIFEST.MF` and returns it together with each per-entry section
/// verbatim; the signature file digests those exact section bytes.
fn build_manifest(digests: &[(String, [u8; 32])]) -> (String, Vec<(String, String)>) {
    let mut manifest = String::new();
    push_attribute(&mut manifest, "Manifest-Version", "1.0");
    push_attribute(&mut manifest, "Created-By", CREATED_BY);
    manifest.push_str("\r\n");

    let mut sections = Vec::with_capacity(digests.len());
    for (name, digest) in digests {
        let mut section = String::new();
        push_attribute(&mut section, "Name", name);
        push_attribute(&mut section, "SHA-256-Digest", &BASE64.encode(digest));
        section.push_str("\r\n");
        manifest.push_str(&section);
        sections.push((name.clone(), section));
    }
    (manifest, sections)
}

fn build_signature_file(manifest: &str, sections: &[(String, String)]) -> String {
    let mut sf = String::new();
    push_attribute(&mut sf, "Signature-Version", "1.0");
    push_attribute(&mut sf, "Created-By", CREATED_BY);
    push_attribute(
        &mut sf,
        "SHA-256-Digest-Manifest",
        &BASE64.encode(Sha256::digest(manifest.as_bytes())),
    );
    // Tells the platform a signing block is also present, so a stripped
    // block cannot be passed off as a legacy-only package.
    push_attribute(&mut sf, "X-Android-APK-Signed", "2");
    sf.push_str("\r\n");

    for (name, section) in sections {
        push_attribute(&mut sf, "Name", name);
        push_attribute(
            &mut sf,
            "SHA-256-Digest",
            &BASE64.encode(Sha256::digest(section.as_bytes())),
        );
        sf.push_str("\r\n");
    }
    sf
}

fn push_attribute(out: &mut String, key: &str, value: &str) {
    let line = format!("{key}: {value}");
    let mut rest = line.as_str();
    let mut limit = LINE_LIMIT;
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push_str(&rest[..cut]);
        out.push_str("\r\n ");
        rest = &rest[cut..];
        limit = LINE_LIMIT - 1;
    }
    out.push_str(rest);
    out.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_emit_main_section_then_one_section_per_entry() {
        let digests = vec![
            ("AndroidManifest.xml".to_string(), [1u8; 32]),
            ("resources.arsc".to_string(), [2u8; 32]),
        ];
        let (manifest, sections) = build_manifest(&digests);
        assert!(manifest.starts_with("Manifest-Version: 1.0\r\n"));
        assert_eq!(sections.len(), 2);
        assert!(sections[0].1.starts_with("Name: AndroidManifest.xml\r\n"));
        assert!(manifest.ends_with(sections.last().unwrap().1.as_str()));
    }

    #[test]
    fn should_digest_manifest_sections_verbatim_in_signature_file() {
        let digests = vec![("classes.dex".to_string(), [3u8; 32])];
        let (manifest, sections) = build_manifest(&digests);
        let sf = build_signature_file(&manifest, &sections);
        let expected = BASE64.encode(Sha256::digest(sections[0].1.as_bytes()));
        assert!(sf.contains(&format!("SHA-256-Digest: {expected}\r\n")));
        assert!(sf.contains("X-Android-APK-Signed: 2\r\n"));
    }

    #[test]
    fn should_wrap_long_attribute_lines_with_space_continuations() {
        let long_name = format!("assets/shell/site/{}.html", "x".repeat(100));
        let mut out = String::new();
        push_attribute(&mut out, "Name", &long_name);
        for line in out.split("\r\n") {
            assert!(line.len() <= LINE_LIMIT, "line too long: {line}");
        }
        // Reassembling the continuation lines restores the value.
        let logical: String = out
            .split("\r\n")
            .enumerate()
            .map(|(i, l)| if i == 0 { l } else { l.strip_prefix(' ').unwrap_or(l) })
            .collect();
        assert_eq!(logical, format!("Name: {long_name}"));
    }
}
