//! The whole-archive signing-block scheme.
//!
//! A digest tree (1 MiB chunks, `0xa5` leaf prefix, `0x5a` root prefix) is
//! computed over the three archive regions — entry contents, central
//! directory, end-of-central-directory — and signed; the resulting block is
//! inserted between the last entry and the central directory, and the EOCD's
//! central-directory offset is fixed up. The EOCD is digested with its
//! offset field substituted by the block start, so the digest stays
//! independent of the block's own size.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use rsa::pkcs8::DecodePublicKey;
use rsa::{PaddingScheme, PublicKey, RsaPublicKey};
use sha2::{Digest as _, Sha256};

use crate::archive::ZipTail;
use crate::error::BuildError;
use crate::sign::{Certificate, SignatureScheme, SigningIdentity, RSA_PKCS1V15_SHA2_256};

const SIGNING_BLOCK_MAGIC: &[u8] = b"APK Sig Block 42";
const SIGNING_BLOCK_V2_ID: u32 = 0x7109_871a;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

pub struct BlockScheme;

impl SignatureScheme for BlockScheme {
    fn apply(&self, apk: &Path, identity: &SigningIdentity) -> Result<(), BuildError> {
        sign(apk, identity).map_err(BuildError::signing)
    }
}

fn sign(path: &Path, identity: &SigningIdentity) -> Result<()> {
    let apk = std::fs::read(path)?;
    let mut r = Cursor::new(&apk);
    let layout = locate_signing_block(&mut r)?;
    let digest = chunked_digest(&mut r, layout.block_start, layout.cd_start, layout.cde_start)?;

    let mut block = vec![];
    write_signing_block(&mut block, digest, identity)?;

    // Rewrite: contents, fresh block, central directory, EOCD with the
    // directory offset fixed up.
    let mut f = File::create(path)?;
    f.write_all(&apk[..layout.block_start as usize])?;
    f.write_all(&block)?;
    let cd_start = f.stream_position()?;
    f.write_all(&apk[layout.cd_start as usize..layout.cde_start as usize])?;
    let cde_start = f.stream_position()?;
    f.write_all(&apk[layout.cde_start as usize..])?;
    f.seek(SeekFrom::Start(cde_start + 16))?;
    f.write_u32::<LittleEndian>(cd_start as u32)?;
    debug!("signing block written ({} bytes)", block.len());
    Ok(())
}

/// Independently re-derives the digest tree and checks every signature in
/// the block against it.
pub fn verify(path: &Path) -> Result<Vec<Certificate>> {
    let f = File::open(path)?;
    let mut r = BufReader::new(f);
    let layout = locate_signing_block(&mut r)?;
    let raw = layout
        .blocks
        .iter()
        .find(|block| block.id == SIGNING_BLOCK_V2_ID)
        .context("archive carries no v2 signing block")?;
    r.seek(SeekFrom::Start(raw.start))?;
    let block = V2Block::read(&mut r)?;
    let digest = chunked_digest(&mut r, layout.block_start, layout.cd_start, layout.cde_start)?;

    let mut certificates = vec![];
    for signer in &block.signers {
        ensure!(!signer.signatures.is_empty(), "signer without signatures");
        for sig in &signer.signatures {
            ensure!(
                sig.algorithm == RSA_PKCS1V15_SHA2_256,
                "unsupported signature algorithm 0x{:x}",
                sig.algorithm
            );
            let pubkey = RsaPublicKey::from_public_key_der(&signer.public_key)?;
            let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
            pubkey.verify(padding, &Sha256::digest(&signer.signed_data), &sig.signature)?;
        }

        let signed_data = V2SignedData::read(&mut Cursor::new(&signer.signed_data[..]))?;
        ensure!(!signed_data.digests.is_empty(), "signer without digests");
        for entry in &signed_data.digests {
            ensure!(
                entry.algorithm == RSA_PKCS1V15_SHA2_256,
                "unsupported digest algorithm 0x{:x}",
                entry.algorithm
            );
            ensure!(
                entry.digest == digest,
                "computed digest does not match the signed digest"
            );
        }
        for cert in &signed_data.certificates {
            certificates
                .push(rasn::der::decode::<Certificate>(cert).map_err(|e| anyhow!("{e}"))?);
        }
    }
    Ok(certificates)
}

/// Archive layout around the signing block. Without a block,
/// `block_start == cd_start`.
struct BlockLayout {
    blocks: Vec<RawBlock>,
    block_start: u64,
    cd_start: u64,
    cde_start: u64,
}

/// One id-value pair inside an existing signing block, by start offset.
struct RawBlock {
    id: u32,
    start: u64,
}

fn locate_signing_block<R: Read + Seek>(r: &mut R) -> Result<BlockLayout> {
    let tail = ZipTail::locate(r)?;
    let mut layout = BlockLayout {
        blocks: vec![],
        block_start: tail.cd_start,
        cd_start: tail.cd_start,
        cde_start: tail.cde_start,
    };
    if tail.cd_start < 16 + 8 {
        return Ok(layout);
    }
    r.seek(SeekFrom::Start(tail.cd_start - 16 - 8))?;
    let mut remaining = r.read_u64::<LittleEndian>()?;
    let mut magic = [0; 16];
    r.read_exact(&mut magic)?;
    if magic != SIGNING_BLOCK_MAGIC {
        return Ok(layout);
    }
    let mut pos = r.seek(SeekFrom::Current(-(remaining as i64)))?;
    layout.block_start = pos - 8;
    while remaining > 24 {
        let length = r.read_u64::<LittleEndian>()?;
        let id = r.read_u32::<LittleEndian>()?;
        layout.blocks.push(RawBlock {
            id,
            start: pos + 8 + 4,
        });
        pos = r.seek(SeekFrom::Start(pos + length + 8))?;
        remaining -= length + 8;
    }
    Ok(layout)
}

fn chunked_digest<R: Read + Seek>(
    r: &mut R,
    block_start: u64,
    cd_start: u64,
    cde_start: u64,
) -> Result<[u8; 32]> {
    let mut chunks = vec![];
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; MAX_CHUNK_SIZE];

    r.rewind()?;
    let mut pos = 0;
    while pos < block_start {
        digest_chunk(&mut chunks, r, block_start, &mut hasher, &mut chunk, &mut pos)?;
    }

    let mut pos = r.seek(SeekFrom::Start(cd_start))?;
    while pos < cde_start {
        digest_chunk(&mut chunks, r, cde_start, &mut hasher, &mut chunk, &mut pos)?;
    }

    // EOCD, with the central-directory offset replaced by the block start.
    chunk.clear();
    r.read_to_end(&mut chunk)?;
    ensure!(chunk.len() >= 20, "truncated end-of-central-directory record");
    ensure!(chunk.len() <= MAX_CHUNK_SIZE, "oversized end-of-central-directory record");
    let mut cursor = Cursor::new(&mut chunk);
    cursor.seek(SeekFrom::Start(16))?;
    cursor.write_u32::<LittleEndian>(block_start as u32)?;
    hasher.update([0xa5]);
    hasher.update((chunk.len() as u32).to_le_bytes());
    hasher.update(&chunk);
    chunks.push(hasher.finalize_reset().into());

    hasher.update([0x5a]);
    hasher.update((chunks.len() as u32).to_le_bytes());
    for chunk in &chunks {
        hasher.update(chunk);
    }
    Ok(hasher.finalize().into())
}

fn digest_chunk<R: Read + Seek>(
    chunks: &mut Vec<[u8; 32]>,
    r: &mut R,
    region_end: u64,
    hasher: &mut Sha256,
    buffer: &mut Vec<u8>,
    pos: &mut u64,
) -> Result<()> {
    let end = std::cmp::min(*pos + MAX_CHUNK_SIZE as u64, region_end);
    let len = (end - *pos) as usize;
    buffer.resize(len, 0);
    r.read_exact(buffer)
        .context("reading archive region for digesting")?;
    hasher.update([0xa5]);
    hasher.update((len as u32).to_le_bytes());
    hasher.update(&buffer);
    chunks.push(hasher.finalize_reset().into());
    *pos = end;
    Ok(())
}

fn write_signing_block(w: &mut Vec<u8>, digest: [u8; 32], identity: &SigningIdentity) -> Result<()> {
    let mut buf = vec![];
    V2Block::new(digest, identity)?.write(&mut buf)?;
    let size = buf.len() as u64 + 36;
    w.write_u64::<LittleEndian>(size)?;
    w.write_u64::<LittleEndian>(buf.len() as u64 + 4)?;
    w.write_u32::<LittleEndian>(SIGNING_BLOCK_V2_ID)?;
    w.write_all(&buf)?;
    w.write_u64::<LittleEndian>(size)?;
    w.write_all(SIGNING_BLOCK_MAGIC)?;
    Ok(())
}

struct V2Block {
    signers: Vec<V2Signer>,
}

struct V2Signer {
    signed_data: Vec<u8>,
    signatures: Vec<V2Signature>,
    public_key: Vec<u8>,
}

struct V2Signature {
    algorithm: u32,
    signature: Vec<u8>,
}

impl V2Block {
    fn new(digest: [u8; 32], identity: &SigningIdentity) -> Result<Self> {
        let mut signed_data = vec![];
        V2SignedData::new(digest, identity).write(&mut signed_data)?;
        let signature = identity.sign(&signed_data).map_err(|e| anyhow!("{e}"))?;
        Ok(Self {
            signers: vec![V2Signer {
                signed_data,
                signatures: vec![V2Signature {
                    algorithm: RSA_PKCS1V15_SHA2_256,
                    signature,
                }],
                public_key: identity.public_key_der().to_vec(),
            }],
        })
    }

    fn read(r: &mut impl Read) -> Result<Self> {
        let mut signers = vec![];
        let mut remaining = r.read_u32::<LittleEndian>()? as u64;
        while remaining > 0 {
            let signer_size = r.read_u32::<LittleEndian>()?;

            let signed_data_size = r.read_u32::<LittleEndian>()?;
            let mut signed_data = vec![0; signed_data_size as usize];
            r.read_exact(&mut signed_data)?;

            let mut signatures = vec![];
            let mut remaining_signatures = r.read_u32::<LittleEndian>()?;
            while remaining_signatures > 0 {
                let signature_size = r.read_u32::<LittleEndian>()?;
                let algorithm = r.read_u32::<LittleEndian>()?;
                let len = r.read_u32::<LittleEndian>()?;
                let mut signature = vec![0; len as usize];
                r.read_exact(&mut signature)?;
                signatures.push(V2Signature {
                    algorithm,
                    signature,
                });
                remaining_signatures = remaining_signatures
                    .checked_sub(signature_size + 4)
                    .context("signature length overruns its container")?;
            }

            let public_key_size = r.read_u32::<LittleEndian>()?;
            let mut public_key = vec![0; public_key_size as usize];
            r.read_exact(&mut public_key)?;

            signers.push(V2Signer {
                signed_data,
                signatures,
                public_key,
            });
            remaining = remaining
                .checked_sub(signer_size as u64 + 4)
                .context("signer length overruns its container")?;
        }
        Ok(Self { signers })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        let mut buffer = vec![];
        for signer in &self.signers {
            let mut signer_buffer = vec![];
            signer_buffer.write_u32::<LittleEndian>(signer.signed_data.len() as u32)?;
            signer_buffer.write_all(&signer.signed_data)?;
            let mut sig_buffer = vec![];
            for sig in &signer.signatures {
                sig_buffer.write_u32::<LittleEndian>(sig.signature.len() as u32 + 8)?;
                sig_buffer.write_u32::<LittleEndian>(sig.algorithm)?;
                sig_buffer.write_u32::<LittleEndian>(sig.signature.len() as u32)?;
                sig_buffer.write_all(&sig.signature)?;
            }
            signer_buffer.write_u32::<LittleEndian>(sig_buffer.len() as u32)?;
            signer_buffer.write_all(&sig_buffer)?;
            signer_buffer.write_u32::<LittleEndian>(signer.public_key.len() as u32)?;
            signer_buffer.write_all(&signer.public_key)?;
            buffer.write_u32::<LittleEndian>(signer_buffer.len() as u32)?;
            buffer.write_all(&signer_buffer)?;
        }
        w.write_u32::<LittleEndian>(buffer.len() as u32)?;
        w.write_all(&buffer)?;
        Ok(())
    }
}

#[derive(Default)]
struct V2SignedData {
    digests: Vec<V2Digest>,
    certificates: Vec<Vec<u8>>,
    additional_attributes: Vec<(u32, Vec<u8>)>,
}

struct V2Digest {
    algorithm: u32,
    digest: Vec<u8>,
}

impl V2Digest {
    fn size(&self) -> u32 {
        self.digest.len() as u32 + 12
    }

    fn read(r: &mut impl Read) -> Result<Self> {
        let _entry_size = r.read_u32::<LittleEndian>()?;
        let algorithm = r.read_u32::<LittleEndian>()?;
        let len = r.read_u32::<LittleEndian>()?;
        let mut digest = vec![0; len as usize];
        r.read_exact(&mut digest)?;
        Ok(Self { algorithm, digest })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.digest.len() as u32 + 8)?;
        w.write_u32::<LittleEndian>(self.algorithm)?;
        w.write_u32::<LittleEndian>(self.digest.len() as u32)?;
        w.write_all(&self.digest)?;
        Ok(())
    }
}

impl V2SignedData {
    fn new(digest: [u8; 32], identity: &SigningIdentity) -> Self {
        Self {
            digests: vec![V2Digest {
                algorithm: RSA_PKCS1V15_SHA2_256,
                digest: digest.to_vec(),
            }],
            certificates: vec![identity.certificate_der().to_vec()],
            additional_attributes: vec![],
        }
    }

    fn read(r: &mut impl Read) -> Result<Self> {
        let mut signed_data = V2SignedData::default();
        let mut remaining = r.read_u32::<LittleEndian>()?;
        while remaining > 0 {
            let digest = V2Digest::read(r)?;
            remaining = remaining
                .checked_sub(digest.size())
                .context("digest length overruns its container")?;
            signed_data.digests.push(digest);
        }
        let mut remaining = r.read_u32::<LittleEndian>()?;
        while remaining > 0 {
            let len = r.read_u32::<LittleEndian>()?;
            let mut cert = vec![0; len as usize];
            r.read_exact(&mut cert)?;
            signed_data.certificates.push(cert);
            remaining = remaining
                .checked_sub(len + 4)
                .context("certificate length overruns its container")?;
        }
        let mut remaining = r.read_u32::<LittleEndian>()?;
        while remaining > 0 {
            let len = r.read_u32::<LittleEndian>()?;
            let id = r.read_u32::<LittleEndian>()?;
            let mut value = vec![0; len as usize - 4];
            r.read_exact(&mut value)?;
            signed_data.additional_attributes.push((id, value));
            remaining = remaining
                .checked_sub(len + 4)
                .context("attribute length overruns its container")?;
        }
        Ok(signed_data)
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.digests.iter().map(V2Digest::size).sum())?;
        for digest in &self.digests {
            digest.write(w)?;
        }
        w.write_u32::<LittleEndian>(self.certificates.iter().map(|c| c.len() as u32 + 4).sum())?;
        for cert in &self.certificates {
            w.write_u32::<LittleEndian>(cert.len() as u32)?;
            w.write_all(cert)?;
        }
        w.write_u32::<LittleEndian>(
            self.additional_attributes
                .iter()
                .map(|(_, v)| v.len() as u32 + 8)
                .sum(),
        )?;
        for (id, value) in &self.additional_attributes {
            w.write_u32::<LittleEndian>(value.len() as u32 + 4)?;
            w.write_u32::<LittleEndian>(*id)?;
            w.write_all(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_frame_and_reparse_a_signing_block_body() {
        let signed_data = {
            let mut buf = vec![];
            V2SignedData {
                digests: vec![V2Digest {
                    algorithm: RSA_PKCS1V15_SHA2_256,
                    digest: vec![7; 32],
                }],
                certificates: vec![vec![1, 2, 3]],
                additional_attributes: vec![],
            }
            .write(&mut buf)
            .unwrap();
            buf
        };
        let block = V2Block {
            signers: vec![V2Signer {
                signed_data: signed_data.clone(),
                signatures: vec![V2Signature {
                    algorithm: RSA_PKCS1V15_SHA2_256,
                    signature: vec![9; 64],
                }],
                public_key: vec![4; 16],
            }],
        };
        let mut buf = vec![];
        block.write(&mut buf).unwrap();

        let back = V2Block::read(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back.signers.len(), 1);
        assert_eq!(back.signers[0].signed_data, signed_data);
        assert_eq!(back.signers[0].signatures[0].signature, vec![9; 64]);
        assert_eq!(back.signers[0].public_key, vec![4; 16]);

        let parsed = V2SignedData::read(&mut Cursor::new(&signed_data)).unwrap();
        assert_eq!(parsed.digests[0].digest, vec![7; 32]);
        assert_eq!(parsed.certificates[0], vec![1, 2, 3]);
    }

    #[test]
    fn should_report_plain_archive_as_blockless() {
        // A minimal EOCD-only archive: 22 bytes, zero entries.
        let mut eocd = vec![0x50, 0x4b, 0x05, 0x06];
        eocd.extend_from_slice(&[0; 18]);
        let layout = locate_signing_block(&mut Cursor::new(&eocd)).unwrap();
        assert!(layout.blocks.is_empty());
        assert_eq!(layout.block_start, layout.cd_start);
    }
}
