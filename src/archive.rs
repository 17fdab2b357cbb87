//! Template archive access and reassembly.
//!
//! The template is loaded once and never mutated; every build works on its
//! own output writer. Reassembly rebuilds the archive entry by entry, so
//! every local header, CRC, size field and central-directory offset is
//! recomputed — offsets from the template are never reused, since any entry
//! changing size shifts every later one.

use std::fs;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::assets::{EmbedPlan, EntryClass};
use crate::error::BuildError;

pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";
pub const RESOURCE_TABLE_ENTRY: &str = "resources.arsc";

/// Alignment for stored entries the platform memory-maps directly.
const STORED_ALIGNMENT: u16 = 4;

/// The immutable, prebuilt template archive. Loaded into memory once and
/// shared read-only between concurrent builds.
#[derive(Debug, Clone)]
pub struct Template {
    path: PathBuf,
    data: Vec<u8>,
}

impl Template {
    /// Loads and probes the template. Both compiled members the pipeline
    /// patches must be present, so a broken template surfaces here rather
    /// than mid-build.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let data = fs::read(path).map_err(|e| BuildError::template(path, e))?;
        let mut zip = ZipArchive::new(Cursor::new(&data))
            .map_err(|e| BuildError::template(path, anyhow!(e)))?;
        for required in [MANIFEST_ENTRY, RESOURCE_TABLE_ENTRY] {
            zip.by_name(required).map_err(|_| {
                BuildError::template(path, anyhow!("member `{required}` is missing"))
            })?;
        }
        debug!("loaded template `{}` ({} bytes)", path.display(), data.len());
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Reads one member out of the template into a private working copy.
    pub fn member(&self, name: &str) -> Result<Vec<u8>, BuildError> {
        let mut zip = ZipArchive::new(Cursor::new(&self.data))
            .map_err(|e| BuildError::template(&self.path, anyhow!(e)))?;
        let mut file = zip
            .by_name(name)
            .map_err(|e| BuildError::template(&self.path, anyhow!("member `{name}`: {e}")))?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| BuildError::template(&self.path, e))?;
        Ok(buf)
    }
}

/// Signature artifacts of a previous signing round. The rebuilt archive is
/// re-signed from scratch, so the template's are dropped.
fn is_stale_signature_entry(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("META-INF/") else {
        return false;
    };
    rest == "MANIFEST.MF"
        || rest.ends_with(".SF")
        || rest.ends_with(".RSA")
        || rest.ends_with(".DSA")
        || rest.ends_with(".EC")
}

/// Rebuilds the archive: unchanged template entries are copied raw (their
/// compressed payload and CRC carried over), planned entries are written
/// fresh with their storage class, stale signature entries are dropped.
pub fn reassemble<W: Write + Seek>(
    template: &Template,
    plan: &EmbedPlan,
    out: W,
) -> Result<(), BuildError> {
    let mut reader = ZipArchive::new(Cursor::new(template.bytes()))
        .map_err(|e| BuildError::template(template.path(), anyhow!(e)))?;
    let mut writer = ZipWriter::new(out);

    for i in 0..reader.len() {
        let file = reader
            .by_index_raw(i)
            .map_err(|e| BuildError::template(template.path(), anyhow!(e)))?;
        let name = file.name().to_string();
        if plan.entries.contains_key(&name) || is_stale_signature_entry(&name) {
            debug!("dropping template entry `{name}`");
            continue;
        }
        writer
            .raw_copy_file(file)
            .map_err(|e| BuildError::asset(name.as_str(), anyhow!(e)))?;
    }

    for (name, entry) in &plan.entries {
        let write = |writer: &mut ZipWriter<W>| -> Result<()> {
            match entry.class {
                EntryClass::Deflated => writer.start_file(
                    name,
                    FileOptions::default().compression_method(CompressionMethod::Deflated),
                )?,
                EntryClass::StoredAligned => {
                    writer.start_file_aligned(
                        name,
                        FileOptions::default().compression_method(CompressionMethod::Stored),
                        STORED_ALIGNMENT,
                    )?;
                }
            }
            writer.write_all(&entry.data)?;
            Ok(())
        };
        write(&mut writer).map_err(|e| BuildError::asset(name.as_str(), e))?;
    }

    writer
        .finish()
        .map_err(|e| BuildError::asset("central directory", anyhow!(e)))?;
    Ok(())
}

/// Audits the rebuilt archive against the plan: every planned entry must
/// exist exactly once with the planned byte length, a matching CRC32 and,
/// for stored entries, an aligned data offset. A mismatch means an upstream
/// stage corrupted its buffer — a bug, never a user-input problem.
pub fn audit<R: Read + Seek>(reader: R, plan: &EmbedPlan) -> Result<(), BuildError> {
    let consistency = |entry: &str, detail: String| BuildError::ArchiveConsistency {
        entry: entry.to_string(),
        detail,
    };
    let mut zip =
        ZipArchive::new(reader).map_err(|e| consistency("end of central directory", e.to_string()))?;

    for (name, planned) in &plan.entries {
        let occurrences = zip.file_names().filter(|n| *n == name.as_str()).count();
        if occurrences != 1 {
            return Err(consistency(name, format!("{occurrences} occurrences")));
        }

        let mut file = zip
            .by_name(name)
            .map_err(|e| consistency(name, e.to_string()))?;
        if file.size() != planned.data.len() as u64 {
            return Err(consistency(
                name,
                format!(
                    "declared size {} != planned size {}",
                    file.size(),
                    planned.data.len()
                ),
            ));
        }
        if planned.class == EntryClass::StoredAligned
            && file.data_start() % STORED_ALIGNMENT as u64 != 0
        {
            return Err(consistency(
                name,
                format!("stored entry data starts at {}", file.data_start()),
            ));
        }
        let expected_crc = crc32fast::hash(&planned.data);
        if file.crc32() != expected_crc {
            return Err(consistency(
                name,
                format!("CRC32 {:08x} != planned {expected_crc:08x}", file.crc32()),
            ));
        }
        let mut actual = Vec::with_capacity(planned.data.len());
        file.read_to_end(&mut actual)
            .map_err(|e| consistency(name, e.to_string()))?;
        if actual != planned.data {
            return Err(consistency(name, "payload differs from plan".to_string()));
        }
    }
    Ok(())
}

/// Locations of the archive tail records, resolved by scanning backwards for
/// the end-of-central-directory signature.
pub struct ZipTail {
    /// Offset of the end-of-central-directory record.
    pub cde_start: u64,
    /// Offset of the central directory, as declared by the EOCD.
    pub cd_start: u64,
}

impl ZipTail {
    pub fn locate<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let cde_start = find_cde_start_pos(r)?;
        r.seek(SeekFrom::Start(cde_start + 16))?;
        let cd_start = r.read_u32::<LittleEndian>()? as u64;
        Ok(Self {
            cde_start,
            cd_start,
        })
    }
}

fn find_cde_start_pos<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    const CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x0605_4b50;
    const HEADER_SIZE: u64 = 22;
    let file_length = reader.seek(SeekFrom::End(0))?;
    if file_length < HEADER_SIZE {
        bail!("archive shorter than an end-of-central-directory record");
    }
    // The record may be followed by a comment of up to u16::MAX bytes.
    let search_upper_bound = file_length.saturating_sub(HEADER_SIZE + u16::MAX as u64);
    let mut pos = file_length - HEADER_SIZE;
    while pos >= search_upper_bound {
        reader.seek(SeekFrom::Start(pos))?;
        if reader.read_u32::<LittleEndian>()? == CENTRAL_DIRECTORY_END_SIGNATURE {
            return Ok(pos);
        }
        pos = match pos.checked_sub(1) {
            Some(p) => p,
            None => break,
        };
    }
    bail!("no end-of-central-directory record found")
}
