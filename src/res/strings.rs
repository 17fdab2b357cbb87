//! In-place patching of strings inside a compiled resource table.
//!
//! The table's string pool records each entry's physical length separately
//! from its payload, so edits must keep the payload byte count exact: the
//! replacement is truncated to fit and NUL-padded to the original length.
//! The consuming platform stops rendering at the first NUL, which makes NUL
//! the only padding that stays invisible.
//!
//! Matching is a raw byte-pattern scan, not a structural parse. The strings
//! this pipeline edits (a display label, a specific resource path) are long
//! enough that collisions elsewhere in the table are not a practical
//! concern; this is a stated limitation of the design, not a guarantee.

use anyhow::{ensure, Result};
use log::debug;

/// Physical encoding a match was found in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Utf8,
    /// Little-endian UTF-16, the default for resource tables compiled
    /// without the UTF-8 pool flag.
    Utf16,
}

/// Tri-state result of a patch attempt. `NotFound` is a diagnostic, not an
/// error: some template builds legitimately omit a given string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PatchOutcome {
    Patched {
        encoding: Encoding,
        occurrences: usize,
    },
    NotFound,
}

impl PatchOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, PatchOutcome::Patched { .. })
    }
}

/// Replaces every occurrence of `old` in the table buffer with `new`,
/// preserving the buffer length. UTF-8 occurrences are tried first; only if
/// none exist is the UTF-16 encoding attempted.
pub fn patch_string(buf: &mut [u8], old: &str, new: &str) -> PatchOutcome {
    let pattern = old.as_bytes();
    let replacement = fit_utf8(new, pattern.len());
    let occurrences = replace_all(buf, pattern, &replacement);
    if occurrences > 0 {
        debug!("patched {occurrences} UTF-8 occurrence(s) of `{old}`");
        return PatchOutcome::Patched {
            encoding: Encoding::Utf8,
            occurrences,
        };
    }

    let pattern = utf16_bytes(old);
    let replacement = fit_utf16(new, pattern.len());
    let occurrences = replace_all(buf, &pattern, &replacement);
    if occurrences > 0 {
        debug!("patched {occurrences} UTF-16 occurrence(s) of `{old}`");
        return PatchOutcome::Patched {
            encoding: Encoding::Utf16,
            occurrences,
        };
    }
    PatchOutcome::NotFound
}

/// Swaps the file extension of a resource path across every
/// density/qualifier variant present in the table, e.g. retargeting a
/// vector foreground drawable to its raster form. Extensions must have
/// equal character length, so each variant keeps its physical size. Each
/// variant is patched independently; the count of rewritten occurrences is
/// returned and zero is not an error.
pub fn retarget_resource_ext(
    buf: &mut [u8],
    stem: &str,
    from_ext: &str,
    to_ext: &str,
) -> Result<usize> {
    ensure!(
        from_ext.len() == to_ext.len(),
        "extension `{from_ext}` and `{to_ext}` differ in length"
    );
    let old = format!("{stem}.{from_ext}");
    let new = format!("{stem}.{to_ext}");

    let mut occurrences = replace_all(buf, old.as_bytes(), new.as_bytes());
    if occurrences == 0 {
        occurrences = replace_all(buf, &utf16_bytes(&old), &utf16_bytes(&new));
    }
    debug!("retargeted {occurrences} variant(s) of `{stem}` to `.{to_ext}`");
    Ok(occurrences)
}

/// Encodes `new` as UTF-8 in exactly `len` bytes: truncated character by
/// character (never splitting a multi-byte sequence), then NUL-padded.
fn fit_utf8(new: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for c in new.chars() {
        if out.len() + c.len_utf8() > len {
            break;
        }
        let mut encoded = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
    }
    out.resize(len, 0);
    out
}

/// Encodes `new` as UTF-16LE in exactly `len` bytes: truncated code unit by
/// code unit (a char producing a surrogate pair is kept or dropped whole),
/// then NUL-padded.
fn fit_utf16(new: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for c in new.chars() {
        let mut units = [0u16; 2];
        let encoded = c.encode_utf16(&mut units);
        if out.len() + encoded.len() * 2 > len {
            break;
        }
        for unit in encoded {
            out.extend_from_slice(&unit.to_le_bytes());
        }
    }
    out.resize(len, 0);
    out
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn replace_all(buf: &mut [u8], pattern: &[u8], replacement: &[u8]) -> usize {
    debug_assert_eq!(pattern.len(), replacement.len());
    if pattern.is_empty() || buf.len() < pattern.len() {
        return 0;
    }
    let mut occurrences = 0;
    let mut i = 0;
    while i + pattern.len() <= buf.len() {
        if &buf[i..i + pattern.len()] == pattern {
            buf[i..i + pattern.len()].copy_from_slice(replacement);
            occurrences += 1;
            i += pattern.len();
        } else {
            i += 1;
        }
    }
    occurrences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_patch_and_nul_pad_shorter_utf8_name() {
        let mut buf = b"....TemplateApp....".to_vec();
        let before = buf.len();
        let outcome = patch_string(&mut buf, "TemplateApp", "MyApp");
        assert_eq!(
            outcome,
            PatchOutcome::Patched {
                encoding: Encoding::Utf8,
                occurrences: 1
            }
        );
        assert_eq!(buf.len(), before);
        assert_eq!(&buf[4..15], b"MyApp\0\0\0\0\0\0");
    }

    #[test]
    fn should_truncate_oversized_name_on_char_boundary() {
        let mut buf = b"..TemplateApp..".to_vec();
        let outcome = patch_string(&mut buf, "TemplateApp", "ThisNameIsWayTooLongToFit");
        assert!(outcome.changed());
        // Longest prefix fitting 11 bytes, no padding needed.
        assert_eq!(&buf[2..13], b"ThisNameIsW");
        assert_eq!(buf.len(), 15);
    }

    #[test]
    fn should_not_split_multibyte_sequence_when_truncating() {
        // 5 ASCII chars + 'ü' (2 bytes) would need 7 bytes; only 6 fit, so
        // the final slot becomes padding instead of half a sequence.
        let mut buf = b"=Abcdef=".to_vec();
        patch_string(&mut buf, "Abcdef", "abcdeü");
        assert_eq!(&buf[1..7], b"abcde\0");
    }

    #[test]
    fn should_fall_back_to_utf16_when_utf8_absent() {
        let mut buf = vec![0u8; 4];
        buf.extend("TemplateApp".encode_utf16().flat_map(u16::to_le_bytes));
        buf.extend_from_slice(&[0u8; 4]);
        let outcome = patch_string(&mut buf, "TemplateApp", "MyApp");
        assert_eq!(
            outcome,
            PatchOutcome::Patched {
                encoding: Encoding::Utf16,
                occurrences: 1
            }
        );
        let mut expected: Vec<u8> = "MyApp".encode_utf16().flat_map(u16::to_le_bytes).collect();
        expected.resize(22, 0);
        assert_eq!(&buf[4..26], &expected[..]);
    }

    #[test]
    fn should_not_drop_half_of_surrogate_pair() {
        let mut buf: Vec<u8> = "0123456789"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        // Nine BMP chars fill 18 bytes; "𝄞" needs a 4-byte pair which no
        // longer fits into the remaining 2, so it is dropped whole.
        patch_string(&mut buf, "0123456789", "abcdefghi𝄞");
        let mut expected: Vec<u8> = "abcdefghi"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        expected.resize(20, 0);
        assert_eq!(buf, expected);
    }

    #[test]
    fn should_report_not_found_without_touching_buffer() {
        let mut buf = b"nothing to see".to_vec();
        let before = buf.clone();
        assert_eq!(
            patch_string(&mut buf, "TemplateApp", "MyApp"),
            PatchOutcome::NotFound
        );
        assert_eq!(buf, before);
    }

    #[test]
    fn should_replace_every_occurrence() {
        let mut buf = b"TemplateApp--TemplateApp".to_vec();
        let outcome = patch_string(&mut buf, "TemplateApp", "MyApp");
        assert_eq!(
            outcome,
            PatchOutcome::Patched {
                encoding: Encoding::Utf8,
                occurrences: 2
            }
        );
    }

    #[test]
    fn should_retarget_each_density_variant() {
        let mut buf = Vec::new();
        for dir in ["mipmap-mdpi", "mipmap-xhdpi", "mipmap-xxxhdpi"] {
            buf.extend_from_slice(format!("res/{dir}/ic_launcher_foreground.xml\0").as_bytes());
        }
        let n = retarget_resource_ext(&mut buf, "ic_launcher_foreground", "xml", "png").unwrap();
        assert_eq!(n, 3);
        assert!(!buf.windows(4).any(|w| w == b".xml"));
    }

    #[test]
    fn should_reject_extension_length_mismatch() {
        let mut buf = vec![];
        assert!(retarget_resource_ext(&mut buf, "icon", "xml", "webp").is_err());
    }
}
