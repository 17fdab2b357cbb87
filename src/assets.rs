//! Staging of per-app payloads into archive entries.
//!
//! Every payload lands at a fixed, well-known path so the runtime inside the
//! produced package can locate it without indirection. Entries are planned
//! into a path-keyed map: planning the same inputs twice yields the same
//! entry set (replacement, not duplication), and absent optional payloads
//! are simply omitted.

use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{GenericImageView, ImageOutputFormat};
use log::debug;

use crate::config::{ShellConfig, CONFIG_ASSET_PATH};
use crate::error::BuildError;

pub const ICON_PATH: &str = "assets/shell/icon.png";
pub const SPLASH_STEM: &str = "assets/shell/splash";
pub const SITE_ROOT: &str = "assets/shell/site";
pub const AUDIO_DIR: &str = "assets/shell/audio";
pub const MODULES_DIR: &str = "assets/shell/modules";

/// Icons larger than this are downscaled before embedding.
const ICON_MAX_SIZE: u32 = 512;

/// Resolved absolute paths of the user-selected payloads. All optional;
/// resolution happens in the storage helpers outside this core.
#[derive(Debug, Clone, Default)]
pub struct PayloadSet {
    pub icon: Option<PathBuf>,
    pub splash: Option<PathBuf>,
    /// Root of an HTML tree embedded with relative paths preserved.
    pub site_root: Option<PathBuf>,
    pub audio: Vec<AudioTrack>,
    /// Extension-module payloads; stored uncompressed like native libraries
    /// so the platform loader can map them directly.
    pub modules: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub file: PathBuf,
    pub lyric: Option<PathBuf>,
}

/// Storage class of a planned entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Deflated,
    /// Stored uncompressed on a 4-byte boundary.
    StoredAligned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub data: Vec<u8>,
    pub class: EntryClass,
}

impl PlannedEntry {
    fn deflated(data: Vec<u8>) -> Self {
        Self {
            data,
            class: EntryClass::Deflated,
        }
    }

    fn stored(data: Vec<u8>) -> Self {
        Self {
            data,
            class: EntryClass::StoredAligned,
        }
    }
}

/// The full set of archive entries a build adds or replaces, keyed by entry
/// path. Ordered, so iteration (and the resulting archive) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedPlan {
    pub entries: BTreeMap<String, PlannedEntry>,
}

impl EmbedPlan {
    pub fn insert(&mut self, path: impl Into<String>, entry: PlannedEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stages the configuration document and every payload into an [`EmbedPlan`].
pub fn plan(config: &ShellConfig, payloads: &PayloadSet) -> Result<EmbedPlan, BuildError> {
    let mut plan = EmbedPlan::default();

    let document = config
        .to_asset_bytes()
        .map_err(|e| BuildError::asset(CONFIG_ASSET_PATH, e))?;
    plan.insert(CONFIG_ASSET_PATH, PlannedEntry::deflated(document));

    if let Some(icon) = &payloads.icon {
        let png = normalize_icon(icon).map_err(|e| BuildError::asset(ICON_PATH, e))?;
        plan.insert(ICON_PATH, PlannedEntry::deflated(png));
    }

    if let Some(splash) = &payloads.splash {
        let name = splash_entry_name(splash);
        let data = fs::read(splash).map_err(|e| BuildError::asset(name.as_str(), e))?;
        plan.insert(name, PlannedEntry::deflated(data));
    }

    if let Some(root) = &payloads.site_root {
        stage_tree(&mut plan, root, SITE_ROOT)
            .map_err(|e| BuildError::asset(SITE_ROOT, e))?;
    }

    for (i, track) in payloads.audio.iter().enumerate() {
        let ext = extension_of(&track.file).unwrap_or_else(|| "mp3".into());
        let name = format!("{AUDIO_DIR}/{i}.{ext}");
        let data = fs::read(&track.file).map_err(|e| BuildError::asset(name.as_str(), e))?;
        plan.insert(name, PlannedEntry::deflated(data));

        if let Some(lyric) = &track.lyric {
            let name = format!("{AUDIO_DIR}/{i}.lrc");
            let data = fs::read(lyric).map_err(|e| BuildError::asset(name.as_str(), e))?;
            plan.insert(name, PlannedEntry::deflated(data));
        }
    }

    for module in &payloads.modules {
        let file_name = module
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BuildError::asset(MODULES_DIR, anyhow::anyhow!("module path has no file name"))
            })?;
        let name = format!("{MODULES_DIR}/{file_name}");
        let data = fs::read(module).map_err(|e| BuildError::asset(name.as_str(), e))?;
        plan.insert(name, PlannedEntry::stored(data));
    }

    debug!("staged {} archive entr(ies)", plan.len());
    Ok(plan)
}

fn splash_entry_name(splash: &Path) -> String {
    match extension_of(splash) {
        Some(ext) => format!("{SPLASH_STEM}.{ext}"),
        None => SPLASH_STEM.to_string(),
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Re-encodes the launcher icon as PNG, downscaled to at most
/// [`ICON_MAX_SIZE`] on the long edge.
fn normalize_icon(path: &Path) -> Result<Vec<u8>> {
    let img = ImageReader::open(path)
        .with_context(|| format!("opening icon `{}`", path.display()))?
        .with_guessed_format()
        .context("probing icon format")?
        .decode()
        .context("decoding icon")?;
    let (width, height) = img.dimensions();
    let img = if width.max(height) > ICON_MAX_SIZE {
        img.resize(ICON_MAX_SIZE, ICON_MAX_SIZE, FilterType::Lanczos3)
    } else {
        img
    };
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageOutputFormat::Png)
        .context("encoding icon as PNG")?;
    Ok(buf.into_inner())
}

/// Embeds a directory tree, relative paths preserved, forward slashes only.
fn stage_tree(plan: &mut EmbedPlan, source: &Path, dest_prefix: &str) -> Result<()> {
    for entry in fs::read_dir(source)
        .with_context(|| format!("reading directory `{}`", source.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let name = name
            .to_str()
            .with_context(|| format!("non UTF-8 file name under `{}`", source.display()))?;
        let dest = format!("{dest_prefix}/{name}");
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            stage_tree(plan, &entry.path(), &dest)?;
        } else if file_type.is_file() {
            let data = fs::read(entry.path())
                .with_context(|| format!("reading `{}`", entry.path().display()))?;
            plan.insert(dest, PlannedEntry::deflated(data));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContentSource;
    use tempfile::tempdir;

    fn test_config() -> ShellConfig {
        serde_json::from_str(
            r#"{
                "label": "MyApp",
                "application_id": "com.example.myapp",
                "content": { "url": { "url": "https://example.com" } }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn should_always_stage_config_document() {
        let plan = plan(&test_config(), &PayloadSet::default()).unwrap();
        assert_eq!(plan.len(), 1);
        let entry = &plan.entries[CONFIG_ASSET_PATH];
        let back: ShellConfig = serde_json::from_slice(&entry.data).unwrap();
        assert_eq!(
            back.content,
            ContentSource::Url {
                url: "https://example.com".into()
            }
        );
    }

    #[test]
    fn should_stage_site_tree_with_relative_paths() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<html/>").unwrap();
        std::fs::write(dir.path().join("css/app.css"), "body{}").unwrap();

        let payloads = PayloadSet {
            site_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let plan = plan(&test_config(), &payloads).unwrap();
        assert_eq!(
            plan.entries["assets/shell/site/index.html"].data,
            b"<html/>"
        );
        assert_eq!(
            plan.entries["assets/shell/site/css/app.css"].data,
            b"body{}"
        );
    }

    #[test]
    fn should_index_audio_tracks_and_lyrics() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("one.MP3"), "a").unwrap();
        std::fs::write(dir.path().join("one.lrc"), "b").unwrap();
        std::fs::write(dir.path().join("two.ogg"), "c").unwrap();

        let payloads = PayloadSet {
            audio: vec![
                AudioTrack {
                    file: dir.path().join("one.MP3"),
                    lyric: Some(dir.path().join("one.lrc")),
                },
                AudioTrack {
                    file: dir.path().join("two.ogg"),
                    lyric: None,
                },
            ],
            ..Default::default()
        };
        let plan = plan(&test_config(), &payloads).unwrap();
        assert!(plan.entries.contains_key("assets/shell/audio/0.mp3"));
        assert!(plan.entries.contains_key("assets/shell/audio/0.lrc"));
        assert!(plan.entries.contains_key("assets/shell/audio/1.ogg"));
        assert!(!plan.entries.contains_key("assets/shell/audio/1.lrc"));
    }

    #[test]
    fn should_store_modules_uncompressed() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("libextra.so"), "ELF").unwrap();
        let payloads = PayloadSet {
            modules: vec![dir.path().join("libextra.so")],
            ..Default::default()
        };
        let plan = plan(&test_config(), &payloads).unwrap();
        assert_eq!(
            plan.entries["assets/shell/modules/libextra.so"].class,
            EntryClass::StoredAligned
        );
    }

    #[test]
    fn should_normalize_icon_to_png() {
        let dir = tempdir().unwrap();
        let icon_path = dir.path().join("icon.png");
        image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 255]))
            .save(&icon_path)
            .unwrap();

        let payloads = PayloadSet {
            icon: Some(icon_path),
            ..Default::default()
        };
        let plan = plan(&test_config(), &payloads).unwrap();
        let png = &plan.entries[ICON_PATH].data;
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn should_plan_identically_on_repeat_runs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html/>").unwrap();
        let payloads = PayloadSet {
            site_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let first = plan(&test_config(), &payloads).unwrap();
        let second = plan(&test_config(), &payloads).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn should_fail_on_missing_payload_file() {
        let payloads = PayloadSet {
            splash: Some(PathBuf::from("/nonexistent/splash.mp4")),
            ..Default::default()
        };
        match plan(&test_config(), &payloads) {
            Err(BuildError::AssetWriteFailed { name, .. }) => {
                assert_eq!(name, "assets/shell/splash.mp4");
            }
            other => panic!("expected AssetWriteFailed, got {other:?}"),
        }
    }
}
