//! The build orchestrator: sequences patching, embedding, reassembly and
//! signing for one build request.
//!
//! Each request runs as one sequential pipeline; the stages are
//! data-dependent on each other, so there is no internal parallelism.
//! Concurrent requests share only the immutable template bytes and the
//! signing identity. Cancellation is polled at stage boundaries, never
//! mid-patch, so a cancelled build cannot leave a half-patched buffer
//! behind; the output file itself only appears at the destination after the
//! final stage, via an atomic rename of a temporary file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tempfile::NamedTempFile;

use crate::archive::{self, Template, MANIFEST_ENTRY, RESOURCE_TABLE_ENTRY};
use crate::assets::{self, EntryClass, PayloadSet, PlannedEntry};
use crate::config::ShellConfig;
use crate::error::{BuildError, BuildWarning};
use crate::manifest::CompiledManifest;
use crate::res::strings::{self, PatchOutcome};
use crate::sign::{self, SigningIdentity};

/// Pipeline stages, in order. Reported by [`BuildError::Cancelled`] as the
/// last stage that completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Loaded,
    ManifestPatched,
    ResourcesPatched,
    AssetsEmbedded,
    Reassembled,
    Signed,
    Done,
}

/// Shared cancellation flag, checked between stages.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What the calling system knows about the template version in use: the
/// display label compiled into its resource table, and (if the template
/// ships a vector launcher foreground) how to retarget it when the user
/// supplies a raster icon.
#[derive(Debug, Clone)]
pub struct TemplateProfile {
    pub display_label: String,
    pub icon_retarget: Option<IconRetarget>,
}

/// Equal-length extension swap applied to one resource path across all of
/// its density variants.
#[derive(Debug, Clone)]
pub struct IconRetarget {
    pub stem: String,
    pub from_ext: String,
    pub to_ext: String,
}

pub struct BuildRequest {
    pub template: Arc<Template>,
    pub profile: TemplateProfile,
    pub config: ShellConfig,
    pub payloads: PayloadSet,
    pub identity: Arc<SigningIdentity>,
    pub destination: PathBuf,
}

/// A successful build: the installed-ready artifact plus any non-fatal
/// diagnostics accumulated along the way.
#[derive(Debug)]
pub struct BuildOutcome {
    pub artifact: PathBuf,
    pub warnings: Vec<BuildWarning>,
}

pub fn build(request: &BuildRequest, cancel: &CancelToken) -> Result<BuildOutcome, BuildError> {
    let checkpoint = |stage: Stage| {
        if cancel.is_cancelled() {
            Err(BuildError::Cancelled { stage })
        } else {
            Ok(())
        }
    };
    let mut warnings = vec![];

    let manifest_bytes = request.template.member(MANIFEST_ENTRY)?;
    let mut table = request.template.member(RESOURCE_TABLE_ENTRY)?;
    checkpoint(Stage::Loaded)?;

    let mut manifest = CompiledManifest::parse(&manifest_bytes)
        .map_err(|reason| BuildError::AliasInjectionFailed { reason })?;
    manifest
        .rename_application_id(&request.config.application_id)
        .map_err(|_| BuildError::ManifestIdentifierNotFound {
            identifier: manifest
                .application_id()
                .unwrap_or_else(|_| "<missing package attribute>".into()),
        })?;
    manifest
        .inject_launcher_aliases(request.config.disguise_icon_count)
        .map_err(|reason| BuildError::AliasInjectionFailed { reason })?;
    let manifest_bytes = manifest
        .to_bytes()
        .map_err(|e| BuildError::ArchiveConsistency {
            entry: MANIFEST_ENTRY.to_string(),
            detail: format!("{e:#}"),
        })?;
    checkpoint(Stage::ManifestPatched)?;

    match strings::patch_string(&mut table, &request.profile.display_label, &request.config.label)
    {
        PatchOutcome::Patched {
            encoding,
            occurrences,
        } => info!(
            "display label patched ({occurrences} occurrence(s), {encoding:?})"
        ),
        PatchOutcome::NotFound => {
            warn!(
                "display label `{}` not found in the resource table",
                request.profile.display_label
            );
            warnings.push(BuildWarning::StringNotFound {
                value: request.profile.display_label.clone(),
            });
        }
    }
    if let (Some(_), Some(retarget)) = (&request.payloads.icon, &request.profile.icon_retarget) {
        let patched = strings::retarget_resource_ext(
            &mut table,
            &retarget.stem,
            &retarget.from_ext,
            &retarget.to_ext,
        )
        .map_err(|reason| BuildError::template(request.template.path(), reason))?;
        if patched == 0 {
            warnings.push(BuildWarning::ResourceVariantNotFound {
                stem: retarget.stem.clone(),
            });
        }
    }
    checkpoint(Stage::ResourcesPatched)?;

    let mut plan = assets::plan(&request.config, &request.payloads)?;
    plan.insert(
        MANIFEST_ENTRY,
        PlannedEntry {
            data: manifest_bytes,
            class: EntryClass::Deflated,
        },
    );
    // The platform maps the resource table directly, so it stays stored and
    // aligned.
    plan.insert(
        RESOURCE_TABLE_ENTRY,
        PlannedEntry {
            data: table,
            class: EntryClass::StoredAligned,
        },
    );
    checkpoint(Stage::AssetsEmbedded)?;

    let dest_dir = request
        .destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dest_dir)
        .map_err(|e| BuildError::asset(dest_dir.display().to_string(), e))?;
    let mut staging = NamedTempFile::new_in(dest_dir)
        .map_err(|e| BuildError::asset("staging file", e))?;

    archive::reassemble(&request.template, &plan, staging.as_file_mut())?;
    archive::audit(staging.as_file_mut(), &plan)?;
    checkpoint(Stage::Reassembled)?;

    sign::sign(staging.path(), &request.identity)?;
    checkpoint(Stage::Signed)?;

    staging
        .persist(&request.destination)
        .map_err(|e| BuildError::asset(request.destination.display().to_string(), e.error))?;
    info!(
        "built `{}` ({} warning(s))",
        request.destination.display(),
        warnings.len()
    );
    Ok(BuildOutcome {
        artifact: request.destination.clone(),
        warnings,
    })
}
