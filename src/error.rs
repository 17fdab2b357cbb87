use std::path::PathBuf;

use thiserror::Error;

use crate::build::Stage;

/// Fatal failure of a build request. Every variant aborts the pipeline;
/// cosmetic misses are reported through [`BuildWarning`] instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("template archive `{}` is unreadable: {reason:#}", .path.display())]
    TemplateUnreadable {
        path: PathBuf,
        reason: anyhow::Error,
    },

    /// The application identifier was not found anywhere in the manifest's
    /// string pool. A package that keeps the template's identity cannot be
    /// installed alongside it, so this is fatal.
    #[error("application identifier `{identifier}` not found in the compiled manifest")]
    ManifestIdentifierNotFound { identifier: String },

    #[error("launcher alias injection failed: {reason:#}")]
    AliasInjectionFailed { reason: anyhow::Error },

    #[error("failed to stage asset `{name}`: {reason:#}")]
    AssetWriteFailed { name: String, reason: anyhow::Error },

    /// An entry in the rebuilt archive does not match what the pipeline
    /// planned to write. This is an internal invariant violation, not a
    /// user-input problem.
    #[error("archive consistency violated for `{entry}`: {detail}")]
    ArchiveConsistency { entry: String, detail: String },

    #[error("signing identity is invalid: {reason}")]
    SigningIdentityInvalid { reason: String },

    #[error("signing failed: {reason:#}")]
    SigningFailed { reason: anyhow::Error },

    #[error("build cancelled after stage {stage:?}")]
    Cancelled { stage: Stage },
}

impl BuildError {
    pub(crate) fn template(path: impl Into<PathBuf>, reason: impl Into<anyhow::Error>) -> Self {
        BuildError::TemplateUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn asset(name: impl Into<String>, reason: impl Into<anyhow::Error>) -> Self {
        BuildError::AssetWriteFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn signing(reason: impl Into<anyhow::Error>) -> Self {
        BuildError::SigningFailed {
            reason: reason.into(),
        }
    }
}

/// Non-fatal condition accumulated during a build and returned alongside the
/// artifact. A missing cosmetic string is legitimate on some template
/// versions and must not abort the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildWarning {
    /// Neither the UTF-8 nor the UTF-16 encoding of the string occurred in
    /// the resource table.
    StringNotFound { value: String },
    /// No density/qualifier variant of the resource path could be retargeted.
    ResourceVariantNotFound { stem: String },
}

impl std::fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildWarning::StringNotFound { value } => {
                write!(f, "string `{value}` not present in the resource table")
            }
            BuildWarning::ResourceVariantNotFound { stem } => {
                write!(f, "no variant of resource `{stem}` could be retargeted")
            }
        }
    }
}
