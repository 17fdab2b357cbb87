//! Repackaging pipeline for shell-app packages.
//!
//! Takes a prebuilt template archive, a per-app [`ShellConfig`], the user's
//! resource payloads and a [`sign::SigningIdentity`], and produces a new,
//! correctly structured, validly signed installable package — without
//! invoking a build toolchain. The compiled resource table is patched in
//! place under a strict byte-length invariant, the compiled manifest is
//! structurally rewritten (identifier rename, launcher aliases), assets are
//! embedded at fixed paths, and the archive is rebuilt and signed with both
//! the legacy JAR scheme and the signing-block scheme.
//!
//! Entry point: [`build`] with a [`BuildRequest`].

pub mod archive;
pub mod assets;
pub mod build;
pub mod config;
pub mod error;
pub mod manifest;
pub mod res;
pub mod sign;

pub use crate::build::{
    build, BuildOutcome, BuildRequest, CancelToken, IconRetarget, Stage, TemplateProfile,
};
pub use crate::config::ShellConfig;
pub use crate::error::{BuildError, BuildWarning};
