#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]

//! Core engine for the lambay package manager.
//!
//! Provides:
//! - A registry client with conditional-request caching ([`registry`])
//! - A concurrent transitive dependency resolver ([`resolver`])
//! - A content-addressed extraction store ([`store`])
//! - A streaming fetch/extract pipeline ([`pipeline`])
//! - A linker that materializes packages into a project tree ([`linker`])
//! - The two-stage install orchestrator ([`installer`])
//!
//! The command-line surface lives in `lambay-cli`; this crate emits
//! `tracing` events but never installs a subscriber.

pub mod config;
pub mod error;
pub mod installer;
pub mod linker;
pub mod lockfile;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod spec;
pub mod store;

pub use config::EngineConfig;
pub use error::{codes, EngineError};
pub use installer::{InstallReport, Installer, PackageRequest};
pub use linker::{IntegrityMarker, Linker};
pub use lockfile::{LockedPackage, LockfileSnapshot, LOCKFILE_NAME};
pub use manifest::{Manifest, MANIFEST_NAME};
pub use registry::{resolve_version, RegistryClient, RegistryDocument, VersionEntry};
pub use resolver::{normalize_version, topo_order, DepGraph, DepNode, ResolveOutcome, Resolver};
pub use spec::PackageSpec;
pub use store::Store;
