//! Repository and repository-service descriptors.
//!
//! Grounded on `examples/original_source/zypp/zypp/RepoInfo.h` /
//! `ServiceInfo.h` (names/fields kept, trimmed to what the download and
//! service-refresh workflows in this crate actually use) and
//! `repo::DownloadContext` from `repodownloaderwf.h`.

use std::path::PathBuf;

use crate::origin::MirroredOriginSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoType {
    RpmMd,
    Susetags,
    PlainDir,
}

/// Static description of one repository: where its content lives and how
/// strictly it must be signed.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub alias: String,
    pub repo_type: RepoType,
    pub origins: MirroredOriginSet,
    pub mirror_list_url: Option<url::Url>,
    pub repo_gpg_check: bool,
    pub repo_gpg_check_mandatory: bool,
    pub metadata_path: Option<PathBuf>,
    pub valid_repo_signature: bool,
    pub predownload_path: PathBuf,
}

impl RepoInfo {
    pub fn new(alias: impl Into<String>, repo_type: RepoType, origins: MirroredOriginSet, predownload_path: PathBuf) -> Self {
        Self {
            alias: alias.into(),
            repo_type,
            origins,
            mirror_list_url: None,
            repo_gpg_check: true,
            repo_gpg_check_mandatory: false,
            metadata_path: None,
            valid_repo_signature: false,
            predownload_path,
        }
    }

    pub fn base_urls_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// Accumulates the result of downloading one repository's master index
/// (and whatever signature/key material came with it).
#[derive(Debug, Clone)]
pub struct DownloadContext {
    pub repo_info: RepoInfo,
    pub dest_dir: PathBuf,
    pub files: Vec<PathBuf>,
}

impl DownloadContext {
    pub fn new(repo_info: RepoInfo, dest_dir: PathBuf) -> Self {
        Self {
            repo_info,
            dest_dir,
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    /// A `repo/repoindex.xml`-serving repository index mirror (RIM).
    Rim,
    /// A local executable that prints `.repo`-format text to stdout.
    Plugin,
}

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub alias: String,
    pub url: url::Url,
    pub service_type: ServiceType,
    pub probed_ttl: Option<u64>,
}

impl ServiceInfo {
    pub fn new(alias: impl Into<String>, url: url::Url, service_type: ServiceType) -> Self {
        Self {
            alias: alias.into(),
            url,
            service_type,
            probed_ttl: None,
        }
    }
}
