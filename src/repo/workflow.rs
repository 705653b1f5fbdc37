//! Master-index download and verification workflow.
//!
//! Grounded on `examples/original_source/zypp-logic/zypp/ng/repo/workflows/repodownloaderwf.cc`'s
//! `DownloadMasterIndexLogic::execute`: fetch the master index, always fetch
//! the `.asc`/`.key` siblings regardless of whether signature checking is
//! mandatory, fall back to a `.key` download only when the signature's key
//! isn't already known, scan the index for extra key hints, run the
//! optional plugin verifier, then check the signature and copy everything
//! into the destination directory with the master index moved to the
//! front of the file list.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::WorkflowError;
use crate::keyring::{KeyRingCallback, KeyRingManager, VerifyFileContext};
use crate::repo::types::DownloadContext;

/// Supplies file bytes for a relative path below the attached medium.
/// `optional` mirrors `ProvideFileSpec::setOptional`: a missing optional
/// file is `Ok(None)`, a missing mandatory one is an error.
pub trait FileProvider {
    fn provide(&self, relative: &Path, optional: bool) -> Result<Option<Vec<u8>>, WorkflowError>;

    /// Like [`provide`](FileProvider::provide) but with mirror fan-out
    /// disabled, matching §4.8 step 5's requirement that key-hint fetches
    /// never fan out across mirrors. Implementations backed by a real
    /// `MediaProvider` should route this through `setMirrorsAllowed(false)`;
    /// the default just forwards to `provide` for providers with only one
    /// endpoint (e.g. test fakes).
    fn provide_no_fanout(&self, relative: &Path, optional: bool) -> Result<Option<Vec<u8>>, WorkflowError> {
        self.provide(relative, optional)
    }
}

/// Runs an external repository-specific verifier against a downloaded file;
/// grounded on `pluginRepoverification()->getChecker(...)`.
pub trait PluginVerifier {
    fn is_needed(&self) -> bool;
    fn check(&self, sigpath: Option<&Path>, keypath: Option<&Path>, file: &Path) -> Result<(), WorkflowError>;
}

/// A no-op verifier for repositories that don't configure one.
pub struct NoPluginVerifier;
impl PluginVerifier for NoPluginVerifier {
    fn is_needed(&self) -> bool {
        false
    }
    fn check(&self, _sigpath: Option<&Path>, _keypath: Option<&Path>, _file: &Path) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// `<data type="..." key="...">hint</data>`-style key hints embedded in a
/// `repomd.xml` master index, pointing at an extra file that carries a
/// signing key the repo expects clients to trust.
fn extract_keyhints(master_index: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(master_index);
    let re = Regex::new(r#"<keyhint\s+file="([^"]+)"\s+keyid="([^"]+)"\s*/?>"#).unwrap();
    re.captures_iter(&text)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

pub struct RepoDownloaderWorkflow;

impl RepoDownloaderWorkflow {
    /// Downloads `master_index` (e.g. `repomd.xml`) plus its detached
    /// signature and key siblings, verifies it, and finalizes
    /// `ctx.dest_dir`/`ctx.files` with the master index first.
    pub fn download_master_index(
        mut ctx: DownloadContext,
        master_index: &Path,
        provider: &dyn FileProvider,
        keyring: &KeyRingManager,
        callback: &dyn KeyRingCallback,
        plugin_verifier: &dyn PluginVerifier,
        pubkey_cache_dir: &Path,
    ) -> Result<DownloadContext, WorkflowError> {
        let index_data = provider
            .provide(master_index, false)?
            .ok_or_else(|| WorkflowError::Repo("master index missing after mandatory fetch".to_string()))?;

        let sigpath = with_extension(master_index, "asc");
        let keypath = with_extension(master_index, "key");

        let sig_data = provider.provide(&sigpath, true)?;
        let mut key_data = None;

        if let Some(sig) = &sig_data {
            let key_ids = crate::keyring::KeyAdapter::read_signature_key_ids(sig).unwrap_or_default();
            let key_known = key_ids
                .last()
                .map(|id| keyring.public_key_exists(id).ok().flatten().is_some())
                .unwrap_or(false);
            if !key_known {
                key_data = provider.provide(&keypath, true)?;
            }
        }

        let mut buddy_keys: Vec<String> = Vec::new();
        if ctx.repo_info.repo_gpg_check && master_index.file_name().and_then(|n| n.to_str()) == Some("repomd.xml") {
            for (file, keyid) in extract_keyhints(&index_data) {
                Self::fetch_and_import_hinted_key(&file, &keyid, provider, keyring, pubkey_cache_dir)?;
                buddy_keys.push(keyid);
            }
        }

        if plugin_verifier.is_needed() {
            let index_path = ctx.dest_dir.join(master_index);
            plugin_verifier.check(
                sig_data.as_ref().map(|_| sigpath.as_path()),
                key_data.as_ref().map(|_| keypath.as_path()),
                &index_path,
            )?;
        }

        if ctx.repo_info.repo_gpg_check {
            let is_signed = sig_data.is_some();
            if is_signed || ctx.repo_info.repo_gpg_check_mandatory {
                if let Some(key) = &key_data {
                    keyring
                        .import_key(key, crate::keyring::TrustLevel::General)
                        .map_err(|e| WorkflowError::Repo(e.to_string()))?;
                }

                let verify_ctx = VerifyFileContext { buddy_keys };
                let outcome = keyring
                    .verify_file_signature_workflow(
                        &index_data,
                        sig_data.as_deref(),
                        &ctx.repo_info.alias,
                        &verify_ctx,
                        callback,
                    )
                    .map_err(|e| WorkflowError::Repo(e.to_string()))?;
                ctx.repo_info.valid_repo_signature = outcome.file_validated;
            }
        }

        ctx.repo_info.metadata_path = Some(ctx.dest_dir.clone());

        let mut files = vec![master_index.to_path_buf()];
        if sig_data.is_some() {
            files.push(sigpath);
        }
        if key_data.is_some() {
            files.push(keypath);
        }
        ctx.files = files;

        Ok(ctx)
    }

    /// §4.8 step 5 / scenario 4: a `<keyhint file="..." keyid="...">` names a
    /// key the repo expects clients to trust but hasn't necessarily signed
    /// the master index with itself. If it's not already known in either
    /// ring, load it from the on-disk pubkey cache or fetch it from the repo
    /// (mirror fan-out disabled), confirm the file actually declares the
    /// hinted key id, cache it, and import it into the **general** ring —
    /// never trusted directly; only a successful signature verification
    /// against an already-trusted key promotes a buddy key to trusted.
    fn fetch_and_import_hinted_key(
        file: &str,
        keyid: &str,
        provider: &dyn FileProvider,
        keyring: &KeyRingManager,
        pubkey_cache_dir: &Path,
    ) -> Result<(), WorkflowError> {
        if keyring
            .public_key_exists(keyid)
            .map_err(|e| WorkflowError::Repo(e.to_string()))?
            .is_some()
        {
            return Ok(());
        }

        let cache_path = pubkey_cache_dir.join(file);
        let key_bytes = if cache_path.exists() {
            std::fs::read(&cache_path).map_err(|e| WorkflowError::Repo(e.to_string()))?
        } else {
            let Some(bytes) = provider.provide_no_fanout(Path::new(file), true)? else {
                // An optional key hint that can't be fetched is not fatal;
                // verification simply proceeds without this buddy key.
                return Ok(());
            };
            bytes
        };

        let declares_expected_id = crate::keyring::KeyAdapter::inspect_key_bytes(&key_bytes)
            .map_err(|e| WorkflowError::Repo(e.to_string()))?
            .iter()
            .any(|info| info.matches_id(keyid));
        if !declares_expected_id {
            return Ok(());
        }

        if !cache_path.exists() {
            if let Some(parent) = cache_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| WorkflowError::Repo(e.to_string()))?;
            }
            std::fs::write(&cache_path, &key_bytes).map_err(|e| WorkflowError::Repo(e.to_string()))?;
        }

        keyring
            .import_key(&key_bytes, crate::keyring::TrustLevel::General)
            .map_err(|e| WorkflowError::Repo(e.to_string()))?;
        Ok(())
    }
}

fn with_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::KeyDecision;
    use crate::origin::MirroredOriginSet;
    use crate::repo::types::{RepoInfo, RepoType};
    use std::collections::HashMap;

    struct FakeProvider {
        files: HashMap<PathBuf, Vec<u8>>,
    }
    impl FileProvider for FakeProvider {
        fn provide(&self, relative: &Path, optional: bool) -> Result<Option<Vec<u8>>, WorkflowError> {
            match self.files.get(relative) {
                Some(data) => Ok(Some(data.clone())),
                None if optional => Ok(None),
                None => Err(WorkflowError::Repo(format!("missing mandatory file {relative:?}"))),
            }
        }
    }

    struct AlwaysReject;
    impl KeyRingCallback for AlwaysReject {
        fn ask_accept_unsigned_file(&self, _filedesc: &str) -> bool {
            false
        }
        fn ask_accept_key(&self, _key: &crate::keyring::KeyInfo) -> KeyDecision {
            KeyDecision::Reject
        }
        fn ask_accept_verification_failed(&self, _filedesc: &str, _key: &crate::keyring::KeyInfo) -> bool {
            false
        }
        fn ask_accept_unknown_key(&self, _filedesc: &str, _key_id: &str) -> bool {
            false
        }
        fn info_verify(&self, _filedesc: &str, _key: &crate::keyring::KeyInfo) {}
        fn report_auto_import_key(&self, _key: &crate::keyring::KeyInfo) {}
    }

    fn make_ctx(dir: &Path) -> DownloadContext {
        let origins = MirroredOriginSet::new();
        let info = RepoInfo::new("test-repo", RepoType::RpmMd, origins, dir.join("predl"));
        DownloadContext::new(info, dir.to_path_buf())
    }

    #[test]
    fn unsigned_repo_with_optional_gpgcheck_disabled_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = make_ctx(dir.path());
        ctx.repo_info.repo_gpg_check = false;

        let mut files = HashMap::new();
        files.insert(PathBuf::from("repomd.xml"), b"<repomd></repomd>".to_vec());
        let provider = FakeProvider { files };

        let trusted = dir.path().join("trusted.gpg");
        let general = dir.path().join("general.gpg");
        let keyring = KeyRingManager::new(&trusted, &general, Default::default());

        let result = RepoDownloaderWorkflow::download_master_index(
            ctx,
            Path::new("repomd.xml"),
            &provider,
            &keyring,
            &AlwaysReject,
            &NoPluginVerifier,
            &dir.path().join("pubkeys"),
        )
        .unwrap();
        assert_eq!(result.files, vec![PathBuf::from("repomd.xml")]);
        assert!(!result.repo_info.valid_repo_signature);
    }

    #[test]
    fn missing_master_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = make_ctx(dir.path());
        let provider = FakeProvider { files: HashMap::new() };
        let trusted = dir.path().join("trusted.gpg");
        let general = dir.path().join("general.gpg");
        let keyring = KeyRingManager::new(&trusted, &general, Default::default());

        let result = RepoDownloaderWorkflow::download_master_index(
            ctx,
            Path::new("repomd.xml"),
            &provider,
            &keyring,
            &AlwaysReject,
            &NoPluginVerifier,
            &dir.path().join("pubkeys"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn keyhints_are_extracted_from_master_index() {
        let xml = br#"<repomd><keyhint file="extra.key" keyid="ABCDEF0123456789"/></repomd>"#;
        let hints = extract_keyhints(xml);
        assert_eq!(hints, vec![("extra.key".to_string(), "ABCDEF0123456789".to_string())]);
    }

    #[test]
    fn key_hint_with_matching_id_is_cached_and_imported_into_general_ring() {
        // §4.8 step 5 / scenario 4.
        use sequoia_openpgp::serialize::SerializeInto;

        let dir = tempfile::tempdir().unwrap();
        let ctx = make_ctx(dir.path());

        let (cert, _rev) = sequoia_openpgp::cert::CertBuilder::general_purpose(None, Some("test <t@example.com>"))
            .generate()
            .unwrap();
        let key_id = cert.keyid().to_hex();
        let key_bytes = cert.armored().to_vec().unwrap();

        let mut files = HashMap::new();
        files.insert(
            PathBuf::from("repomd.xml"),
            format!(r#"<repomd><keyhint file="extra.key" keyid="{key_id}"/></repomd>"#).into_bytes(),
        );
        files.insert(PathBuf::from("extra.key"), key_bytes);
        let provider = FakeProvider { files };

        let trusted = dir.path().join("trusted.gpg");
        let general = dir.path().join("general.gpg");
        let keyring = KeyRingManager::new(&trusted, &general, Default::default());
        let pubkey_cache = dir.path().join("pubkeys");

        RepoDownloaderWorkflow::download_master_index(
            ctx,
            Path::new("repomd.xml"),
            &provider,
            &keyring,
            &AlwaysReject,
            &NoPluginVerifier,
            &pubkey_cache,
        )
        .unwrap();

        assert!(keyring.general_public_key_exists(&key_id).unwrap().is_some());
        assert!(keyring.trusted_public_key_exists(&key_id).unwrap().is_none());
        assert!(pubkey_cache.join("extra.key").exists());
    }

    #[test]
    fn key_hint_with_mismatched_id_is_not_imported() {
        use sequoia_openpgp::serialize::SerializeInto;

        let dir = tempfile::tempdir().unwrap();
        let ctx = make_ctx(dir.path());

        let (cert, _rev) = sequoia_openpgp::cert::CertBuilder::general_purpose(None, Some("test <t@example.com>"))
            .generate()
            .unwrap();
        let key_bytes = cert.armored().to_vec().unwrap();

        let mut files = HashMap::new();
        files.insert(
            PathBuf::from("repomd.xml"),
            br#"<repomd><keyhint file="extra.key" keyid="0000000000000000"/></repomd>"#.to_vec(),
        );
        files.insert(PathBuf::from("extra.key"), key_bytes);
        let provider = FakeProvider { files };

        let trusted = dir.path().join("trusted.gpg");
        let general = dir.path().join("general.gpg");
        let keyring = KeyRingManager::new(&trusted, &general, Default::default());

        RepoDownloaderWorkflow::download_master_index(
            ctx,
            Path::new("repomd.xml"),
            &provider,
            &keyring,
            &AlwaysReject,
            &NoPluginVerifier,
            &dir.path().join("pubkeys"),
        )
        .unwrap();

        assert!(keyring.general_public_key_exists("0000000000000000").unwrap().is_none());
    }
}
