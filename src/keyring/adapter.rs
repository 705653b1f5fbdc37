//! Thin wrapper around `sequoia-openpgp` that plays the role the original's
//! `KeyManagerCtx` plays over `gpgme`: one adapter instance owns a single
//! on-disk keyring file (a concatenation of OpenPGP certificates) and knows
//! how to list, import, export, delete and verify against it.
//!
//! Grounded on `examples/original_source/zypp-common/KeyManager.cc`
//! (`listKeys`, `readKeyFromFile`/`importKey`, `exportKey`, `deleteKey`,
//! `verify`, `readSignatureFingerprints`) and on the teacher's
//! `src/helpers/verifier.rs` for the sequoia policy/verification idiom.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sequoia_openpgp::cert::CertParser;
use sequoia_openpgp::packet::Signature;
use sequoia_openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
};
use sequoia_openpgp::parse::{PacketParser, PacketParserResult, Parse};
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::serialize::SerializeInto;
use sequoia_openpgp::{Cert, KeyHandle, Packet};

use crate::error::KeyringError;

/// Relaxations of the default signature-validation policy. Carried over
/// verbatim from the teacher's `WeakCryptoConfig`; unlike the teacher's
/// `verify_signature` helper (which reuses `min_dsa_key_size` for the RSA
/// check too), the two fields are kept independent here.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct WeakCryptoConfig {
    pub allow_sha1: bool,
    pub min_dsa_key_size: Option<u32>,
    pub min_rsa_key_size: Option<u32>,
}

fn build_policy(weak_crypto: &WeakCryptoConfig) -> StandardPolicy<'static> {
    let mut policy = StandardPolicy::new();
    if weak_crypto.allow_sha1 {
        policy.accept_hash(sequoia_openpgp::types::HashAlgorithm::SHA1);
    }
    if weak_crypto.min_dsa_key_size.is_some_and(|n| n <= 1024) {
        policy.accept_asymmetric_algo(sequoia_openpgp::policy::AsymmetricAlgorithm::DSA1024);
    }
    if weak_crypto.min_rsa_key_size.is_some_and(|n| n <= 1024) {
        policy.accept_asymmetric_algo(sequoia_openpgp::policy::AsymmetricAlgorithm::RSA1024);
    }
    policy
}

/// A subset of a `Cert`'s identifying data, analogous to `PublicKeyData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub key_id: String,
    pub user_ids: Vec<String>,
    pub created: i64,
}

impl KeyInfo {
    fn from_cert(cert: &Cert) -> Self {
        let fingerprint = cert.fingerprint().to_hex();
        let key_id = cert.keyid().to_hex();
        let user_ids = cert
            .userids()
            .map(|u| String::from_utf8_lossy(u.userid().value()).into_owned())
            .collect();
        let created = cert
            .primary_key()
            .key()
            .creation_time()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            fingerprint,
            key_id,
            user_ids,
            created,
        }
    }

    /// Matches an id that is either the short key id or the full fingerprint.
    pub fn matches_id(&self, id: &str) -> bool {
        let id = id.to_ascii_lowercase();
        self.fingerprint.to_ascii_lowercase().ends_with(&id) || self.key_id.to_ascii_lowercase() == id
    }
}

/// A single keyring file on disk, loaded into memory and rewritten whole on
/// mutation -- the original's gpgme keyrings are similarly just a directory
/// `sequoia` doesn't need, so one flat file per trust level is enough here.
pub struct KeyAdapter {
    path: PathBuf,
    weak_crypto: WeakCryptoConfig,
}

impl KeyAdapter {
    pub fn new(path: impl Into<PathBuf>, weak_crypto: WeakCryptoConfig) -> Self {
        Self {
            path: path.into(),
            weak_crypto,
        }
    }

    fn load_certs(&self) -> Result<Vec<Cert>, KeyringError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .map_err(|e| KeyringError::KeyRing(format!("opening {}: {e}", self.path.display())))?;
        let parser = CertParser::from_reader(BufReader::new(file))
            .map_err(|e| KeyringError::Adapter(e.to_string()))?;
        parser
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| KeyringError::Adapter(e.to_string()))
    }

    fn save_certs(&self, certs: &[Cert]) -> Result<(), KeyringError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| KeyringError::KeyRing(format!("creating {}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)
            .map_err(|e| KeyringError::KeyRing(format!("writing {}: {e}", tmp.display())))?;
        for cert in certs {
            let bytes = cert
                .to_vec()
                .map_err(|e| KeyringError::Adapter(e.to_string()))?;
            file.write_all(&bytes)
                .map_err(|e| KeyringError::KeyRing(e.to_string()))?;
        }
        fs::rename(&tmp, &self.path)
            .map_err(|e| KeyringError::KeyRing(format!("renaming {}: {e}", tmp.display())))?;
        Ok(())
    }

    pub fn list_keys(&self) -> Result<Vec<KeyInfo>, KeyringError> {
        Ok(self.load_certs()?.iter().map(KeyInfo::from_cert).collect())
    }

    pub fn find_key(&self, id: &str) -> Result<Option<KeyInfo>, KeyringError> {
        Ok(self
            .load_certs()?
            .iter()
            .map(KeyInfo::from_cert)
            .find(|k| k.matches_id(id)))
    }

    /// Parse a standalone key file (possibly multi-key) without touching any
    /// on-disk keyring, so a caller can confirm it declares an expected key
    /// id before deciding to import it. Mirrors `readSignatureFingerprints`'s
    /// read-only posture but over a key file rather than a signature.
    pub fn inspect_key_bytes(data: &[u8]) -> Result<Vec<KeyInfo>, KeyringError> {
        CertParser::from_bytes(data)
            .map_err(|e| KeyringError::Adapter(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| KeyringError::Adapter(e.to_string()))
            .map(|certs| certs.iter().map(KeyInfo::from_cert).collect())
    }

    /// Import a certificate, merging with any existing copy of the same
    /// primary key (same behavior as gpgme's "unchanged"/merge semantics).
    pub fn import_key_bytes(&self, data: &[u8]) -> Result<KeyInfo, KeyringError> {
        let incoming = Cert::from_bytes(data).map_err(|e| KeyringError::Adapter(e.to_string()))?;
        let mut certs = self.load_certs()?;
        if let Some(existing) = certs
            .iter_mut()
            .find(|c| c.fingerprint() == incoming.fingerprint())
        {
            *existing = existing
                .clone()
                .merge_public(incoming.clone())
                .map_err(|e| KeyringError::Adapter(e.to_string()))?;
        } else {
            certs.push(incoming.clone());
        }
        self.save_certs(&certs)?;
        Ok(KeyInfo::from_cert(&incoming))
    }

    pub fn import_key_file(&self, keyfile: &Path) -> Result<KeyInfo, KeyringError> {
        let data = fs::read(keyfile)
            .map_err(|e| KeyringError::KeyRing(format!("reading {}: {e}", keyfile.display())))?;
        self.import_key_bytes(&data)
    }

    pub fn delete_key(&self, id: &str) -> Result<bool, KeyringError> {
        let mut certs = self.load_certs()?;
        let before = certs.len();
        certs.retain(|c| !KeyInfo::from_cert(c).matches_id(id));
        if certs.len() == before {
            return Ok(false);
        }
        self.save_certs(&certs)?;
        Ok(true)
    }

    pub fn export_key(&self, id: &str) -> Result<Option<Vec<u8>>, KeyringError> {
        let certs = self.load_certs()?;
        let Some(cert) = certs.iter().find(|c| KeyInfo::from_cert(c).matches_id(id)) else {
            return Ok(None);
        };
        let armored = cert
            .armored()
            .to_vec()
            .map_err(|e| KeyringError::Adapter(e.to_string()))?;
        Ok(Some(armored))
    }

    /// Read the issuer key id(s) referenced by a detached signature, without
    /// verifying anything -- mirrors `readSignatureFingerprints`.
    pub fn read_signature_key_ids(sig_bytes: &[u8]) -> Result<Vec<String>, KeyringError> {
        let mut ids = Vec::new();
        let mut ppr = PacketParser::from_bytes(sig_bytes)
            .map_err(|e| KeyringError::Adapter(e.to_string()))?;
        while let PacketParserResult::Some(pp) = ppr {
            let (packet, next) = pp
                .recurse()
                .map_err(|e| KeyringError::Adapter(e.to_string()))?;
            if let Packet::Signature(sig) = packet {
                for issuer in sig_issuers(&sig) {
                    ids.push(issuer);
                }
            }
            ppr = next;
        }
        Ok(ids)
    }

    /// Verify `data` against `signature` using this keyring's certificates.
    /// Returns the fingerprint of whichever certificate validated it.
    ///
    /// Checked at the signature's own creation time rather than "now": a key
    /// that has since expired but was valid when it signed is a *good*
    /// signature per §8's boundary property, matching `zypp/KeyRing.cc`'s own
    /// gpgme-backed behavior. This is a known migration hazard (an attacker
    /// who gets hold of an expired key's private material after expiry can
    /// still produce signatures this accepts) carried over deliberately; see
    /// DESIGN.md.
    pub fn verify_detached(&self, data: &[u8], signature: &[u8]) -> Result<String, KeyringError> {
        let certs = self.load_certs()?;
        let policy = build_policy(&self.weak_crypto);
        let reference_time = Self::signature_creation_time(signature)?;
        let helper = VerifyHelper::new(&certs);
        let mut verifier = DetachedVerifierBuilder::from_bytes(signature)
            .map_err(|e| KeyringError::Adapter(e.to_string()))?
            .with_policy(&policy, reference_time, helper)
            .map_err(|e| KeyringError::Adapter(e.to_string()))?;
        verifier
            .verify_bytes(data)
            .map_err(|e| KeyringError::Adapter(e.to_string()))?;
        Ok(verifier.helper_ref().matched_fingerprint.clone())
    }

    /// The creation time of the last signature packet found, used as the
    /// verification reference time so a key's *current* expiry can't
    /// retroactively invalidate a signature it made while still valid.
    fn signature_creation_time(sig_bytes: &[u8]) -> Result<Option<std::time::SystemTime>, KeyringError> {
        let mut time = None;
        let mut ppr =
            PacketParser::from_bytes(sig_bytes).map_err(|e| KeyringError::Adapter(e.to_string()))?;
        while let PacketParserResult::Some(pp) = ppr {
            let (packet, next) = pp.recurse().map_err(|e| KeyringError::Adapter(e.to_string()))?;
            if let Packet::Signature(sig) = packet {
                if let Some(t) = sig.signature_creation_time() {
                    time = Some(t);
                }
            }
            ppr = next;
        }
        Ok(time)
    }
}

fn sig_issuers(sig: &Signature) -> Vec<String> {
    sig.get_issuers()
        .into_iter()
        .map(|handle| match handle {
            KeyHandle::Fingerprint(fp) => fp.to_hex(),
            KeyHandle::KeyID(id) => id.to_hex(),
        })
        .collect()
}

struct VerifyHelper<'a> {
    certs: &'a [Cert],
    matched_fingerprint: String,
}

impl<'a> VerificationHelper for VerifyHelper<'a> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> sequoia_openpgp::Result<Vec<Cert>> {
        Ok(self.certs.to_vec())
    }

    fn check(&mut self, structure: MessageStructure) -> sequoia_openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                for result in results {
                    if let Ok(sig) = result {
                        self.matched_fingerprint = sig.cert().fingerprint().to_hex();
                        return Ok(());
                    }
                }
            }
        }
        Err(anyhow::anyhow!("no valid signature found"))
    }
}

impl<'a> VerifyHelper<'a> {
    fn new(certs: &'a [Cert]) -> Self {
        Self {
            certs,
            matched_fingerprint: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_info_matches_by_suffix_or_exact_keyid() {
        let info = KeyInfo {
            fingerprint: "ABCD1234EF567890ABCD1234EF567890ABCD1234".to_string(),
            key_id: "ABCD1234EF567890".to_string(),
            user_ids: vec![],
            created: 0,
        };
        assert!(info.matches_id("ABCD1234EF567890"));
        assert!(info.matches_id("abcd1234ef567890"));
        assert!(!info.matches_id("deadbeef"));
    }

    #[test]
    fn empty_keyring_file_yields_no_keys() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = KeyAdapter::new(dir.path().join("keyring.gpg"), WeakCryptoConfig::default());
        assert!(adapter.list_keys().unwrap().is_empty());
    }
}
