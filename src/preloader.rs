//! Background package preloader.
//!
//! Grounded on `examples/original_source/zypp/target/commitpackagepreloader.cc`:
//! a worker pool (one per configured concurrent connection) pulling from a
//! shared job queue, per-repository mirror selection that favors mirrors
//! with the fewest outstanding references plus misses
//! (`refs + miss`, ascending), and "tainting" a mirror that 404s/errors so
//! the same worker tries a different one before giving up on the file
//! entirely. The original drives this through an in-process async event
//! loop (`zyppng::EventLoop` + `NetworkRequestDispatcher`); this crate has no
//! async runtime in its dependency stack, so the worker pool is plain OS
//! threads pulling off a shared queue, matching the blocking style the rest
//! of this crate's transfer code already uses.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{Read as _, Write as _};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use openssl::hash::{Hasher, MessageDigest};
use url::Url;

use crate::error::TransferError;
use crate::reports::Reports;

/// A single package that needs to land in the predownload cache before the
/// commit phase runs.
#[derive(Debug, Clone)]
pub struct PreloadRequest {
    pub repo_id: String,
    pub filename: String,
    pub expected_sha256: Option<[u8; 32]>,
    pub download_size: u64,
}

#[derive(Debug, Clone)]
struct Job {
    repo_id: String,
    filename: String,
    expected_sha256: Option<[u8; 32]>,
    expected_size: u64,
}

#[derive(Debug, Clone)]
struct MirrorStat {
    base_url: Url,
    refs: usize,
    miss: usize,
}

#[derive(Debug, Default)]
struct RepoMirrors {
    mirrors: Vec<MirrorStat>,
}

impl RepoMirrors {
    /// Picks the mirror with the smallest `refs + miss`, optionally skipping
    /// one index and optionally excluding already-tainted mirrors.
    fn find_usable(&self, skip: Option<usize>, tainted: &[usize], allow_tainted: bool) -> Option<usize> {
        self.mirrors
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .filter(|(i, _)| allow_tainted || !tainted.contains(i))
            .min_by_key(|(_, m)| m.refs + m.miss)
            .map(|(i, _)| i)
    }
}

/// Outcome of preloading one requested file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadOutcome {
    AlreadyCached,
    Downloaded,
    NotFound,
    Error(String),
}

pub struct PreloadResult {
    pub repo_id: String,
    pub filename: String,
    pub outcome: PreloadOutcome,
}

pub struct PreloadSummary {
    pub results: Vec<PreloadResult>,
    pub missed: bool,
    pub downloaded_bytes: u64,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    mirrors: Mutex<HashMap<String, RepoMirrors>>,
    results: Mutex<Vec<PreloadResult>>,
    missed: Mutex<bool>,
    downloaded_bytes: Mutex<u64>,
}

/// Downloads everything in `requests` into `predownload_dir`, using up to
/// `max_concurrent` worker threads and the given per-repository mirror
/// lists. Returns once every job has either succeeded or exhausted every
/// mirror for its repository.
pub fn preload(
    requests: Vec<PreloadRequest>,
    repo_mirrors: &HashMap<String, Vec<Url>>,
    predownload_dir: &Path,
    client: &reqwest::blocking::Client,
    reports: &(dyn Reports + Sync),
    max_concurrent: usize,
) -> Result<PreloadSummary, TransferError> {
    let mut queue = VecDeque::new();
    let mut mirrors = HashMap::new();
    // Scenario 1: a step whose target already exists in the predownload
    // cache and matches the expected checksum does no I/O and is reported
    // immediately as `AlreadyCached` rather than silently dropped.
    let mut already_cached = Vec::new();

    for req in requests {
        let target = predownload_dir.join(&req.repo_id).join(&req.filename);
        if target.exists() {
            if let Some(expected) = req.expected_sha256 {
                if file_matches(&target, &expected)? {
                    already_cached.push(PreloadResult {
                        repo_id: req.repo_id,
                        filename: req.filename,
                        outcome: PreloadOutcome::AlreadyCached,
                    });
                    continue;
                }
            } else {
                already_cached.push(PreloadResult {
                    repo_id: req.repo_id,
                    filename: req.filename,
                    outcome: PreloadOutcome::AlreadyCached,
                });
                continue;
            }
        }
        queue.push_back(Job {
            repo_id: req.repo_id.clone(),
            filename: req.filename,
            expected_sha256: req.expected_sha256,
            expected_size: req.download_size,
        });
        mirrors.entry(req.repo_id.clone()).or_insert_with(|| {
            let urls = repo_mirrors.get(&req.repo_id).cloned().unwrap_or_default();
            RepoMirrors {
                mirrors: urls
                    .into_iter()
                    .map(|base_url| MirrorStat {
                        base_url,
                        refs: 0,
                        miss: 0,
                    })
                    .collect(),
            }
        });
    }

    if queue.is_empty() {
        return Ok(PreloadSummary {
            results: already_cached,
            missed: false,
            downloaded_bytes: 0,
        });
    }

    let worker_count = max_concurrent.max(1).min(queue.len());
    let shared = Shared {
        queue: Mutex::new(queue),
        mirrors: Mutex::new(mirrors),
        results: Mutex::new(already_cached),
        missed: Mutex::new(false),
        downloaded_bytes: Mutex::new(0),
    };

    reports.important(&format!("preloading packages via {worker_count} connections"));

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| worker_loop(&shared, predownload_dir, client, reports));
        }
    });

    let results = shared.results.into_inner().unwrap();
    let missed = *shared.missed.lock().unwrap();
    let downloaded_bytes = *shared.downloaded_bytes.lock().unwrap();

    Ok(PreloadSummary {
        results,
        missed,
        downloaded_bytes,
    })
}

fn worker_loop(shared: &Shared, predownload_dir: &Path, client: &reqwest::blocking::Client, reports: &(dyn Reports + Sync)) {
    let mut current_mirror: Option<(String, usize)> = None;
    let mut tainted: Vec<usize> = Vec::new();

    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            queue.pop_front()
        };
        let job = match job {
            Some(job) => job,
            None => break,
        };

        if current_mirror.as_ref().map(|(r, _)| r) != Some(&job.repo_id) {
            if let Some((repo, idx)) = current_mirror.take() {
                let mut mirrors = shared.mirrors.lock().unwrap();
                if let Some(rm) = mirrors.get_mut(&repo) {
                    rm.mirrors[idx].refs = rm.mirrors[idx].refs.saturating_sub(1);
                }
            }
            tainted.clear();
        }

        let picked = {
            let mut mirrors = shared.mirrors.lock().unwrap();
            let rm = mirrors.entry(job.repo_id.clone()).or_default();
            match rm.find_usable(None, &tainted, true) {
                Some(idx) => {
                    rm.mirrors[idx].refs += 1;
                    current_mirror = Some((job.repo_id.clone(), idx));
                    Some(rm.mirrors[idx].base_url.clone())
                }
                None => None,
            }
        };

        let Some(base_url) = picked else {
            push_result(shared, job.repo_id, job.filename, PreloadOutcome::Error("no mirror found".into()));
            *shared.missed.lock().unwrap() = true;
            continue;
        };

        let outcome = try_download(&base_url, &job, predownload_dir, client, reports, shared, &mut tainted, &mut current_mirror);

        if matches!(outcome, PreloadOutcome::Error(_) | PreloadOutcome::NotFound) {
            *shared.missed.lock().unwrap() = true;
        }
        push_result(shared, job.repo_id, job.filename, outcome);
    }

    if let Some((repo, idx)) = current_mirror {
        let mut mirrors = shared.mirrors.lock().unwrap();
        if let Some(rm) = mirrors.get_mut(&repo) {
            rm.mirrors[idx].refs = rm.mirrors[idx].refs.saturating_sub(1);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn try_download(
    base_url: &Url,
    job: &Job,
    predownload_dir: &Path,
    client: &reqwest::blocking::Client,
    reports: &(dyn Reports + Sync),
    shared: &Shared,
    tainted: &mut Vec<usize>,
    current_mirror: &mut Option<(String, usize)>,
) -> PreloadOutcome {
    let target = predownload_dir.join(&job.repo_id).join(&job.filename);
    if let Some(parent) = target.parent() {
        if fs::create_dir_all(parent).is_err() {
            return PreloadOutcome::Error("could not create target directory".into());
        }
    }

    let mut url = base_url.clone();
    {
        let mut segments = match url.path_segments_mut() {
            Ok(s) => s,
            Err(_) => return PreloadOutcome::Error("mirror URL cannot be a base".into()),
        };
        segments.push(&job.filename);
    }

    match client.get(url.clone()).send().and_then(|r| r.error_for_status()) {
        Ok(mut response) => {
            let buf = match read_with_throttled_progress(&mut response, job, reports) {
                Ok(buf) => buf,
                Err(()) => return PreloadOutcome::Error("failed reading response body".into()),
            };
            if let Some(expected) = job.expected_sha256 {
                match sha256(&buf) {
                    Ok(actual) if actual == expected => {}
                    Ok(_) => return PreloadOutcome::Error("checksum mismatch".into()),
                    Err(e) => return PreloadOutcome::Error(e.to_string()),
                }
            }
            match write_atomically(&target, &buf) {
                Ok(()) => {
                    *shared.downloaded_bytes.lock().unwrap() += buf.len() as u64;
                    reports.data("preloaded", &job.filename);
                    PreloadOutcome::Downloaded
                }
                Err(e) => PreloadOutcome::Error(e.to_string()),
            }
        }
        Err(e) => {
            reports.warning(&format!("download from mirror failed for {url}: {e}, trying next mirror"));
            if taint_and_retry(shared, job, tainted, current_mirror) {
                reports.info(&format!("retrying {} on a different mirror", job.filename));
                let new_base = {
                    let mirrors = shared.mirrors.lock().unwrap();
                    let (_, idx) = current_mirror.as_ref().unwrap();
                    mirrors.get(&job.repo_id).unwrap().mirrors[*idx].base_url.clone()
                };
                return try_download(&new_base, job, predownload_dir, client, reports, shared, tainted, current_mirror);
            }
            if e.status().map(|s| s.as_u16()) == Some(404) {
                PreloadOutcome::NotFound
            } else {
                PreloadOutcome::Error(e.to_string())
            }
        }
    }
}

fn taint_and_retry(shared: &Shared, job: &Job, tainted: &mut Vec<usize>, current_mirror: &mut Option<(String, usize)>) -> bool {
    let mut mirrors = shared.mirrors.lock().unwrap();
    let rm = match mirrors.get_mut(&job.repo_id) {
        Some(rm) => rm,
        None => return false,
    };

    let (_, current_idx) = match current_mirror {
        Some(pair) => pair,
        None => return false,
    };
    rm.mirrors[*current_idx].miss += 1;
    tainted.push(*current_idx);

    match rm.find_usable(Some(*current_idx), tainted, false) {
        Some(new_idx) => {
            rm.mirrors[*current_idx].refs = rm.mirrors[*current_idx].refs.saturating_sub(1);
            rm.mirrors[new_idx].refs += 1;
            *current_idx = new_idx;
            true
        }
        None => false,
    }
}

/// Reads the whole response body, reporting download progress against
/// `job.expected_size` at most once per 500ms (§4.7).
fn read_with_throttled_progress(
    response: &mut reqwest::blocking::Response,
    job: &Job,
    reports: &(dyn Reports + Sync),
) -> Result<Vec<u8>, ()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    let mut last_report = std::time::Instant::now();
    loop {
        let n = response.read(&mut chunk).map_err(|_| ())?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if job.expected_size > 0 && last_report.elapsed() >= std::time::Duration::from_millis(500) {
            reports.data(
                "preload-progress",
                &format!("{}: {}/{} bytes", job.filename, buf.len(), job.expected_size),
            );
            last_report = std::time::Instant::now();
        }
    }
    Ok(buf)
}

fn push_result(shared: &Shared, repo_id: String, filename: String, outcome: PreloadOutcome) {
    shared.results.lock().unwrap().push(PreloadResult {
        repo_id,
        filename,
        outcome,
    });
}

fn sha256(data: &[u8]) -> Result<[u8; 32], TransferError> {
    let mut hasher =
        Hasher::new(MessageDigest::sha256()).map_err(|e| TransferError::Internal(e.to_string()))?;
    hasher.update(data).map_err(|e| TransferError::Internal(e.to_string()))?;
    let digest = hasher.finish().map_err(|e| TransferError::Internal(e.to_string()))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

fn file_matches(path: &Path, expected: &[u8; 32]) -> Result<bool, TransferError> {
    let data = fs::read(path).map_err(|e| TransferError::Internal(e.to_string()))?;
    Ok(&sha256(&data)? == expected)
}

fn write_atomically(target: &Path, data: &[u8]) -> Result<(), TransferError> {
    let part = target.with_extension("part");
    {
        let mut file = File::create(&part).map_err(|e| TransferError::Internal(e.to_string()))?;
        file.write_all(data).map_err(|e| TransferError::Internal(e.to_string()))?;
        file.sync_all().map_err(|e| TransferError::Internal(e.to_string()))?;
        let mut perms = file
            .metadata()
            .map_err(|e| TransferError::Internal(e.to_string()))?
            .permissions();
        perms.set_mode(0o644);
        file.set_permissions(perms)
            .map_err(|e| TransferError::Internal(e.to_string()))?;
    }
    fs::rename(&part, target).map_err(|e| TransferError::Internal(e.to_string()))
}

/// Remove everything under each repository's predownload directory; called
/// once the commit phase has consumed whatever it needed.
pub fn cleanup_caches(predownload_dir: &Path, repo_ids: &[String]) -> Result<(), TransferError> {
    for repo_id in repo_ids {
        let dir = predownload_dir.join(repo_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| TransferError::Internal(e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_selection_prefers_fewest_refs_plus_misses() {
        let mirrors = RepoMirrors {
            mirrors: vec![
                MirrorStat { base_url: Url::parse("http://a.example.com").unwrap(), refs: 2, miss: 0 },
                MirrorStat { base_url: Url::parse("http://b.example.com").unwrap(), refs: 0, miss: 1 },
                MirrorStat { base_url: Url::parse("http://c.example.com").unwrap(), refs: 0, miss: 0 },
            ],
        };
        assert_eq!(mirrors.find_usable(None, &[], true), Some(2));
    }

    #[test]
    fn tainted_mirrors_are_excluded_when_allow_tainted_is_false() {
        let mirrors = RepoMirrors {
            mirrors: vec![
                MirrorStat { base_url: Url::parse("http://a.example.com").unwrap(), refs: 0, miss: 0 },
                MirrorStat { base_url: Url::parse("http://b.example.com").unwrap(), refs: 0, miss: 0 },
            ],
        };
        assert_eq!(mirrors.find_usable(None, &[0], false), Some(1));
    }

    #[test]
    fn no_usable_mirror_when_all_tainted() {
        let mirrors = RepoMirrors {
            mirrors: vec![MirrorStat { base_url: Url::parse("http://a.example.com").unwrap(), refs: 0, miss: 0 }],
        };
        assert_eq!(mirrors.find_usable(None, &[0], false), None);
    }

    #[test]
    fn already_cached_file_with_matching_checksum_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let predownload = dir.path().join("predl");
        let repo_dir = predownload.join("myrepo");
        fs::create_dir_all(&repo_dir).unwrap();
        fs::write(repo_dir.join("pkg.rpm"), b"payload").unwrap();
        let digest = sha256(b"payload").unwrap();

        let client = reqwest::blocking::Client::new();
        let reports = crate::reports::RecordingReports::new();
        let summary = preload(
            vec![PreloadRequest {
                repo_id: "myrepo".into(),
                filename: "pkg.rpm".into(),
                expected_sha256: Some(digest),
                download_size: 7,
            }],
            &HashMap::new(),
            &predownload,
            &client,
            &reports,
            2,
        )
        .unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].outcome, PreloadOutcome::AlreadyCached);
        assert!(!summary.missed);
    }
}
