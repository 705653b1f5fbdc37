//! Media attachment and the media-change dialogue.
//!
//! Grounded on `examples/original_source/zypp/zypp/ng/media/provide.cc`
//! (the attach loop: find-existing-by-`isSameMedium`, else attach and
//! retry-on-failure through a reporter-driven action loop with
//! ABORT/IGNORE/EJECT/RETRY/CHANGE_URL) and the teacher's `medium.rs` for
//! the refcounted-handle/lock-guarded-statefile idiom this module's
//! `MediaHandle` follows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::MediaError;
use crate::origin::MirroredOrigin;

/// What the user (or an unattended policy) decides when a medium can't be
/// attached as requested. Mirrors `MediaChangeReport::Action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaChangeAction {
    Abort,
    Ignore,
    Eject,
    Retry,
    ChangeUrl,
}

/// Why the medium change dialogue was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaChangeReason {
    /// Medium does not exist / path unreachable.
    Invalid,
    /// Medium exists but isn't the one requested (wrong disc, wrong mirror
    /// content).
    Wrong,
}

/// Caller-supplied policy for the attach loop's decision points, and an
/// optional request to redirect to a different URL on `ChangeUrl`.
pub trait MediaChangeCallback {
    fn on_media_problem(&self, reason: MediaChangeReason, current_url: &str) -> MediaChangeAction;
    /// Only consulted after `ChangeUrl` is returned; `None` aborts instead.
    fn replacement_url(&self) -> Option<url::Url>;
}

/// An unattended policy that always aborts -- the safe default when no
/// interactive decision-maker is wired up.
pub struct AbortOnProblem;
impl MediaChangeCallback for AbortOnProblem {
    fn on_media_problem(&self, _reason: MediaChangeReason, _current_url: &str) -> MediaChangeAction {
        MediaChangeAction::Abort
    }
    fn replacement_url(&self) -> Option<url::Url> {
        None
    }
}

/// What actually attaching a medium looks like in this crate: for
/// downloading schemes this is a no-op (the transfer engine fetches
/// directly); for local/volatile media (`cd`, `dvd`, `dir`) it resolves to a
/// local mount path. Implementations plug in whatever backing mechanism the
/// embedder has (an actual mount call, a pre-populated directory for tests).
pub trait MediumAttacher {
    fn attach(&self, origin: &MirroredOrigin) -> Result<PathBuf, MediaError>;
    fn is_same_medium(&self, a: &MirroredOrigin, b: &MirroredOrigin) -> bool;
}

struct AttachedMedium {
    origin: MirroredOrigin,
    local_path: PathBuf,
    refcount: usize,
}

/// Dedups attach requests against already-attached media and drives the
/// change dialogue on failure. One instance is shared across a session
/// (`Arc`-friendly, internally locked) the same way the teacher's `Pool`
/// lock guard lets multiple callers share one on-disk resource safely.
pub struct MediaProvider<A: MediumAttacher> {
    attacher: A,
    attached: Mutex<HashMap<u64, AttachedMedium>>,
    next_id: Mutex<u64>,
}

/// A refcounted handle to an attached medium's local path. Call
/// [`MediaProvider::release`] when done with it; the medium stays attached
/// as long as any handle to it is outstanding.
#[derive(Clone)]
pub struct MediaHandle {
    id: u64,
    local_path: PathBuf,
}

impl MediaHandle {
    pub fn local_path(&self) -> &std::path::Path {
        &self.local_path
    }
}

/// A promise to attach `origin` on first use. `attachMediaIfNeeded` is
/// idempotent for a given handle: it attaches once and returns the same
/// [`MediaHandle`] on every later call.
pub struct LazyMediaHandle {
    origin: MirroredOrigin,
    cached: Mutex<Option<MediaHandle>>,
}

impl LazyMediaHandle {
    pub fn new(origin: MirroredOrigin) -> Self {
        Self { origin, cached: Mutex::new(None) }
    }
}

/// A spec describing the medium to attach: a label plus optional
/// media-number/media-file used to verify the right disc is inserted. Two
/// specs refer to the *same medium* iff the authorities are equal and the
/// labels and media numbers match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvideMediaSpec {
    pub label: String,
    pub media_number: Option<u32>,
    pub media_file: Option<PathBuf>,
}

impl ProvideMediaSpec {
    pub fn is_same_medium(a: (&MirroredOrigin, &ProvideMediaSpec), b: (&MirroredOrigin, &ProvideMediaSpec)) -> bool {
        a.0.authority().url() == b.0.authority().url() && a.1.label == b.1.label && a.1.media_number == b.1.media_number
    }
}

/// Options for fetching one file off an attached medium.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvideFileSpec {
    pub optional: bool,
    /// Succeed without downloading iff the file exists on the medium.
    pub check_exists_only: bool,
}

/// The result of a successful `provide(handle, file, spec)` call: a managed
/// local path plus the mirror origin it actually came from.
#[derive(Debug, Clone)]
pub struct ProvideRes {
    pub local_path: PathBuf,
    pub origin: MirroredOrigin,
}

/// Enumerates and filters the devices available for a volatile medium (an
/// optical drive, a removable disk) so the attach loop can pick one the OS
/// hasn't already claimed.
pub trait VolatileDeviceSource {
    fn detect_devices(&self) -> Vec<PathBuf>;
    fn is_mounted_by_os(&self, device: &Path) -> bool;
}

/// Picks which detected device to attach: candidates are devices not
/// already mounted by the OS; the currently-in-use device is kept if it
/// survives filtering, otherwise the first remaining candidate is used. An
/// empty candidate set after filtering means the medium is jammed.
pub fn select_volatile_device(
    source: &dyn VolatileDeviceSource,
    current: Option<&Path>,
) -> Result<PathBuf, MediaError> {
    let candidates: Vec<PathBuf> = source
        .detect_devices()
        .into_iter()
        .filter(|d| !source.is_mounted_by_os(d))
        .collect();
    if candidates.is_empty() {
        return Err(MediaError::Jammed);
    }
    if let Some(current) = current {
        if let Some(kept) = candidates.iter().find(|c| c.as_path() == current) {
            return Ok(kept.clone());
        }
    }
    Ok(candidates[0].clone())
}

impl<A: MediumAttacher> MediaProvider<A> {
    pub fn new(attacher: A) -> Self {
        Self {
            attacher,
            attached: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Attach `origin`, reusing an already-attached medium if one matches,
    /// otherwise running the attach-with-retry loop.
    pub fn provide(
        &self,
        origin: &MirroredOrigin,
        callback: &dyn MediaChangeCallback,
    ) -> Result<MediaHandle, MediaError> {
        {
            let mut attached = self.attached.lock().unwrap();
            if let Some((&id, medium)) = attached
                .iter_mut()
                .find(|(_, m)| self.attacher.is_same_medium(&m.origin, origin))
            {
                medium.refcount += 1;
                return Ok(MediaHandle { id, local_path: medium.local_path.clone() });
            }
        }

        let mut current = origin.clone();
        loop {
            match self.attacher.attach(&current) {
                Ok(local_path) => {
                    let mut next_id = self.next_id.lock().unwrap();
                    let id = *next_id;
                    *next_id += 1;
                    drop(next_id);

                    let mut attached = self.attached.lock().unwrap();
                    attached.insert(
                        id,
                        AttachedMedium { origin: current, local_path: local_path.clone(), refcount: 1 },
                    );
                    return Ok(MediaHandle { id, local_path });
                }
                Err(MediaError::NotDesired) => {
                    match self.run_change_dialogue(MediaChangeReason::Wrong, &current, callback)? {
                        Some(next) => current = next,
                        None => return Err(MediaError::AbortRequest),
                    }
                }
                Err(MediaError::Media(_)) | Err(MediaError::FileNotFound(_)) => {
                    match self.run_change_dialogue(MediaChangeReason::Invalid, &current, callback)? {
                        Some(next) => current = next,
                        None => return Err(MediaError::AbortRequest),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Attaches `lazy.origin` on first call; every later call (for the same
    /// `LazyMediaHandle`) returns the cached handle without re-attaching or
    /// bumping its refcount again.
    pub fn attach_media_if_needed(
        &self,
        lazy: &LazyMediaHandle,
        callback: &dyn MediaChangeCallback,
    ) -> Result<MediaHandle, MediaError> {
        let mut cached = lazy.cached.lock().unwrap();
        if let Some(handle) = cached.as_ref() {
            return Ok(handle.clone());
        }
        let handle = self.provide(&lazy.origin, callback)?;
        *cached = Some(handle.clone());
        Ok(handle)
    }

    /// Fetches one file off `handle`'s medium. If `spec.check_exists_only`,
    /// succeeds without copying anything iff the file exists.
    pub fn provide_file(
        &self,
        handle: &MediaHandle,
        relative: &Path,
        spec: &ProvideFileSpec,
    ) -> Result<ProvideRes, MediaError> {
        let full = handle.local_path.join(relative);
        if !full.exists() {
            return Err(MediaError::FileNotFound(relative.display().to_string()));
        }
        let origin = self
            .attached
            .lock()
            .unwrap()
            .get(&handle.id)
            .map(|m| m.origin.clone())
            .ok_or_else(|| MediaError::Media("handle refers to a released medium".to_string()))?;
        Ok(ProvideRes { local_path: full, origin })
    }

    /// Runs the ABORT/IGNORE/EJECT/RETRY/CHANGE_URL loop once; returns the
    /// origin to retry with, or `None` if the caller should give up.
    /// EJECT loops internally (same as the original's `do { ... } while
    /// (user == EJECT)`), every other action returns immediately.
    fn run_change_dialogue(
        &self,
        reason: MediaChangeReason,
        current: &MirroredOrigin,
        callback: &dyn MediaChangeCallback,
    ) -> Result<Option<MirroredOrigin>, MediaError> {
        loop {
            let action = callback.on_media_problem(reason, current.authority().url().as_str());
            match action {
                MediaChangeAction::Abort => return Err(MediaError::AbortRequest),
                MediaChangeAction::Ignore => return Err(MediaError::SkipRequest),
                MediaChangeAction::Eject => continue,
                MediaChangeAction::Retry => return Ok(Some(current.clone())),
                MediaChangeAction::ChangeUrl => {
                    return match callback.replacement_url() {
                        Some(url) => {
                            let mut next = current.clone();
                            next.clear_mirrors();
                            next.set_authority(crate::origin::OriginEndpoint::new(url));
                            Ok(Some(next))
                        }
                        None => Err(MediaError::AbortRequest),
                    };
                }
            }
        }
    }

    pub fn release(&self, handle: MediaHandle) {
        let mut attached = self.attached.lock().unwrap();
        if let Some(medium) = attached.get_mut(&handle.id) {
            medium.refcount = medium.refcount.saturating_sub(1);
            if medium.refcount == 0 {
                attached.remove(&handle.id);
            }
        }
    }
}
