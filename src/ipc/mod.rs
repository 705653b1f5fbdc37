//! Install-helper IPC: a framed message stream between the package manager
//! and the external RPM transaction subprocess.
//!
//! Grounded on `examples/original_source/zypp/tools/zypp-rpm/main.cc` for the
//! fixed-FD convention, the exit-code taxonomy, and the end-of-script
//! sentinel; on `examples/original_source/zypp/shared/commit/CommitMessages.h`
//! / `CommitMessages.cc` for the message catalogue in [`messages`]. The RPM
//! transaction driver itself — reading packages, calling into librpm,
//! running scripts — is out of scope per this crate's spec (§1): only the
//! wire protocol it speaks is implemented here, plus a protocol-conformant
//! stub subprocess (`src/bin/repo-provision-helper.rs`) useful for testing
//! the parent side end-to-end without a real RPM stack.

pub mod frame;
pub mod messages;

use std::io::{BufRead, Write};

pub use frame::PluginFrame;
pub use messages::{
    CleanupBegin, CleanupFinished, CleanupProgress, Commit, HelperMessage, InstallStep, PackageBegin,
    PackageError, PackageFinished, PackageProgress, RemoveStep, RpmLog, ScriptBegin, ScriptError, ScriptFinished,
    TransBegin, TransFinished, TransProgress, TransactionError, TransactionStep,
};

use crate::error::IpcError;

/// The FD the parent writes STOMP-like messages to and the helper reads its
/// `Commit` from — conventionally `STDERR_FILENO + 1`.
pub const MESSAGE_FD: i32 = libc_stderr_fileno() + 1;
/// The FD the helper writes script stdout/stderr to, kept separate from
/// [`MESSAGE_FD`] so interleaved script output never corrupts a frame.
pub const SCRIPT_FD: i32 = libc_stderr_fileno() + 2;

const fn libc_stderr_fileno() -> i32 {
    2
}

/// Sentinel byte sequence written to [`SCRIPT_FD`] after every script
/// boundary so the parent can segment interleaved script output per script
/// invocation.
pub const END_OF_SCRIPT_TAG: &[u8] = b"\x1e--zypp-rpm-end-of-script--\x1e";

/// Exit codes the helper subprocess reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HelperExitCode {
    NoError = 0,
    WrongMessageFormat = 1,
    FailedToCreateLock = 2,
    RpmInitFailed = 3,
    FailedToOpenDb = 4,
    FailedToReadPackage = 5,
    FailedToAddStepToTransaction = 6,
    RpmOrderFailed = 7,
    RpmFinishedWithTransactionError = 8,
    RpmFinishedWithError = 9,
    OtherError = 10,
}

impl HelperExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Writes `commit` as the single `Commit` frame the helper expects on
/// startup.
pub fn write_commit(w: &mut impl Write, commit: &Commit) -> Result<(), IpcError> {
    commit.to_frame().write_to(w)
}

/// Reads [`Commit`] off the message stream; used by the helper subprocess.
pub fn read_commit(r: &mut impl BufRead) -> Result<Commit, IpcError> {
    let frame = PluginFrame::read_from(r)?.ok_or(IpcError::UnexpectedEof)?;
    Commit::from_frame(&frame)
}

/// Pulls [`HelperMessage`]s off the stream one at a time. `None` marks a
/// clean end of stream (the helper closed its message FD on exit).
pub struct HelperMessageReader<R> {
    inner: R,
}

impl<R: BufRead> HelperMessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read_next(&mut self) -> Result<Option<HelperMessage>, IpcError> {
        match PluginFrame::read_from(&mut self.inner)? {
            Some(frame) => Ok(Some(HelperMessage::from_frame(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Writes one helper-side message to the message stream; used by the helper
/// subprocess to push lifecycle/progress updates.
pub fn push_message(w: &mut impl Write, frame: PluginFrame) -> Result<(), IpcError> {
    frame.write_to(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn scenario_install_message_lifecycle() {
        // §8 scenario 6: a Commit with one install step, echoed back as
        // PackageBegin, at least one in-range PackageProgress, then
        // PackageFinished.
        let commit = Commit {
            flags: 0,
            arch: "x86_64".into(),
            root: "/".into(),
            db_path: "/var/lib/rpm".into(),
            lock_file_path: "".into(),
            ignore_arch: false,
            transaction_steps: vec![TransactionStep::Install(InstallStep {
                step_id: 7,
                pathname: "/p/a-1.rpm".into(),
                multiversion: false,
            })],
        };

        let mut commit_buf = Vec::new();
        write_commit(&mut commit_buf, &commit).unwrap();
        let mut reader = BufReader::new(Cursor::new(commit_buf));
        let round_tripped = read_commit(&mut reader).unwrap();
        assert_eq!(round_tripped, commit);

        let mut stream = Vec::new();
        push_message(&mut stream, PackageBegin { step_id: 7 }.to_frame()).unwrap();
        push_message(&mut stream, PackageProgress { step_id: 7, amount: 50.0 }.to_frame()).unwrap();
        push_message(&mut stream, PackageFinished { step_id: 7 }.to_frame()).unwrap();

        let mut messages = HelperMessageReader::new(BufReader::new(Cursor::new(stream)));
        let mut seen = Vec::new();
        while let Some(msg) = messages.read_next().unwrap() {
            seen.push(msg);
        }

        assert!(matches!(seen[0], HelperMessage::PackageBegin(PackageBegin { step_id: 7 })));
        match &seen[1] {
            HelperMessage::PackageProgress(p) => {
                assert_eq!(p.step_id, 7);
                assert!((0.0..=100.0).contains(&p.amount));
            }
            other => panic!("expected PackageProgress, got {other:?}"),
        }
        assert!(matches!(seen[2], HelperMessage::PackageFinished(PackageFinished { step_id: 7 })));
    }

    #[test]
    fn message_and_script_fds_are_distinct() {
        assert_ne!(MESSAGE_FD, SCRIPT_FD);
    }
}
