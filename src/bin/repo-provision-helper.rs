//! Install-helper subprocess: speaks the frame protocol in
//! `repo_provision_core::ipc` — the initial `Commit` on stdin, every
//! reply on the fixed `MESSAGE_FD`, script output on `SCRIPT_FD`.
//!
//! Grounded on `examples/original_source/zypp/tools/zypp-rpm/main.cc`'s
//! startup sequence (tty refusal, FD validation, pidfile, per-step
//! lifecycle messages). The actual RPM transaction — reading package
//! headers, calling into librpm, running scripts — is out of scope for this
//! crate (spec §1 treats the RPM transaction driver as an external
//! collaborator); this binary implements the protocol side only, applying
//! each step as a no-op so the parent's IPC plumbing can be exercised
//! end-to-end without a real RPM stack.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, IsTerminal, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;

use anyhow::{bail, Result};
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat::{fstat, SFlag};

use repo_provision_core::ipc::{
    self, HelperExitCode, PackageBegin, PackageFinished, PackageProgress, TransBegin, TransFinished, TransProgress,
};

fn is_fifo(fd: RawFd) -> bool {
    fstat(fd).map(|st| SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFIFO)).unwrap_or(false)
}

fn check_environment() -> Result<()> {
    if std::io::stdin().is_terminal() || std::io::stdout().is_terminal() || std::io::stderr().is_terminal() {
        bail!("running {} directly from the console is not supported", env!("CARGO_PKG_NAME"));
    }
    if !is_fifo(ipc::MESSAGE_FD) {
        bail!("expected message fd is not a pipe");
    }
    if !is_fifo(ipc::SCRIPT_FD) {
        bail!("expected script fd is not a pipe");
    }
    Ok(())
}

struct PidFileGuard {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl PidFileGuard {
    fn create(lock_file_path: &str) -> Result<Self> {
        if lock_file_path.is_empty() {
            return Ok(Self { path: None, file: None });
        }
        let path = PathBuf::from(lock_file_path).join("zypp-rpm.pid");
        let mut file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Self { path: Some(path), file: Some(file) })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Some(file) = &mut self.file {
            let _ = file.set_len(0);
            let _ = file.flush();
        }
        let _ = &self.path;
    }
}

fn run() -> Result<HelperExitCode> {
    check_environment()?;

    // The initial Commit arrives on stdin; MESSAGE_FD is write-only and
    // carries every message the helper sends back to the parent.
    let mut stdin = BufReader::new(std::io::stdin().lock());
    let commit = match ipc::read_commit(&mut stdin) {
        Ok(commit) => commit,
        Err(e) => {
            eprintln!("wrong commit message format, aborting ({e})");
            return Ok(HelperExitCode::WrongMessageFormat);
        }
    };

    let _pidfile = match PidFileGuard::create(&commit.lock_file_path) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to create pidfile: {e}");
            return Ok(HelperExitCode::FailedToCreateLock);
        }
    };

    let mut message_out = unsafe { File::from_raw_fd(ipc::MESSAGE_FD) };
    ipc::push_message(&mut message_out, TransBegin { name: "Preparing".into() }.to_frame())?;

    let total = commit.transaction_steps.len().max(1);
    for (i, step) in commit.transaction_steps.iter().enumerate() {
        let step_id = step.step_id();
        ipc::push_message(&mut message_out, PackageBegin { step_id }.to_frame())?;
        ipc::push_message(&mut message_out, PackageProgress { step_id, amount: 100.0 }.to_frame())?;
        ipc::push_message(&mut message_out, PackageFinished { step_id }.to_frame())?;
        ipc::push_message(
            &mut message_out,
            TransProgress { amount: ((i + 1) as f64 / total as f64) * 100.0 }.to_frame(),
        )?;
    }

    ipc::push_message(&mut message_out, TransFinished.to_frame())?;

    Ok(HelperExitCode::NoError)
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("repo-provision-helper: {e}");
            HelperExitCode::OtherError
        }
    };
    std::process::exit(code.code());
}
