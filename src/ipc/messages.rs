//! The message catalogue exchanged between the package manager and the
//! install-helper subprocess over the frame stream in [`super::frame`].
//!
//! Grounded on `examples/original_source/zypp/shared/commit/CommitMessages.h`
//! and `examples/original_source/zypp-proto/target/CommitMessages.cc`: the
//! message names, their fields, and `InstallStep`/`RemoveStep`'s
//! `<typeByte><field>\0...` body encoding (stepId always first) are carried
//! over unchanged; only the transport (`PluginFrame` here vs. the original's
//! STOMP writer) differs.

use crate::error::IpcError;
use crate::ipc::frame::PluginFrame;

const INSTALL_STEP_TYPE: u8 = 0;
const REMOVE_STEP_TYPE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub step_id: u32,
    pub pathname: String,
    pub multiversion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveStep {
    pub step_id: u32,
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStep {
    Install(InstallStep),
    Remove(RemoveStep),
}

impl TransactionStep {
    pub fn step_id(&self) -> u32 {
        match self {
            TransactionStep::Install(s) => s.step_id,
            TransactionStep::Remove(s) => s.step_id,
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        match self {
            TransactionStep::Install(s) => {
                out.push(INSTALL_STEP_TYPE);
                push_field(out, &s.step_id.to_string());
                push_field(out, &s.pathname);
                push_field(out, if s.multiversion { "1" } else { "0" });
            }
            TransactionStep::Remove(s) => {
                out.push(REMOVE_STEP_TYPE);
                push_field(out, &s.step_id.to_string());
                push_field(out, &s.name);
                push_field(out, &s.version);
                push_field(out, &s.release);
                push_field(out, &s.arch);
            }
        }
    }

    /// Consumes one step's worth of bytes starting at `*pos`, advancing it
    /// past the step's trailing terminator.
    fn read_body(data: &[u8], pos: &mut usize) -> Result<Self, IpcError> {
        let type_byte = *data
            .get(*pos)
            .ok_or_else(|| IpcError::WrongMessageFormat("truncated step: missing type byte".into()))?;
        *pos += 1;
        match type_byte {
            INSTALL_STEP_TYPE => {
                let step_id = pull_field(data, pos)?.parse().map_err(bad_number)?;
                let pathname = pull_field(data, pos)?;
                let multiversion = pull_field(data, pos)? == "1";
                Ok(TransactionStep::Install(InstallStep { step_id, pathname, multiversion }))
            }
            REMOVE_STEP_TYPE => {
                let step_id = pull_field(data, pos)?.parse().map_err(bad_number)?;
                let name = pull_field(data, pos)?;
                let version = pull_field(data, pos)?;
                let release = pull_field(data, pos)?;
                let arch = pull_field(data, pos)?;
                Ok(TransactionStep::Remove(RemoveStep { step_id, name, version, release, arch }))
            }
            other => Err(IpcError::WrongMessageFormat(format!("unknown step type byte {other}"))),
        }
    }
}

fn push_field(out: &mut Vec<u8>, field: &str) {
    out.extend_from_slice(field.as_bytes());
    out.push(0);
}

fn pull_field(data: &[u8], pos: &mut usize) -> Result<String, IpcError> {
    let start = *pos;
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| IpcError::WrongMessageFormat("unterminated step field".into()))?
        + start;
    let field = String::from_utf8(data[start..end].to_vec())
        .map_err(|_| IpcError::WrongMessageFormat("non-UTF8 step field".into()))?;
    *pos = end + 1;
    Ok(field)
}

fn bad_number(_: std::num::ParseIntError) -> IpcError {
    IpcError::WrongMessageFormat("invalid numeric step field".into())
}

/// First message sent to the helper: global commit settings plus the
/// ordered transaction plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub flags: u32,
    pub arch: String,
    pub root: String,
    pub db_path: String,
    pub lock_file_path: String,
    pub ignore_arch: bool,
    pub transaction_steps: Vec<TransactionStep>,
}

impl Commit {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("Commit");
        frame
            .add_header("flags", self.flags.to_string())
            .add_header("arch", &self.arch)
            .add_header("root", &self.root)
            .add_header("dbPath", &self.db_path)
            .add_header("lockFilePath", &self.lock_file_path)
            .add_header("ignoreArch", if self.ignore_arch { "1" } else { "0" });

        let mut body = Vec::new();
        for step in &self.transaction_steps {
            step.write_body(&mut body);
        }
        frame.set_body(body);
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "Commit")?;
        let flags = frame.get_header("flags").parse().map_err(bad_number)?;
        let ignore_arch = frame.get_header("ignoreArch") == "1";

        let data = frame.body();
        let mut pos = 0;
        let mut transaction_steps = Vec::new();
        while pos < data.len() {
            transaction_steps.push(TransactionStep::read_body(data, &mut pos)?);
        }

        Ok(Self {
            flags,
            arch: frame.get_header("arch").to_string(),
            root: frame.get_header("root").to_string(),
            db_path: frame.get_header("dbPath").to_string(),
            lock_file_path: frame.get_header("lockFilePath").to_string(),
            ignore_arch,
            transaction_steps,
        })
    }
}

fn expect_command(frame: &PluginFrame, expected: &str) -> Result<(), IpcError> {
    if frame.command() != expected {
        return Err(IpcError::WrongMessageFormat(format!(
            "expected {expected} message, got {}",
            frame.command()
        )));
    }
    Ok(())
}

/// Sent back to the parent when `rpmtsCheck`/`rpmtsRun` reports problems.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionError {
    pub problems: Vec<String>,
}

impl TransactionError {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("TransactionError");
        frame.set_body(self.problems.join("\n").into_bytes());
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "TransactionError")?;
        let text = String::from_utf8(frame.body().to_vec())
            .map_err(|_| IpcError::WrongMessageFormat("non-UTF8 problem list".into()))?;
        let problems = if text.is_empty() {
            Vec::new()
        } else {
            text.lines().map(str::to_string).collect()
        };
        Ok(Self { problems })
    }
}

/// Free-text rpmlog line plus its rpmlog priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmLog {
    pub level: u32,
    pub line: String,
}

impl RpmLog {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("RpmLog");
        frame.add_header("level", self.level.to_string());
        frame.set_body(self.line.clone().into_bytes());
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "RpmLog")?;
        let level = frame.get_header("level").parse().map_err(bad_number)?;
        let line = String::from_utf8(frame.body().to_vec())
            .map_err(|_| IpcError::WrongMessageFormat("non-UTF8 log line".into()))?;
        Ok(Self { level, line })
    }
}

macro_rules! stepid_message {
    ($name:ident, $cmd:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub step_id: u32,
        }

        impl $name {
            pub fn to_frame(&self) -> PluginFrame {
                let mut frame = PluginFrame::new($cmd);
                frame.add_header("stepId", self.step_id.to_string());
                frame
            }

            pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
                expect_command(frame, $cmd)?;
                let step_id = frame.get_header("stepId").parse().map_err(bad_number)?;
                Ok(Self { step_id })
            }
        }
    };
}

stepid_message!(PackageBegin, "PackageBegin");
stepid_message!(PackageFinished, "PackageFinished");
stepid_message!(PackageError, "PackageError");

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackageProgress {
    pub step_id: u32,
    pub amount: f64,
}

impl PackageProgress {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("PackageProgress");
        frame
            .add_header("stepId", self.step_id.to_string())
            .add_header("amount", self.amount.to_string());
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "PackageProgress")?;
        Ok(Self {
            step_id: frame.get_header("stepId").parse().map_err(bad_number)?,
            amount: frame
                .get_header("amount")
                .parse()
                .map_err(|_| IpcError::WrongMessageFormat("invalid amount".into()))?,
        })
    }
}

macro_rules! nvra_message {
    ($name:ident, $cmd:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub nvra: String,
        }

        impl $name {
            pub fn to_frame(&self) -> PluginFrame {
                let mut frame = PluginFrame::new($cmd);
                frame.add_header("nvra", &self.nvra);
                frame
            }

            pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
                expect_command(frame, $cmd)?;
                Ok(Self { nvra: frame.get_header("nvra").to_string() })
            }
        }
    };
}

nvra_message!(CleanupBegin, "CleanupBegin");
nvra_message!(CleanupFinished, "CleanupFinished");

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupProgress {
    pub nvra: String,
    pub amount: f64,
}

impl CleanupProgress {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("CleanupProgress");
        frame.add_header("nvra", &self.nvra).add_header("amount", self.amount.to_string());
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "CleanupProgress")?;
        Ok(Self {
            nvra: frame.get_header("nvra").to_string(),
            amount: frame
                .get_header("amount")
                .parse()
                .map_err(|_| IpcError::WrongMessageFormat("invalid amount".into()))?,
        })
    }
}

/// `step_id` is `-1` for scripts with no associated transaction step (e.g. a
/// package-independent `%trigger`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBegin {
    pub step_id: i32,
    pub script_type: String,
    pub script_package: String,
}

impl ScriptBegin {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("ScriptBegin");
        frame
            .add_header("stepId", self.step_id.to_string())
            .add_header("scriptType", &self.script_type)
            .add_header("scriptPackage", &self.script_package);
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "ScriptBegin")?;
        Ok(Self {
            step_id: frame.get_header("stepId").parse().map_err(|_| IpcError::WrongMessageFormat("invalid stepId".into()))?,
            script_type: frame.get_header("scriptType").to_string(),
            script_package: frame.get_header("scriptPackage").to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptFinished {
    pub step_id: i32,
}

impl ScriptFinished {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("ScriptFinished");
        frame.add_header("stepId", self.step_id.to_string());
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "ScriptFinished")?;
        Ok(Self {
            step_id: frame.get_header("stepId").parse().map_err(|_| IpcError::WrongMessageFormat("invalid stepId".into()))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptError {
    pub step_id: i32,
    pub fatal: bool,
}

impl ScriptError {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("ScriptError");
        frame
            .add_header("stepId", self.step_id.to_string())
            .add_header("fatal", if self.fatal { "1" } else { "0" });
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "ScriptError")?;
        Ok(Self {
            step_id: frame.get_header("stepId").parse().map_err(|_| IpcError::WrongMessageFormat("invalid stepId".into()))?,
            fatal: frame.get_header("fatal") == "1",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransBegin {
    pub name: String,
}

impl TransBegin {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("TransBegin");
        frame.add_header("name", &self.name);
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "TransBegin")?;
        Ok(Self { name: frame.get_header("name").to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransFinished;

impl TransFinished {
    pub fn to_frame(&self) -> PluginFrame {
        PluginFrame::new("TransFinished")
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "TransFinished")?;
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransProgress {
    pub amount: f64,
}

impl TransProgress {
    pub fn to_frame(&self) -> PluginFrame {
        let mut frame = PluginFrame::new("TransProgress");
        frame.add_header("amount", self.amount.to_string());
        frame
    }

    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        expect_command(frame, "TransProgress")?;
        Ok(Self {
            amount: frame
                .get_header("amount")
                .parse()
                .map_err(|_| IpcError::WrongMessageFormat("invalid amount".into()))?,
        })
    }
}

/// Every message the helper can stream back to the parent, dispatched on
/// `PluginFrame::command()`.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperMessage {
    PackageBegin(PackageBegin),
    PackageFinished(PackageFinished),
    PackageError(PackageError),
    PackageProgress(PackageProgress),
    CleanupBegin(CleanupBegin),
    CleanupFinished(CleanupFinished),
    CleanupProgress(CleanupProgress),
    ScriptBegin(ScriptBegin),
    ScriptFinished(ScriptFinished),
    ScriptError(ScriptError),
    TransBegin(TransBegin),
    TransFinished(TransFinished),
    TransProgress(TransProgress),
    RpmLog(RpmLog),
    TransactionError(TransactionError),
}

impl HelperMessage {
    pub fn from_frame(frame: &PluginFrame) -> Result<Self, IpcError> {
        Ok(match frame.command() {
            "PackageBegin" => HelperMessage::PackageBegin(PackageBegin::from_frame(frame)?),
            "PackageFinished" => HelperMessage::PackageFinished(PackageFinished::from_frame(frame)?),
            "PackageError" => HelperMessage::PackageError(PackageError::from_frame(frame)?),
            "PackageProgress" => HelperMessage::PackageProgress(PackageProgress::from_frame(frame)?),
            "CleanupBegin" => HelperMessage::CleanupBegin(CleanupBegin::from_frame(frame)?),
            "CleanupFinished" => HelperMessage::CleanupFinished(CleanupFinished::from_frame(frame)?),
            "CleanupProgress" => HelperMessage::CleanupProgress(CleanupProgress::from_frame(frame)?),
            "ScriptBegin" => HelperMessage::ScriptBegin(ScriptBegin::from_frame(frame)?),
            "ScriptFinished" => HelperMessage::ScriptFinished(ScriptFinished::from_frame(frame)?),
            "ScriptError" => HelperMessage::ScriptError(ScriptError::from_frame(frame)?),
            "TransBegin" => HelperMessage::TransBegin(TransBegin::from_frame(frame)?),
            "TransFinished" => HelperMessage::TransFinished(TransFinished::from_frame(frame)?),
            "TransProgress" => HelperMessage::TransProgress(TransProgress::from_frame(frame)?),
            "RpmLog" => HelperMessage::RpmLog(RpmLog::from_frame(frame)?),
            "TransactionError" => HelperMessage::TransactionError(TransactionError::from_frame(frame)?),
            other => return Err(IpcError::WrongMessageFormat(format!("unknown helper message {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_message_serializes_to_the_documented_body() {
        let commit = Commit {
            flags: 0,
            arch: "x86_64".into(),
            root: "/".into(),
            db_path: "/var/lib/rpm".into(),
            lock_file_path: "/var/run/zypp".into(),
            ignore_arch: false,
            transaction_steps: vec![TransactionStep::Install(InstallStep {
                step_id: 7,
                pathname: "/p/a-1.rpm".into(),
                multiversion: false,
            })],
        };
        let frame = commit.to_frame();
        assert_eq!(
            frame.body(),
            &[0x00u8, b'7', 0x00, b'/', b'p', b'/', b'a', b'-', b'1', b'.', b'r', b'p', b'm', 0x00, b'0', 0x00]
        );
    }

    #[test]
    fn commit_round_trips_through_a_frame() {
        let commit = Commit {
            flags: 3,
            arch: "x86_64".into(),
            root: "/".into(),
            db_path: "/var/lib/rpm".into(),
            lock_file_path: "".into(),
            ignore_arch: true,
            transaction_steps: vec![
                TransactionStep::Install(InstallStep { step_id: 1, pathname: "/a.rpm".into(), multiversion: true }),
                TransactionStep::Remove(RemoveStep {
                    step_id: 2,
                    name: "foo".into(),
                    version: "1.0".into(),
                    release: "1".into(),
                    arch: "noarch".into(),
                }),
            ],
        };
        let frame = commit.to_frame();
        let parsed = Commit::from_frame(&frame).unwrap();
        assert_eq!(parsed, commit);
    }

    #[test]
    fn package_progress_round_trips() {
        let msg = PackageProgress { step_id: 7, amount: 42.5 };
        let frame = msg.to_frame();
        assert_eq!(PackageProgress::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn transaction_error_round_trips_multiple_problems() {
        let err = TransactionError { problems: vec!["a conflicts with b".into(), "missing dep c".into()] };
        let frame = err.to_frame();
        assert_eq!(TransactionError::from_frame(&frame).unwrap(), err);
    }

    #[test]
    fn dispatches_by_command_name() {
        let frame = PackageFinished { step_id: 9 }.to_frame();
        match HelperMessage::from_frame(&frame).unwrap() {
            HelperMessage::PackageFinished(m) => assert_eq!(m.step_id, 9),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_command() {
        let frame = PluginFrame::new("SomethingElse");
        assert!(HelperMessage::from_frame(&frame).is_err());
    }
}
