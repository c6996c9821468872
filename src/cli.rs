//! Command-line surface: one `ThreadexecCommand` per operation, dispatched
//! from a `structopt`-derived option tree and reporting results as JSON,
//! the same shape `rd`'s `commands/` module gives its own subcommands
//! (`RdCommand::run` + `serde_json::to_string` to stdout).

use std::io;

use serde::Serialize;
use structopt::StructOpt;

use crate::error::ThreadexecError;
use crate::handle::ExecHandleBuilder;

pub trait ThreadexecCommand {
    fn run(&mut self) -> io::Result<()>;
}

#[derive(StructOpt, Debug)]
#[structopt(name = "threadexec-cli", about = "drive a remote call inside another task")]
pub struct ThreadexecOptions {
    #[structopt(subcommand)]
    pub cmd: ThreadexecSubCommand,
}

#[derive(StructOpt, Debug)]
pub enum ThreadexecSubCommand {
    /// Call a function by address in the target, with up to 9 literal
    /// 64-bit arguments.
    Call {
        /// pid of the target process.
        #[structopt(long)]
        pid: i32,
        /// Function address (remote), e.g. 0x7fff12345678.
        #[structopt(long, parse(try_from_str = parse_hex))]
        function: u64,
        /// Literal arguments, each parsed as hex or decimal.
        #[structopt(long, parse(try_from_str = parse_hex))]
        arg: Vec<u64>,
        /// Width in bytes of the return value to decode (default 8).
        #[structopt(long, default_value = "8")]
        result_width: usize,
    },
    /// Acquire a handle via hijack-bootstrap-spawn and report its fields,
    /// then tear it down immediately. Mostly useful to sanity-check that
    /// acquisition itself works against a given target.
    Hijack {
        #[structopt(long)]
        pid: i32,
    },
    /// `open()` a path in the target, optionally extracting a local fd.
    Open {
        #[structopt(long)]
        pid: i32,
        path: String,
        #[structopt(long, default_value = "0")]
        oflag: i32,
        #[structopt(long, default_value = "0")]
        mode: u32,
        #[structopt(long)]
        want_local: bool,
    },
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(stripped) = s.strip_prefix("0x") {
        u64::from_str_radix(stripped, 16)
    } else {
        s.parse()
    }
}

fn task_for_pid(pid: i32) -> io::Result<mach2::mach_types::task_t> {
    crate::mach::task_for_pid_local(pid).map_err(|e| {
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("task_for_pid({}) failed: {}", pid, e),
        )
    })
}

fn to_io_err(e: ThreadexecError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallReport {
    result: u64,
    buffers: Vec<String>,
}

pub struct CallCommand {
    pid: i32,
    function: u64,
    args: Vec<u64>,
    result_width: usize,
}

impl CallCommand {
    pub fn new(pid: i32, function: u64, args: Vec<u64>, result_width: usize) -> CallCommand {
        CallCommand { pid, function, args, result_width }
    }
}

impl ThreadexecCommand for CallCommand {
    fn run(&mut self) -> io::Result<()> {
        let task = task_for_pid(self.pid)?;
        let mut handle = ExecHandleBuilder::new(task, detect_arch())
            .build()
            .map_err(to_io_err)?;
        let call_args: Vec<crate::call::CallArg> = self
            .args
            .iter()
            .map(|v| crate::call::CallArg::literal(*v, 8, false))
            .collect();
        let outcome = handle
            .call(self.function, &call_args, self.result_width)
            .map_err(to_io_err)?;
        let report = CallReport {
            result: outcome.result,
            buffers: outcome.buffers.iter().map(|b| encode_hex(b)).collect(),
        };
        println!("{}", serde_json::to_string(&report).unwrap());
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HijackReport {
    target_task_remote: u64,
    bootstrap_port_local: u32,
    bootstrap_port_remote: u32,
}

pub struct HijackCommand {
    pid: i32,
}

impl HijackCommand {
    pub fn new(pid: i32) -> HijackCommand {
        HijackCommand { pid }
    }
}

impl ThreadexecCommand for HijackCommand {
    fn run(&mut self) -> io::Result<()> {
        let task = task_for_pid(self.pid)?;
        let handle = ExecHandleBuilder::new(task, detect_arch())
            .build()
            .map_err(to_io_err)?;
        let report = HijackReport {
            target_task_remote: handle.target_task_remote(),
            bootstrap_port_local: handle.bootstrap_port_local(),
            bootstrap_port_remote: handle.bootstrap_port_remote(),
        };
        println!("{}", serde_json::to_string(&report).unwrap());
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenReport {
    remote_fd: i32,
    local_fd: Option<i32>,
}

pub struct OpenCommand {
    pid: i32,
    path: String,
    oflag: i32,
    mode: u32,
    want_local: bool,
}

impl OpenCommand {
    pub fn new(pid: i32, path: String, oflag: i32, mode: u32, want_local: bool) -> OpenCommand {
        OpenCommand { pid, path, oflag, mode, want_local }
    }
}

impl ThreadexecCommand for OpenCommand {
    fn run(&mut self) -> io::Result<()> {
        let task = task_for_pid(self.pid)?;
        let handle = ExecHandleBuilder::new(task, detect_arch())
            .build()
            .map_err(to_io_err)?;
        let (remote_fd, local_fd) = handle
            .file_open(&self.path, self.oflag, self.mode, self.want_local)
            .map_err(to_io_err)?;
        let report = OpenReport { remote_fd, local_fd };
        println!("{}", serde_json::to_string(&report).unwrap());
        Ok(())
    }
}

/// Architecture selection isn't auto-detected from the target binary; the
/// CLI assumes the host's own architecture, which is always correct for the
/// common case of instrumenting a process on the same machine.
fn detect_arch() -> crate::arch::ArchKind {
    if cfg!(target_arch = "aarch64") {
        crate::arch::ArchKind::RegisterAndLink
    } else {
        crate::arch::ArchKind::RegisterAndStack
    }
}
