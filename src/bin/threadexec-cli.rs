use std::process::ExitCode;

use structopt::StructOpt;

use threadexec::cli::{CallCommand, HijackCommand, OpenCommand, ThreadexecCommand, ThreadexecOptions, ThreadexecSubCommand};

fn main() -> ExitCode {
    threadexec::log::init();

    let options = ThreadexecOptions::from_args();
    let mut command: Box<dyn ThreadexecCommand> = match options.cmd {
        ThreadexecSubCommand::Call { pid, function, arg, result_width } => {
            Box::new(CallCommand::new(pid, function, arg, result_width))
        }
        ThreadexecSubCommand::Hijack { pid } => Box::new(HijackCommand::new(pid)),
        ThreadexecSubCommand::Open { pid, path, oflag, mode, want_local } => {
            Box::new(OpenCommand::new(pid, path, oflag, mode, want_local))
        }
    };

    match command.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("threadexec-cli: {}", e);
            ExitCode::FAILURE
        }
    }
}
