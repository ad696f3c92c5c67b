//! Process-edge helpers: argument parsing and exit codes.

use std::ffi::OsString;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use crate::error::SidecarError;

/// Parse the process arguments.
///
/// Usage errors exit 1 rather than clap's default 2; `--help` and
/// `--version` exit 0.
pub fn parse_args<T: Parser>() -> Result<T, ExitCode> {
    parse_args_from(std::env::args_os())
}

pub fn parse_args_from<T, I, A>(args: I) -> Result<T, ExitCode>
where
    T: Parser,
    I: IntoIterator<Item = A>,
    A: Into<OsString> + Clone,
{
    T::try_parse_from(args).map_err(|e| {
        let _ = e.print();
        if e.use_stderr() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    })
}

/// Log a fatal error as a single line and pick the failure exit code.
pub fn fail(err: &SidecarError) -> ExitCode {
    error!("{err}");
    ExitCode::FAILURE
}
