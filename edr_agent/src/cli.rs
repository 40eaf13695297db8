//! Command-line arguments.

use std::path::PathBuf;

pub const USAGE: &str = "[--config PATH|-c PATH] [--no-poll] [--check] [-h|--help]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub no_poll: bool,
    pub check: bool,
    pub help: bool,
}

pub fn usage(prog: &str) -> String {
    format!("Usage: {prog} {USAGE}")
}

/// Parse `std::env::args()`-style input (program name first). Errors carry the usage line.
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<CliArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "edr_agent".into());
    let mut out = CliArgs::default();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => out.help = true,
            "--config" | "-c" => match it.next() {
                Some(p) if !p.is_empty() => out.config = Some(PathBuf::from(p)),
                _ => return Err(format!("--config needs a path. {}", usage(&prog))),
            },
            "--no-poll" => out.no_poll = true,
            "--check" => out.check = true,
            _ if arg.starts_with("--config=") => match arg.split_once('=') {
                Some((_, v)) if !v.is_empty() => out.config = Some(PathBuf::from(v)),
                _ => return Err(format!("--config needs a path. {}", usage(&prog))),
            },
            other => return Err(format!("Unexpected argument '{other}'. {}", usage(&prog))),
        }
    }
    Ok(out)
}
