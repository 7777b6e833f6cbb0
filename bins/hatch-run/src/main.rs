use anyhow::{anyhow, bail, Result};
use clap::Parser;
use tracing::{debug, info};

use hatch_spawn::{
    parse_rlimit_value, spawn, Command, LaunchRequest, LaunchRequestBuilder, Pgroup,
    ResourceName, Source, Terminal,
};

/// Launch a command with full control over its environment, descriptors,
/// resource limits and process group, then wait for it and report how it
/// ended.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, trailing_var_arg = true)]
struct Args {
    /// Interpret COMMAND as a single /bin/sh -c line instead of an argv
    /// vector.
    #[arg(short, long)]
    shell: bool,

    /// Override the process name (argv[0]) seen by the child.
    #[arg(long, value_name = "NAME", conflicts_with = "shell")]
    argv0: Option<String>,

    /// Set an environment variable for the child (repeatable).
    #[arg(short, long, value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Remove a variable from the child's environment (repeatable).
    #[arg(long, value_name = "KEY")]
    unset: Vec<String>,

    /// Start from an empty environment instead of the inherited one.
    #[arg(long)]
    unset_others: bool,

    /// Working directory for the child.
    #[arg(short = 'C', long, value_name = "DIR")]
    chdir: Option<String>,

    /// File creation mask, in octal.
    #[arg(long, value_name = "OCTAL")]
    umask: Option<String>,

    /// Resource limit as name=soft[:hard], e.g. nofile=256 or cpu=10:20
    /// (repeatable).
    #[arg(long, value_name = "NAME=SOFT[:HARD]")]
    rlimit: Vec<String>,

    /// Process-group placement: "new" or "join:<pid>".
    #[arg(long, value_name = "MODE")]
    pgroup: Option<String>,

    /// Leave inherited descriptors above stderr open in the child.
    #[arg(long)]
    keep_fds: bool,

    /// Redirect the child's stdin from a file.
    #[arg(long, value_name = "FILE")]
    stdin: Option<String>,

    /// Redirect the child's stdout to a file (truncating).
    #[arg(long, value_name = "FILE", conflicts_with = "append_stdout")]
    stdout: Option<String>,

    /// Redirect the child's stdout to a file, appending.
    #[arg(long, value_name = "FILE")]
    append_stdout: Option<String>,

    /// Redirect the child's stderr to a file (truncating).
    #[arg(long, value_name = "FILE")]
    stderr: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// The command to run.
    #[arg(required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging(args.debug);

    let request = build_request(&args)?;
    debug!(?request, "launching");

    let mut handle = spawn(request)?;
    info!(pid = handle.pid(), "child started");
    let status = handle.wait()?;
    println!("{status}");

    let code = match status.terminal() {
        Terminal::Exited(code) => code,
        Terminal::Signaled { signal, .. } | Terminal::Stopped(signal) => 128 + signal,
    };
    std::process::exit(code);
}

fn build_request(args: &Args) -> Result<LaunchRequest> {
    let command = if args.shell {
        if args.command.len() != 1 {
            bail!("--shell takes exactly one COMMAND argument");
        }
        Command::shell(&args.command[0])
    } else if let Some(argv0) = &args.argv0 {
        Command::argv_with_argv0(&args.command, argv0)
    } else {
        Command::argv(&args.command)
    };

    let mut builder = LaunchRequest::builder(command).unset_others(args.unset_others);

    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("--env {pair:?} is not KEY=VALUE"))?;
        builder = builder.env(key, value);
    }
    for key in &args.unset {
        builder = builder.unset_env(key);
    }
    if let Some(dir) = &args.chdir {
        builder = builder.chdir(dir);
    }
    if let Some(umask) = &args.umask {
        let mask = u32::from_str_radix(umask, 8)
            .map_err(|_| anyhow!("--umask {umask:?} is not an octal number"))?;
        builder = builder.umask(mask);
    }
    for spec in &args.rlimit {
        let (name, value) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("--rlimit {spec:?} is not NAME=SOFT[:HARD]"))?;
        builder = builder.rlimit(name.parse::<ResourceName>()?, parse_rlimit_value(value)?);
    }
    if let Some(mode) = &args.pgroup {
        builder = builder.pgroup(parse_pgroup(mode)?);
    }
    if args.keep_fds {
        builder = builder.close_others(false);
    }
    builder = apply_redirects(builder, args);

    Ok(builder.build()?)
}

fn apply_redirects(mut builder: LaunchRequestBuilder, args: &Args) -> LaunchRequestBuilder {
    if let Some(path) = &args.stdin {
        builder = builder.redirect(0, Source::read_from(path));
    }
    if let Some(path) = &args.stdout {
        builder = builder.redirect(1, Source::write_to(path));
    }
    if let Some(path) = &args.append_stdout {
        builder = builder.redirect(1, Source::append_to(path));
    }
    if let Some(path) = &args.stderr {
        builder = builder.redirect(2, Source::write_to(path));
    }
    builder
}

fn parse_pgroup(mode: &str) -> Result<Pgroup> {
    if mode == "new" {
        return Ok(Pgroup::New);
    }
    if let Some(pid) = mode.strip_prefix("join:") {
        let pid: i32 = pid
            .parse()
            .map_err(|_| anyhow!("--pgroup join pid {pid:?} is not a number"))?;
        return Ok(Pgroup::Join(pid));
    }
    bail!("--pgroup must be \"new\" or \"join:<pid>\", got {mode:?}");
}

fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
