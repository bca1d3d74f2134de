mod workflows;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "rescue-builder",
    version,
    about = "Resumable builder for a single-file bootable rescue image",
    long_about = "Build a bootable rescue image in five checkpointed stages \
(fetch, install, configure, compile, finalize). An interrupted or failed build \
resumes at the first stage without a checkpoint for the same configuration.\n\n\
TARGET is one of: all (default), fetch, install, configure, compile, finalize, \
show-config, save-config, status, clean.\n\n\
FLAGS: minimal|standard|full, --with-<component>, --without-<component>, \
--compress, --no-compress, --compressor=<upx|zstd|xz>, -j<N>, --jobs=<N>, \
--cache-dir=<dir>, --no-cache, --password=<pw>, --random-password[=<len>], \
--no-password, --swap, --no-swap, --kernel-overlay=<file>, --resume, --clean"
)]
pub struct Cli {
    /// Debug logging
    #[arg(short = 'v', long = "verbose", conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only warnings and errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Project checkout with kernel/ and hooks/ [default: current directory]
    #[arg(long = "project-dir", value_name = "DIR")]
    pub project_dir: Option<PathBuf>,

    /// State root for checkpoints, defaults, cache and outputs [default: <project>/.artifacts]
    #[arg(long = "state-dir", value_name = "DIR", env = "RESCUE_BUILDER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// [TARGET] followed by build flags
    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else if cli.quiet {
            log::LevelFilter::Warn
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();

    match workflows::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(workflows::exit_code_for(&e))
        }
    }
}
