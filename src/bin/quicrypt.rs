//! Quicrypt CLI - encrypt or decrypt a file or folder in place
//!
//! The direction is chosen from the target itself: anything that already
//! is an OpenPGP passphrase-encrypted message is decrypted, everything else
//! is encrypted to `<target>.gpg`.

use clap::Parser;
use std::io;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use quicrypt::error::{ErrorKind, QuicryptError};
use quicrypt::file_ops::{self, Options};
use quicrypt::passphrase::{
    CachingPassphraseReader, PassphraseReader, ReaderPassphraseReader, RetryPolicy,
    TerminalPassphraseReader,
};

/// Environment variable holding a tracing filter, e.g. `quicrypt=debug`.
const LOG_ENV: &str = "QUICRYPT_LOG";

#[derive(Parser)]
#[command(name = "quicrypt")]
#[command(version)]
#[command(about = "Encrypt a file or folder with a passphrase, or decrypt it if it already is.", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// File or folder to encrypt or decrypt
    #[arg(value_name = "FILE/FOLDER")]
    path: PathBuf,

    /// Read passphrase from stdin instead of from terminal
    #[arg(long)]
    passphrase_stdin: bool,

    /// ASCII-armor the encrypted output
    #[arg(long)]
    armor: bool,

    /// Give up after this many incorrect decryption passphrases
    #[arg(long, value_name = "N", conflicts_with = "passphrase_stdin")]
    max_attempts: Option<NonZeroU32>,

    /// Log progress to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (mut reader, retry) = get_passphrase_reader(cli.passphrase_stdin, cli.max_attempts);
    let options = Options {
        armor: cli.armor,
        retry,
    };

    let result = std::env::current_dir()
        .map_err(|e| {
            QuicryptError::from_io(e, ErrorKind::Io, "failed to determine current directory")
        })
        .and_then(|workdir| {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            file_ops::process_path(&cli.path, &workdir, &mut *reader, &mut out, &options)
        });

    match result {
        Ok(outcome) => debug!(?outcome, "done"),
        Err(e) => {
            eprintln!("Error: {}", e.report());
            process::exit(e.kind.exit_code());
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// A piped passphrase is read once and reused for the confirmation prompt;
/// it cannot change between attempts, so it gets a single one.
fn get_passphrase_reader(
    use_stdin: bool,
    max_attempts: Option<NonZeroU32>,
) -> (Box<dyn PassphraseReader>, RetryPolicy) {
    if use_stdin {
        let stdin = ReaderPassphraseReader::new(Box::new(io::stdin()));
        (
            Box::new(CachingPassphraseReader::new(Box::new(stdin))),
            RetryPolicy::once(),
        )
    } else {
        let retry = max_attempts.map_or_else(RetryPolicy::unbounded, RetryPolicy::bounded);
        (Box::new(TerminalPassphraseReader::new()), retry)
    }
}
