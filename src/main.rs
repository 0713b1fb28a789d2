//! A command-line interface to the `imgsig` crate.

use std::io::Write as _;

use anyhow::Context;

use clap::{ColorChoice, Parser, ValueEnum};

use imgsig::{Operation, Options, Scratch};

use log::{debug, info, LevelFilter};

/// Generate and verify SHA-256 / RSA-2048 signature files for firmware images
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, arg_required_else_help = true, color = ColorChoice::Auto)]
struct Cli {
    /// Verbosity
    #[arg(short = 'l', long, default_value = "regular")]
    verbosity: Verbosity,

    #[command(flatten)]
    options: Options,
}

/// Verbosity
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Verbosity {
    Silent,
    #[default]
    Regular,
    Verbose,
}

impl Verbosity {
    fn log_level(&self) -> LevelFilter {
        match self {
            // Failures are still reported
            Self::Silent => LevelFilter::Error,
            Self::Regular => LevelFilter::Info,
            Self::Verbose => LevelFilter::Debug,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter_level(args.verbosity.log_level())
        .init();

    let scratch = Scratch::new();

    let interrupted = scratch.clone();
    ctrlc::set_handler(move || {
        interrupted.remove();
        std::process::exit(130);
    })
    .context("Installing interrupt handler failed")?;

    let result = run(args.options, &scratch);

    scratch.remove();

    if let Err(err) = result {
        log::error!("{:#}", err);
        std::process::exit(1);
    }

    Ok(())
}

fn run(options: Options, scratch: &Scratch) -> anyhow::Result<()> {
    match options.into_operation()? {
        Operation::Generate(generate) => generate_record(generate, scratch),
        Operation::Verify(verify) => verify_image(verify),
    }
}

fn generate_record(generate: imgsig::Generate, scratch: &Scratch) -> anyhow::Result<()> {
    let record = generate.run(scratch).with_context(|| {
        format!(
            "Generating signature file for `{}` failed",
            generate.image.display()
        )
    })?;

    debug!("Image digest: {}", hex::encode(record.digest()));

    let kind = if record.signature().is_some() {
        "Signed"
    } else {
        "Digest-only"
    };

    info!(
        "{} signature file saved to `{}`",
        kind,
        generate.output.display()
    );

    Ok(())
}

fn verify_image(verify: imgsig::Verify) -> anyhow::Result<()> {
    verify.run().with_context(|| {
        format!(
            "Verifying image `{}` against `{}` failed",
            verify.image.display(),
            verify.signature.display()
        )
    })?;

    debug!("Image verified successfully");

    Ok(())
}
