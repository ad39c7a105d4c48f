use anyhow::{Context, Result};
use bitrover::metainfo::MetaInfo;
use bitrover::torrent::Torrent;
use clap::Parser;
use log::{error, LevelFilter};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "bitrover", about = "minimal bittorrent download client")]
struct Cli {
    #[clap(short, long, help = "path to *.torrent file")]
    file: PathBuf,
    #[clap(short, long, default_value = ".", help = "output directory")]
    out: PathBuf,
    #[clap(short, long, help = "enable debug logging")]
    debug: bool,
}

fn main() -> ExitCode {
    // covers -h and bad flags alike: usage text, exit 1
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::new()
        .filter_level(if args.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    if let Err(err) = run(&args) {
        error!("{:#}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: &Cli) -> Result<()> {
    let meta = MetaInfo::open(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?;
    let torrent = Torrent::new(meta)?;
    torrent.download(&args.out)
}
