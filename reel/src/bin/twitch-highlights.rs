use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use twitch_highlights::config::Config;
use twitch_highlights::error::Fault;
use twitch_highlights::{Request, run_pipeline};

/// Download, concatenate, and upload Twitch clips.
#[derive(Debug, Parser)]
#[command(name = "twitch-highlights", version)]
struct Args {
    /// Game name
    #[arg(short, long)]
    game: String,

    /// Number of clips to use; 0 picks them by hand
    #[arg(short, long, default_value_t = 0)]
    num_clips: i64,

    /// Number of days ago that clips started
    #[arg(short, long, default_value_t = 7)]
    days_ago: u32,

    /// Upload the rendered video
    #[arg(long)]
    upload: bool,

    /// Directory holding secrets, caches and output
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Keep downloaded clips and the rendered video
    #[arg(long)]
    keep_files: bool,

    /// Text placed above the chapter list in the video description
    #[arg(long)]
    promo: Option<String>,

    /// Image shown beside each clip's caption
    #[arg(long)]
    logo: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    let args = Args::parse();
    let mut config = Config::new(args.root);
    config.promo = args.promo;
    config.logo = args.logo;
    let request = Request {
        game: args.game,
        num_clips: args.num_clips,
        days_ago: args.days_ago,
        upload: args.upload,
        keep_files: args.keep_files,
    };

    match run_pipeline(&config, &request).await {
        Ok(outcome) => {
            if let Some(id) = outcome.video_id {
                println!("Uploaded video {id}");
            } else if let Some(video) = outcome.video {
                println!("Rendered {}", video.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::debug!(error = ?e, "run failed");
            eprintln!("{}", failure_message(&e));
            ExitCode::FAILURE
        }
    }
}

/// The single line shown to the operator when a run fails.
fn failure_message(e: &eyre::Report) -> String {
    match e.downcast_ref::<Fault>() {
        Some(fault) => fault.to_string(),
        None => format!("error: {e:#}"),
    }
}
