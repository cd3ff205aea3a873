//! Builds a highlight reel from a game's recent clips and optionally publishes it.
//!
//! [`run_pipeline`] strings the pieces together: authenticate with the clips provider, resolve
//! the game, select clips, download and render them, then upload the result into the game's
//! playlist.

pub mod cache;
pub mod config;
pub mod error;
pub mod media;
pub mod prompt;
pub mod twitch;
pub mod youtube;

use crate::cache::Cache;
use crate::config::{Config, TwitchCredentials, load_json};
use crate::error::Fault;
use crate::prompt::{OperatorDecisions, Terminal};
use crate::twitch::client::HelixClient;
use crate::twitch::clips::{GameClips, Mode, select_clips};
use eyre::Context;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::instrument;

/// What the operator asked for.
#[derive(Debug, Clone)]
pub struct Request {
    /// Game name as the operator typed it.
    pub game: String,
    /// Number of clips to take automatically; zero means picking by hand.
    pub num_clips: i64,
    pub days_ago: u32,
    pub upload: bool,
    pub keep_files: bool,
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The rendered video, if it was kept.
    pub video: Option<PathBuf>,
    pub video_id: Option<String>,
}

#[instrument(skip(config))]
pub async fn run_pipeline(config: &Config, request: &Request) -> eyre::Result<Outcome> {
    let credentials: TwitchCredentials = load_json(&config.twitch_secret_path())
        .await
        .context("load clips provider credentials")?;
    let helix = HelixClient::connect(config, &credentials).await?;

    let mut terminal = Terminal::new();
    let game_cache: Cache<String> = Cache::new(config.game_ids_path());
    let game_id =
        twitch::games::resolve_game_id(&helix, &game_cache, &mut terminal, &request.game).await?;

    let mode = Mode::from_target(request.num_clips, config.manual_page_size);
    let pages = GameClips::new(&helix, game_id.clone(), request.days_ago)?;
    let mut decisions = OperatorDecisions::new(terminal);
    let selection = match select_clips(&pages, mode, &mut decisions).await {
        Ok(selection) => selection,
        Err(e) => match e.downcast::<Fault>() {
            Ok(Fault::PageExhausted { selection }) if matches!(mode, Mode::Manual { .. }) => {
                tracing::warn!(
                    selected = selection.len(),
                    "no more clips available, continuing with the ones selected"
                );
                selection
            }
            Ok(fault) => return Err(fault.into()),
            Err(e) => return Err(e),
        },
    };
    let mut terminal = decisions.into_prompter();
    eyre::ensure!(!selection.is_empty(), "no clips were selected");
    tracing::info!(clips = selection.len(), "clips selected");

    let http = reqwest::Client::builder()
        .connect_timeout(config.http_timeout)
        .read_timeout(config.http_timeout)
        .build()
        .context("build download client")?;
    let scratch = config.scratch_dir();
    let downloaded = media::download_clips(&http, &selection.download_urls, &scratch).await?;
    let kept: BTreeSet<usize> = downloaded.iter().map(|d| d.index).collect();
    let mut selection = selection;
    selection.retain_indices(|i| kept.contains(&i));
    eyre::ensure!(!selection.is_empty(), "none of the selected clips could be downloaded");

    let paths: Vec<PathBuf> = downloaded.into_iter().map(|d| d.path).collect();
    let rendered = media::render(
        &paths,
        &selection.creators,
        config.logo.as_deref(),
        &config.output_path(),
    )
    .await?;

    let mut video_id = None;
    if request.upload {
        let youtube = youtube::connect(config).await?;
        let id = youtube::upload::publish(
            &youtube,
            config,
            &mut terminal,
            &game_id,
            &rendered.path,
            &rendered.timestamps,
            &selection,
        )
        .await?;
        video_id = Some(id);
    }

    let mut video = Some(rendered.path);
    if !request.keep_files {
        let remove_video = video_id.is_some();
        media::cleanup(&scratch, video.as_deref().filter(|_| remove_video)).await?;
        if remove_video {
            video = None;
        }
    }

    Ok(Outcome { video, video_id })
}
