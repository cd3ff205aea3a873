//! Clip media on disk: downloading, rendering the final video, and cleaning up.
//!
//! Rendering shells out to `ffmpeg` and `ffprobe`, which must be on `PATH`.

use eyre::Context;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tracing::instrument;

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;
const CAPTION_FONT_SIZE: u32 = 50;
const CAPTION_MARGIN: u32 = 8;
const LOGO_SIZE: u32 = 64;

/// Formats a number of seconds as `H:MM:SS`, rounded to the nearest second.
pub fn timecode(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, total / 60 % 60, total % 60)
}

/// Start time of each clip in the concatenated video.
///
/// The first clip starts at zero; the last clip's duration is not needed.
pub fn chapter_timestamps(durations: &[f64]) -> Vec<f64> {
    let mut start = 0.0;
    durations
        .iter()
        .map(|d| {
            let at = start;
            start += d;
            at
        })
        .collect()
}

/// A downloaded clip and its position in the selection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedClip {
    pub index: usize,
    pub path: PathBuf,
}

/// Streams each URL to `<index>.mp4` in `scratch`, which is created or emptied first.
///
/// A clip that fails to download is logged and left out; callers use the returned indices to
/// drop the matching entries elsewhere.
#[instrument(skip(http, urls), fields(clips = urls.len()))]
pub async fn download_clips(
    http: &reqwest::Client,
    urls: &[String],
    scratch: &Path,
) -> eyre::Result<Vec<DownloadedClip>> {
    reset_dir(scratch).await?;

    let mut downloaded = Vec::with_capacity(urls.len());
    for (index, url) in urls.iter().enumerate() {
        let path = scratch.join(format!("{index}.mp4"));
        match download_one(http, url, &path).await {
            Ok(bytes) => {
                tracing::debug!(url, bytes, "clip downloaded");
                downloaded.push(DownloadedClip { index, path });
            }
            Err(e) => {
                tracing::warn!(url, error = %format!("{e:#}"), "skipping clip that failed to download");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }
    tracing::info!(downloaded = downloaded.len(), "clips downloaded");
    Ok(downloaded)
}

async fn download_one(http: &reqwest::Client, url: &str, path: &Path) -> eyre::Result<u64> {
    let response = http
        .get(url)
        .send()
        .await
        .context("send download request")?
        .error_for_status()
        .context("download request rejected")?;

    let mut file = tokio::fs::File::create(path)
        .await
        .wrap_err_with(|| format!("create {}", path.display()))?;
    let mut written = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("read download body")?;
        file.write_all(&chunk).await.context("write clip")?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("flush clip")?;
    Ok(written)
}

async fn reset_dir(dir: &Path) -> eyre::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).wrap_err_with(|| format!("clear {}", dir.display())),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .wrap_err_with(|| format!("create {}", dir.display()))
}

/// The concatenated video and where each clip starts in it.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedVideo {
    pub path: PathBuf,
    pub timestamps: Vec<f64>,
}

/// Concatenates `clips` into `output`, captioning each with the matching entry of `captions`.
///
/// Every clip is scaled and padded to 1080p, with its caption in the top-left corner for as
/// long as the clip runs. When `logo` is given, the image is shown just left of each caption.
/// Audio is re-encoded as AAC.
#[instrument(skip(clips, captions), fields(clips = clips.len()))]
pub async fn render(
    clips: &[PathBuf],
    captions: &[String],
    logo: Option<&Path>,
    output: &Path,
) -> eyre::Result<RenderedVideo> {
    eyre::ensure!(!clips.is_empty(), "no clips to render");
    eyre::ensure!(
        clips.len() == captions.len(),
        "{} clips but {} captions",
        clips.len(),
        captions.len()
    );

    let mut durations = Vec::with_capacity(clips.len());
    for clip in clips {
        durations.push(probe_duration(clip).await?);
    }

    let mut args: Vec<OsString> = vec!["-y".into(), "-v".into(), "error".into()];
    for clip in clips.iter().map(PathBuf::as_path).chain(logo) {
        args.push("-i".into());
        args.push(clip.into());
    }
    let graph = filter_graph(captions, logo.is_some());
    args.extend(
        [
            "-filter_complex",
            graph.as_str(),
            "-map",
            "[outv]",
            "-map",
            "[outa]",
            "-c:v",
            "libx264",
            "-c:a",
            "aac",
        ]
        .map(OsString::from),
    );
    args.push(output.into());

    tracing::info!(output = %output.display(), "rendering video");
    run_tool("ffmpeg", &args).await?;
    tracing::info!("final video created");

    Ok(RenderedVideo {
        path: output.to_path_buf(),
        timestamps: chapter_timestamps(&durations),
    })
}

/// Builds the `-filter_complex` graph for [`render`].
///
/// With `logo`, the input after the last clip is the logo image.
fn filter_graph(captions: &[String], logo: bool) -> String {
    let n = captions.len();
    let mut graph = String::new();
    let mut caption_x = CAPTION_MARGIN;
    if logo {
        graph.push_str(&format!("[{n}:v]scale={LOGO_SIZE}:{LOGO_SIZE},split={n}"));
        for i in 0..n {
            graph.push_str(&format!("[l{i}]"));
        }
        graph.push(';');
        caption_x += LOGO_SIZE + CAPTION_MARGIN;
    }
    for (i, caption) in captions.iter().enumerate() {
        graph.push_str(&format!(
            "[{i}:v]scale={WIDTH}:{HEIGHT}:force_original_aspect_ratio=decrease,\
             pad={WIDTH}:{HEIGHT}:(ow-iw)/2:(oh-ih)/2,setsar=1"
        ));
        if logo {
            graph.push_str(&format!(
                "[base{i}];[base{i}][l{i}]overlay={CAPTION_MARGIN}:{CAPTION_MARGIN}"
            ));
        }
        graph.push_str(&format!(
            ",drawtext=text={}:expansion=none:font='Sans\\:style=Bold':\
             fontsize={CAPTION_FONT_SIZE}:fontcolor=black:box=1:boxcolor=white:boxborderw=8:\
             x={caption_x}:y={CAPTION_MARGIN}[v{i}];[{i}:a]aresample=44100[a{i}];",
            escape_drawtext(caption)
        ));
    }
    for i in 0..n {
        graph.push_str(&format!("[v{i}][a{i}]"));
    }
    graph.push_str(&format!("concat=n={n}:v=1:a=1[outv][outa]"));
    graph
}

/// Escapes text for an unquoted `drawtext` value inside a filter graph.
///
/// The value is unescaped twice, once as an option value and once as part of the graph.
fn escape_drawtext(text: &str) -> String {
    let option = escape_with(text, &['\\', '\'', ':']);
    escape_with(&option, &['\\', '\'', '[', ']', ',', ';'])
}

fn escape_with(text: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Length of a media file in seconds, as reported by `ffprobe`.
pub async fn probe_duration(path: &Path) -> eyre::Result<f64> {
    let args: Vec<OsString> = vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "format=duration".into(),
        "-of".into(),
        "default=noprint_wrappers=1:nokey=1".into(),
        path.into(),
    ];
    let stdout = run_tool("ffprobe", &args).await?;
    parse_duration(&stdout).wrap_err_with(|| format!("duration of {}", path.display()))
}

fn parse_duration(stdout: &str) -> eyre::Result<f64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| eyre::eyre!("ffprobe printed no duration"))?;
    line.parse()
        .wrap_err_with(|| format!("ffprobe printed {line:?}"))
}

/// Runs an external tool to completion, returning its stdout.
async fn run_tool(program: &str, args: &[OsString]) -> eyre::Result<String> {
    tracing::debug!(program, ?args, "running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .wrap_err_with(|| format!("spawn {program}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        eyre::bail!("{program} failed ({}): {}", output.status, stderr.trim());
    }
    String::from_utf8(output.stdout).wrap_err_with(|| format!("{program} output is not UTF-8"))
}

/// Removes the scratch directory and, if given, the rendered video.
pub async fn cleanup(scratch: &Path, rendered: Option<&Path>) -> eyre::Result<()> {
    match tokio::fs::remove_dir_all(scratch).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).wrap_err_with(|| format!("remove {}", scratch.display())),
    }
    if let Some(file) = rendered {
        match tokio::fs::remove_file(file).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).wrap_err_with(|| format!("remove {}", file.display())),
        }
    }
    tracing::info!("videos deleted");
    Ok(())
}
