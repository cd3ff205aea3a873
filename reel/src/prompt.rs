//! Operator interaction.
//!
//! The rest of the crate only sees the [`Prompter`] and [`DecisionSource`] capabilities, so
//! tests (or a future non-interactive front-end) can script the answers.

use crate::media::timecode;
use crate::twitch::types::Clip;
use eyre::Context;
use std::future::Future;
use std::io::Write;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

/// Asks the operator a free-text question.
pub trait Prompter {
    fn ask(&mut self, question: &str) -> impl Future<Output = eyre::Result<String>> + Send;
}

/// What to do with a clip candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// `y`: include it and keep going.
    Accept,
    /// `n`: skip it and keep going.
    Reject,
    /// `yf`: include it, and stop selecting.
    AcceptFinish,
    /// `nf`: skip it, and stop selecting.
    RejectFinish,
}

impl Decision {
    pub fn accepts(self) -> bool {
        matches!(self, Self::Accept | Self::AcceptFinish)
    }

    pub fn finishes(self) -> bool {
        matches!(self, Self::AcceptFinish | Self::RejectFinish)
    }
}

impl FromStr for Decision {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "y" => Ok(Self::Accept),
            "n" => Ok(Self::Reject),
            "yf" => Ok(Self::AcceptFinish),
            "nf" => Ok(Self::RejectFinish),
            other => Err(eyre::eyre!("{other:?} is not one of y, yf, n, nf")),
        }
    }
}

/// Decides, one candidate at a time, which clips go into the video.
pub trait DecisionSource {
    /// `running_total` is the length in seconds of the clips accepted so far.
    fn decide(
        &mut self,
        candidate: &Clip,
        running_total: f64,
    ) -> impl Future<Output = eyre::Result<Decision>> + Send;
}

/// Reads answers line by line from standard input.
pub struct Terminal {
    lines: Lines<BufReader<Stdin>>,
}

impl Terminal {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for Terminal {
    async fn ask(&mut self, question: &str) -> eyre::Result<String> {
        {
            let mut stdout = std::io::stdout().lock();
            write!(stdout, "{question}").context("write prompt")?;
            stdout.flush().context("flush prompt")?;
        }
        let line = self
            .lines
            .next_line()
            .await
            .context("read operator input")?
            .ok_or_else(|| eyre::eyre!("standard input closed while waiting for an answer"))?;
        Ok(line.trim().to_string())
    }
}

/// Shows each candidate to the operator and asks whether to keep it.
pub struct OperatorDecisions<P> {
    prompter: P,
    open_in_browser: bool,
}

impl<P: Prompter + Send> OperatorDecisions<P> {
    pub fn new(prompter: P) -> Self {
        Self {
            prompter,
            open_in_browser: true,
        }
    }

    /// Don't open each candidate in the system browser.
    pub fn without_browser(mut self) -> Self {
        self.open_in_browser = false;
        self
    }

    /// Hands the prompter back once selection is over.
    pub fn into_prompter(self) -> P {
        self.prompter
    }
}

impl<P: Prompter + Send> DecisionSource for OperatorDecisions<P> {
    async fn decide(&mut self, candidate: &Clip, running_total: f64) -> eyre::Result<Decision> {
        if self.open_in_browser
            && let Err(e) = webbrowser::open(&candidate.url)
        {
            tracing::warn!(url = %candidate.url, error = %e, "could not open clip in browser");
        }

        println!("{}", candidate.url);
        println!("Current length of video: {}", timecode(running_total));
        println!(
            "With current clip:       {}",
            timecode(running_total + candidate.duration)
        );

        loop {
            let answer = self
                .prompter
                .ask("Include this clip in the video? (y, yf, n, nf): ")
                .await?;
            match answer.parse() {
                Ok(decision) => return Ok(decision),
                Err(_) => println!("Invalid choice."),
            }
        }
    }
}
