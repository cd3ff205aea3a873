//! Failures that callers are expected to tell apart.
//!
//! Everything else travels as a plain [`eyre::Report`] with context attached. The binary
//! downcasts to [`Fault`] to decide how to describe an irrecoverable state to the operator.

use crate::twitch::clips::Selection;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// The clips provider rejected the application credentials. Never retried.
    #[error("clips provider rejected the application credentials ({status}): {body}")]
    CredentialsInvalid { status: StatusCode, body: String },

    /// A network exchange kept failing at the transport level.
    #[error("network request still failing after {attempts} attempts")]
    NetworkTransient { attempts: u32 },

    /// Paging ran out of cursors while more clips were still wanted.
    ///
    /// Carries whatever was accumulated so the caller can decide whether a short result is
    /// acceptable.
    #[error("clip listing ran out of pages after {} clips", selection.len())]
    PageExhausted { selection: Selection },

    /// The upload kept hitting retriable faults until the retry cap was reached.
    #[error("no longer attempting to retry the upload after {attempts} retries")]
    UploadRetriesExhausted { attempts: u32 },

    /// The upload finished without the platform handing back a video id.
    #[error("the upload failed with an unexpected response: {0}")]
    UnexpectedUploadResponse(String),

    /// None of the operator's playlists matched the supplied name.
    #[error("no playlist matching {query:?} exists")]
    NoPlaylistFound { query: String },
}
