//! Which playlist a game's videos go into, and filing videos there.

use crate::cache::Cache;
use crate::error::Fault;
use crate::prompt::Prompter;
use crate::youtube::client::{PlaylistInsert, YouTubeClient};
use serde::{Deserialize, Serialize};
use std::pin::pin;
use tokio_stream::StreamExt;
use tracing::instrument;

/// A game's playlist as remembered locally.
///
/// Stored as a `[id, title, item_count]` array. The count is only ever incremented locally
/// after an insert, so it can drift from the real playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String, u64)", into = "(String, String, u64)")]
pub struct PlaylistRecord {
    pub playlist_id: String,
    pub title: String,
    pub item_count: u64,
}

impl From<(String, String, u64)> for PlaylistRecord {
    fn from((playlist_id, title, item_count): (String, String, u64)) -> Self {
        Self {
            playlist_id,
            title,
            item_count,
        }
    }
}

impl From<PlaylistRecord> for (String, String, u64) {
    fn from(record: PlaylistRecord) -> Self {
        (record.playlist_id, record.title, record.item_count)
    }
}

/// Finds the playlist for `game_id`, consulting the cache first.
///
/// On a miss the operator is asked once for the playlist's name, and the operator's own
/// playlists are searched page by page for the first title containing it, ignoring case.
/// A match is written to the cache with the playlist's current item count.
#[instrument(skip(client, cache, prompter))]
pub async fn resolve_playlist<P: Prompter>(
    client: &YouTubeClient,
    cache: &Cache<PlaylistRecord>,
    prompter: &mut P,
    game_id: &str,
) -> eyre::Result<PlaylistRecord> {
    if let Some(record) = cache.lookup(game_id).await? {
        tracing::info!(playlist_id = %record.playlist_id, "playlist retrieved from cache");
        return Ok(record);
    }

    let query = prompter
        .ask("Game not yet attributed to a playlist. What is the full name of the playlist? ")
        .await?;
    let needle = query.trim().to_lowercase();

    let mut playlists = pin!(client.list_my_playlists());
    let found = loop {
        let Some(playlist) = playlists.next().await else {
            return Err(Fault::NoPlaylistFound { query }.into());
        };
        let playlist = playlist?;
        if playlist.snippet.title.to_lowercase().contains(&needle) {
            break playlist;
        }
    };

    let record = PlaylistRecord {
        item_count: found.item_count(),
        playlist_id: found.id,
        title: found.snippet.title,
    };
    cache
        .update(|records| {
            records.insert(game_id.to_string(), record.clone());
        })
        .await?;
    tracing::info!(playlist_id = %record.playlist_id, title = %record.title, "playlist found");
    Ok(record)
}

/// Appends `video_id` to the game's playlist and bumps the locally cached item count.
///
/// The count goes up even when the video turned out to be in the playlist already.
#[instrument(skip(client, cache, record), fields(playlist_id = %record.playlist_id))]
pub async fn insert_video(
    client: &YouTubeClient,
    cache: &Cache<PlaylistRecord>,
    game_id: &str,
    record: &PlaylistRecord,
    video_id: &str,
) -> eyre::Result<()> {
    match client
        .insert_playlist_item(&record.playlist_id, video_id)
        .await?
    {
        PlaylistInsert::Inserted => tracing::info!("video added to playlist"),
        PlaylistInsert::AlreadyPresent => tracing::info!("video was already in playlist"),
    }

    cache
        .update(|records| {
            records
                .entry(game_id.to_string())
                .or_insert_with(|| record.clone())
                .item_count += 1;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::scripted::ScriptedPrompter;
    use crate::youtube::client::tests::{client_for, playlist};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cache(dir: &TempDir) -> Cache<PlaylistRecord> {
        Cache::new(dir.path().join("playlist_ids.json"))
    }

    #[test]
    fn record_is_stored_as_array() {
        let record = PlaylistRecord {
            playlist_id: "PL1".into(),
            title: "Apex".into(),
            item_count: 3,
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            serde_json::json!(["PL1", "Apex", 3])
        );
        let back: PlaylistRecord = serde_json::from_str(r#"["PL1","Apex",3]"#).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn cached_playlist_needs_no_request_or_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        std::fs::write(cache.path(), r#"{"21779": ["PL9", "League Highlights", 7]}"#).unwrap();
        let mut prompter = ScriptedPrompter::default();

        let record = resolve_playlist(&client_for(&server), &cache, &mut prompter, "21779")
            .await
            .unwrap();
        assert_eq!(record.playlist_id, "PL9");
        assert_eq!(record.item_count, 7);
        assert!(prompter.questions.is_empty());
    }

    #[tokio::test]
    async fn searches_pages_with_one_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/playlists"))
            .and(query_param("pageToken", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [playlist("PL2", "Best of APEX LEGENDS", 12)]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/playlists"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [playlist("PL1", "Valorant", 2)],
                "nextPageToken": "next"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let mut prompter = ScriptedPrompter::new(["apex legends"]);

        let record = resolve_playlist(&client_for(&server), &cache, &mut prompter, "511224")
            .await
            .unwrap();
        assert_eq!(
            record,
            PlaylistRecord {
                playlist_id: "PL2".into(),
                title: "Best of APEX LEGENDS".into(),
                item_count: 12,
            }
        );
        assert_eq!(prompter.questions.len(), 1);
        assert_eq!(cache.lookup("511224").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn no_match_on_last_page_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/playlists"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [playlist("PL1", "Valorant", 2)]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut prompter = ScriptedPrompter::new(["minecraft"]);
        let err = resolve_playlist(&client_for(&server), &cache(&dir), &mut prompter, "27471")
            .await
            .unwrap_err();
        match err.downcast_ref::<Fault>() {
            Some(Fault::NoPlaylistFound { query }) => assert_eq!(query, "minecraft"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_still_bumps_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/playlistItems"))
            .respond_with(
                ResponseTemplate::new(409).set_body_string("reason: videoAlreadyInPlaylist"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        std::fs::write(
            cache.path(),
            r#"{"511224": ["PL2", "Apex", 12], "21779": ["PL9", "League", 7]}"#,
        )
        .unwrap();
        let record = cache.lookup("511224").await.unwrap().unwrap();

        insert_video(&client_for(&server), &cache, "511224", &record, "vid")
            .await
            .unwrap();

        let stored = cache.get().await.unwrap();
        assert_eq!(stored["511224"].item_count, 13);
        assert_eq!(stored["21779"].item_count, 7);
    }
}
