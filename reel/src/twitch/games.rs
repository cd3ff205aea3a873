//! Turning an operator-supplied game name into the provider's category id.

use crate::cache::Cache;
use crate::prompt::Prompter;
use crate::twitch::client::HelixClient;
use tracing::instrument;

/// Resolves `name` to a category id, consulting the local cache first.
///
/// Cache keys are lower-cased names. On a miss the provider is asked for the title-cased
/// name; if it knows no such game, the operator is asked for the official name and the lookup
/// is repeated with that. Whatever is found is stored under the name the operator typed
/// originally, so the informal name resolves directly next time.
#[instrument(skip(client, cache, prompter))]
pub async fn resolve_game_id<P: Prompter>(
    client: &HelixClient,
    cache: &Cache<String>,
    prompter: &mut P,
    name: &str,
) -> eyre::Result<String> {
    let key = name.to_lowercase();
    if let Some(id) = cache.lookup(&key).await? {
        tracing::info!(game_id = %id, "game id retrieved from cache");
        return Ok(id);
    }

    let mut query = name.to_string();
    let id = loop {
        let games = client.search_games(&title_case(&query)).await?;
        if let Some(game) = games.into_iter().next() {
            break game.id;
        }

        tracing::debug!(query, "no game found");
        query = prompter
            .ask(&format!(
                "Could not find \"{query}\". What is the game's full name on Twitch? "
            ))
            .await?;

        if let Some(id) = cache.lookup(&query.to_lowercase()).await? {
            break id;
        }
    };

    cache
        .update(|ids| {
            ids.insert(key.clone(), id.clone());
        })
        .await?;
    tracing::info!(game_id = %id, "game id retrieved");
    Ok(id)
}

/// Upper-cases the first letter of every run of letters and lower-cases the rest.
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_word = false;
    for c in name.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}
