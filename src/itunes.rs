#![forbid(unsafe_code)]

//! Metadata-only music search backing the browse UI: free search, the home
//! shelves and artist radio. Results describe tracks; they are never played
//! directly.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LIMIT: u32 = 20;
pub const SHELF_LIMIT: u32 = 10;
pub const RADIO_LIMIT: u32 = 25;
const SONG_ENTITY: &str = "song";

/// Home page shelves: display title and the search term behind it.
pub const HOME_SHELVES: [(&str, &str); 5] = [
    ("Top Hits 🌎", "top hits 2024"),
    ("Hip-Hop Essentials 🎤", "hip hop hits"),
    ("Workout Energy 💪", "workout music"),
    ("Chill Vibes ☁️", "lofi chill"),
    ("Rock Classics 🎸", "best rock songs"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSummary {
    pub id: Option<u64>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Milliseconds.
    pub duration: Option<u64>,
    pub cover: Option<String>,
    pub genre: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Shelf {
    pub title: String,
    pub songs: Vec<TrackSummary>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<ItunesTrack>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItunesTrack {
    track_id: Option<u64>,
    track_name: Option<String>,
    artist_name: Option<String>,
    collection_name: Option<String>,
    track_time_millis: Option<u64>,
    artwork_url100: Option<String>,
    primary_genre_name: Option<String>,
}

impl From<ItunesTrack> for TrackSummary {
    fn from(track: ItunesTrack) -> Self {
        Self {
            id: track.track_id,
            title: track.track_name,
            artist: track.artist_name,
            album: track.collection_name,
            duration: track.track_time_millis,
            cover: track
                .artwork_url100
                .map(|url| url.replace("100x100bb", "600x600bb")),
            genre: track.primary_genre_name,
        }
    }
}

pub struct ItunesCatalog {
    client: reqwest::Client,
    search_url: String,
}

impl ItunesCatalog {
    pub fn new(search_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building iTunes client")?;
        Ok(Self { client, search_url })
    }

    /// `entity` narrows the result kind (`song`); `None` leaves the
    /// provider's default mix.
    pub async fn search(
        &self,
        term: &str,
        entity: Option<&str>,
        limit: u32,
    ) -> Result<Vec<TrackSummary>> {
        let limit = limit.to_string();
        let mut request = self
            .client
            .get(&self.search_url)
            .query(&[("term", term), ("media", "music")]);
        if let Some(entity) = entity {
            request = request.query(&[("entity", entity)]);
        }
        let response = request
            .query(&[("limit", limit.as_str())])
            .send()
            .await
            .context("calling iTunes search")?
            .error_for_status()
            .context("iTunes search status")?;
        let payload: SearchResponse = response
            .json()
            .await
            .context("decoding iTunes search response")?;
        Ok(payload.results.into_iter().map(TrackSummary::from).collect())
    }

    /// Every shelf is fetched concurrently; a shelf whose search fails is
    /// left out and the rest keep their order.
    pub async fn home(&self) -> Vec<Shelf> {
        let shelves = HOME_SHELVES.iter().map(|&(title, term)| async move {
            match self.search(term, None, SHELF_LIMIT).await {
                Ok(songs) => Some(Shelf {
                    title: title.to_string(),
                    songs,
                }),
                Err(err) => {
                    warn!(shelf = title, error = %format!("{err:#}"), "dropping home shelf");
                    None
                }
            }
        });
        join_all(shelves).await.into_iter().flatten().collect()
    }

    /// Songs by `artist` in random order.
    pub async fn radio(&self, artist: &str) -> Result<Vec<TrackSummary>> {
        let mut songs = self.search(artist, Some(SONG_ENTITY), RADIO_LIMIT).await?;
        songs.shuffle(&mut rand::thread_rng());
        Ok(songs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn maps_results_and_upscales_artwork() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("term", "shape of you"))
            .and(query_param("media", "music"))
            .and(query_param("limit", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resultCount": 1,
                "results": [{
                    "trackId": 1193701392,
                    "trackName": "Shape of You",
                    "artistName": "Ed Sheeran",
                    "collectionName": "÷ (Deluxe)",
                    "trackTimeMillis": 233713,
                    "artworkUrl100": "https://is1.mzstatic.com/image/100x100bb.jpg",
                    "primaryGenreName": "Pop"
                }]
            })))
            .mount(&server)
            .await;

        let catalog = ItunesCatalog::new(format!("{}/search", server.uri())).unwrap();
        let results = catalog.search("shape of you", None, DEFAULT_LIMIT).await.unwrap();
        assert_eq!(results.len(), 1);
        let track = &results[0];
        assert_eq!(track.id, Some(1193701392));
        assert_eq!(track.artist.as_deref(), Some("Ed Sheeran"));
        assert_eq!(
            track.cover.as_deref(),
            Some("https://is1.mzstatic.com/image/600x600bb.jpg")
        );
    }

    #[tokio::test]
    async fn provider_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let catalog = ItunesCatalog::new(format!("{}/search", server.uri())).unwrap();
        assert!(catalog.search("anything", None, DEFAULT_LIMIT).await.is_err());
    }

    #[tokio::test]
    async fn tolerates_sparse_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": [{"trackName": "Untitled"}]})),
            )
            .mount(&server)
            .await;

        let catalog = ItunesCatalog::new(format!("{}/search", server.uri())).unwrap();
        let results = catalog.search("x", None, 1).await.unwrap();
        assert_eq!(results[0].title.as_deref(), Some("Untitled"));
        assert_eq!(results[0].cover, None);
    }

    fn track_json(id: u64, name: &str) -> serde_json::Value {
        json!({"trackId": id, "trackName": name, "artistName": "Daft Punk"})
    }

    #[tokio::test]
    async fn home_drops_failed_shelves_and_keeps_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("term", "hip hop hits"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("limit", "10"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": [track_json(1, "One")]})),
            )
            .mount(&server)
            .await;

        let catalog = ItunesCatalog::new(format!("{}/search", server.uri())).unwrap();
        let shelves = catalog.home().await;
        let titles: Vec<&str> = shelves.iter().map(|shelf| shelf.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                HOME_SHELVES[0].0,
                HOME_SHELVES[2].0,
                HOME_SHELVES[3].0,
                HOME_SHELVES[4].0
            ]
        );
        assert!(shelves.iter().all(|shelf| shelf.songs.len() == 1));
    }

    #[tokio::test]
    async fn radio_asks_for_songs_and_keeps_every_track() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("term", "Daft Punk"))
            .and(query_param("entity", "song"))
            .and(query_param("limit", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [track_json(1, "One"), track_json(2, "Two"), track_json(3, "Three")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = ItunesCatalog::new(format!("{}/search", server.uri())).unwrap();
        let mut ids: Vec<u64> = catalog
            .radio("Daft Punk")
            .await
            .unwrap()
            .into_iter()
            .filter_map(|track| track.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
