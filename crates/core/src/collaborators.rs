//! Interfaces to external collaborators
//!
//! Track catalogs and room persistence live outside the coordinator. The
//! in-memory implementations here back the default server and the tests.

use crate::protocol::{PlayMode, ResolvedTrack, RoomId, Track, UserId};
use crate::room::ConnectionId;
use crate::time::TimestampMs;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Results per search page
pub const SEARCH_PAGE_SIZE: usize = 20;

/// Third-party track catalog
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Search a source; `page` starts at 1
    async fn search(&self, source: &str, keyword: &str, page: u32) -> Result<Vec<Track>>;

    /// Playable URL, or `None` when the track is unavailable
    async fn stream_url(&self, source: &str, id: &str) -> Result<Option<String>>;

    async fn cover(&self, source: &str, id: &str) -> Result<Option<String>>;

    async fn lyric(&self, source: &str, id: &str) -> Result<Option<String>>;
}

/// Resolve everything needed to play `track`
///
/// The stream URL is mandatory; cover and lyric are fetched best-effort and
/// their failures only logged.
pub async fn resolve_track(
    resolver: &dyn TrackResolver,
    track: &Track,
) -> Result<Option<ResolvedTrack>> {
    let Some(stream_url) = resolver.stream_url(&track.source, &track.id).await? else {
        return Ok(None);
    };

    let (cover, lyric) = futures::join!(
        resolver.cover(&track.source, &track.id),
        resolver.lyric(&track.source, &track.id)
    );
    let cover_url = cover.unwrap_or_else(|e| {
        tracing::debug!(track_id = %track.id, error = %e, "Cover lookup failed");
        None
    });
    let lyric = lyric.unwrap_or_else(|e| {
        tracing::debug!(track_id = %track.id, error = %e, "Lyric lookup failed");
        None
    });

    Ok(Some(ResolvedTrack {
        track: track.clone(),
        stream_url,
        cover_url,
        lyric,
    }))
}

#[derive(Debug, Clone)]
enum Availability {
    Available(String),
    Unavailable,
    Failing,
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    track: Track,
    availability: Availability,
    cover_url: Option<String>,
    lyric: Option<String>,
}

/// In-memory catalog
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: RwLock<Vec<CatalogEntry>>,
    latency: Option<Duration>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every lookup, to exercise completion re-validation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Add a playable track
    pub fn add(&self, track: Track, stream_url: impl Into<String>) {
        self.insert(CatalogEntry {
            track,
            availability: Availability::Available(stream_url.into()),
            cover_url: None,
            lyric: None,
        });
    }

    /// Add a playable track with artwork and lyrics
    pub fn add_with_extras(
        &self,
        track: Track,
        stream_url: impl Into<String>,
        cover_url: Option<String>,
        lyric: Option<String>,
    ) {
        self.insert(CatalogEntry {
            track,
            availability: Availability::Available(stream_url.into()),
            cover_url,
            lyric,
        });
    }

    /// Add a track with no playable stream
    pub fn add_unavailable(&self, track: Track) {
        self.insert(CatalogEntry {
            track,
            availability: Availability::Unavailable,
            cover_url: None,
            lyric: None,
        });
    }

    /// Add a track whose lookups fail
    pub fn add_failing(&self, track: Track) {
        self.insert(CatalogEntry {
            track,
            availability: Availability::Failing,
            cover_url: None,
            lyric: None,
        });
    }

    /// Load a catalog from JSON: an array of tracks with a `stream_url`
    pub fn from_json(json: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(flatten)]
            track: Track,
            #[serde(default)]
            stream_url: Option<String>,
            #[serde(default)]
            cover_url: Option<String>,
            #[serde(default)]
            lyric: Option<String>,
        }

        let rows: Vec<Row> = serde_json::from_str(json)?;
        let resolver = Self::new();
        for row in rows {
            resolver.insert(CatalogEntry {
                track: row.track,
                availability: match row.stream_url {
                    Some(url) => Availability::Available(url),
                    None => Availability::Unavailable,
                },
                cover_url: row.cover_url,
                lyric: row.lyric,
            });
        }
        Ok(resolver)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn insert(&self, entry: CatalogEntry) {
        let mut entries = self.entries.write();
        entries.retain(|e| !(e.track.id == entry.track.id && e.track.source == entry.track.source));
        entries.push(entry);
    }

    fn lookup(&self, source: &str, id: &str) -> Option<CatalogEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.track.source == source && e.track.id == id)
            .cloned()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl TrackResolver for StaticResolver {
    async fn search(&self, source: &str, keyword: &str, page: u32) -> Result<Vec<Track>> {
        self.simulate_latency().await;
        let keyword = keyword.to_lowercase();
        let skip = (page.max(1) as usize - 1) * SEARCH_PAGE_SIZE;
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.track.source == source)
            .filter(|e| {
                e.track.title.to_lowercase().contains(&keyword)
                    || e.track.artist.to_lowercase().contains(&keyword)
            })
            .skip(skip)
            .take(SEARCH_PAGE_SIZE)
            .map(|e| e.track.clone())
            .collect())
    }

    async fn stream_url(&self, source: &str, id: &str) -> Result<Option<String>> {
        self.simulate_latency().await;
        match self.lookup(source, id).map(|e| e.availability) {
            Some(Availability::Available(url)) => Ok(Some(url)),
            Some(Availability::Unavailable) | None => Ok(None),
            Some(Availability::Failing) => Err(Error::Collaborator(format!(
                "catalog lookup failed for {source}:{id}"
            ))),
        }
    }

    async fn cover(&self, source: &str, id: &str) -> Result<Option<String>> {
        Ok(self.lookup(source, id).and_then(|e| e.cover_url))
    }

    async fn lyric(&self, source: &str, id: &str) -> Result<Option<String>> {
        Ok(self.lookup(source, id).and_then(|e| e.lyric))
    }
}

/// Persisted summary of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub host_id: UserId,
    pub member_count: usize,
    pub play_mode: PlayMode,
    pub created_at: TimestampMs,
}

/// Which room and user a connection belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketMapping {
    pub room_id: RoomId,
    pub user_id: UserId,
}

/// Plain key-value room store
pub trait RoomRepository: Send + Sync {
    fn get(&self, room_id: &str) -> Option<RoomRecord>;

    fn set(&self, record: RoomRecord);

    /// Returns whether an entry was removed
    fn delete(&self, room_id: &str) -> bool;

    fn socket_mapping(&self, conn: &ConnectionId) -> Option<SocketMapping>;

    fn set_socket_mapping(&self, conn: ConnectionId, mapping: SocketMapping);

    fn remove_socket_mapping(&self, conn: &ConnectionId) -> Option<SocketMapping>;
}

#[derive(Debug, Default)]
pub struct InMemoryRoomRepository {
    rooms: RwLock<HashMap<RoomId, RoomRecord>>,
    sockets: RwLock<HashMap<ConnectionId, SocketMapping>>,
    deletions: AtomicU64,
}

impl InMemoryRoomRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.read().len()
    }

    /// Number of entries actually removed by `delete`
    pub fn deletions(&self) -> u64 {
        self.deletions.load(Ordering::Relaxed)
    }
}

impl RoomRepository for InMemoryRoomRepository {
    fn get(&self, room_id: &str) -> Option<RoomRecord> {
        self.rooms.read().get(room_id).cloned()
    }

    fn set(&self, record: RoomRecord) {
        self.rooms.write().insert(record.room_id.clone(), record);
    }

    fn delete(&self, room_id: &str) -> bool {
        let removed = self.rooms.write().remove(room_id).is_some();
        if removed {
            self.deletions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    fn socket_mapping(&self, conn: &ConnectionId) -> Option<SocketMapping> {
        self.sockets.read().get(conn).cloned()
    }

    fn set_socket_mapping(&self, conn: ConnectionId, mapping: SocketMapping) {
        self.sockets.write().insert(conn, mapping);
    }

    fn remove_socket_mapping(&self, conn: &ConnectionId) -> Option<SocketMapping> {
        self.sockets.write().remove(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, title: &str) -> Track {
        Track {
            id: id.to_string(),
            source: "demo".to_string(),
            title: title.to_string(),
            artist: "Band".to_string(),
            duration_secs: Some(200.0),
        }
    }

    #[tokio::test]
    async fn test_resolve_track_with_extras() {
        let resolver = StaticResolver::new();
        resolver.add_with_extras(
            track("t1", "Song"),
            "https://cdn.example/t1.mp3",
            Some("https://cdn.example/t1.jpg".into()),
            None,
        );

        let resolved = resolve_track(&resolver, &track("t1", "Song"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.stream_url, "https://cdn.example/t1.mp3");
        assert!(resolved.cover_url.is_some());
        assert!(resolved.lyric.is_none());
    }

    #[tokio::test]
    async fn test_resolve_unavailable_and_failing() {
        let resolver = StaticResolver::new();
        resolver.add_unavailable(track("gone", "Gone"));
        resolver.add_failing(track("err", "Err"));

        assert!(resolve_track(&resolver, &track("gone", "Gone"))
            .await
            .unwrap()
            .is_none());
        assert!(resolve_track(&resolver, &track("err", "Err")).await.is_err());
        assert!(resolve_track(&resolver, &track("missing", "?"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_search_pages() {
        let resolver = StaticResolver::new();
        for i in 0..25 {
            resolver.add(track(&format!("t{i}"), &format!("Night {i}")), "url");
        }
        resolver.add(track("x", "Morning"), "url");

        assert_eq!(resolver.search("demo", "night", 1).await.unwrap().len(), 20);
        assert_eq!(resolver.search("demo", "NIGHT", 2).await.unwrap().len(), 5);
        assert_eq!(resolver.search("demo", "band", 1).await.unwrap().len(), 20);
        assert!(resolver.search("other", "night", 1).await.unwrap().is_empty());
    }

    #[test]
    fn test_catalog_from_json() {
        let resolver = StaticResolver::from_json(
            r#"[
                {"id":"a","source":"demo","title":"A","stream_url":"https://cdn.example/a.mp3"},
                {"id":"b","source":"demo","title":"B"}
            ]"#,
        )
        .unwrap();
        assert_eq!(resolver.len(), 2);
    }

    #[test]
    fn test_repository_delete_counts_once() {
        let repo = InMemoryRoomRepository::new();
        repo.set(RoomRecord {
            room_id: "r1".into(),
            host_id: "u1".into(),
            member_count: 1,
            play_mode: PlayMode::Sequential,
            created_at: 0,
        });
        assert!(repo.delete("r1"));
        assert!(!repo.delete("r1"));
        assert_eq!(repo.deletions(), 1);
    }

    #[test]
    fn test_socket_mappings() {
        let repo = InMemoryRoomRepository::new();
        let conn = uuid::Uuid::new_v4();
        repo.set_socket_mapping(
            conn,
            SocketMapping {
                room_id: "r1".into(),
                user_id: "u1".into(),
            },
        );
        assert_eq!(repo.socket_mapping(&conn).unwrap().user_id, "u1");
        assert!(repo.remove_socket_mapping(&conn).is_some());
        assert_eq!(repo.socket_count(), 0);
    }
}
