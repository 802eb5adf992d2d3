use std::collections::BTreeSet;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id::Id;

pub type UserId = Id<User>;
pub type SongId = Id<Song>;
pub type AlbumId = Id<Album>;
pub type PlaylistId = Id<Playlist>;

/// What a user is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Listener,
    Artist,
    Admin,
}

/// A listener, artist, or admin account.
///
/// The relationship sets are stored on both participating records and always
/// written together, so either side can be read without a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// Hashing happens outside the engine, this is opaque here.
    pub password_hash: String,
    pub role: Role,
    pub liked_songs: BTreeSet<SongId>,
    pub liked_albums: BTreeSet<AlbumId>,
    /// Users this user follows.
    pub following: BTreeSet<UserId>,
    /// Users following this user, the reverse edge of `following`.
    pub followers: BTreeSet<UserId>,
    pub following_playlists: BTreeSet<PlaylistId>,
    /// Playlists owned by this user, in creation order.
    pub playlists: Vec<PlaylistId>,
}

/// A single track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: SongId,
    pub artist_id: UserId,
    /// The album this song belongs to, if any. Kept in sync with the
    /// album's track list.
    pub album_id: Option<AlbumId>,
    pub title: String,
    pub duration_seconds: u32,
    /// Where the audio lives. Resolved by external collaborators.
    pub file_ref: String,
    /// Monotonic, never decremented.
    pub play_count: u64,
    pub liked_by: BTreeSet<UserId>,
}

/// An ordered collection of songs by one artist.
/// The track number of a song is its index in `songs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: AlbumId,
    pub artist_id: UserId,
    pub title: String,
    /// No duplicates allowed.
    pub songs: Vec<SongId>,
    pub liked_by: BTreeSet<UserId>,
}

/// A user-curated ordered collection of songs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: PlaylistId,
    pub owner_id: UserId,
    pub title: String,
    pub is_public: bool,
    /// The same song may appear more than once.
    pub songs: Vec<SongId>,
    pub followed_by: BTreeSet<UserId>,
}

/// One entry of the recently played list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayEntry {
    pub song_id: SongId,
    pub played_at: DateTime<Utc>,
}

/// Per-user state that exists exactly as long as the user does.
/// Created lazily with `Settings::default` the first time it is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: UserId,
    /// Most recent first, strictly ordered by `played_at`, bounded by
    /// the configured history capacity.
    pub recently_played: Vec<PlayEntry>,
    /// User-editable, replaced wholesale, unbounded.
    pub queue: Vec<SongId>,
    pub settings: Settings,
}

impl UserPreferences {
    /// The record a user starts with.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            recently_played: Vec::new(),
            queue: Vec::new(),
            settings: Settings::default(),
        }
    }
}

/// Playback quality preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Low,
    Medium,
    High,
}

/// Player and privacy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub theme: String,
    pub language: String,
    pub autoplay: bool,
    pub explicit_content: bool,
    pub audio_quality: AudioQuality,
    pub crossfade_seconds: u32,
    pub gapless_playback: bool,
    pub show_activity: bool,
    pub show_recently_played: bool,
    pub show_favorites: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            language: "en".to_string(),
            autoplay: true,
            explicit_content: false,
            audio_quality: AudioQuality::Medium,
            crossfade_seconds: 0,
            gapless_playback: true,
            show_activity: true,
            show_recently_played: true,
            show_favorites: true,
        }
    }
}

/// The kinds of records the store can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    User,
    Song,
    Album,
    Playlist,
    Preferences,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Song => "song",
            Self::Album => "album",
            Self::Playlist => "playlist",
            Self::Preferences => "preferences",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "song" => Some(Self::Song),
            "album" => Some(Self::Album),
            "playlist" => Some(Self::Playlist),
            "preferences" => Some(Self::Preferences),
            _ => None,
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Addresses one record in the store. Orders by kind, then id, which is the
/// global order every operation acquires locks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl RecordKey {
    pub fn new(kind: EntityKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Any record the store can hold. Serialized bodies carry a kind tag, so a
/// stored document decodes without knowing its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    User(User),
    Song(Song),
    Album(Album),
    Playlist(Playlist),
    Preferences(UserPreferences),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::Song(_) => EntityKind::Song,
            Self::Album(_) => EntityKind::Album,
            Self::Playlist(_) => EntityKind::Playlist,
            Self::Preferences(_) => EntityKind::Preferences,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::User(user) => user.id.value(),
            Self::Song(song) => song.id.value(),
            Self::Album(album) => album.id.value(),
            Self::Playlist(playlist) => playlist.id.value(),
            Self::Preferences(preferences) => preferences.user_id.value(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind(), self.id())
    }

    pub fn into_user(self) -> Option<User> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn into_song(self) -> Option<Song> {
        match self {
            Self::Song(song) => Some(song),
            _ => None,
        }
    }

    pub fn into_album(self) -> Option<Album> {
        match self {
            Self::Album(album) => Some(album),
            _ => None,
        }
    }

    pub fn into_playlist(self) -> Option<Playlist> {
        match self {
            Self::Playlist(playlist) => Some(playlist),
            _ => None,
        }
    }

    pub fn into_preferences(self) -> Option<UserPreferences> {
        match self {
            Self::Preferences(preferences) => Some(preferences),
            _ => None,
        }
    }
}

impl From<User> for Record {
    fn from(user: User) -> Self {
        Self::User(user)
    }
}

impl From<Song> for Record {
    fn from(song: Song) -> Self {
        Self::Song(song)
    }
}

impl From<Album> for Record {
    fn from(album: Album) -> Self {
        Self::Album(album)
    }
}

impl From<Playlist> for Record {
    fn from(playlist: Playlist) -> Self {
        Self::Playlist(playlist)
    }
}

impl From<UserPreferences> for Record {
    fn from(preferences: UserPreferences) -> Self {
        Self::Preferences(preferences)
    }
}

/// A typed reference to a deletable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    User(UserId),
    Song(SongId),
    Album(AlbumId),
    Playlist(PlaylistId),
}

impl EntityRef {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::User(id) => RecordKey::new(EntityKind::User, id.value()),
            Self::Song(id) => RecordKey::new(EntityKind::Song, id.value()),
            Self::Album(id) => RecordKey::new(EntityKind::Album, id.value()),
            Self::Playlist(id) => RecordKey::new(EntityKind::Playlist, id.value()),
        }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A typed reference to an entity holding an ordered list of songs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRef {
    Album(AlbumId),
    Playlist(PlaylistId),
}

impl ContainerRef {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Album(id) => RecordKey::new(EntityKind::Album, id.value()),
            Self::Playlist(id) => RecordKey::new(EntityKind::Playlist, id.value()),
        }
    }
}

impl Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// What a like toggle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeTarget {
    Song(SongId),
    Album(AlbumId),
}

/// What a follow toggle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowTarget {
    User(UserId),
    Playlist(PlaylistId),
}

/// Addresses one entry of a container, either by song or by position.
/// A song id addresses its first occurrence when a playlist holds duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SongSelector {
    Id(SongId),
    Position(usize),
}

/// One entry of a reorder request: move `song_id` to `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionAssignment {
    pub song_id: SongId,
    pub position: usize,
}

/// A user account to be created.
#[derive(Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

/// A song to be created, owned by `artist_id`.
#[derive(Debug)]
pub struct NewSong {
    pub artist_id: UserId,
    pub title: String,
    pub duration_seconds: u32,
    pub file_ref: String,
    /// Appends the song to this album's track list on creation.
    pub album_id: Option<AlbumId>,
}

/// An album to be created, owned by `artist_id`.
#[derive(Debug)]
pub struct NewAlbum {
    pub artist_id: UserId,
    pub title: String,
}

/// A playlist to be created, owned by `owner_id`.
#[derive(Debug)]
pub struct NewPlaylist {
    pub owner_id: UserId,
    pub title: String,
    pub is_public: bool,
}

/// A partial profile update.
#[derive(Debug, Default)]
pub struct UpdatedUser {
    pub username: Option<String>,
    pub email: Option<String>,
}

/// A partial song update.
#[derive(Debug, Default)]
pub struct UpdatedSong {
    pub title: Option<String>,
    pub duration_seconds: Option<u32>,
    pub file_ref: Option<String>,
}

/// A partial album update.
#[derive(Debug, Default)]
pub struct UpdatedAlbum {
    pub title: Option<String>,
}

/// A partial playlist update.
#[derive(Debug, Default)]
pub struct UpdatedPlaylist {
    pub title: Option<String>,
    pub is_public: Option<bool>,
}

/// A partial settings update. `None` fields keep their current value.
#[derive(Debug, Default)]
pub struct UpdatedSettings {
    pub theme: Option<String>,
    pub language: Option<String>,
    pub autoplay: Option<bool>,
    pub explicit_content: Option<bool>,
    pub audio_quality: Option<AudioQuality>,
    pub crossfade_seconds: Option<u32>,
    pub gapless_playback: Option<bool>,
    pub show_activity: Option<bool>,
    pub show_recently_played: Option<bool>,
    pub show_favorites: Option<bool>,
}

#[cfg(test)]
impl User {
    pub fn mock(username: &str) -> Self {
        Self {
            id: UserId::new(),
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password_hash: "hash".to_string(),
            role: Role::Listener,
            liked_songs: BTreeSet::new(),
            liked_albums: BTreeSet::new(),
            following: BTreeSet::new(),
            followers: BTreeSet::new(),
            following_playlists: BTreeSet::new(),
            playlists: Vec::new(),
        }
    }

    pub fn mock_artist(username: &str) -> Self {
        Self {
            role: Role::Artist,
            ..Self::mock(username)
        }
    }
}

#[cfg(test)]
impl Song {
    pub fn mock(artist_id: UserId, title: &str) -> Self {
        Self {
            id: SongId::new(),
            artist_id,
            album_id: None,
            title: title.to_string(),
            duration_seconds: 180,
            file_ref: format!("audio/{}.ogg", title),
            play_count: 0,
            liked_by: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
impl Album {
    pub fn mock(artist_id: UserId, title: &str) -> Self {
        Self {
            id: AlbumId::new(),
            artist_id,
            title: title.to_string(),
            songs: Vec::new(),
            liked_by: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
impl Playlist {
    pub fn mock(owner_id: UserId, title: &str) -> Self {
        Self {
            id: PlaylistId::new(),
            owner_id,
            title: title.to_string(),
            is_public: true,
            songs: Vec::new(),
            followed_by: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bodies_carry_a_kind_tag_matching_their_key() {
        let user = User::mock("john");

        let records: Vec<Record> = vec![
            user.clone().into(),
            Song::mock(user.id, "one").into(),
            Album::mock(user.id, "two").into(),
            Playlist::mock(user.id, "three").into(),
            UserPreferences::new(user.id).into(),
        ];

        for record in records {
            let value = serde_json::to_value(&record).unwrap();

            assert_eq!(value["kind"], record.kind().as_str());
            assert_eq!(serde_json::from_value::<Record>(value).unwrap(), record);
        }
    }

    #[test]
    fn bodies_keep_their_fields_inline() {
        let user = User::mock("john");
        let value = serde_json::to_value(Record::from(user.clone())).unwrap();

        assert_eq!(value["id"], user.id.to_string());
        assert_eq!(value["username"], "john");
        assert_eq!(value["email"], "john@example.com");
    }
}
