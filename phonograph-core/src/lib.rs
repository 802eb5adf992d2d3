use std::sync::Arc;

use crossbeam::channel::unbounded;

mod catalog;
mod config;
mod entity;
mod error;
mod events;
mod history;
mod relations;
mod store;
mod tracklist;
mod txn;

pub use catalog::*;
pub use config::*;
pub use entity::*;
pub use error::*;
pub use events::*;
pub use history::*;
pub use relations::*;
pub use store::*;
pub use tracklist::*;
pub use txn::*;

/// The media graph engine, keeping relationships, track orders, and
/// listening history consistent over any entity store.
///
/// Every command runs as one transaction: the records it touches are locked,
/// validated, and written as a single batch, so no caller ever observes half
/// an operation. Queries read committed state without taking locks.
pub struct MediaGraph<S> {
    relations: Relations<S>,
    tracklists: Tracklists<S>,
    history: History<S>,
    catalog: Catalog<S>,

    context: GraphContext<S>,
    event_receiver: EventReceiver,
}

/// A type passed to the managers of the graph, to read records, take locks,
/// and open transactions.
pub struct GraphContext<S> {
    pub config: Config,

    pub store: Arc<S>,
    pub locks: Arc<LockTable>,

    event_sender: EventSender,
}

impl<S> MediaGraph<S>
where
    S: EntityStore,
{
    /// Creates a graph over the given store.
    pub fn new(store: S, config: Config) -> Self {
        let (event_sender, event_receiver) = unbounded();

        let context = GraphContext {
            config,

            store: Arc::new(store),
            locks: Arc::new(LockTable::new()),

            event_sender,
        };

        Self {
            relations: Relations::new(&context),
            tracklists: Tracklists::new(&context),
            history: History::new(&context),
            catalog: Catalog::new(&context),

            context,
            event_receiver,
        }
    }

    /// Returns a receiver for the events the engine emits after commits.
    /// Rolled back operations emit nothing.
    pub fn events(&self) -> EventReceiver {
        self.event_receiver.clone()
    }

    /// Toggles a like on a song or album, returning the resulting state.
    pub async fn toggle_like(&self, user_id: UserId, target: LikeTarget) -> Result<bool> {
        self.relations.toggle_like(user_id, target).await
    }

    /// Toggles a follow on a user or playlist, returning the resulting state.
    pub async fn toggle_follow(&self, user_id: UserId, target: FollowTarget) -> Result<bool> {
        self.relations.toggle_follow(user_id, target).await
    }

    /// Appends a song to an album or playlist, returning its position.
    pub async fn add_song(
        &self,
        actor: UserId,
        container: ContainerRef,
        song_id: SongId,
    ) -> Result<usize> {
        self.tracklists.add_song(actor, container, song_id).await
    }

    /// Removes one container entry and closes the gap it leaves.
    pub async fn remove_song(
        &self,
        actor: UserId,
        container: ContainerRef,
        selector: SongSelector,
    ) -> Result<()> {
        self.tracklists.remove_song(actor, container, selector).await
    }

    /// Moves container entries to the given positions, all or nothing.
    pub async fn reorder(
        &self,
        actor: UserId,
        container: ContainerRef,
        assignments: Vec<PositionAssignment>,
    ) -> Result<()> {
        self.tracklists.reorder(actor, container, assignments).await
    }

    /// Records a play in the user's history and bumps the song's counter.
    pub async fn record_play(&self, user_id: UserId, song_id: SongId) -> Result<()> {
        self.history.record_play(user_id, song_id).await
    }

    /// Replaces the user's queue wholesale.
    pub async fn replace_queue(&self, user_id: UserId, song_ids: Vec<SongId>) -> Result<()> {
        self.history.replace_queue(user_id, song_ids).await
    }

    /// Deletes an entity and repairs every record referring to it.
    pub async fn delete_entity(&self, actor: UserId, entity: EntityRef) -> Result<()> {
        self.catalog.delete_entity(actor, entity).await
    }

    /// Creates a user with a unique username and email.
    pub async fn create_user(&self, new_user: NewUser) -> Result<User> {
        self.catalog.create_user(new_user).await
    }

    /// Creates a song, optionally straight onto one of the artist's albums.
    pub async fn create_song(&self, actor: UserId, new_song: NewSong) -> Result<Song> {
        self.catalog.create_song(actor, new_song).await
    }

    /// Creates an empty album.
    pub async fn create_album(&self, actor: UserId, new_album: NewAlbum) -> Result<Album> {
        self.catalog.create_album(actor, new_album).await
    }

    /// Creates an empty playlist owned by a user.
    pub async fn create_playlist(
        &self,
        actor: UserId,
        new_playlist: NewPlaylist,
    ) -> Result<Playlist> {
        self.catalog.create_playlist(actor, new_playlist).await
    }

    /// Applies a partial update to a user's profile.
    pub async fn update_profile(
        &self,
        actor: UserId,
        user_id: UserId,
        update: UpdatedUser,
    ) -> Result<User> {
        self.catalog.update_profile(actor, user_id, update).await
    }

    /// Applies a partial update to a song's metadata.
    pub async fn update_song(
        &self,
        actor: UserId,
        song_id: SongId,
        update: UpdatedSong,
    ) -> Result<Song> {
        self.catalog.update_song(actor, song_id, update).await
    }

    /// Applies a partial update to an album's metadata.
    pub async fn update_album(
        &self,
        actor: UserId,
        album_id: AlbumId,
        update: UpdatedAlbum,
    ) -> Result<Album> {
        self.catalog.update_album(actor, album_id, update).await
    }

    /// Applies a partial update to a playlist's metadata.
    pub async fn update_playlist(
        &self,
        actor: UserId,
        playlist_id: PlaylistId,
        update: UpdatedPlaylist,
    ) -> Result<Playlist> {
        self.catalog.update_playlist(actor, playlist_id, update).await
    }

    /// Returns the user's preferences, creating them on first access.
    pub async fn ensure_preferences(&self, user_id: UserId) -> Result<UserPreferences> {
        self.history.ensure_preferences(user_id).await
    }

    /// Merges a partial settings update into the user's preferences.
    pub async fn update_settings(
        &self,
        user_id: UserId,
        update: UpdatedSettings,
    ) -> Result<UserPreferences> {
        self.history.update_settings(user_id, update).await
    }

    /// Puts the user's settings back to their defaults.
    pub async fn reset_settings(&self, user_id: UserId) -> Result<UserPreferences> {
        self.history.reset_settings(user_id).await
    }

    /// A user by id.
    pub async fn user(&self, id: UserId) -> Result<User> {
        self.context.user(id).await
    }

    /// A user by their unique username.
    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.catalog.user_by_username(username).await
    }

    /// A song by id.
    pub async fn song(&self, id: SongId) -> Result<Song> {
        self.context.song(id).await
    }

    /// An album by id.
    pub async fn album(&self, id: AlbumId) -> Result<Album> {
        self.context.album(id).await
    }

    /// A playlist by id.
    pub async fn playlist(&self, id: PlaylistId) -> Result<Playlist> {
        self.context.playlist(id).await
    }

    /// A user's preferences record.
    pub async fn preferences(&self, user_id: UserId) -> Result<UserPreferences> {
        self.context.preferences(user_id).await
    }

    /// An album's tracks in order.
    pub async fn album_tracks(&self, album_id: AlbumId) -> Result<Vec<Song>> {
        self.tracklists.album_tracks(album_id).await
    }

    /// A playlist's tracks in order.
    pub async fn playlist_tracks(&self, playlist_id: PlaylistId) -> Result<Vec<Song>> {
        self.tracklists.playlist_tracks(playlist_id).await
    }

    /// The songs a user likes.
    pub async fn liked_songs(&self, user_id: UserId) -> Result<Vec<Song>> {
        self.relations.liked_songs(user_id).await
    }

    /// The albums a user likes.
    pub async fn liked_albums(&self, user_id: UserId) -> Result<Vec<Album>> {
        self.relations.liked_albums(user_id).await
    }

    /// The playlists a user follows.
    pub async fn followed_playlists(&self, user_id: UserId) -> Result<Vec<Playlist>> {
        self.relations.followed_playlists(user_id).await
    }

    /// The users following a user.
    pub async fn followers(&self, user_id: UserId) -> Result<Vec<User>> {
        self.relations.followers(user_id).await
    }

    /// The users a user follows.
    pub async fn following(&self, user_id: UserId) -> Result<Vec<User>> {
        self.relations.following(user_id).await
    }

    /// The user's recently played songs, newest first.
    pub async fn recently_played(&self, user_id: UserId) -> Result<Vec<Song>> {
        self.history.recently_played(user_id).await
    }

    /// The user's queue in order.
    pub async fn queue(&self, user_id: UserId) -> Result<Vec<Song>> {
        self.history.queue(user_id).await
    }

    /// Case-insensitive title search over songs, albums, and public
    /// playlists.
    pub async fn search(&self, query: &str) -> Result<SearchResults> {
        self.catalog.search(query).await
    }

    /// The most played songs, descending, capped at `limit`.
    pub async fn most_played(&self, limit: usize) -> Result<Vec<Song>> {
        self.catalog.most_played(limit).await
    }
}

impl<S> GraphContext<S>
where
    S: EntityStore,
{
    /// Starts a transaction by locking the given keys.
    pub(crate) async fn begin(&self, keys: Vec<LockKey>) -> Result<Txn<S>> {
        Txn::begin(self, keys).await
    }

    /// Reads the committed record at `key` without taking a lock.
    pub async fn fetch(&self, key: RecordKey) -> Result<Option<Record>> {
        Ok(self.store.get(key).await?)
    }

    pub async fn user(&self, id: UserId) -> Result<User> {
        let key = RecordKey::new(EntityKind::User, id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_user)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_user(&self, id: UserId) -> Result<Option<User>> {
        let key = RecordKey::new(EntityKind::User, id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_user))
    }

    pub async fn song(&self, id: SongId) -> Result<Song> {
        let key = RecordKey::new(EntityKind::Song, id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_song)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_song(&self, id: SongId) -> Result<Option<Song>> {
        let key = RecordKey::new(EntityKind::Song, id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_song))
    }

    pub async fn album(&self, id: AlbumId) -> Result<Album> {
        let key = RecordKey::new(EntityKind::Album, id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_album)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_album(&self, id: AlbumId) -> Result<Option<Album>> {
        let key = RecordKey::new(EntityKind::Album, id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_album))
    }

    pub async fn playlist(&self, id: PlaylistId) -> Result<Playlist> {
        let key = RecordKey::new(EntityKind::Playlist, id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_playlist)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_playlist(&self, id: PlaylistId) -> Result<Option<Playlist>> {
        let key = RecordKey::new(EntityKind::Playlist, id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_playlist))
    }

    pub async fn preferences(&self, user_id: UserId) -> Result<UserPreferences> {
        let key = RecordKey::new(EntityKind::Preferences, user_id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_preferences)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_preferences(&self, user_id: UserId) -> Result<Option<UserPreferences>> {
        let key = RecordKey::new(EntityKind::Preferences, user_id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_preferences))
    }
}

impl<S> Clone for GraphContext<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),

            store: self.store.clone(),
            locks: self.locks.clone(),

            event_sender: self.event_sender.clone(),
        }
    }
}

// Realistically, the context should always be created by the graph.
// However, in a test, this may not be possible.
#[cfg(test)]
impl<S> GraphContext<S>
where
    S: EntityStore,
{
    pub fn with_store(store: S, config: Config) -> Self {
        Self::with_shared_store(Arc::new(store), config)
    }

    pub fn with_shared_store(store: Arc<S>, config: Config) -> Self {
        let (event_sender, _) = unbounded();

        Self {
            config,

            store,
            locks: Arc::new(LockTable::new()),

            event_sender,
        }
    }
}

#[cfg(test)]
impl Default for GraphContext<MemoryStore> {
    fn default() -> Self {
        Self::with_store(MemoryStore::new(), Config::default())
    }
}
