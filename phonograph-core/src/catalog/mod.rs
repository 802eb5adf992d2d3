mod cascade;

use std::collections::BTreeSet;

use log::info;

use crate::entity::{
    Album, AlbumId, ContainerRef, EntityKind, EntityRef, NewAlbum, NewPlaylist, NewSong, NewUser,
    Playlist, PlaylistId, RecordKey, Role, Song, SongId, UpdatedAlbum, UpdatedPlaylist,
    UpdatedSong, UpdatedUser, User, UserId,
};
use crate::error::{GraphError, Result};
use crate::events::{GraphEvent, TracklistChange};
use crate::store::{EntityStore, LockKey};
use crate::GraphContext;

/// Creates, updates, and deletes the entities of the graph.
///
/// Deletions cascade: every record referring to the deleted one is repaired
/// in the same transaction, so a committed deletion leaves nothing dangling
/// and a failed one leaves everything untouched.
pub struct Catalog<S> {
    context: GraphContext<S>,
}

/// What a title search matched.
#[derive(Debug, Default)]
pub struct SearchResults {
    pub songs: Vec<Song>,
    pub albums: Vec<Album>,
    pub playlists: Vec<Playlist>,
}

impl<S> Catalog<S>
where
    S: EntityStore,
{
    pub fn new(context: &GraphContext<S>) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Creates a user. The username and email must be unique, which is
    /// checked under the user registry lock so racing creations serialize.
    pub async fn create_user(&self, new_user: NewUser) -> Result<User> {
        let mut txn = self
            .context
            .begin(vec![LockKey::Registry(EntityKind::User)])
            .await?;

        if self
            .context
            .store
            .user_id_by_username(&new_user.username)
            .await?
            .is_some()
        {
            return Err(GraphError::conflict(format!(
                "username {} is taken",
                new_user.username
            )));
        }

        if self
            .context
            .store
            .user_id_by_email(&new_user.email)
            .await?
            .is_some()
        {
            return Err(GraphError::conflict(format!(
                "email {} is taken",
                new_user.email
            )));
        }

        let user = User {
            id: UserId::new(),
            username: new_user.username,
            email: new_user.email,
            password_hash: new_user.password_hash,
            role: new_user.role,
            liked_songs: BTreeSet::new(),
            liked_albums: BTreeSet::new(),
            following: BTreeSet::new(),
            followers: BTreeSet::new(),
            following_playlists: BTreeSet::new(),
            playlists: Vec::new(),
        };

        txn.put(user.clone());
        txn.queue_event(GraphEvent::UserCreated { user_id: user.id });
        txn.commit().await?;

        info!("User {} was created", user.username);

        Ok(user)
    }

    /// Creates a song, optionally placing it at the end of one of the
    /// artist's albums.
    pub async fn create_song(&self, actor: UserId, new_song: NewSong) -> Result<Song> {
        // The new song will reference the artist, so their record is
        // locked against a concurrent deletion cascade
        let mut keys = vec![LockKey::Record(RecordKey::new(
            EntityKind::User,
            new_song.artist_id.value(),
        ))];

        if let Some(album_id) = new_song.album_id {
            keys.push(LockKey::Record(RecordKey::new(
                EntityKind::Album,
                album_id.value(),
            )));
        }

        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;
        authorize_creation(&actor_user, new_song.artist_id, "songs")?;
        txn.user(new_song.artist_id).await?;

        let mut song = Song {
            id: SongId::new(),
            artist_id: new_song.artist_id,
            album_id: None,
            title: new_song.title,
            duration_seconds: new_song.duration_seconds,
            file_ref: new_song.file_ref,
            play_count: 0,
            liked_by: BTreeSet::new(),
        };

        if let Some(album_id) = new_song.album_id {
            let mut album = txn.album(album_id).await?;

            if album.artist_id != song.artist_id {
                return Err(GraphError::unauthorized(
                    "the album belongs to another artist",
                ));
            }

            album.songs.push(song.id);
            song.album_id = Some(album_id);

            txn.queue_event(GraphEvent::TracklistChanged {
                container: ContainerRef::Album(album_id),
                change: TracklistChange::Added {
                    song_id: song.id,
                    position: album.songs.len() - 1,
                },
            });
            txn.put(album);
        }

        txn.put(song.clone());
        txn.queue_event(GraphEvent::SongCreated {
            song_id: song.id,
            artist_id: song.artist_id,
        });
        txn.commit().await?;

        info!("Song {} was created", song.title);

        Ok(song)
    }

    /// Creates an empty album for an artist.
    pub async fn create_album(&self, actor: UserId, new_album: NewAlbum) -> Result<Album> {
        let keys = vec![LockKey::Record(RecordKey::new(
            EntityKind::User,
            new_album.artist_id.value(),
        ))];
        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;
        authorize_creation(&actor_user, new_album.artist_id, "albums")?;
        txn.user(new_album.artist_id).await?;

        let album = Album {
            id: AlbumId::new(),
            artist_id: new_album.artist_id,
            title: new_album.title,
            songs: Vec::new(),
            liked_by: BTreeSet::new(),
        };

        txn.put(album.clone());
        txn.queue_event(GraphEvent::AlbumCreated {
            album_id: album.id,
            artist_id: album.artist_id,
        });
        txn.commit().await?;

        info!("Album {} was created", album.title);

        Ok(album)
    }

    /// Creates an empty playlist and appends it to the owner's list.
    pub async fn create_playlist(
        &self,
        actor: UserId,
        new_playlist: NewPlaylist,
    ) -> Result<Playlist> {
        let keys = vec![LockKey::Record(RecordKey::new(
            EntityKind::User,
            new_playlist.owner_id.value(),
        ))];
        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;

        if actor_user.role != Role::Admin && new_playlist.owner_id != actor {
            return Err(GraphError::unauthorized(
                "users can only create their own playlists",
            ));
        }

        let mut owner = txn.user(new_playlist.owner_id).await?;

        let playlist = Playlist {
            id: PlaylistId::new(),
            owner_id: new_playlist.owner_id,
            title: new_playlist.title,
            is_public: new_playlist.is_public,
            songs: Vec::new(),
            followed_by: BTreeSet::new(),
        };

        owner.playlists.push(playlist.id);

        txn.put(owner);
        txn.put(playlist.clone());
        txn.queue_event(GraphEvent::PlaylistCreated {
            playlist_id: playlist.id,
            owner_id: playlist.owner_id,
        });
        txn.commit().await?;

        info!("Playlist {} was created", playlist.title);

        Ok(playlist)
    }

    /// Applies a partial profile update, re-checking uniqueness on renames.
    pub async fn update_profile(
        &self,
        actor: UserId,
        user_id: UserId,
        update: UpdatedUser,
    ) -> Result<User> {
        let mut keys = vec![LockKey::Record(RecordKey::new(
            EntityKind::User,
            user_id.value(),
        ))];

        if update.username.is_some() || update.email.is_some() {
            keys.push(LockKey::Registry(EntityKind::User));
        }

        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;

        if actor_user.role != Role::Admin && actor != user_id {
            return Err(GraphError::unauthorized(
                "users can only update their own profile",
            ));
        }

        let mut user = txn.user(user_id).await?;

        if let Some(username) = update.username {
            let taken = self
                .context
                .store
                .user_id_by_username(&username)
                .await?
                .is_some_and(|existing| existing != user_id.value());

            if taken {
                return Err(GraphError::conflict(format!("username {} is taken", username)));
            }

            user.username = username;
        }

        if let Some(email) = update.email {
            let taken = self
                .context
                .store
                .user_id_by_email(&email)
                .await?
                .is_some_and(|existing| existing != user_id.value());

            if taken {
                return Err(GraphError::conflict(format!("email {} is taken", email)));
            }

            user.email = email;
        }

        txn.put(user.clone());
        txn.commit().await?;

        Ok(user)
    }

    /// Applies a partial update to a song's metadata.
    pub async fn update_song(
        &self,
        actor: UserId,
        song_id: SongId,
        update: UpdatedSong,
    ) -> Result<Song> {
        let keys = vec![LockKey::Record(RecordKey::new(
            EntityKind::Song,
            song_id.value(),
        ))];
        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;
        let mut song = txn.song(song_id).await?;

        if actor_user.role != Role::Admin && song.artist_id != actor {
            return Err(GraphError::unauthorized("only the song's artist can update it"));
        }

        if let Some(title) = update.title {
            song.title = title;
        }
        if let Some(duration_seconds) = update.duration_seconds {
            song.duration_seconds = duration_seconds;
        }
        if let Some(file_ref) = update.file_ref {
            song.file_ref = file_ref;
        }

        txn.put(song.clone());
        txn.commit().await?;

        Ok(song)
    }

    /// Applies a partial update to an album's metadata.
    pub async fn update_album(
        &self,
        actor: UserId,
        album_id: AlbumId,
        update: UpdatedAlbum,
    ) -> Result<Album> {
        let keys = vec![LockKey::Record(RecordKey::new(
            EntityKind::Album,
            album_id.value(),
        ))];
        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;
        let mut album = txn.album(album_id).await?;

        if actor_user.role != Role::Admin && album.artist_id != actor {
            return Err(GraphError::unauthorized(
                "only the album's artist can update it",
            ));
        }

        if let Some(title) = update.title {
            album.title = title;
        }

        txn.put(album.clone());
        txn.commit().await?;

        Ok(album)
    }

    /// Applies a partial update to a playlist's metadata.
    pub async fn update_playlist(
        &self,
        actor: UserId,
        playlist_id: PlaylistId,
        update: UpdatedPlaylist,
    ) -> Result<Playlist> {
        let keys = vec![LockKey::Record(RecordKey::new(
            EntityKind::Playlist,
            playlist_id.value(),
        ))];
        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;
        let mut playlist = txn.playlist(playlist_id).await?;

        if actor_user.role != Role::Admin && playlist.owner_id != actor {
            return Err(GraphError::unauthorized(
                "only the playlist's owner can update it",
            ));
        }

        if let Some(title) = update.title {
            playlist.title = title;
        }
        if let Some(is_public) = update.is_public {
            playlist.is_public = is_public;
        }

        txn.put(playlist.clone());
        txn.commit().await?;

        Ok(playlist)
    }

    /// Deletes an entity and repairs everything that referred to it, as one
    /// unit. The referrer set is discovered from a snapshot scan, locked,
    /// and re-verified under the locks; if references appeared in between,
    /// the scan is retried with the larger set.
    pub async fn delete_entity(&self, actor: UserId, entity: EntityRef) -> Result<()> {
        match entity {
            EntityRef::Song(id) => self.delete_song(actor, id).await,
            EntityRef::Album(id) => self.delete_album(actor, id).await,
            EntityRef::Playlist(id) => self.delete_playlist(actor, id).await,
            EntityRef::User(id) => self.delete_user(actor, id).await,
        }?;

        info!("{} was deleted", entity);

        Ok(())
    }

    async fn delete_song(&self, actor: UserId, song_id: SongId) -> Result<()> {
        let mut attempts = 0;

        loop {
            let song = self.context.song(song_id).await?;
            let keys = cascade::discover_song(&self.context, &song)
                .await?
                .lock_keys(song_id);

            let mut txn = self.context.begin(keys.clone()).await?;

            let actor_user = txn.user(actor).await?;
            let song = match txn.try_song(song_id).await? {
                Some(song) => song,
                None => {
                    return Err(GraphError::not_found(RecordKey::new(
                        EntityKind::Song,
                        song_id.value(),
                    )))
                }
            };

            if actor_user.role != Role::Admin && song.artist_id != actor {
                return Err(GraphError::unauthorized("only the song's artist can delete it"));
            }

            let fresh = cascade::discover_song(&self.context, &song).await?;

            if !cascade::covers(&keys, &fresh.lock_keys(song_id)) {
                attempts += 1;

                if attempts > self.context.config.cascade_retries {
                    return Err(GraphError::retryable_conflict(
                        "new references kept appearing during the deletion",
                    ));
                }

                continue;
            }

            cascade::repair_song(&mut txn, song_id, &fresh).await?;
            txn.queue_event(GraphEvent::EntityDeleted {
                entity: EntityRef::Song(song_id),
            });

            return txn.commit().await;
        }
    }

    async fn delete_album(&self, actor: UserId, album_id: AlbumId) -> Result<()> {
        let mut attempts = 0;

        loop {
            let album = self.context.album(album_id).await?;
            let keys = cascade::discover_album(&album).lock_keys(album_id);

            let mut txn = self.context.begin(keys.clone()).await?;

            let actor_user = txn.user(actor).await?;
            let album = match txn.try_album(album_id).await? {
                Some(album) => album,
                None => {
                    return Err(GraphError::not_found(RecordKey::new(
                        EntityKind::Album,
                        album_id.value(),
                    )))
                }
            };

            if actor_user.role != Role::Admin && album.artist_id != actor {
                return Err(GraphError::unauthorized(
                    "only the album's artist can delete it",
                ));
            }

            let fresh = cascade::discover_album(&album);

            if !cascade::covers(&keys, &fresh.lock_keys(album_id)) {
                attempts += 1;

                if attempts > self.context.config.cascade_retries {
                    return Err(GraphError::retryable_conflict(
                        "new references kept appearing during the deletion",
                    ));
                }

                continue;
            }

            cascade::repair_album(&mut txn, album_id, &fresh).await?;
            txn.queue_event(GraphEvent::EntityDeleted {
                entity: EntityRef::Album(album_id),
            });

            return txn.commit().await;
        }
    }

    async fn delete_playlist(&self, actor: UserId, playlist_id: PlaylistId) -> Result<()> {
        let mut attempts = 0;

        loop {
            let playlist = self.context.playlist(playlist_id).await?;
            let keys = cascade::discover_playlist(&playlist).lock_keys(playlist_id);

            let mut txn = self.context.begin(keys.clone()).await?;

            let actor_user = txn.user(actor).await?;
            let playlist = match txn.try_playlist(playlist_id).await? {
                Some(playlist) => playlist,
                None => {
                    return Err(GraphError::not_found(RecordKey::new(
                        EntityKind::Playlist,
                        playlist_id.value(),
                    )))
                }
            };

            if actor_user.role != Role::Admin && playlist.owner_id != actor {
                return Err(GraphError::unauthorized(
                    "only the playlist's owner can delete it",
                ));
            }

            let fresh = cascade::discover_playlist(&playlist);

            if !cascade::covers(&keys, &fresh.lock_keys(playlist_id)) {
                attempts += 1;

                if attempts > self.context.config.cascade_retries {
                    return Err(GraphError::retryable_conflict(
                        "new references kept appearing during the deletion",
                    ));
                }

                continue;
            }

            cascade::repair_playlist(&mut txn, playlist_id, &fresh).await?;
            txn.queue_event(GraphEvent::EntityDeleted {
                entity: EntityRef::Playlist(playlist_id),
            });

            return txn.commit().await;
        }
    }

    async fn delete_user(&self, actor: UserId, user_id: UserId) -> Result<()> {
        let mut attempts = 0;

        loop {
            let user = self.context.user(user_id).await?;
            let keys = cascade::discover_user(&self.context, &user)
                .await?
                .lock_keys(user_id);

            let mut txn = self.context.begin(keys.clone()).await?;

            let actor_user = txn.user(actor).await?;

            if actor_user.role != Role::Admin && actor != user_id {
                return Err(GraphError::unauthorized(
                    "users can only delete their own account",
                ));
            }

            let user = match txn.try_user(user_id).await? {
                Some(user) => user,
                None => {
                    return Err(GraphError::not_found(RecordKey::new(
                        EntityKind::User,
                        user_id.value(),
                    )))
                }
            };

            let fresh = cascade::discover_user(&self.context, &user).await?;

            if !cascade::covers(&keys, &fresh.lock_keys(user_id)) {
                attempts += 1;

                if attempts > self.context.config.cascade_retries {
                    return Err(GraphError::retryable_conflict(
                        "new references kept appearing during the deletion",
                    ));
                }

                continue;
            }

            cascade::repair_user(&mut txn, user_id, &fresh).await?;
            txn.queue_event(GraphEvent::EntityDeleted {
                entity: EntityRef::User(user_id),
            });

            return txn.commit().await;
        }
    }

    /// Looks a user up by their unique username.
    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        match self.context.store.user_id_by_username(username).await? {
            Some(id) => self.context.try_user(UserId::from_value(id)).await,
            None => Ok(None),
        }
    }

    /// Case-insensitive substring search over song, album, and playlist
    /// titles. Private playlists stay hidden.
    pub async fn search(&self, query: &str) -> Result<SearchResults> {
        let needle = query.to_lowercase();
        let mut results = SearchResults::default();

        for id in self.context.store.list(EntityKind::Song).await? {
            if let Some(song) = self.context.try_song(SongId::from_value(id)).await? {
                if song.title.to_lowercase().contains(&needle) {
                    results.songs.push(song);
                }
            }
        }

        for id in self.context.store.list(EntityKind::Album).await? {
            if let Some(album) = self.context.try_album(AlbumId::from_value(id)).await? {
                if album.title.to_lowercase().contains(&needle) {
                    results.albums.push(album);
                }
            }
        }

        for id in self.context.store.list(EntityKind::Playlist).await? {
            if let Some(playlist) = self.context.try_playlist(PlaylistId::from_value(id)).await? {
                if playlist.is_public && playlist.title.to_lowercase().contains(&needle) {
                    results.playlists.push(playlist);
                }
            }
        }

        results.songs.sort_by(|a, b| a.title.cmp(&b.title));
        results.albums.sort_by(|a, b| a.title.cmp(&b.title));
        results.playlists.sort_by(|a, b| a.title.cmp(&b.title));

        Ok(results)
    }

    /// The most played songs, descending, capped at `limit`.
    pub async fn most_played(&self, limit: usize) -> Result<Vec<Song>> {
        let mut songs = Vec::new();

        for id in self.context.store.list(EntityKind::Song).await? {
            if let Some(song) = self.context.try_song(SongId::from_value(id)).await? {
                songs.push(song);
            }
        }

        songs.sort_by(|a, b| b.play_count.cmp(&a.play_count));
        songs.truncate(limit);

        Ok(songs)
    }
}

fn authorize_creation(actor: &User, artist_id: UserId, what: &str) -> Result<()> {
    if actor.role == Role::Admin {
        return Ok(());
    }

    if actor.role != Role::Artist {
        return Err(GraphError::unauthorized(format!(
            "only artists can create {}",
            what
        )));
    }

    if artist_id != actor.id {
        return Err(GraphError::unauthorized(format!(
            "artists can only create their own {}",
            what
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entity::{PlayEntry, Record, UserPreferences};
    use crate::store::{MemoryStore, StoreResult, WriteOp};
    use crate::{Config, History};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;
    use uuid::Uuid;

    fn context() -> GraphContext<MemoryStore> {
        GraphContext::with_store(MemoryStore::new(), Config::default())
    }

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password_hash: "hash".to_string(),
            role: Role::Listener,
        }
    }

    /// Delegates to a memory store. Once armed, the next batch parks just
    /// before it lands, until the test resumes it.
    struct PausingStore {
        inner: MemoryStore,
        armed: AtomicBool,
        parked: Notify,
        resumed: Notify,
    }

    impl PausingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                armed: AtomicBool::new(false),
                parked: Notify::new(),
                resumed: Notify::new(),
            }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        async fn until_parked(&self) {
            self.parked.notified().await;
        }

        fn resume(&self) {
            self.resumed.notify_one();
        }
    }

    #[async_trait]
    impl EntityStore for PausingStore {
        async fn get(&self, key: RecordKey) -> StoreResult<Option<Record>> {
            self.inner.get(key).await
        }

        async fn put(&self, record: Record) -> StoreResult<()> {
            self.inner.put(record).await
        }

        async fn delete(&self, key: RecordKey) -> StoreResult<bool> {
            self.inner.delete(key).await
        }

        async fn list(&self, kind: EntityKind) -> StoreResult<Vec<Uuid>> {
            self.inner.list(kind).await
        }

        async fn user_id_by_username(&self, username: &str) -> StoreResult<Option<Uuid>> {
            self.inner.user_id_by_username(username).await
        }

        async fn user_id_by_email(&self, email: &str) -> StoreResult<Option<Uuid>> {
            self.inner.user_id_by_email(email).await
        }

        async fn apply(&self, batch: Vec<WriteOp>) -> StoreResult<()> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.resumed.notified().await;
            }

            self.inner.apply(batch).await
        }
    }

    #[tokio::test]
    async fn usernames_and_emails_are_unique() {
        let context = context();
        let catalog = Catalog::new(&context);

        catalog.create_user(new_user("john")).await.unwrap();

        let result = catalog.create_user(new_user("john")).await;
        assert!(matches!(result, Err(GraphError::Conflict { .. })));

        let mut clashing_email = new_user("lucy");
        clashing_email.email = "john@example.com".to_string();

        let result = catalog.create_user(clashing_email).await;
        assert!(matches!(result, Err(GraphError::Conflict { .. })));
    }

    #[tokio::test]
    async fn only_artists_create_songs() {
        let context = context();
        let catalog = Catalog::new(&context);

        let listener = User::mock("john");
        context.store.put(listener.clone().into()).await.unwrap();

        let result = catalog
            .create_song(
                listener.id,
                NewSong {
                    artist_id: listener.id,
                    title: "strawberries".to_string(),
                    duration_seconds: 180,
                    file_ref: "audio/strawberries.ogg".to_string(),
                    album_id: None,
                },
            )
            .await;

        assert!(matches!(result, Err(GraphError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn songs_can_be_created_onto_an_album() {
        let context = context();
        let catalog = Catalog::new(&context);

        let artist = User::mock_artist("nora");
        let album = Album::mock(artist.id, "Holograms");
        context.store.put(artist.clone().into()).await.unwrap();
        context.store.put(album.clone().into()).await.unwrap();

        let song = catalog
            .create_song(
                artist.id,
                NewSong {
                    artist_id: artist.id,
                    title: "strawberries".to_string(),
                    duration_seconds: 180,
                    file_ref: "audio/strawberries.ogg".to_string(),
                    album_id: Some(album.id),
                },
            )
            .await
            .unwrap();

        assert_eq!(song.album_id, Some(album.id));

        let stored_album = context.album(album.id).await.unwrap();
        assert_eq!(stored_album.songs, vec![song.id]);
    }

    #[tokio::test]
    async fn playlists_append_to_the_owner_list() {
        let context = context();
        let catalog = Catalog::new(&context);

        let user = User::mock("john");
        context.store.put(user.clone().into()).await.unwrap();

        let playlist = catalog
            .create_playlist(
                user.id,
                NewPlaylist {
                    owner_id: user.id,
                    title: "Morning".to_string(),
                    is_public: true,
                },
            )
            .await
            .unwrap();

        let stored_user = context.user(user.id).await.unwrap();
        assert_eq!(stored_user.playlists, vec![playlist.id]);
    }

    #[tokio::test]
    async fn creations_wait_on_the_artist_record() {
        let config = Config {
            lock_timeout: std::time::Duration::from_millis(20),
            ..Config::default()
        };
        let context = GraphContext::with_store(MemoryStore::new(), config);
        let catalog = Catalog::new(&context);

        let artist = User::mock_artist("nora");
        context.store.put(artist.clone().into()).await.unwrap();

        let key = RecordKey::new(EntityKind::User, artist.id.value());
        let held = context.begin(vec![LockKey::Record(key)]).await.unwrap();

        let result = catalog
            .create_song(
                artist.id,
                NewSong {
                    artist_id: artist.id,
                    title: "strawberries".to_string(),
                    duration_seconds: 180,
                    file_ref: "audio/strawberries.ogg".to_string(),
                    album_id: None,
                },
            )
            .await;
        assert!(
            matches!(result, Err(GraphError::Timeout(LockKey::Record(k))) if k == key),
            "song creation takes the artist's record lock"
        );

        let result = catalog
            .create_album(
                artist.id,
                NewAlbum {
                    artist_id: artist.id,
                    title: "Holograms".to_string(),
                },
            )
            .await;
        assert!(
            matches!(result, Err(GraphError::Timeout(LockKey::Record(k))) if k == key),
            "album creation takes the artist's record lock"
        );

        drop(held);
    }

    #[tokio::test]
    async fn renames_recheck_uniqueness() {
        let context = context();
        let catalog = Catalog::new(&context);

        let john = catalog.create_user(new_user("john")).await.unwrap();
        catalog.create_user(new_user("lucy")).await.unwrap();

        let result = catalog
            .update_profile(
                john.id,
                john.id,
                UpdatedUser {
                    username: Some("lucy".to_string()),
                    ..UpdatedUser::default()
                },
            )
            .await;
        assert!(matches!(result, Err(GraphError::Conflict { .. })));

        let renamed = catalog
            .update_profile(
                john.id,
                john.id,
                UpdatedUser {
                    username: Some("johnny".to_string()),
                    ..UpdatedUser::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.username, "johnny");

        // Renaming to your own current name is not a conflict
        catalog
            .update_profile(
                john.id,
                john.id,
                UpdatedUser {
                    username: Some("johnny".to_string()),
                    ..UpdatedUser::default()
                },
            )
            .await
            .expect("a no-op rename passes the uniqueness check");
    }

    #[tokio::test]
    async fn metadata_updates_require_ownership() {
        let context = context();
        let catalog = Catalog::new(&context);

        let artist = User::mock_artist("nora");
        let song = Song::mock(artist.id, "strawberries");
        let stranger = User::mock("eve");

        context.store.put(artist.clone().into()).await.unwrap();
        context.store.put(song.clone().into()).await.unwrap();
        context.store.put(stranger.clone().into()).await.unwrap();

        let result = catalog
            .update_song(
                stranger.id,
                song.id,
                UpdatedSong {
                    title: Some("stolen".to_string()),
                    ..UpdatedSong::default()
                },
            )
            .await;
        assert!(matches!(result, Err(GraphError::Unauthorized { .. })));

        let updated = catalog
            .update_song(
                artist.id,
                song.id,
                UpdatedSong {
                    title: Some("Strawberries".to_string()),
                    duration_seconds: Some(200),
                    ..UpdatedSong::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Strawberries");
        assert_eq!(updated.duration_seconds, 200);
        assert_eq!(updated.file_ref, song.file_ref, "unmentioned fields survive");
    }

    #[tokio::test]
    async fn song_deletion_repairs_every_referrer() {
        let context = context();
        let catalog = Catalog::new(&context);

        let artist = User::mock_artist("nora");
        let mut john = User::mock("john");
        let mut lucy = User::mock("lucy");

        let mut song = Song::mock(artist.id, "strawberries");
        let other = Song::mock(artist.id, "daybreak");
        let mut album = Album::mock(artist.id, "Holograms");
        let mut playlist = Playlist::mock(john.id, "Loops");

        // The song sits on an album, twice in a playlist, is liked by two
        // users, and fills a listener's history and queue
        album.songs = vec![song.id, other.id];
        song.album_id = Some(album.id);
        playlist.songs = vec![song.id, other.id, song.id];
        song.liked_by = BTreeSet::from([john.id, lucy.id]);
        john.liked_songs.insert(song.id);
        lucy.liked_songs.insert(song.id);

        let mut preferences = UserPreferences::new(john.id);
        preferences.recently_played.push(PlayEntry {
            song_id: song.id,
            played_at: Utc::now(),
        });
        preferences.queue = vec![song.id, other.id];

        context.store.put(artist.clone().into()).await.unwrap();
        context.store.put(john.clone().into()).await.unwrap();
        context.store.put(lucy.clone().into()).await.unwrap();
        context.store.put(song.clone().into()).await.unwrap();
        context.store.put(other.clone().into()).await.unwrap();
        context.store.put(album.clone().into()).await.unwrap();
        context.store.put(playlist.clone().into()).await.unwrap();
        context.store.put(preferences.clone().into()).await.unwrap();

        catalog
            .delete_entity(artist.id, EntityRef::Song(song.id))
            .await
            .unwrap();

        assert!(context.try_song(song.id).await.unwrap().is_none());

        let album = context.album(album.id).await.unwrap();
        assert_eq!(album.songs, vec![other.id], "the track list is repacked");

        let playlist = context.playlist(playlist.id).await.unwrap();
        assert_eq!(playlist.songs, vec![other.id], "both occurrences are gone");

        let john = context.user(john.id).await.unwrap();
        let lucy = context.user(lucy.id).await.unwrap();
        assert!(john.liked_songs.is_empty());
        assert!(lucy.liked_songs.is_empty());

        let preferences = context.preferences(john.id).await.unwrap();
        assert!(preferences.recently_played.is_empty());
        assert_eq!(preferences.queue, vec![other.id]);
    }

    #[tokio::test]
    async fn album_deletion_keeps_its_songs() {
        let context = context();
        let catalog = Catalog::new(&context);

        let artist = User::mock_artist("nora");
        let mut john = User::mock("john");
        let mut song = Song::mock(artist.id, "strawberries");
        let mut album = Album::mock(artist.id, "Holograms");

        album.songs = vec![song.id];
        song.album_id = Some(album.id);
        album.liked_by.insert(john.id);
        john.liked_albums.insert(album.id);

        context.store.put(artist.clone().into()).await.unwrap();
        context.store.put(john.clone().into()).await.unwrap();
        context.store.put(song.clone().into()).await.unwrap();
        context.store.put(album.clone().into()).await.unwrap();

        catalog
            .delete_entity(artist.id, EntityRef::Album(album.id))
            .await
            .unwrap();

        assert!(context.try_album(album.id).await.unwrap().is_none());

        let song = context.song(song.id).await.unwrap();
        assert_eq!(song.album_id, None, "the song survives, detached");

        let john = context.user(john.id).await.unwrap();
        assert!(john.liked_albums.is_empty());
    }

    #[tokio::test]
    async fn playlist_deletion_cleans_followers_and_owner() {
        let context = context();
        let catalog = Catalog::new(&context);

        let mut owner = User::mock("john");
        let mut follower = User::mock("lucy");
        let mut playlist = Playlist::mock(owner.id, "Morning");

        owner.playlists = vec![playlist.id];
        playlist.followed_by.insert(follower.id);
        follower.following_playlists.insert(playlist.id);

        context.store.put(owner.clone().into()).await.unwrap();
        context.store.put(follower.clone().into()).await.unwrap();
        context.store.put(playlist.clone().into()).await.unwrap();

        catalog
            .delete_entity(owner.id, EntityRef::Playlist(playlist.id))
            .await
            .unwrap();

        assert!(context.try_playlist(playlist.id).await.unwrap().is_none());

        let owner = context.user(owner.id).await.unwrap();
        assert!(owner.playlists.is_empty());

        let follower = context.user(follower.id).await.unwrap();
        assert!(follower.following_playlists.is_empty());
    }

    #[tokio::test]
    async fn user_deletion_cascades_through_everything_they_own() {
        let context = context();
        let catalog = Catalog::new(&context);

        let mut artist = User::mock_artist("nora");
        let mut listener = User::mock("john");

        let mut song = Song::mock(artist.id, "strawberries");
        let mut album = Album::mock(artist.id, "Holograms");
        let mut playlist = Playlist::mock(artist.id, "Own mix");

        album.songs = vec![song.id];
        song.album_id = Some(album.id);
        artist.playlists = vec![playlist.id];

        // The listener is entangled with the artist in every direction
        song.liked_by.insert(listener.id);
        listener.liked_songs.insert(song.id);
        playlist.followed_by.insert(listener.id);
        listener.following_playlists.insert(playlist.id);
        artist.following.insert(listener.id);
        listener.followers.insert(artist.id);
        listener.following.insert(artist.id);
        artist.followers.insert(listener.id);

        let mut artist_preferences = UserPreferences::new(artist.id);
        artist_preferences.queue = vec![song.id];
        let mut listener_preferences = UserPreferences::new(listener.id);
        listener_preferences.queue = vec![song.id];

        context.store.put(artist.clone().into()).await.unwrap();
        context.store.put(listener.clone().into()).await.unwrap();
        context.store.put(song.clone().into()).await.unwrap();
        context.store.put(album.clone().into()).await.unwrap();
        context.store.put(playlist.clone().into()).await.unwrap();
        context
            .store
            .put(artist_preferences.clone().into())
            .await
            .unwrap();
        context
            .store
            .put(listener_preferences.clone().into())
            .await
            .unwrap();

        catalog
            .delete_entity(artist.id, EntityRef::User(artist.id))
            .await
            .unwrap();

        assert!(context.try_user(artist.id).await.unwrap().is_none());
        assert!(context.try_song(song.id).await.unwrap().is_none());
        assert!(context.try_album(album.id).await.unwrap().is_none());
        assert!(context.try_playlist(playlist.id).await.unwrap().is_none());
        assert!(
            context.try_preferences(artist.id).await.unwrap().is_none(),
            "the preferences record dies with the user"
        );

        let listener = context.user(listener.id).await.unwrap();
        assert!(listener.liked_songs.is_empty());
        assert!(listener.following_playlists.is_empty());
        assert!(listener.followers.is_empty());
        assert!(listener.following.is_empty());

        let listener_preferences = context.preferences(listener.id).await.unwrap();
        assert!(
            listener_preferences.queue.is_empty(),
            "the authored song is gone from other queues"
        );
    }

    #[tokio::test]
    async fn deletion_requires_ownership() {
        let context = context();
        let catalog = Catalog::new(&context);

        let artist = User::mock_artist("nora");
        let song = Song::mock(artist.id, "strawberries");
        let stranger = User::mock("eve");
        let mut admin = User::mock("root");
        admin.role = Role::Admin;

        context.store.put(artist.clone().into()).await.unwrap();
        context.store.put(song.clone().into()).await.unwrap();
        context.store.put(stranger.clone().into()).await.unwrap();
        context.store.put(admin.clone().into()).await.unwrap();

        let result = catalog
            .delete_entity(stranger.id, EntityRef::Song(song.id))
            .await;
        assert!(matches!(result, Err(GraphError::Unauthorized { .. })));

        catalog
            .delete_entity(admin.id, EntityRef::Song(song.id))
            .await
            .expect("admins can delete anything");
    }

    #[tokio::test]
    async fn a_queue_edit_racing_a_deletion_commits_nothing() {
        let store = Arc::new(PausingStore::new());
        let context = GraphContext::with_shared_store(store.clone(), Config::default());

        let artist = User::mock_artist("nora");
        let listener = User::mock("john");
        let song = Song::mock(artist.id, "strawberries");

        context.store.put(artist.clone().into()).await.unwrap();
        context.store.put(listener.clone().into()).await.unwrap();
        context.store.put(song.clone().into()).await.unwrap();
        context
            .store
            .put(UserPreferences::new(listener.id).into())
            .await
            .unwrap();

        // Hold the deletion's batch after its locks and referrer checks
        // are in place, but before anything lands
        store.arm();

        let deletion = {
            let catalog = Catalog::new(&context);
            let (artist_id, song_id) = (artist.id, song.id);

            tokio::spawn(async move {
                catalog
                    .delete_entity(artist_id, EntityRef::Song(song_id))
                    .await
            })
        };

        store.until_parked().await;

        // The song lock is still held, so the edit has to wait the
        // deletion out
        let edit = {
            let history = History::new(&context);
            let (listener_id, song_id) = (listener.id, song.id);

            tokio::spawn(async move { history.replace_queue(listener_id, vec![song_id]).await })
        };

        store.resume();

        deletion
            .await
            .expect("the deletion task finishes")
            .expect("the deletion commits");

        let result = edit.await.expect("the edit task finishes");
        assert!(
            matches!(result, Err(GraphError::NotFound(_))),
            "the edit finds the song already gone"
        );

        assert!(context.try_song(song.id).await.unwrap().is_none());

        let preferences = context.preferences(listener.id).await.unwrap();
        assert!(
            preferences.queue.is_empty(),
            "nothing references the dead song"
        );
    }

    #[tokio::test]
    async fn a_creation_racing_the_artist_deletion_commits_nothing() {
        let store = Arc::new(PausingStore::new());
        let context = GraphContext::with_shared_store(store.clone(), Config::default());

        let artist = User::mock_artist("nora");
        context.store.put(artist.clone().into()).await.unwrap();

        store.arm();

        let deletion = {
            let catalog = Catalog::new(&context);
            let artist_id = artist.id;

            tokio::spawn(async move {
                catalog
                    .delete_entity(artist_id, EntityRef::User(artist_id))
                    .await
            })
        };

        store.until_parked().await;

        let creation = {
            let catalog = Catalog::new(&context);
            let artist_id = artist.id;

            tokio::spawn(async move {
                catalog
                    .create_song(
                        artist_id,
                        NewSong {
                            artist_id,
                            title: "strawberries".to_string(),
                            duration_seconds: 180,
                            file_ref: "audio/strawberries.ogg".to_string(),
                            album_id: None,
                        },
                    )
                    .await
            })
        };

        store.resume();

        deletion
            .await
            .expect("the deletion task finishes")
            .expect("the deletion commits");

        let result = creation.await.expect("the creation task finishes");
        assert!(
            matches!(result, Err(GraphError::NotFound(_))),
            "the creation finds the artist already gone"
        );

        assert!(
            context.store.list(EntityKind::Song).await.unwrap().is_empty(),
            "no orphaned song landed"
        );
    }

    #[tokio::test]
    async fn search_matches_titles_and_hides_private_playlists() {
        let context = context();
        let catalog = Catalog::new(&context);

        let artist = User::mock_artist("nora");
        let song = Song::mock(artist.id, "Strawberry Fields");
        let album = Album::mock(artist.id, "Berry Season");
        let mut hidden = Playlist::mock(artist.id, "strawberry stash");
        hidden.is_public = false;
        let open = Playlist::mock(artist.id, "Strawberry Mix");

        context.store.put(artist.clone().into()).await.unwrap();
        context.store.put(song.clone().into()).await.unwrap();
        context.store.put(album.clone().into()).await.unwrap();
        context.store.put(hidden.clone().into()).await.unwrap();
        context.store.put(open.clone().into()).await.unwrap();

        let results = catalog.search("sTrAwBeRrY").await.unwrap();

        assert_eq!(results.songs.len(), 1);
        assert!(results.albums.is_empty());
        assert_eq!(results.playlists.len(), 1);
        assert_eq!(results.playlists[0].id, open.id);

        let results = catalog.search("berry").await.unwrap();
        assert_eq!(results.albums.len(), 1);
    }

    #[tokio::test]
    async fn most_played_orders_by_count() {
        let context = context();
        let catalog = Catalog::new(&context);

        let artist = User::mock_artist("nora");
        context.store.put(artist.clone().into()).await.unwrap();

        for (title, plays) in [("one", 3), ("two", 9), ("three", 6)] {
            let mut song = Song::mock(artist.id, title);
            song.play_count = plays;
            context.store.put(song.into()).await.unwrap();
        }

        let top = catalog.most_played(2).await.unwrap();
        let counts: Vec<_> = top.iter().map(|song| song.play_count).collect();

        assert_eq!(counts, vec![9, 6]);
    }
}
