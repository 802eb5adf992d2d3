use std::collections::HashSet;

use uuid::Uuid;

use crate::entity::{
    Album, AlbumId, EntityKind, Playlist, PlaylistId, RecordKey, Role, Song, SongId, User, UserId,
};
use crate::error::Result;
use crate::store::{EntityStore, LockKey};
use crate::txn::Txn;
use crate::GraphContext;

/// Everything that refers to a song.
pub(super) struct SongReferrers {
    pub album: Option<AlbumId>,
    pub likers: Vec<UserId>,
    pub playlists: Vec<PlaylistId>,
    pub preferences: Vec<UserId>,
}

/// Everything that refers to an album.
pub(super) struct AlbumReferrers {
    pub songs: Vec<SongId>,
    pub likers: Vec<UserId>,
}

/// Everything that refers to a playlist.
pub(super) struct PlaylistReferrers {
    pub owner: UserId,
    pub followers: Vec<UserId>,
}

/// Everything that refers to a user, including the full referrer sets of
/// the records that die with them.
pub(super) struct UserReferrers {
    pub owned_playlists: Vec<(PlaylistId, PlaylistReferrers)>,
    pub authored_songs: Vec<(SongId, SongReferrers)>,
    pub authored_albums: Vec<(AlbumId, AlbumReferrers)>,
    pub liked_songs: Vec<SongId>,
    pub liked_albums: Vec<AlbumId>,
    pub following_playlists: Vec<PlaylistId>,
    pub following: Vec<UserId>,
    pub followers: Vec<UserId>,
}

fn record(kind: EntityKind, id: Uuid) -> LockKey {
    LockKey::Record(RecordKey::new(kind, id))
}

impl SongReferrers {
    pub(super) fn lock_keys(&self, song_id: SongId) -> Vec<LockKey> {
        let mut keys = vec![record(EntityKind::Song, song_id.value())];

        if let Some(album_id) = self.album {
            keys.push(record(EntityKind::Album, album_id.value()));
        }

        keys.extend(
            self.likers
                .iter()
                .map(|id| record(EntityKind::User, id.value())),
        );
        keys.extend(
            self.playlists
                .iter()
                .map(|id| record(EntityKind::Playlist, id.value())),
        );
        keys.extend(
            self.preferences
                .iter()
                .map(|id| record(EntityKind::Preferences, id.value())),
        );

        keys
    }
}

impl AlbumReferrers {
    pub(super) fn lock_keys(&self, album_id: AlbumId) -> Vec<LockKey> {
        let mut keys = vec![record(EntityKind::Album, album_id.value())];

        keys.extend(
            self.songs
                .iter()
                .map(|id| record(EntityKind::Song, id.value())),
        );
        keys.extend(
            self.likers
                .iter()
                .map(|id| record(EntityKind::User, id.value())),
        );

        keys
    }
}

impl PlaylistReferrers {
    pub(super) fn lock_keys(&self, playlist_id: PlaylistId) -> Vec<LockKey> {
        let mut keys = vec![
            record(EntityKind::Playlist, playlist_id.value()),
            record(EntityKind::User, self.owner.value()),
        ];

        keys.extend(
            self.followers
                .iter()
                .map(|id| record(EntityKind::User, id.value())),
        );

        keys
    }
}

impl UserReferrers {
    pub(super) fn lock_keys(&self, user_id: UserId) -> Vec<LockKey> {
        let mut keys = vec![
            record(EntityKind::User, user_id.value()),
            // Always held, whether or not the record exists yet
            record(EntityKind::Preferences, user_id.value()),
        ];

        for (playlist_id, referrers) in &self.owned_playlists {
            keys.extend(referrers.lock_keys(*playlist_id));
        }
        for (song_id, referrers) in &self.authored_songs {
            keys.extend(referrers.lock_keys(*song_id));
        }
        for (album_id, referrers) in &self.authored_albums {
            keys.extend(referrers.lock_keys(*album_id));
        }

        keys.extend(
            self.liked_songs
                .iter()
                .map(|id| record(EntityKind::Song, id.value())),
        );
        keys.extend(
            self.liked_albums
                .iter()
                .map(|id| record(EntityKind::Album, id.value())),
        );
        keys.extend(
            self.following_playlists
                .iter()
                .map(|id| record(EntityKind::Playlist, id.value())),
        );
        keys.extend(
            self.following
                .iter()
                .map(|id| record(EntityKind::User, id.value())),
        );
        keys.extend(
            self.followers
                .iter()
                .map(|id| record(EntityKind::User, id.value())),
        );

        keys
    }
}

/// True when every needed key is already held.
pub(super) fn covers(held: &[LockKey], needed: &[LockKey]) -> bool {
    let held: HashSet<&LockKey> = held.iter().collect();
    needed.iter().all(|key| held.contains(key))
}

/// Finds the records referring to a song: its album and likers from the
/// record itself, playlist and preferences referrers by scanning, since
/// those hold no reverse edge.
pub(super) async fn discover_song<S: EntityStore>(
    context: &GraphContext<S>,
    song: &Song,
) -> Result<SongReferrers> {
    let mut referrers = SongReferrers {
        album: song.album_id,
        likers: song.liked_by.iter().copied().collect(),
        playlists: Vec::new(),
        preferences: Vec::new(),
    };

    for id in context.store.list(EntityKind::Playlist).await? {
        if let Some(playlist) = context.try_playlist(PlaylistId::from_value(id)).await? {
            if playlist.songs.contains(&song.id) {
                referrers.playlists.push(playlist.id);
            }
        }
    }

    for id in context.store.list(EntityKind::Preferences).await? {
        if let Some(preferences) = context.try_preferences(UserId::from_value(id)).await? {
            let in_history = preferences
                .recently_played
                .iter()
                .any(|entry| entry.song_id == song.id);

            if in_history || preferences.queue.contains(&song.id) {
                referrers.preferences.push(preferences.user_id);
            }
        }
    }

    Ok(referrers)
}

pub(super) fn discover_album(album: &Album) -> AlbumReferrers {
    AlbumReferrers {
        songs: album.songs.clone(),
        likers: album.liked_by.iter().copied().collect(),
    }
}

pub(super) fn discover_playlist(playlist: &Playlist) -> PlaylistReferrers {
    PlaylistReferrers {
        owner: playlist.owner_id,
        followers: playlist.followed_by.iter().copied().collect(),
    }
}

/// Finds everything a user's deletion touches. Authored songs and albums
/// are found by scanning the registries, and each carries its own referrer
/// set since it dies with the user.
pub(super) async fn discover_user<S: EntityStore>(
    context: &GraphContext<S>,
    user: &User,
) -> Result<UserReferrers> {
    let mut authored_songs = Vec::new();
    let mut authored_albums = Vec::new();

    if user.role == Role::Artist {
        for id in context.store.list(EntityKind::Song).await? {
            if let Some(song) = context.try_song(SongId::from_value(id)).await? {
                if song.artist_id == user.id {
                    let referrers = discover_song(context, &song).await?;
                    authored_songs.push((song.id, referrers));
                }
            }
        }

        for id in context.store.list(EntityKind::Album).await? {
            if let Some(album) = context.try_album(AlbumId::from_value(id)).await? {
                if album.artist_id == user.id {
                    authored_albums.push((album.id, discover_album(&album)));
                }
            }
        }
    }

    let mut owned_playlists = Vec::new();

    for playlist_id in &user.playlists {
        if let Some(playlist) = context.try_playlist(*playlist_id).await? {
            owned_playlists.push((playlist.id, discover_playlist(&playlist)));
        }
    }

    Ok(UserReferrers {
        owned_playlists,
        authored_songs,
        authored_albums,
        liked_songs: user.liked_songs.iter().copied().collect(),
        liked_albums: user.liked_albums.iter().copied().collect(),
        following_playlists: user.following_playlists.iter().copied().collect(),
        following: user.following.iter().copied().collect(),
        followers: user.followers.iter().copied().collect(),
    })
}

/// Removes every reference to the song and stages its deletion.
pub(super) async fn repair_song<S: EntityStore>(
    txn: &mut Txn<S>,
    song_id: SongId,
    referrers: &SongReferrers,
) -> Result<()> {
    if txn.try_song(song_id).await?.is_none() {
        return Ok(());
    }

    if let Some(album_id) = referrers.album {
        if let Some(mut album) = txn.try_album(album_id).await? {
            album.songs.retain(|id| *id != song_id);
            txn.put(album);
        }
    }

    for playlist_id in &referrers.playlists {
        if let Some(mut playlist) = txn.try_playlist(*playlist_id).await? {
            playlist.songs.retain(|id| *id != song_id);
            txn.put(playlist);
        }
    }

    for user_id in &referrers.likers {
        if let Some(mut user) = txn.try_user(*user_id).await? {
            user.liked_songs.remove(&song_id);
            txn.put(user);
        }
    }

    for user_id in &referrers.preferences {
        if let Some(mut preferences) = txn.try_preferences(*user_id).await? {
            preferences
                .recently_played
                .retain(|entry| entry.song_id != song_id);
            preferences.queue.retain(|id| *id != song_id);
            txn.put(preferences);
        }
    }

    txn.delete(RecordKey::new(EntityKind::Song, song_id.value()));

    Ok(())
}

/// Detaches the album's songs, removes its likers, and stages its deletion.
/// The songs themselves survive.
pub(super) async fn repair_album<S: EntityStore>(
    txn: &mut Txn<S>,
    album_id: AlbumId,
    referrers: &AlbumReferrers,
) -> Result<()> {
    if txn.try_album(album_id).await?.is_none() {
        return Ok(());
    }

    for song_id in &referrers.songs {
        if let Some(mut song) = txn.try_song(*song_id).await? {
            if song.album_id == Some(album_id) {
                song.album_id = None;
                txn.put(song);
            }
        }
    }

    for user_id in &referrers.likers {
        if let Some(mut user) = txn.try_user(*user_id).await? {
            user.liked_albums.remove(&album_id);
            txn.put(user);
        }
    }

    txn.delete(RecordKey::new(EntityKind::Album, album_id.value()));

    Ok(())
}

/// Unfollows every follower, drops the playlist from its owner's list, and
/// stages its deletion.
pub(super) async fn repair_playlist<S: EntityStore>(
    txn: &mut Txn<S>,
    playlist_id: PlaylistId,
    referrers: &PlaylistReferrers,
) -> Result<()> {
    if txn.try_playlist(playlist_id).await?.is_none() {
        return Ok(());
    }

    for user_id in &referrers.followers {
        if let Some(mut user) = txn.try_user(*user_id).await? {
            user.following_playlists.remove(&playlist_id);
            txn.put(user);
        }
    }

    if let Some(mut owner) = txn.try_user(referrers.owner).await? {
        owner.playlists.retain(|id| *id != playlist_id);
        txn.put(owner);
    }

    txn.delete(RecordKey::new(EntityKind::Playlist, playlist_id.value()));

    Ok(())
}

/// The full user cascade: owned and authored records die with the user,
/// every edge pointing at the user from elsewhere is removed, and the
/// preferences record goes too.
pub(super) async fn repair_user<S: EntityStore>(
    txn: &mut Txn<S>,
    user_id: UserId,
    referrers: &UserReferrers,
) -> Result<()> {
    if txn.try_user(user_id).await?.is_none() {
        return Ok(());
    }

    for (song_id, song_referrers) in &referrers.authored_songs {
        repair_song(txn, *song_id, song_referrers).await?;
    }

    for (album_id, album_referrers) in &referrers.authored_albums {
        repair_album(txn, *album_id, album_referrers).await?;
    }

    for (playlist_id, playlist_referrers) in &referrers.owned_playlists {
        repair_playlist(txn, *playlist_id, playlist_referrers).await?;
    }

    for song_id in &referrers.liked_songs {
        if let Some(mut song) = txn.try_song(*song_id).await? {
            song.liked_by.remove(&user_id);
            txn.put(song);
        }
    }

    for album_id in &referrers.liked_albums {
        if let Some(mut album) = txn.try_album(*album_id).await? {
            album.liked_by.remove(&user_id);
            txn.put(album);
        }
    }

    for playlist_id in &referrers.following_playlists {
        if let Some(mut playlist) = txn.try_playlist(*playlist_id).await? {
            playlist.followed_by.remove(&user_id);
            txn.put(playlist);
        }
    }

    for other_id in &referrers.following {
        if let Some(mut other) = txn.try_user(*other_id).await? {
            other.followers.remove(&user_id);
            txn.put(other);
        }
    }

    for other_id in &referrers.followers {
        if let Some(mut other) = txn.try_user(*other_id).await? {
            other.following.remove(&user_id);
            txn.put(other);
        }
    }

    if txn.try_preferences(user_id).await?.is_some() {
        txn.delete(RecordKey::new(EntityKind::Preferences, user_id.value()));
    }

    txn.delete(RecordKey::new(EntityKind::User, user_id.value()));

    Ok(())
}
