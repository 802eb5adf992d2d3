use crate::entity::{
    Album, AlbumId, ContainerRef, EntityKind, Playlist, PlaylistId, PositionAssignment, RecordKey,
    Role, Song, SongId, SongSelector, User, UserId,
};
use crate::error::{GraphError, Result};
use crate::events::{GraphEvent, TracklistChange};
use crate::store::{EntityStore, LockKey};
use crate::GraphContext;

/// Maintains the ordered song lists of albums and playlists.
///
/// Positions are implicit, an entry's position is its index, so every
/// mutation that goes through here leaves the list contiguous from zero.
/// Albums additionally carry the membership rule that a song belongs to at
/// most one album, tracked through `Song::album_id`.
pub struct Tracklists<S> {
    context: GraphContext<S>,
}

impl<S> Tracklists<S>
where
    S: EntityStore,
{
    pub fn new(context: &GraphContext<S>) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Appends a song to the end of a container, returning its position.
    pub async fn add_song(
        &self,
        actor: UserId,
        container: ContainerRef,
        song_id: SongId,
    ) -> Result<usize> {
        let keys = vec![
            LockKey::Record(container.key()),
            LockKey::Record(RecordKey::new(EntityKind::Song, song_id.value())),
        ];
        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;
        let mut song = txn.song(song_id).await?;

        let position = match container {
            ContainerRef::Album(album_id) => {
                let mut album = txn.album(album_id).await?;
                authorize_album(&actor_user, &album)?;

                if album.songs.contains(&song_id) {
                    return Err(GraphError::conflict("the song is already on the album"));
                }

                if song.album_id.is_some_and(|other| other != album_id) {
                    return Err(GraphError::conflict(
                        "the song already belongs to another album",
                    ));
                }

                album.songs.push(song_id);
                song.album_id = Some(album_id);

                let position = album.songs.len() - 1;
                txn.put(album);
                txn.put(song);
                position
            }
            ContainerRef::Playlist(playlist_id) => {
                let mut playlist = txn.playlist(playlist_id).await?;
                authorize_playlist(&actor_user, &playlist)?;

                playlist.songs.push(song_id);

                let position = playlist.songs.len() - 1;
                txn.put(playlist);
                position
            }
        };

        txn.queue_event(GraphEvent::TracklistChanged {
            container,
            change: TracklistChange::Added { song_id, position },
        });
        txn.commit().await?;

        Ok(position)
    }

    /// Removes one entry from a container and repacks the positions after it.
    ///
    /// A song id addresses its first occurrence, a position addresses one
    /// exact entry. Removing from an album also clears the song's album
    /// back-reference.
    pub async fn remove_song(
        &self,
        actor: UserId,
        container: ContainerRef,
        selector: SongSelector,
    ) -> Result<()> {
        match container {
            ContainerRef::Album(album_id) => {
                self.remove_from_album(actor, album_id, selector).await
            }
            ContainerRef::Playlist(playlist_id) => {
                self.remove_from_playlist(actor, playlist_id, selector).await
            }
        }
    }

    /// Album removals write the song record too, so the lock set depends on
    /// which song the selector resolves to. The resolution is retried when
    /// the album changes between resolving and locking.
    async fn remove_from_album(
        &self,
        actor: UserId,
        album_id: AlbumId,
        selector: SongSelector,
    ) -> Result<()> {
        let mut attempts = 0;

        loop {
            let song_id = match selector {
                SongSelector::Id(id) => id,
                SongSelector::Position(position) => {
                    let album = self.context.album(album_id).await?;

                    album.songs.get(position).copied().ok_or_else(|| {
                        GraphError::stale(format!("no album entry at position {}", position))
                    })?
                }
            };

            let keys = vec![
                LockKey::Record(RecordKey::new(EntityKind::Album, album_id.value())),
                LockKey::Record(RecordKey::new(EntityKind::Song, song_id.value())),
            ];
            let mut txn = self.context.begin(keys).await?;

            let actor_user = txn.user(actor).await?;
            let mut album = txn.album(album_id).await?;
            authorize_album(&actor_user, &album)?;

            let index = match selector {
                SongSelector::Id(id) => album
                    .songs
                    .iter()
                    .position(|entry| *entry == id)
                    .ok_or_else(|| GraphError::stale("the song is not on the album"))?,
                SongSelector::Position(position) => {
                    if album.songs.get(position) != Some(&song_id) {
                        // The entry moved before the locks were taken
                        attempts += 1;

                        if attempts > self.context.config.cascade_retries {
                            return Err(GraphError::retryable_conflict(
                                "the album kept changing during removal",
                            ));
                        }

                        continue;
                    }

                    position
                }
            };

            let removed = album.songs.remove(index);
            let mut song = txn.song(removed).await?;

            if song.album_id == Some(album_id) {
                song.album_id = None;
            }

            txn.put(album);
            txn.put(song);
            txn.queue_event(GraphEvent::TracklistChanged {
                container: ContainerRef::Album(album_id),
                change: TracklistChange::Removed {
                    song_id: removed,
                    position: index,
                },
            });

            return txn.commit().await;
        }
    }

    async fn remove_from_playlist(
        &self,
        actor: UserId,
        playlist_id: PlaylistId,
        selector: SongSelector,
    ) -> Result<()> {
        let keys = vec![LockKey::Record(RecordKey::new(
            EntityKind::Playlist,
            playlist_id.value(),
        ))];
        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;
        let mut playlist = txn.playlist(playlist_id).await?;
        authorize_playlist(&actor_user, &playlist)?;

        let index = match selector {
            SongSelector::Id(id) => playlist
                .songs
                .iter()
                .position(|entry| *entry == id)
                .ok_or_else(|| GraphError::stale("the song is not in the playlist"))?,
            SongSelector::Position(position) => {
                if position >= playlist.songs.len() {
                    return Err(GraphError::stale(format!(
                        "no playlist entry at position {}",
                        position
                    )));
                }

                position
            }
        };

        let removed = playlist.songs.remove(index);

        txn.put(playlist);
        txn.queue_event(GraphEvent::TracklistChanged {
            container: ContainerRef::Playlist(playlist_id),
            change: TracklistChange::Removed {
                song_id: removed,
                position: index,
            },
        });

        txn.commit().await
    }

    /// Moves entries to the requested positions, leaving unmentioned entries
    /// where they are. The resulting order must fill every position exactly
    /// once or nothing is changed.
    pub async fn reorder(
        &self,
        actor: UserId,
        container: ContainerRef,
        assignments: Vec<PositionAssignment>,
    ) -> Result<()> {
        let keys = vec![LockKey::Record(container.key())];
        let mut txn = self.context.begin(keys).await?;

        let actor_user = txn.user(actor).await?;

        match container {
            ContainerRef::Album(album_id) => {
                let mut album = txn.album(album_id).await?;
                authorize_album(&actor_user, &album)?;

                album.songs = reorder_list(&album.songs, &assignments)?;
                txn.put(album);
            }
            ContainerRef::Playlist(playlist_id) => {
                let mut playlist = txn.playlist(playlist_id).await?;
                authorize_playlist(&actor_user, &playlist)?;

                playlist.songs = reorder_list(&playlist.songs, &assignments)?;
                txn.put(playlist);
            }
        }

        txn.queue_event(GraphEvent::TracklistChanged {
            container,
            change: TracklistChange::Reordered,
        });

        txn.commit().await
    }

    /// The album's track list resolved to song records. Entries whose
    /// record is gone are skipped.
    pub async fn album_tracks(&self, album_id: AlbumId) -> Result<Vec<Song>> {
        let album = self.context.album(album_id).await?;
        self.resolve_songs(&album.songs).await
    }

    /// The playlist's track list resolved to song records.
    pub async fn playlist_tracks(&self, playlist_id: PlaylistId) -> Result<Vec<Song>> {
        let playlist = self.context.playlist(playlist_id).await?;
        self.resolve_songs(&playlist.songs).await
    }

    async fn resolve_songs(&self, ids: &[SongId]) -> Result<Vec<Song>> {
        let mut songs = Vec::with_capacity(ids.len());

        for id in ids {
            if let Some(song) = self.context.try_song(*id).await? {
                songs.push(song);
            }
        }

        Ok(songs)
    }
}

fn authorize_album(actor: &User, album: &Album) -> Result<()> {
    if actor.role == Role::Admin || album.artist_id == actor.id {
        Ok(())
    } else {
        Err(GraphError::unauthorized(
            "only the album's artist can change its track list",
        ))
    }
}

fn authorize_playlist(actor: &User, playlist: &Playlist) -> Result<()> {
    if actor.role == Role::Admin || playlist.owner_id == actor.id {
        Ok(())
    } else {
        Err(GraphError::unauthorized(
            "only the playlist's owner can change its track list",
        ))
    }
}

/// Computes the new order for a list without touching it.
fn reorder_list(current: &[SongId], assignments: &[PositionAssignment]) -> Result<Vec<SongId>> {
    let total = current.len();
    let mut slots: Vec<Option<SongId>> = vec![None; total];
    let mut consumed = vec![false; total];

    for assignment in assignments {
        if assignment.position >= total {
            return Err(GraphError::invalid_order(format!(
                "position {} is out of range for {} entries",
                assignment.position, total
            )));
        }

        // Duplicate songs resolve to their first occurrence that no
        // earlier assignment has claimed
        let source = (0..total)
            .find(|&index| current[index] == assignment.song_id && !consumed[index])
            .ok_or_else(|| {
                GraphError::stale(format!("song {} is not in the container", assignment.song_id))
            })?;

        consumed[source] = true;

        let slot = &mut slots[assignment.position];

        if slot.is_some() {
            return Err(GraphError::invalid_order(format!(
                "position {} is assigned more than once",
                assignment.position
            )));
        }

        *slot = Some(assignment.song_id);
    }

    for (index, id) in current.iter().enumerate() {
        if consumed[index] {
            continue;
        }

        let slot = &mut slots[index];

        if slot.is_some() {
            return Err(GraphError::invalid_order(format!(
                "the entry keeping position {} collides with an assignment",
                index
            )));
        }

        *slot = Some(*id);
    }

    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| GraphError::invalid_order("the resulting positions leave a gap"))
}
