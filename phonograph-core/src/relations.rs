use crate::entity::{Album, EntityKind, FollowTarget, LikeTarget, Playlist, RecordKey, Song, User, UserId};
use crate::error::{GraphError, Result};
use crate::events::GraphEvent;
use crate::store::{EntityStore, LockKey};
use crate::GraphContext;

/// Maintains the symmetric relationship sets of the graph.
///
/// Every relation is stored on both participants. This manager is the only
/// code that writes those sets, and it always writes the two sides in the
/// same transaction, so one side can never be observed disagreeing with the
/// other.
pub struct Relations<S> {
    context: GraphContext<S>,
}

impl<S> Relations<S>
where
    S: EntityStore,
{
    pub fn new(context: &GraphContext<S>) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Toggles a like on a song or album, returning the resulting state.
    pub async fn toggle_like(&self, user_id: UserId, target: LikeTarget) -> Result<bool> {
        let user_key = RecordKey::new(EntityKind::User, user_id.value());
        let target_key = match target {
            LikeTarget::Song(id) => RecordKey::new(EntityKind::Song, id.value()),
            LikeTarget::Album(id) => RecordKey::new(EntityKind::Album, id.value()),
        };

        let keys = vec![LockKey::Record(user_key), LockKey::Record(target_key)];
        let mut txn = self.context.begin(keys).await?;

        let mut user = txn.user(user_id).await?;

        let liked = match target {
            LikeTarget::Song(song_id) => {
                let mut song = txn.song(song_id).await?;
                let liked = !user.liked_songs.contains(&song_id);

                if liked {
                    user.liked_songs.insert(song_id);
                    song.liked_by.insert(user_id);
                } else {
                    user.liked_songs.remove(&song_id);
                    song.liked_by.remove(&user_id);
                }

                txn.put(song);
                liked
            }
            LikeTarget::Album(album_id) => {
                let mut album = txn.album(album_id).await?;
                let liked = !user.liked_albums.contains(&album_id);

                if liked {
                    user.liked_albums.insert(album_id);
                    album.liked_by.insert(user_id);
                } else {
                    user.liked_albums.remove(&album_id);
                    album.liked_by.remove(&user_id);
                }

                txn.put(album);
                liked
            }
        };

        txn.put(user);
        txn.queue_event(GraphEvent::LikeToggled {
            user_id,
            target,
            liked,
        });
        txn.commit().await?;

        Ok(liked)
    }

    /// Toggles a follow on a user or playlist, returning the resulting state.
    pub async fn toggle_follow(&self, user_id: UserId, target: FollowTarget) -> Result<bool> {
        if matches!(target, FollowTarget::User(other) if other == user_id) {
            return Err(GraphError::SelfReferenceDenied);
        }

        let user_key = RecordKey::new(EntityKind::User, user_id.value());
        let target_key = match target {
            FollowTarget::User(id) => RecordKey::new(EntityKind::User, id.value()),
            FollowTarget::Playlist(id) => RecordKey::new(EntityKind::Playlist, id.value()),
        };

        let keys = vec![LockKey::Record(user_key), LockKey::Record(target_key)];
        let mut txn = self.context.begin(keys).await?;

        let mut user = txn.user(user_id).await?;

        let following = match target {
            FollowTarget::User(other_id) => {
                let mut other = txn.user(other_id).await?;
                let following = !user.following.contains(&other_id);

                if following {
                    user.following.insert(other_id);
                    other.followers.insert(user_id);
                } else {
                    user.following.remove(&other_id);
                    other.followers.remove(&user_id);
                }

                txn.put(other);
                following
            }
            FollowTarget::Playlist(playlist_id) => {
                let mut playlist = txn.playlist(playlist_id).await?;
                let following = !user.following_playlists.contains(&playlist_id);

                if following {
                    user.following_playlists.insert(playlist_id);
                    playlist.followed_by.insert(user_id);
                } else {
                    user.following_playlists.remove(&playlist_id);
                    playlist.followed_by.remove(&user_id);
                }

                txn.put(playlist);
                following
            }
        };

        txn.put(user);
        txn.queue_event(GraphEvent::FollowToggled {
            user_id,
            target,
            following,
        });
        txn.commit().await?;

        Ok(following)
    }

    /// Songs the user likes, resolved to live records.
    pub async fn liked_songs(&self, user_id: UserId) -> Result<Vec<Song>> {
        let user = self.context.user(user_id).await?;
        let mut songs = Vec::with_capacity(user.liked_songs.len());

        for song_id in user.liked_songs {
            if let Some(song) = self.context.try_song(song_id).await? {
                songs.push(song);
            }
        }

        Ok(songs)
    }

    /// Albums the user likes, resolved to live records.
    pub async fn liked_albums(&self, user_id: UserId) -> Result<Vec<Album>> {
        let user = self.context.user(user_id).await?;
        let mut albums = Vec::with_capacity(user.liked_albums.len());

        for album_id in user.liked_albums {
            if let Some(album) = self.context.try_album(album_id).await? {
                albums.push(album);
            }
        }

        Ok(albums)
    }

    /// Playlists the user follows, resolved to live records.
    pub async fn followed_playlists(&self, user_id: UserId) -> Result<Vec<Playlist>> {
        let user = self.context.user(user_id).await?;
        let mut playlists = Vec::with_capacity(user.following_playlists.len());

        for playlist_id in user.following_playlists {
            if let Some(playlist) = self.context.try_playlist(playlist_id).await? {
                playlists.push(playlist);
            }
        }

        Ok(playlists)
    }

    /// Users following the given user, straight from the stored reverse edge.
    pub async fn followers(&self, user_id: UserId) -> Result<Vec<User>> {
        let user = self.context.user(user_id).await?;
        let mut users = Vec::with_capacity(user.followers.len());

        for follower_id in user.followers {
            if let Some(follower) = self.context.try_user(follower_id).await? {
                users.push(follower);
            }
        }

        Ok(users)
    }

    /// Users the given user follows.
    pub async fn following(&self, user_id: UserId) -> Result<Vec<User>> {
        let user = self.context.user(user_id).await?;
        let mut users = Vec::with_capacity(user.following.len());

        for followed_id in user.following {
            if let Some(followed) = self.context.try_user(followed_id).await? {
                users.push(followed);
            }
        }

        Ok(users)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemoryStore;
    use crate::Config;
    use std::sync::Arc;

    async fn seeded_context() -> (GraphContext<MemoryStore>, User, Song) {
        let context = GraphContext::with_store(MemoryStore::new(), Config::default());
        let user = User::mock("john");
        let song = Song::mock(user.id, "strawberries");

        context.store.put(user.clone().into()).await.unwrap();
        context.store.put(song.clone().into()).await.unwrap();

        (context, user, song)
    }

    #[tokio::test]
    async fn like_toggle_flips_both_sides() {
        let (context, user, song) = seeded_context().await;
        let relations = Relations::new(&context);

        let liked = relations
            .toggle_like(user.id, LikeTarget::Song(song.id))
            .await
            .expect("toggle succeeds");
        assert!(liked, "the first toggle likes");

        let stored_user = context.user(user.id).await.unwrap();
        let stored_song = context.song(song.id).await.unwrap();
        assert!(stored_user.liked_songs.contains(&song.id));
        assert!(stored_song.liked_by.contains(&user.id));

        let liked = relations
            .toggle_like(user.id, LikeTarget::Song(song.id))
            .await
            .expect("toggle succeeds");
        assert!(!liked, "the second toggle unlikes");

        let stored_user = context.user(user.id).await.unwrap();
        let stored_song = context.song(song.id).await.unwrap();
        assert!(stored_user.liked_songs.is_empty());
        assert!(stored_song.liked_by.is_empty());
    }

    #[tokio::test]
    async fn album_likes_toggle_both_sides() {
        let (context, user, _) = seeded_context().await;
        let relations = Relations::new(&context);

        let album = Album::mock(user.id, "Holograms");
        context.store.put(album.clone().into()).await.unwrap();

        assert!(relations
            .toggle_like(user.id, LikeTarget::Album(album.id))
            .await
            .unwrap());

        let stored_user = context.user(user.id).await.unwrap();
        let stored_album = context.album(album.id).await.unwrap();
        assert!(stored_user.liked_albums.contains(&album.id));
        assert!(stored_album.liked_by.contains(&user.id));
    }

    #[tokio::test]
    async fn follow_updates_both_edges() {
        let (context, user, _) = seeded_context().await;
        let relations = Relations::new(&context);

        let other = User::mock("lucy");
        context.store.put(other.clone().into()).await.unwrap();

        assert!(relations
            .toggle_follow(user.id, FollowTarget::User(other.id))
            .await
            .unwrap());

        let stored_user = context.user(user.id).await.unwrap();
        let stored_other = context.user(other.id).await.unwrap();
        assert!(stored_user.following.contains(&other.id));
        assert!(stored_other.followers.contains(&user.id));

        assert!(!relations
            .toggle_follow(user.id, FollowTarget::User(other.id))
            .await
            .unwrap());

        let stored_other = context.user(other.id).await.unwrap();
        assert!(stored_other.followers.is_empty(), "unfollow clears the reverse edge");
    }

    #[tokio::test]
    async fn playlist_follows_toggle_both_sides() {
        let (context, user, _) = seeded_context().await;
        let relations = Relations::new(&context);

        let owner = User::mock("lucy");
        let playlist = Playlist::mock(owner.id, "Morning");
        context.store.put(owner.clone().into()).await.unwrap();
        context.store.put(playlist.clone().into()).await.unwrap();

        assert!(relations
            .toggle_follow(user.id, FollowTarget::Playlist(playlist.id))
            .await
            .unwrap());

        let stored_user = context.user(user.id).await.unwrap();
        let stored_playlist = context.playlist(playlist.id).await.unwrap();
        assert!(stored_user.following_playlists.contains(&playlist.id));
        assert!(stored_playlist.followed_by.contains(&user.id));
    }

    #[tokio::test]
    async fn self_follow_is_denied() {
        let (context, user, _) = seeded_context().await;
        let relations = Relations::new(&context);

        let result = relations
            .toggle_follow(user.id, FollowTarget::User(user.id))
            .await;

        assert!(matches!(result, Err(GraphError::SelfReferenceDenied)));
    }

    #[tokio::test]
    async fn liking_a_missing_song_is_not_found() {
        let (context, user, _) = seeded_context().await;
        let relations = Relations::new(&context);

        let result = relations
            .toggle_like(user.id, LikeTarget::Song(crate::entity::SongId::new()))
            .await;
        assert!(matches!(result, Err(GraphError::NotFound(_))));

        let stored_user = context.user(user.id).await.unwrap();
        assert!(stored_user.liked_songs.is_empty(), "nothing was written");
    }

    #[tokio::test]
    async fn concurrent_toggles_settle_to_parity() {
        let (context, user, song) = seeded_context().await;
        let relations = Arc::new(Relations::new(&context));

        let total = 15;
        let mut handles = Vec::new();

        for _ in 0..total {
            let relations = relations.clone();
            let user_id = user.id;
            let target = LikeTarget::Song(song.id);

            handles.push(tokio::spawn(async move {
                relations.toggle_like(user_id, target).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().expect("every toggle succeeds");
        }

        let stored_user = context.user(user.id).await.unwrap();
        let stored_song = context.song(song.id).await.unwrap();
        let liked = stored_user.liked_songs.contains(&song.id);

        assert_eq!(liked, total % 2 == 1, "an odd toggle count ends liked");
        assert_eq!(
            stored_song.liked_by.contains(&user.id),
            liked,
            "both sides agree"
        );
    }

    #[tokio::test]
    async fn random_toggle_sweeps_never_break_symmetry() {
        use rand::seq::SliceRandom;
        use rand::{thread_rng, Rng};

        let context = GraphContext::with_store(MemoryStore::new(), Config::default());
        let relations = Relations::new(&context);

        let users: Vec<_> = ["ann", "ben", "cleo"].map(User::mock).into();
        let songs: Vec<_> = (0..3)
            .map(|index| Song::mock(users[0].id, &format!("track-{}", index)))
            .collect();

        for user in &users {
            context.store.put(user.clone().into()).await.unwrap();
        }
        for song in &songs {
            context.store.put(song.clone().into()).await.unwrap();
        }

        let mut rng = thread_rng();

        for _ in 0..150 {
            let user = users.choose(&mut rng).unwrap();

            if rng.gen_bool(0.5) {
                let song = songs.choose(&mut rng).unwrap();
                relations
                    .toggle_like(user.id, LikeTarget::Song(song.id))
                    .await
                    .unwrap();
            } else {
                let other = users.choose(&mut rng).unwrap();

                if other.id != user.id {
                    relations
                        .toggle_follow(user.id, FollowTarget::User(other.id))
                        .await
                        .unwrap();
                }
            }
        }

        // Whatever sequence ran, each edge exists on both sides or neither
        for user in &users {
            let stored = context.user(user.id).await.unwrap();

            for song in &songs {
                let stored_song = context.song(song.id).await.unwrap();
                assert_eq!(
                    stored.liked_songs.contains(&song.id),
                    stored_song.liked_by.contains(&user.id),
                );
            }

            for other in &users {
                let stored_other = context.user(other.id).await.unwrap();
                assert_eq!(
                    stored.following.contains(&other.id),
                    stored_other.followers.contains(&user.id),
                );
            }
        }
    }

    #[tokio::test]
    async fn listings_skip_dead_references() {
        let (context, mut user, song) = seeded_context().await;
        let relations = Relations::new(&context);

        // One live and one dangling liked song
        user.liked_songs.insert(song.id);
        user.liked_songs.insert(crate::entity::SongId::new());
        context.store.put(user.clone().into()).await.unwrap();

        let songs = relations.liked_songs(user.id).await.unwrap();
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].id, song.id);
    }
}
