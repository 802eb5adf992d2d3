use crossbeam::channel::{Receiver, Sender};

use crate::entity::{
    AlbumId, ContainerRef, EntityRef, FollowTarget, LikeTarget, PlaylistId, SongId, UserId,
};

pub type EventSender = Sender<GraphEvent>;
pub type EventReceiver = Receiver<GraphEvent>;

/// Describes the events emitted by the engine after a commit.
/// Rolled back operations never emit anything.
#[derive(Debug)]
pub enum GraphEvent {
    /// A user account was created.
    UserCreated { user_id: UserId },
    /// A song was created.
    SongCreated { song_id: SongId, artist_id: UserId },
    /// An album was created.
    AlbumCreated { album_id: AlbumId, artist_id: UserId },
    /// A playlist was created.
    PlaylistCreated {
        playlist_id: PlaylistId,
        owner_id: UserId,
    },
    /// A like was toggled on or off.
    LikeToggled {
        user_id: UserId,
        target: LikeTarget,
        /// The resulting state.
        liked: bool,
    },
    /// A follow was toggled on or off.
    FollowToggled {
        user_id: UserId,
        target: FollowTarget,
        /// The resulting state.
        following: bool,
    },
    /// The ordered list of a container changed.
    TracklistChanged {
        container: ContainerRef,
        change: TracklistChange,
    },
    /// A play was recorded in a user's history.
    PlayRecorded { user_id: UserId, song_id: SongId },
    /// A user's queue was replaced.
    QueueReplaced {
        user_id: UserId,
        /// The length of the new queue.
        length: usize,
    },
    /// A user's settings were updated or reset.
    SettingsUpdated { user_id: UserId },
    /// An entity and every reference to it were removed.
    EntityDeleted { entity: EntityRef },
}

/// How a container's ordered list changed.
#[derive(Debug)]
pub enum TracklistChange {
    Added { song_id: SongId, position: usize },
    Removed { song_id: SongId, position: usize },
    Reordered,
}
