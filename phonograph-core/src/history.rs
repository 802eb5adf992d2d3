use chrono::{Duration, Utc};

use crate::entity::{
    EntityKind, PlayEntry, RecordKey, Settings, Song, SongId, UpdatedSettings, UserId,
    UserPreferences,
};
use crate::error::Result;
use crate::events::GraphEvent;
use crate::store::{EntityStore, LockKey};
use crate::GraphContext;

/// Tracks each user's bounded listening history and queue.
///
/// The recently played list is capped and ordered by play time descending,
/// and a song appears in it at most once. The queue has no bound and is
/// replaced wholesale by its owner.
pub struct History<S> {
    context: GraphContext<S>,
}

impl<S> History<S>
where
    S: EntityStore,
{
    pub fn new(context: &GraphContext<S>) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Records a play: moves the song to the front of the recently played
    /// list, trims the list to its cap, and bumps the song's play count.
    /// Creates the preferences record when the user has none yet.
    pub async fn record_play(&self, user_id: UserId, song_id: SongId) -> Result<()> {
        let keys = vec![
            LockKey::Record(preferences_key(user_id)),
            LockKey::Record(RecordKey::new(EntityKind::Song, song_id.value())),
        ];
        let mut txn = self.context.begin(keys).await?;

        txn.user(user_id).await?;
        let mut song = txn.song(song_id).await?;

        let mut preferences = match txn.try_preferences(user_id).await? {
            Some(preferences) => preferences,
            None => UserPreferences::new(user_id),
        };

        preferences
            .recently_played
            .retain(|entry| entry.song_id != song_id);

        // Keep play times strictly descending even when the clock ties
        // or steps backwards
        let mut played_at = Utc::now();

        if let Some(head) = preferences.recently_played.first() {
            if played_at <= head.played_at {
                played_at = head.played_at + Duration::milliseconds(1);
            }
        }

        preferences
            .recently_played
            .insert(0, PlayEntry { song_id, played_at });
        preferences
            .recently_played
            .truncate(self.context.config.history_capacity);

        song.play_count += 1;

        txn.put(preferences);
        txn.put(song);
        txn.queue_event(GraphEvent::PlayRecorded { user_id, song_id });

        txn.commit().await
    }

    /// Replaces the user's queue wholesale.
    ///
    /// The user must already have a preferences record, playback starts
    /// with a play being recorded, not with queue edits.
    pub async fn replace_queue(&self, user_id: UserId, song_ids: Vec<SongId>) -> Result<()> {
        // The queued songs join the lock set even though they are only
        // read, a deletion must not land between their validation here
        // and the commit
        let mut keys = vec![LockKey::Record(preferences_key(user_id))];

        keys.extend(
            song_ids
                .iter()
                .map(|id| LockKey::Record(RecordKey::new(EntityKind::Song, id.value()))),
        );

        let mut txn = self.context.begin(keys).await?;

        let mut preferences = txn.preferences(user_id).await?;

        for song_id in &song_ids {
            txn.song(*song_id).await?;
        }

        let length = song_ids.len();
        preferences.queue = song_ids;

        txn.put(preferences);
        txn.queue_event(GraphEvent::QueueReplaced { user_id, length });

        txn.commit().await
    }

    /// Returns the user's preferences, creating them with the documented
    /// defaults on first access.
    pub async fn ensure_preferences(&self, user_id: UserId) -> Result<UserPreferences> {
        let keys = vec![LockKey::Record(preferences_key(user_id))];
        let mut txn = self.context.begin(keys).await?;

        txn.user(user_id).await?;

        if let Some(preferences) = txn.try_preferences(user_id).await? {
            return Ok(preferences);
        }

        let preferences = UserPreferences::new(user_id);

        txn.put(preferences.clone());
        txn.commit().await?;

        Ok(preferences)
    }

    /// Merges a partial settings update into the user's preferences,
    /// creating them first if needed.
    pub async fn update_settings(
        &self,
        user_id: UserId,
        update: UpdatedSettings,
    ) -> Result<UserPreferences> {
        let keys = vec![LockKey::Record(preferences_key(user_id))];
        let mut txn = self.context.begin(keys).await?;

        txn.user(user_id).await?;

        let mut preferences = match txn.try_preferences(user_id).await? {
            Some(preferences) => preferences,
            None => UserPreferences::new(user_id),
        };

        merge_settings(&mut preferences.settings, update);

        txn.put(preferences.clone());
        txn.queue_event(GraphEvent::SettingsUpdated { user_id });
        txn.commit().await?;

        Ok(preferences)
    }

    /// Puts the user's settings back to their defaults.
    pub async fn reset_settings(&self, user_id: UserId) -> Result<UserPreferences> {
        let keys = vec![LockKey::Record(preferences_key(user_id))];
        let mut txn = self.context.begin(keys).await?;

        txn.user(user_id).await?;

        let mut preferences = match txn.try_preferences(user_id).await? {
            Some(preferences) => preferences,
            None => UserPreferences::new(user_id),
        };

        preferences.settings = Settings::default();

        txn.put(preferences.clone());
        txn.queue_event(GraphEvent::SettingsUpdated { user_id });
        txn.commit().await?;

        Ok(preferences)
    }

    /// The user's raw preferences record.
    pub async fn preferences(&self, user_id: UserId) -> Result<UserPreferences> {
        self.context.preferences(user_id).await
    }

    /// The recently played list resolved to song records, newest first.
    /// Entries whose record is gone are skipped.
    pub async fn recently_played(&self, user_id: UserId) -> Result<Vec<Song>> {
        let preferences = self.context.preferences(user_id).await?;
        let mut songs = Vec::with_capacity(preferences.recently_played.len());

        for entry in &preferences.recently_played {
            if let Some(song) = self.context.try_song(entry.song_id).await? {
                songs.push(song);
            }
        }

        Ok(songs)
    }

    /// The queue resolved to song records, in queue order.
    pub async fn queue(&self, user_id: UserId) -> Result<Vec<Song>> {
        let preferences = self.context.preferences(user_id).await?;
        let mut songs = Vec::with_capacity(preferences.queue.len());

        for song_id in &preferences.queue {
            if let Some(song) = self.context.try_song(*song_id).await? {
                songs.push(song);
            }
        }

        Ok(songs)
    }
}

fn preferences_key(user_id: UserId) -> RecordKey {
    RecordKey::new(EntityKind::Preferences, user_id.value())
}

fn merge_settings(settings: &mut Settings, update: UpdatedSettings) {
    if let Some(theme) = update.theme {
        settings.theme = theme;
    }
    if let Some(language) = update.language {
        settings.language = language;
    }
    if let Some(autoplay) = update.autoplay {
        settings.autoplay = autoplay;
    }
    if let Some(explicit_content) = update.explicit_content {
        settings.explicit_content = explicit_content;
    }
    if let Some(audio_quality) = update.audio_quality {
        settings.audio_quality = audio_quality;
    }
    if let Some(crossfade_seconds) = update.crossfade_seconds {
        settings.crossfade_seconds = crossfade_seconds;
    }
    if let Some(gapless_playback) = update.gapless_playback {
        settings.gapless_playback = gapless_playback;
    }
    if let Some(show_activity) = update.show_activity {
        settings.show_activity = show_activity;
    }
    if let Some(show_recently_played) = update.show_recently_played {
        settings.show_recently_played = show_recently_played;
    }
    if let Some(show_favorites) = update.show_favorites {
        settings.show_favorites = show_favorites;
    }
}
