//! Spotify Web API helpers
//!
//! Thin wrappers that pick the right named cache, TTL and dedup policy for the
//! endpoints the player polls most. Responses stay as raw JSON; modelling
//! tracks or playlists is left to the caller.

use serde_json::Value;
use tracing::debug;

use crate::cache_store::CacheName;
use crate::dispatcher::{ApiRequest, SmartDispatcher};
use crate::error::RequestError;

/// Player commands that mutate playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    Play,
    Pause,
    Next,
    Previous,
}

impl PlayerCommand {
    fn request(self) -> ApiRequest {
        match self {
            Self::Play => ApiRequest::put("/me/player/play"),
            Self::Pause => ApiRequest::put("/me/player/pause"),
            Self::Next => ApiRequest::post("/me/player/next"),
            Self::Previous => ApiRequest::post("/me/player/previous"),
        }
    }

    /// Whether the command changes what is queued up next
    fn moves_queue(self) -> bool {
        matches!(self, Self::Next | Self::Previous)
    }
}

fn playback_key(user_id: &str) -> String {
    format!("playback:{user_id}")
}

fn queue_key(user_id: &str) -> String {
    format!("queue:{user_id}")
}

fn profile_key(user_id: &str) -> String {
    format!("profile:{user_id}")
}

/// Endpoint helpers bound to one dispatcher
#[derive(Clone)]
pub struct SpotifyClient {
    dispatcher: SmartDispatcher,
}

impl SpotifyClient {
    pub fn new(dispatcher: SmartDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Current playback state, `None` when nothing is playing
    ///
    /// # Errors
    ///
    /// Any [`RequestError`] from the dispatcher.
    pub async fn current_playback(&self, user_id: &str) -> Result<Option<Value>, RequestError> {
        let request = ApiRequest::get("/me/player")
            .for_user(user_id)
            .cached(CacheName::CurrentPlayback, playback_key(user_id));
        Ok(self.dispatcher.smart_request(request).await?.body)
    }

    /// Best-effort variant for polling loops
    ///
    /// Transient failures degrade to `None`. Auth expiry is still returned so
    /// the session layer can prompt for re-authentication.
    ///
    /// # Errors
    ///
    /// Only [`RequestError::AuthExpired`].
    pub async fn poll_playback(&self, user_id: &str) -> Result<Option<Value>, RequestError> {
        match self.current_playback(user_id).await {
            Ok(playback) => Ok(playback),
            Err(err) if err.is_auth_expired() => Err(err),
            Err(err) => {
                debug!(user = %user_id, error = %err, "Playback poll degraded to no data");
                Ok(None)
            }
        }
    }

    /// The user's playback queue
    ///
    /// # Errors
    ///
    /// Any [`RequestError`] from the dispatcher.
    pub async fn queue(&self, user_id: &str) -> Result<Option<Value>, RequestError> {
        let request = ApiRequest::get("/me/player/queue")
            .for_user(user_id)
            .cached(CacheName::Queue, queue_key(user_id));
        Ok(self.dispatcher.smart_request(request).await?.body)
    }

    /// The user's profile
    ///
    /// # Errors
    ///
    /// Any [`RequestError`] from the dispatcher.
    pub async fn current_user(&self, user_id: &str) -> Result<Option<Value>, RequestError> {
        let request = ApiRequest::get("/me")
            .for_user(user_id)
            .cached(CacheName::UserState, profile_key(user_id));
        Ok(self.dispatcher.smart_request(request).await?.body)
    }

    /// Send a player command and drop cached state it invalidates
    ///
    /// # Errors
    ///
    /// Any [`RequestError`] from the dispatcher.
    pub async fn player_command(&self, user_id: &str, command: PlayerCommand) -> Result<(), RequestError> {
        let request = command.request().for_user(user_id).without_dedup();
        self.dispatcher.smart_request(request).await?;

        let caches = &self.dispatcher.parts().caches;
        caches.cache(CacheName::CurrentPlayback).remove(&playback_key(user_id));
        if command.moves_queue() {
            caches.cache(CacheName::Queue).remove(&queue_key(user_id));
        }
        Ok(())
    }
}
