//! Channel upstream and live-stream fan-out: one owner per channel, a
//! subscriber set, a bounded FIFO upstream queue used while the owner is
//! offline, and owner-only live-stream frames fanned out to subscribers.

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::VecDeque;

use crate::{config::Channels as ChannelsConfig, error::ProtocolError, session::SessionRegistry};

struct QueuedUpstream {
    message: Value,
    ephemeral_public_key: String,
}

struct LiveStream {
    stream_id: String,
    title: Option<String>,
}

#[derive(Default)]
struct ChannelState {
    owner: Option<String>,
    subscribers: Vec<String>,
    upstream_queue: VecDeque<QueuedUpstream>,
    live_stream: Option<LiveStream>,
}

#[derive(Default)]
pub struct ChannelFanout {
    channels: RwLock<HashMap<String, ChannelState>>,
    config: ChannelsConfig,
}

impl ChannelFanout {
    pub fn new(config: ChannelsConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn register_owner(&self, sessions: &SessionRegistry, session_id: &str, channel_id: &str) {
        let queued = {
            let mut channels = self.channels.write();
            let state = channels.entry(channel_id.to_string()).or_default();
            state.owner = Some(session_id.to_string());
            std::mem::take(&mut state.upstream_queue)
        };

        if let Some(owner) = sessions.get(session_id) {
            for item in queued {
                owner.tx.send(
                    json!({
                        "type": "upstream-message",
                        "channelId": channel_id,
                        "message": item.message,
                        "ephemeralPublicKey": item.ephemeral_public_key,
                    })
                    .to_string(),
                );
            }
        }
    }

    pub fn subscribe(&self, sessions: &SessionRegistry, session_id: &str, channel_id: &str) {
        let stream_frame = {
            let mut channels = self.channels.write();
            let state = channels.entry(channel_id.to_string()).or_default();
            if !state.subscribers.contains(&session_id.to_string()) {
                state.subscribers.push(session_id.to_string());
            }
            state.live_stream.as_ref().map(|s| {
                json!({
                    "type": "stream-start",
                    "streamId": s.stream_id,
                    "channelId": channel_id,
                    "title": s.title,
                })
                .to_string()
            })
        };

        if let (Some(frame), Some(session)) = (stream_frame, sessions.get(session_id)) {
            session.tx.send(frame);
        }
    }

    /// Forwards to the owner if present, otherwise enqueues (dropping the
    /// oldest entry on overflow). Always returns `Ok` — the caller still
    /// emits `upstream-ack` either way.
    pub fn upstream_message(
        &self,
        sessions: &SessionRegistry,
        channel_id: &str,
        message: Value,
        ephemeral_public_key: &str,
    ) {
        let mut channels = self.channels.write();
        let state = channels.entry(channel_id.to_string()).or_default();

        if let Some(owner_id) = state.owner.clone() {
            drop(channels);
            if let Some(owner) = sessions.get(&owner_id) {
                owner.tx.send(
                    json!({
                        "type": "upstream-message",
                        "channelId": channel_id,
                        "message": message,
                        "ephemeralPublicKey": ephemeral_public_key,
                    })
                    .to_string(),
                );
            }
            return;
        }

        if state.upstream_queue.len() >= self.config.upstream_queue_capacity {
            state.upstream_queue.pop_front();
        }
        state.upstream_queue.push_back(QueuedUpstream {
            message,
            ephemeral_public_key: ephemeral_public_key.to_string(),
        });
    }

    pub fn stream_start(
        &self,
        sessions: &SessionRegistry,
        session_id: &str,
        channel_id: &str,
        stream_id: &str,
        title: Option<String>,
    ) -> Result<usize, ProtocolError> {
        let subscribers = {
            let mut channels = self.channels.write();
            let state = channels.entry(channel_id.to_string()).or_default();
            if state.owner.as_deref() != Some(session_id) {
                return Err(ProtocolError::NotChannelOwner);
            }
            state.live_stream = Some(LiveStream {
                stream_id: stream_id.to_string(),
                title: title.clone(),
            });
            state.subscribers.clone()
        };

        for subscriber_id in &subscribers {
            if let Some(subscriber) = sessions.get(subscriber_id) {
                subscriber.tx.send(
                    json!({
                        "type": "stream-start",
                        "streamId": stream_id,
                        "channelId": channel_id,
                        "title": title,
                    })
                    .to_string(),
                );
            }
        }

        Ok(subscribers.len())
    }

    /// Returns `Ok(())` for a silent drop from a non-owner — per spec,
    /// `stream-frame` from a non-owner is dropped, not errored.
    pub fn stream_frame(&self, sessions: &SessionRegistry, session_id: &str, channel_id: &str, frame: Value) {
        let (subscribers, stream_id) = {
            let channels = self.channels.read();
            let Some(state) = channels.get(channel_id) else {
                return;
            };
            if state.owner.as_deref() != Some(session_id) {
                return;
            }
            let Some(stream) = &state.live_stream else {
                return;
            };
            (state.subscribers.clone(), stream.stream_id.clone())
        };

        for subscriber_id in &subscribers {
            if let Some(subscriber) = sessions.get(subscriber_id) {
                subscriber.tx.send(
                    json!({
                        "type": "stream-frame",
                        "streamId": stream_id,
                        "channelId": channel_id,
                        "frame": frame,
                    })
                    .to_string(),
                );
            }
        }
    }

    pub fn stream_end(
        &self,
        sessions: &SessionRegistry,
        session_id: &str,
        channel_id: &str,
    ) -> Result<(), ProtocolError> {
        let (subscribers, stream_id) = {
            let mut channels = self.channels.write();
            let state = channels.entry(channel_id.to_string()).or_default();
            if state.owner.as_deref() != Some(session_id) {
                return Err(ProtocolError::NotChannelOwner);
            }
            let stream_id = state.live_stream.take().map(|s| s.stream_id);
            (state.subscribers.clone(), stream_id)
        };

        let Some(stream_id) = stream_id else {
            return Ok(());
        };

        for subscriber_id in &subscribers {
            if let Some(subscriber) = sessions.get(subscriber_id) {
                subscriber.tx.send(
                    json!({
                        "type": "stream-end",
                        "streamId": stream_id,
                        "channelId": channel_id,
                    })
                    .to_string(),
                );
            }
        }

        Ok(())
    }

    /// Called when a session disconnects: clears any owner/subscriber
    /// membership and, if it owned an active stream, synthesizes the
    /// `stream-end` fan-out.
    pub fn remove_session(&self, sessions: &SessionRegistry, session_id: &str) {
        let mut ended_channels = Vec::new();

        {
            let mut channels = self.channels.write();
            for (channel_id, state) in channels.iter_mut() {
                state.subscribers.retain(|s| s != session_id);
                if state.owner.as_deref() == Some(session_id) {
                    state.owner = None;
                    if state.live_stream.take().is_some() {
                        ended_channels.push((channel_id.clone(), state.subscribers.clone()));
                    }
                }
            }
        }

        for (channel_id, subscribers) in ended_channels {
            for subscriber_id in &subscribers {
                if let Some(subscriber) = sessions.get(subscriber_id) {
                    subscriber.tx.send(
                        json!({ "type": "stream-end", "channelId": channel_id }).to_string(),
                    );
                }
            }
        }
    }
}
