//! WebSocket channel layer: pub/sub with public/private/presence semantics.
//!
//! Channels bypass the router; the WebSocket adapter hands subscribe /
//! unsubscribe / publish frames straight to the [`ChannelManager`].  Each
//! connected socket registers an outbound sender; the manager fans published
//! events out to members through those senders.
//!
//! Ordering: publishes to one channel are delivered in the order they reach
//! the manager (the channel map lock serializes fan-out).  No cross-channel
//! ordering is implied.

pub mod pattern;

pub use pattern::ChannelPattern;

use sb_core::Context;
use sb_protocol::{Envelope, ErrorCode, FrameKind, RpcError};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

// ---------------------------------------------------------------------------
// Channel definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

/// Everything an authorization hook gets to see.  The context carries the
/// auth established at subscribe time; per-event hooks see the same one (no
/// mid-session re-auth).
#[derive(Clone)]
pub struct ChannelRequest {
    pub socket_id: String,
    pub channel: String,
    pub params: HashMap<String, String>,
    pub context: Context,
    /// Event name, for publish authorization only.
    pub event: Option<String>,
}

type AuthorizeFn = Arc<dyn Fn(ChannelRequest) -> BoxFuture<bool> + Send + Sync>;
type PresenceDataFn = Arc<dyn Fn(&str, &Context) -> Value + Send + Sync>;

/// A channel definition registered against a literal or parameterized name.
pub struct ChannelDefinition {
    pattern: ChannelPattern,
    kind: ChannelKind,
    subscribe_auth: Option<AuthorizeFn>,
    publish_auth: Option<AuthorizeFn>,
    presence_data: Option<PresenceDataFn>,
    /// Deliver published events back to the publishing socket.
    broadcast_to_sender: bool,
}

impl ChannelDefinition {
    fn new(pattern: &str, kind: ChannelKind) -> Self {
        ChannelDefinition {
            pattern: ChannelPattern::parse(pattern),
            kind,
            subscribe_auth: None,
            publish_auth: None,
            presence_data: None,
            broadcast_to_sender: false,
        }
    }

    pub fn public(pattern: &str) -> Self {
        Self::new(pattern, ChannelKind::Public)
    }

    pub fn private(pattern: &str) -> Self {
        Self::new(pattern, ChannelKind::Private)
    }

    pub fn presence(pattern: &str) -> Self {
        Self::new(pattern, ChannelKind::Presence)
    }

    /// Subscribe authorization hook.  Without one, private and presence
    /// channels require an authenticated context.
    pub fn authorize<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ChannelRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.subscribe_auth = Some(Arc::new(move |req| Box::pin(hook(req))));
        self
    }

    /// Publish authorization hook; sees the event name being published.
    pub fn authorize_publish<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ChannelRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.publish_auth = Some(Arc::new(move |req| Box::pin(hook(req))));
        self
    }

    /// Presence data attached to this socket's roster entry and join event.
    pub fn presence_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Context) -> Value + Send + Sync + 'static,
    {
        self.presence_data = Some(Arc::new(f));
        self
    }

    pub fn broadcast_to_sender(mut self, include: bool) -> Self {
        self.broadcast_to_sender = include;
        self
    }
}

// ---------------------------------------------------------------------------
// Live channel state
// ---------------------------------------------------------------------------

struct ChannelState {
    kind: ChannelKind,
    members: HashSet<String>,
    /// Presence roster; keys always equal `members` for presence channels.
    roster: HashMap<String, Value>,
    broadcast_to_sender: bool,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ChannelManager {
    definitions: Vec<ChannelDefinition>,
    sockets: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    channels: Mutex<HashMap<String, ChannelState>>,
}

impl ChannelManager {
    pub fn new(definitions: Vec<ChannelDefinition>) -> Self {
        ChannelManager {
            definitions,
            sockets: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connected socket; the returned receiver is the socket's
    /// outbound frame queue (acks, events, presence traffic).
    pub fn register_socket(&self, socket_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets
            .lock()
            .expect("socket lock poisoned")
            .insert(socket_id.to_owned(), tx);
        rx
    }

    /// The outbound sender for a registered socket.  The WebSocket adapter
    /// routes router replies through this so channel traffic and RPC replies
    /// stay ordered on one queue.
    pub fn socket_sender(&self, socket_id: &str) -> Option<mpsc::UnboundedSender<Envelope>> {
        self.sockets
            .lock()
            .expect("socket lock poisoned")
            .get(socket_id)
            .cloned()
    }

    fn find_definition(&self, channel: &str) -> Option<(&ChannelDefinition, HashMap<String, String>)> {
        self.definitions
            .iter()
            .find_map(|def| def.pattern.matches(channel).map(|params| (def, params)))
    }

    fn send_to(&self, socket_id: &str, envelope: Envelope) {
        let sockets = self.sockets.lock().expect("socket lock poisoned");
        if let Some(tx) = sockets.get(socket_id) {
            if tx.send(envelope).is_err() {
                debug!(socket_id, "dropping frame for closed socket");
            }
        }
    }

    /// Subscribe `socket_id` to `channel`.  The ack is only enqueued after
    /// authorization resolves; for presence channels, existing members get a
    /// `presence:join` and the new member's ack carries the roster snapshot.
    pub async fn subscribe(
        &self,
        socket_id: &str,
        channel: &str,
        request_id: &str,
        ctx: &Context,
    ) -> Result<(), RpcError> {
        let Some((def, params)) = self.find_definition(channel) else {
            return Err(RpcError::new(
                ErrorCode::NotFound,
                format!("no channel matches '{channel}'"),
            ));
        };

        self.authorize_subscribe(def, socket_id, channel, params, ctx)
            .await?;

        let presence_entry = def
            .presence_data
            .as_ref()
            .map(|f| f(socket_id, ctx))
            .unwrap_or_else(|| json!({}));

        let mut channels = self.channels.lock().expect("channel lock poisoned");
        let state = channels
            .entry(channel.to_owned())
            .or_insert_with(|| ChannelState {
                kind: def.kind,
                members: HashSet::new(),
                roster: HashMap::new(),
                broadcast_to_sender: def.broadcast_to_sender,
            });

        let mut ack_payload = json!({ "channel": channel });
        if state.kind == ChannelKind::Presence {
            for member in &state.members {
                self.send_to(
                    member,
                    presence_frame(
                        FrameKind::PresenceJoin,
                        channel,
                        socket_id,
                        presence_entry.clone(),
                    ),
                );
            }
            state.roster.insert(socket_id.to_owned(), presence_entry);
            ack_payload["members"] = json!(state.roster);
        }
        state.members.insert(socket_id.to_owned());
        drop(channels);

        let mut ack = Envelope {
            id: request_id.to_owned(),
            procedure: String::new(),
            kind: FrameKind::Subscribed,
            payload: ack_payload,
            metadata: Default::default(),
            channel: Some(channel.to_owned()),
            event: None,
        };
        ack.metadata
            .insert("x-request-id".to_owned(), ctx.request_id.clone());
        self.send_to(socket_id, ack);
        Ok(())
    }

    async fn authorize_subscribe(
        &self,
        def: &ChannelDefinition,
        socket_id: &str,
        channel: &str,
        params: HashMap<String, String>,
        ctx: &Context,
    ) -> Result<(), RpcError> {
        if def.kind == ChannelKind::Public {
            return Ok(());
        }
        match &def.subscribe_auth {
            Some(hook) => {
                let request = ChannelRequest {
                    socket_id: socket_id.to_owned(),
                    channel: channel.to_owned(),
                    params,
                    context: ctx.clone(),
                    event: None,
                };
                if hook(request).await {
                    Ok(())
                } else {
                    Err(RpcError::new(
                        ErrorCode::PermissionDenied,
                        format!("subscription to '{channel}' denied"),
                    ))
                }
            }
            None => {
                if ctx.auth.as_ref().is_some_and(|a| a.authenticated) {
                    Ok(())
                } else {
                    Err(RpcError::new(
                        ErrorCode::Unauthenticated,
                        format!("'{channel}' requires authentication"),
                    ))
                }
            }
        }
    }

    /// Remove `socket_id` from `channel`, acking with `unsubscribed` and
    /// emitting `presence:leave` to remaining members where applicable.
    pub fn unsubscribe(&self, socket_id: &str, channel: &str, request_id: &str) {
        self.remove_membership(socket_id, channel);
        let ack = Envelope {
            id: request_id.to_owned(),
            procedure: String::new(),
            kind: FrameKind::Unsubscribed,
            payload: json!({ "channel": channel }),
            metadata: Default::default(),
            channel: Some(channel.to_owned()),
            event: None,
        };
        self.send_to(socket_id, ack);
    }

    fn remove_membership(&self, socket_id: &str, channel: &str) {
        let mut channels = self.channels.lock().expect("channel lock poisoned");
        let Some(state) = channels.get_mut(channel) else {
            return;
        };
        if !state.members.remove(socket_id) {
            return;
        }
        let leave_data = state.roster.remove(socket_id).unwrap_or(Value::Null);
        if state.kind == ChannelKind::Presence {
            for member in &state.members {
                self.send_to(
                    member,
                    presence_frame(
                        FrameKind::PresenceLeave,
                        channel,
                        socket_id,
                        leave_data.clone(),
                    ),
                );
            }
        }
        if state.members.is_empty() {
            channels.remove(channel);
        }
    }

    /// Publish `event` with `data` to every member of `channel` (minus the
    /// sender unless the channel opts in).
    pub async fn publish(
        &self,
        socket_id: &str,
        channel: &str,
        event: &str,
        data: Value,
        ctx: &Context,
    ) -> Result<(), RpcError> {
        let Some((def, params)) = self.find_definition(channel) else {
            return Err(RpcError::new(
                ErrorCode::NotFound,
                format!("no channel matches '{channel}'"),
            ));
        };

        if let Some(hook) = &def.publish_auth {
            let request = ChannelRequest {
                socket_id: socket_id.to_owned(),
                channel: channel.to_owned(),
                params,
                context: ctx.clone(),
                event: Some(event.to_owned()),
            };
            if !hook(request).await {
                return Err(RpcError::new(
                    ErrorCode::PermissionDenied,
                    format!("publish of '{event}' to '{channel}' denied"),
                ));
            }
        }

        // Fan out under the channel lock so concurrent publishes to one
        // channel are delivered in receipt order.  A channel nobody has
        // subscribed to yet has zero members: the fan-out is a no-op, not an
        // error.
        let channels = self.channels.lock().expect("channel lock poisoned");
        let Some(state) = channels.get(channel) else {
            return Ok(());
        };
        let frame = Envelope {
            id: Uuid::new_v4().to_string(),
            procedure: String::new(),
            kind: FrameKind::Event,
            payload: data,
            metadata: Default::default(),
            channel: Some(channel.to_owned()),
            event: Some(event.to_owned()),
        };
        for member in &state.members {
            if member == socket_id && !state.broadcast_to_sender {
                continue;
            }
            self.send_to(member, frame.clone());
        }
        Ok(())
    }

    /// Drop a disconnected socket from every channel it belonged to.
    pub fn on_disconnect(&self, socket_id: &str) {
        let member_of: Vec<String> = {
            let channels = self.channels.lock().expect("channel lock poisoned");
            channels
                .iter()
                .filter(|(_, state)| state.members.contains(socket_id))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for channel in member_of {
            self.remove_membership(socket_id, &channel);
        }
        if self
            .sockets
            .lock()
            .expect("socket lock poisoned")
            .remove(socket_id)
            .is_none()
        {
            warn!(socket_id, "disconnect for unknown socket");
        }
    }

    /// Current membership of `channel` (sorted; empty when absent).
    pub fn members(&self, channel: &str) -> Vec<String> {
        let channels = self.channels.lock().expect("channel lock poisoned");
        let mut members: Vec<String> = channels
            .get(channel)
            .map(|s| s.members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Presence roster of `channel`.
    pub fn roster(&self, channel: &str) -> HashMap<String, Value> {
        let channels = self.channels.lock().expect("channel lock poisoned");
        channels
            .get(channel)
            .map(|s| s.roster.clone())
            .unwrap_or_default()
    }
}

fn presence_frame(kind: FrameKind, channel: &str, socket_id: &str, data: Value) -> Envelope {
    Envelope {
        id: Uuid::new_v4().to_string(),
        procedure: String::new(),
        kind,
        payload: json!({ "socketId": socket_id, "data": data }),
        metadata: Default::default(),
        channel: Some(channel.to_owned()),
        event: None,
    }
}
