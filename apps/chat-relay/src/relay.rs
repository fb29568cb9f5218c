use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::RelayError;
use crate::event::{ChatEvent, ClientEvent, EventBody, EventIds};
use crate::history::HistoryBuffer;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::session::SessionResolver;
use crate::storage::SessionStore;
use crate::store::{MessageStream, StoreHandle};

/// Publishes chat events to the shared channel and fans the channel back out
/// to every connection bound on this process.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    store: StoreHandle,
    sessions: SessionStore,
    resolver: SessionResolver,
    history: HistoryBuffer,
    registry: Arc<ConnectionRegistry>,
    ids: Arc<EventIds>,
    channel: String,
    resubscribe_backoff: Duration,
}

/// What a connection is told once it has been admitted.
enum Greeting {
    /// Sent only to the joining connection
    Direct(String),
    /// Published to the room
    Broadcast(ChatEvent),
}

impl Relay {
    pub fn new(
        store: StoreHandle,
        registry: Arc<ConnectionRegistry>,
        ids: Arc<EventIds>,
        config: &Config,
    ) -> Self {
        let sessions = SessionStore::new(store.clone(), config.keyspace.clone());
        let history = HistoryBuffer::new(
            store.clone(),
            config.keyspace.history.clone(),
            config.history_limit,
        );
        Self {
            inner: Arc::new(RelayInner {
                resolver: SessionResolver::new(sessions.clone()),
                store,
                sessions,
                history,
                registry,
                ids,
                channel: config.keyspace.channel.clone(),
                resubscribe_backoff: config.resubscribe_backoff,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.inner.history
    }

    pub fn ids(&self) -> &Arc<EventIds> {
        &self.inner.ids
    }

    /// Subscribe to the shared channel and spawn the fan-out task. The
    /// subscription is live when this returns.
    pub async fn start(&self) -> Result<JoinHandle<()>, RelayError> {
        let stream = self.inner.store.subscribe(&self.inner.channel).await?;
        info!(channel = %self.inner.channel, "subscribed to relay channel");
        let relay = self.clone();
        Ok(tokio::spawn(async move { relay.pump(stream).await }))
    }

    async fn pump(self, mut stream: MessageStream) {
        loop {
            while let Some((channel, payload)) = stream.next().await {
                if channel != self.inner.channel {
                    continue;
                }
                self.deliver(&payload);
            }

            warn!(channel = %self.inner.channel, "relay subscription ended; resubscribing");
            stream = loop {
                tokio::time::sleep(self.inner.resubscribe_backoff).await;
                match self.inner.store.subscribe(&self.inner.channel).await {
                    Ok(stream) => break stream,
                    Err(err) => {
                        warn!(error = %err, "resubscribe failed; retrying");
                    }
                }
            };
        }
    }

    /// Hand a channel payload to every local connection, regardless of which
    /// process published it. Returns the number of connections reached.
    pub fn deliver(&self, payload: &str) -> usize {
        if let Err(err) = ChatEvent::decode(payload) {
            warn!(error = %err, "dropping undecodable channel payload");
            return 0;
        }
        let mut delivered = 0usize;
        self.inner.registry.for_each_local(|handle, _| {
            if handle.send(payload) {
                delivered += 1;
            }
        });
        counter!("chat_relay_events_delivered_total", delivered as u64);
        delivered
    }

    /// Serialize once, publish to the channel and, for chat messages, append
    /// to the shared history.
    pub async fn publish(&self, event: &ChatEvent) -> Result<(), RelayError> {
        let payload = event.encode()?;
        self.inner
            .store
            .publish(&self.inner.channel, &payload)
            .await?;
        counter!(
            "chat_relay_events_published_total",
            1,
            "type" => event.body.kind()
        );
        if event.is_message() {
            self.inner.history.append(&payload).await?;
        }
        Ok(())
    }

    /// Resolve the connection's session, replay history, greet it and bind it.
    pub async fn admit(
        &self,
        handle: &ConnectionHandle,
        requested: Option<&str>,
    ) -> Result<String, RelayError> {
        let resource_id = handle.resource_label();
        let resolution = self.inner.resolver.resolve(&resource_id, requested).await?;
        let session_id = resolution.session_id;

        let greeting = match self.prepare(&resource_id, &session_id, resolution.reused).await {
            Ok(greeting) => greeting,
            Err(err) => {
                // A freshly issued id must not leave a binding without activity.
                if !resolution.reused {
                    if let Err(cleanup) = self.inner.sessions.remove_binding(&session_id).await {
                        warn!(session_id = %session_id, error = %cleanup, "failed to drop unused binding");
                    }
                }
                return Err(err);
            }
        };

        // Queued before the bind so live fan-out cannot overtake the replay.
        match self.inner.history.replay().await {
            Ok(entries) => {
                debug!(%resource_id, entries = entries.len(), "replaying history");
                for entry in entries {
                    handle.send(entry);
                }
            }
            Err(err) => {
                warn!(%resource_id, error = %err, "history replay failed");
            }
        }
        let announce = match greeting {
            Greeting::Direct(payload) => {
                handle.send(payload);
                None
            }
            Greeting::Broadcast(event) => Some(event),
        };

        if self.inner.registry.bind(handle, &session_id).is_err() {
            return Err(RelayError::InvalidIdentity(session_id));
        }
        info!(
            %resource_id,
            session_id = %session_id,
            reused = resolution.reused,
            "connection admitted"
        );

        if let Some(event) = announce {
            if let Err(err) = self.publish(&event).await {
                warn!(%resource_id, error = %err, "failed to announce returning session");
            }
        }

        Ok(session_id)
    }

    /// Store steps of admission that can refuse the connection.
    async fn prepare(
        &self,
        resource_id: &str,
        session_id: &str,
        reused: bool,
    ) -> Result<Greeting, RelayError> {
        if reused {
            self.inner
                .sessions
                .bind_connection(session_id, resource_id)
                .await?;
        }

        let greeting = match self.inner.sessions.display_name(session_id).await? {
            Some(user_name) if !user_name.is_empty() => Greeting::Broadcast(ChatEvent::new(
                self.inner.ids.next(),
                resource_id,
                session_id,
                EventBody::UserName { user_name },
            )),
            _ => Greeting::Direct(
                ChatEvent::new(
                    self.inner.ids.next(),
                    resource_id,
                    session_id,
                    EventBody::SessionInit,
                )
                .encode()?,
            ),
        };
        self.inner.sessions.touch(session_id).await?;
        Ok(greeting)
    }

    pub async fn handle_client_event(
        &self,
        handle: &ConnectionHandle,
        session_id: &str,
        event: ClientEvent,
    ) -> Result<(), RelayError> {
        match event {
            ClientEvent::UserName { user_name } => {
                self.set_user_name(handle, session_id, user_name).await
            }
            ClientEvent::Message { message } => {
                self.relay_message(handle, session_id, message).await
            }
        }
    }

    async fn set_user_name(
        &self,
        handle: &ConnectionHandle,
        session_id: &str,
        user_name: String,
    ) -> Result<(), RelayError> {
        let user_name = user_name.trim().to_string();
        let event = ChatEvent::new(
            self.inner.ids.next(),
            handle.resource_label(),
            session_id,
            EventBody::UserName {
                user_name: user_name.clone(),
            },
        );
        if user_name.is_empty() {
            let payload = event.with_error("display name must not be empty").encode()?;
            handle.send(payload);
            return Ok(());
        }

        let write = async {
            if !self.inner.sessions.is_active(session_id).await? {
                return Ok(false);
            }
            self.inner
                .sessions
                .set_display_name(session_id, &user_name)
                .await?;
            Ok::<_, RelayError>(true)
        };

        match write.await {
            Ok(true) => {
                self.publish(&event).await?;
                if let Err(err) = self.inner.sessions.touch(session_id).await {
                    warn!(session_id = %session_id, error = %err, "failed to refresh activity");
                }
                Ok(())
            }
            Ok(false) => {
                close_with_notice(&self.inner.ids, handle, session_id, "session expired");
                Err(RelayError::InvalidIdentity(session_id.to_string()))
            }
            Err(err) => {
                let event = event.with_error(err.to_string());
                if let Err(publish_err) = self.publish(&event).await {
                    debug!(error = %publish_err, "publish failed; informing sender directly");
                    handle.send(event.encode()?);
                }
                Err(err)
            }
        }
    }

    async fn relay_message(
        &self,
        handle: &ConnectionHandle,
        session_id: &str,
        message: String,
    ) -> Result<(), RelayError> {
        let user_name = self
            .inner
            .sessions
            .display_name(session_id)
            .await?
            .filter(|name| !name.is_empty());
        let Some(user_name) = user_name else {
            close_with_notice(
                &self.inner.ids,
                handle,
                session_id,
                "a display name is required before sending messages",
            );
            return Err(RelayError::InvalidIdentity(session_id.to_string()));
        };

        let event = ChatEvent::new(
            self.inner.ids.next(),
            handle.resource_label(),
            session_id,
            EventBody::Message { user_name, message },
        );
        self.publish(&event).await?;
        if let Err(err) = self.inner.sessions.touch(session_id).await {
            warn!(session_id = %session_id, error = %err, "failed to refresh activity");
        }
        Ok(())
    }

    /// Tear down after the transport closed. A connection already released by
    /// the janitor is a no-op.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        let Some(session_id) = self.inner.registry.unbind(handle.resource_id()) else {
            return;
        };
        let resource_id = handle.resource_label();

        match self.inner.sessions.display_name(&session_id).await {
            Ok(Some(user_name)) if !user_name.is_empty() => {
                let event = ChatEvent::new(
                    self.inner.ids.next(),
                    resource_id.as_str(),
                    session_id.as_str(),
                    EventBody::Disconnected {
                        user_name: Some(user_name),
                        message: None,
                    },
                );
                if let Err(err) = self.publish(&event).await {
                    warn!(session_id = %session_id, error = %err, "failed to announce disconnect");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to look up display name");
            }
        }

        // A reconnect may already have rebound the session elsewhere.
        match self.inner.sessions.bound_connection(&session_id).await {
            Ok(Some(bound)) if bound == resource_id => {
                if let Err(err) = self.inner.sessions.remove_binding(&session_id).await {
                    warn!(session_id = %session_id, error = %err, "failed to remove binding");
                }
            }
            Ok(_) => {
                debug!(session_id = %session_id, %resource_id, "binding not owned by this connection");
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to read binding");
            }
        }

        info!(session_id = %session_id, %resource_id, "connection released");
    }
}

/// Tell a connection why it is being dropped, then close it. Sent directly,
/// never published.
pub(crate) fn close_with_notice(
    ids: &EventIds,
    handle: &ConnectionHandle,
    session_id: &str,
    reason: &str,
) {
    let event = ChatEvent::new(
        ids.next(),
        handle.resource_label(),
        session_id,
        EventBody::Disconnected {
            user_name: None,
            message: Some(reason.to_string()),
        },
    );
    match event.encode() {
        Ok(payload) => {
            handle.send(payload);
        }
        Err(err) => warn!(error = %err, "failed to encode disconnect notice"),
    }
    handle.close(reason);
    counter!("chat_relay_forced_closes_total", 1);
    info!(
        session_id = %session_id,
        resource_id = handle.resource_id(),
        %reason,
        "connection force-closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use crate::store::{MemoryStore, Store};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        store: MemoryStore,
        relay: Relay,
        _pump: JoinHandle<()>,
    }

    async fn harness() -> Harness {
        harness_with(Config::default()).await
    }

    async fn harness_with(config: Config) -> Harness {
        let store = MemoryStore::new();
        let relay = Relay::new(
            Arc::new(store.clone()),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(EventIds::new()),
            &config,
        );
        let pump = relay.start().await.unwrap();
        Harness {
            store,
            relay,
            _pump: pump,
        }
    }

    async fn next(rx: &mut UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no frame within a second")
            .expect("writer channel closed")
    }

    async fn next_event(rx: &mut UnboundedReceiver<Outbound>) -> ChatEvent {
        match next(rx).await {
            Outbound::Event(payload) => ChatEvent::decode(&payload).unwrap(),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn fresh_connection_receives_session_init() {
        let h = harness().await;
        let (handle, mut rx) = h.relay.registry().open();
        let session_id = h.relay.admit(&handle, None).await.unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.body, EventBody::SessionInit);
        assert_eq!(event.session_id, session_id);
        assert_eq!(event.resource_id, handle.resource_label());
        assert!(h.relay.sessions().is_active(&session_id).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn message_before_name_closes_without_broadcast() {
        let h = harness().await;
        let (anon, mut anon_rx) = h.relay.registry().open();
        let (watcher, mut watcher_rx) = h.relay.registry().open();
        let anon_session = h.relay.admit(&anon, None).await.unwrap();
        h.relay.admit(&watcher, None).await.unwrap();
        next_event(&mut anon_rx).await;
        next_event(&mut watcher_rx).await;

        let result = h
            .relay
            .handle_client_event(
                &anon,
                &anon_session,
                ClientEvent::Message {
                    message: "hi".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::InvalidIdentity(_))));

        let notice = next_event(&mut anon_rx).await;
        assert!(matches!(notice.body, EventBody::Disconnected { .. }));
        assert!(matches!(next(&mut anon_rx).await, Outbound::Close(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher_rx.try_recv().is_err());
        assert!(h.relay.history().recent().await.unwrap().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn named_message_reaches_everyone_and_history() {
        let h = harness().await;
        let (sender, mut sender_rx) = h.relay.registry().open();
        let (watcher, mut watcher_rx) = h.relay.registry().open();
        let session_id = h.relay.admit(&sender, None).await.unwrap();
        h.relay.admit(&watcher, None).await.unwrap();
        next_event(&mut sender_rx).await;
        next_event(&mut watcher_rx).await;

        h.relay
            .handle_client_event(
                &sender,
                &session_id,
                ClientEvent::UserName {
                    user_name: "Ash".into(),
                },
            )
            .await
            .unwrap();
        h.relay
            .handle_client_event(
                &sender,
                &session_id,
                ClientEvent::Message {
                    message: "hi".into(),
                },
            )
            .await
            .unwrap();

        for rx in [&mut sender_rx, &mut watcher_rx] {
            let named = next_event(rx).await;
            assert_eq!(
                named.body,
                EventBody::UserName {
                    user_name: "Ash".into()
                }
            );
            assert!(!named.error);
            let message = next_event(rx).await;
            assert_eq!(
                message.body,
                EventBody::Message {
                    user_name: "Ash".into(),
                    message: "hi".into()
                }
            );
            assert!(message.id > named.id);
        }
        assert_eq!(h.relay.history().recent().await.unwrap().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_name_write_is_reported_to_the_sender() {
        let h = harness().await;
        let (handle, mut rx) = h.relay.registry().open();
        let session_id = h.relay.admit(&handle, None).await.unwrap();
        next_event(&mut rx).await;

        h.store.set_unavailable(true);
        let result = h
            .relay
            .handle_client_event(
                &handle,
                &session_id,
                ClientEvent::UserName {
                    user_name: "Ash".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::StoreUnavailable(_))));

        let event = next_event(&mut rx).await;
        assert!(event.error);
        assert!(event.error_info.is_some());
        h.store.set_unavailable(false);
        assert!(h.relay.sessions().display_name(&session_id).await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn naming_an_expired_session_closes_the_connection() {
        let h = harness().await;
        let (handle, mut rx) = h.relay.registry().open();
        let session_id = h.relay.admit(&handle, None).await.unwrap();
        next_event(&mut rx).await;
        h.relay.sessions().remove_activity(&session_id).await.unwrap();

        let result = h
            .relay
            .handle_client_event(
                &handle,
                &session_id,
                ClientEvent::UserName {
                    user_name: "Ash".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::InvalidIdentity(_))));
        assert!(matches!(
            next_event(&mut rx).await.body,
            EventBody::Disconnected { .. }
        ));
        assert!(matches!(next(&mut rx).await, Outbound::Close(_)));
        assert!(h.relay.sessions().display_name(&session_id).await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn disconnect_announces_only_named_sessions() {
        let h = harness().await;
        let (watcher, mut watcher_rx) = h.relay.registry().open();
        h.relay.admit(&watcher, None).await.unwrap();
        next_event(&mut watcher_rx).await;

        let (anon, _anon_rx) = h.relay.registry().open();
        let anon_session = h.relay.admit(&anon, None).await.unwrap();
        h.relay.disconnect(&anon).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher_rx.try_recv().is_err());
        assert!(h
            .relay
            .sessions()
            .bound_connection(&anon_session)
            .await
            .unwrap()
            .is_none());

        let (named, _named_rx) = h.relay.registry().open();
        let named_session = h.relay.admit(&named, None).await.unwrap();
        h.relay
            .handle_client_event(
                &named,
                &named_session,
                ClientEvent::UserName {
                    user_name: "Ash".into(),
                },
            )
            .await
            .unwrap();
        next_event(&mut watcher_rx).await;
        h.relay.disconnect(&named).await;

        let event = next_event(&mut watcher_rx).await;
        assert_eq!(
            event.body,
            EventBody::Disconnected {
                user_name: Some("Ash".into()),
                message: None
            }
        );
        assert_eq!(h.relay.registry().len(), 1);
        // Identity outlives the connection until the janitor expires it.
        assert!(h.relay.sessions().is_active(&named_session).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn disconnect_keeps_a_binding_taken_over_by_a_reconnect() {
        let h = harness().await;
        let (first, _first_rx) = h.relay.registry().open();
        let session_id = h.relay.admit(&first, None).await.unwrap();
        let (second, _second_rx) = h.relay.registry().open();
        h.relay.admit(&second, Some(&session_id)).await.unwrap();

        h.relay.disconnect(&first).await;
        assert_eq!(
            h.relay
                .sessions()
                .bound_connection(&session_id)
                .await
                .unwrap(),
            Some(second.resource_label())
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn sibling_relays_share_the_room() {
        let store = MemoryStore::new();
        let config = Config::default();
        let make = || {
            Relay::new(
                Arc::new(store.clone()),
                Arc::new(ConnectionRegistry::new()),
                Arc::new(EventIds::new()),
                &config,
            )
        };
        let (east, west) = (make(), make());
        let _east_pump = east.start().await.unwrap();
        let _west_pump = west.start().await.unwrap();

        let (speaker, mut speaker_rx) = east.registry().open();
        let (listener, mut listener_rx) = west.registry().open();
        let session_id = east.admit(&speaker, None).await.unwrap();
        west.admit(&listener, None).await.unwrap();
        next_event(&mut speaker_rx).await;
        next_event(&mut listener_rx).await;

        store
            .hset(&config.keyspace.users, &session_id, "Ash")
            .await
            .unwrap();
        east.handle_client_event(
            &speaker,
            &session_id,
            ClientEvent::Message {
                message: "across".into(),
            },
        )
        .await
        .unwrap();

        let heard = next_event(&mut listener_rx).await;
        assert_eq!(
            heard.body,
            EventBody::Message {
                user_name: "Ash".into(),
                message: "across".into()
            }
        );
        assert_eq!(heard.resource_id, speaker.resource_label());
        assert!(matches!(
            next_event(&mut speaker_rx).await.body,
            EventBody::Message { .. }
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn undecodable_channel_payloads_are_dropped() {
        let h = harness().await;
        let (handle, mut rx) = h.relay.registry().open();
        h.relay.admit(&handle, None).await.unwrap();
        next_event(&mut rx).await;
        assert_eq!(h.relay.deliver("{not json"), 0);
        assert!(rx.try_recv().is_err());
    }

    fn chat_message(id: u64, text: &str) -> String {
        ChatEvent::new(
            id,
            "9",
            "0123456789abcdef0123456789abcdef",
            EventBody::Message {
                user_name: "Misty".into(),
                message: text.into(),
            },
        )
        .encode()
        .unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn replay_and_greeting_precede_live_traffic() {
        let h = harness().await;
        h.relay
            .history()
            .append(&chat_message(1, "earlier"))
            .await
            .unwrap();

        let (handle, mut rx) = h.relay.registry().open();
        h.relay.admit(&handle, None).await.unwrap();
        h.relay.deliver(&chat_message(2, "live"));

        let replayed = next_event(&mut rx).await;
        assert!(matches!(&replayed.body, EventBody::Message { message, .. } if message == "earlier"));
        assert_eq!(next_event(&mut rx).await.body, EventBody::SessionInit);
        let live = next_event(&mut rx).await;
        assert!(matches!(&live.body, EventBody::Message { message, .. } if message == "live"));
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_admission_drops_the_fresh_binding() {
        let h = harness().await;
        let (handle, _rx) = h.relay.registry().open();
        // Issuing the id binds it; the display-name lookup after that fails.
        h.store.fail_nth_call(2);

        let result = h.relay.admit(&handle, None).await;
        assert!(matches!(result, Err(RelayError::StoreUnavailable(_))));
        assert!(h
            .store
            .hgetall(&Config::default().keyspace.sessions)
            .await
            .unwrap()
            .is_empty());
        assert!(h.relay.registry().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn fan_out_survives_a_lost_subscription() {
        let h = harness_with(Config {
            resubscribe_backoff: Duration::from_millis(10),
            ..Config::default()
        })
        .await;
        let (handle, mut rx) = h.relay.registry().open();
        h.relay.admit(&handle, None).await.unwrap();
        next_event(&mut rx).await;

        h.store.close_subscriptions();
        let channel = Config::default().keyspace.channel;
        let payload = chat_message(5, "after reconnect");
        // Publishing before the resubscribe lands is lost, as with Redis.
        let event = loop {
            h.store.publish(&channel, &payload).await.unwrap();
            match tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
                Ok(Some(Outbound::Event(json))) => break ChatEvent::decode(&json).unwrap(),
                Ok(other) => panic!("unexpected frame {other:?}"),
                Err(_) => continue,
            }
        };
        assert!(matches!(&event.body, EventBody::Message { message, .. } if message == "after reconnect"));
    }
}
