use anyhow::Result;
use futures_util::lock::Mutex;
use log::{
    debug,
    info,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    core::{
        error::InteractionError,
        hash::HashMap,
        id::Id,
        types::{
            Dictionary,
            List,
        },
        uri::Uri,
    },
    message::message::{
        EventMessage,
        Message,
    },
};

/// The most recent payload published to a managed topic.
///
/// Retained so that a late subscriber receives the current value as its
/// first event instead of waiting for the next publication.
#[derive(Debug, Clone)]
pub struct CachedEvent {
    pub publication_id: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

struct TopicSubscriber {
    session: Id,
    subscription_id: Id,
    event_tx: UnboundedSender<Message>,
}

/// A topic managed by the router: its subscribers, in subscription order,
/// and the last published payload.
///
/// Managed topics are created lazily on first subscribe or publish and live
/// for the rest of the process.
#[derive(Default)]
struct ManagedTopic {
    subscribers: Vec<TopicSubscriber>,
    last_published: Option<CachedEvent>,
}

#[derive(Default)]
struct PubSubState {
    realms: HashMap<Uri, HashMap<Uri, ManagedTopic>>,
    topics_by_session: HashMap<Id, Vec<(Uri, Uri)>>,
    next_subscription_id: u64,
    next_publication_id: u64,
}

/// The router's Pub/Sub registry.
///
/// A single mutex guards the whole structure. Events are fanned out inside
/// the publish critical section, so for any one topic, subscribers observe
/// publications in the order the publish calls completed.
#[derive(Default)]
pub struct PubSubManager {
    state: Mutex<PubSubState>,
}

impl PubSubManager {
    /// Subscribes a session to a topic, creating the managed topic on
    /// demand.
    ///
    /// Returns the subscription ID and, for a new subscriber, the cached
    /// last-published payload to deliver as its first event. Subscribing
    /// again to the same topic yields the existing subscription ID.
    pub async fn subscribe(
        &self,
        realm: &Uri,
        session: Id,
        event_tx: UnboundedSender<Message>,
        topic: Uri,
    ) -> Result<(Id, Option<CachedEvent>)> {
        let mut state = self.state.lock().await;
        state.next_subscription_id += 1;
        let subscription_id = Id::try_from(state.next_subscription_id).unwrap();

        let managed_topic = state
            .realms
            .entry(realm.clone())
            .or_default()
            .entry(topic.clone())
            .or_default();
        if let Some(existing) = managed_topic
            .subscribers
            .iter()
            .find(|subscriber| subscriber.session == session)
        {
            return Ok((existing.subscription_id, None));
        }

        managed_topic.subscribers.push(TopicSubscriber {
            session,
            subscription_id,
            event_tx,
        });
        let cached = managed_topic.last_published.clone();

        state
            .topics_by_session
            .entry(session)
            .or_default()
            .push((realm.clone(), topic.clone()));

        info!("Session {session} subscribed to {realm}::{topic} as {subscription_id}");
        Ok((subscription_id, cached))
    }

    /// Removes a subscription.
    pub async fn unsubscribe(&self, realm: &Uri, session: Id, subscription_id: Id) -> Result<()> {
        let mut state = self.state.lock().await;
        let topics = match state.realms.get_mut(realm) {
            Some(topics) => topics,
            None => return Err(InteractionError::NoSuchSubscription.into()),
        };
        let mut unsubscribed_topic = None;
        for (topic, managed_topic) in topics.iter_mut() {
            let before = managed_topic.subscribers.len();
            managed_topic.subscribers.retain(|subscriber| {
                subscriber.session != session || subscriber.subscription_id != subscription_id
            });
            if managed_topic.subscribers.len() != before {
                unsubscribed_topic = Some(topic.clone());
                break;
            }
        }
        let topic = match unsubscribed_topic {
            Some(topic) => topic,
            None => return Err(InteractionError::NoSuchSubscription.into()),
        };
        if let Some(session_topics) = state.topics_by_session.get_mut(&session) {
            session_topics.retain(|(_, subscribed)| *subscribed != topic);
        }
        info!("Session {session} unsubscribed from {realm}::{topic}");
        Ok(())
    }

    /// Publishes an event to a topic, creating the managed topic on demand.
    ///
    /// The payload is cached for late subscribers, then delivered to every
    /// subscriber except the publisher. Delivery to each subscriber is
    /// independent: a subscriber whose session closed concurrently is
    /// silently dropped.
    pub async fn publish(
        &self,
        realm: &Uri,
        publisher: Id,
        topic: Uri,
        arguments: List,
        arguments_keyword: Dictionary,
    ) -> Result<Id> {
        let mut state = self.state.lock().await;
        state.next_publication_id += 1;
        let publication_id = Id::try_from(state.next_publication_id).unwrap();

        let managed_topic = state
            .realms
            .entry(realm.clone())
            .or_default()
            .entry(topic.clone())
            .or_default();
        managed_topic.last_published = Some(CachedEvent {
            publication_id,
            arguments: arguments.clone(),
            arguments_keyword: arguments_keyword.clone(),
        });

        managed_topic.subscribers.retain(|subscriber| {
            if subscriber.session == publisher {
                return true;
            }
            let delivered = subscriber
                .event_tx
                .send(Message::Event(EventMessage {
                    subscribed_subscription: subscriber.subscription_id,
                    published_publication: publication_id,
                    details: Dictionary::default(),
                    publish_arguments: arguments.clone(),
                    publish_arguments_keyword: arguments_keyword.clone(),
                }))
                .is_ok();
            if !delivered {
                debug!(
                    "Pruned subscriber session {} from {realm}::{topic}",
                    subscriber.session
                );
            }
            delivered
        });

        Ok(publication_id)
    }

    /// Removes the session from every managed topic's subscriber set.
    pub async fn session_closed(&self, session: Id) {
        let mut state = self.state.lock().await;
        if let Some(session_topics) = state.topics_by_session.remove(&session) {
            for (realm, topic) in session_topics {
                if let Some(managed_topic) = state
                    .realms
                    .get_mut(&realm)
                    .and_then(|topics| topics.get_mut(&topic))
                {
                    managed_topic
                        .subscribers
                        .retain(|subscriber| subscriber.session != session);
                }
            }
        }
    }

    /// Builds the EVENT message that replays a cached payload to a new
    /// subscriber.
    pub fn replay_event(subscription_id: Id, cached: CachedEvent) -> Message {
        Message::Event(EventMessage {
            subscribed_subscription: subscription_id,
            published_publication: cached.publication_id,
            details: Dictionary::default(),
            publish_arguments: cached.arguments,
            publish_arguments_keyword: cached.arguments_keyword,
        })
    }
}

#[cfg(test)]
mod pub_sub_manager_test {
    use tokio::sync::mpsc::unbounded_channel;

    use crate::{
        core::{
            error::InteractionError,
            id::Id,
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::Uri,
        },
        message::message::Message,
        router::topic::PubSubManager,
    };

    fn realm() -> Uri {
        Uri::try_from("com.example.realm").unwrap()
    }

    fn topic() -> Uri {
        Uri::try_from("com.example.topic").unwrap()
    }

    #[tokio::test]
    async fn delivers_publications_to_subscribers_in_order() {
        let manager = PubSubManager::default();
        let publisher = Id::try_from(1).unwrap();
        let subscriber = Id::try_from(2).unwrap();
        let (tx, mut rx) = unbounded_channel();

        let (subscription_id, cached) = manager
            .subscribe(&realm(), subscriber, tx, topic())
            .await
            .unwrap();
        assert_matches::assert_matches!(cached, None);

        let first = manager
            .publish(
                &realm(),
                publisher,
                topic(),
                List::from_iter([Value::String("heads".to_owned())]),
                Dictionary::default(),
            )
            .await
            .unwrap();
        let second = manager
            .publish(
                &realm(),
                publisher,
                topic(),
                List::from_iter([Value::String("tails".to_owned())]),
                Dictionary::default(),
            )
            .await
            .unwrap();
        assert_ne!(first, second);

        assert_matches::assert_matches!(rx.recv().await, Some(Message::Event(event)) => {
            assert_eq!(event.subscribed_subscription, subscription_id);
            assert_eq!(event.published_publication, first);
            assert_eq!(event.publish_arguments, List::from_iter([Value::String("heads".to_owned())]));
        });
        assert_matches::assert_matches!(rx.recv().await, Some(Message::Event(event)) => {
            assert_eq!(event.published_publication, second);
            assert_eq!(event.publish_arguments, List::from_iter([Value::String("tails".to_owned())]));
        });
    }

    #[tokio::test]
    async fn excludes_publisher_from_its_own_publication() {
        let manager = PubSubManager::default();
        let session = Id::try_from(1).unwrap();
        let (tx, mut rx) = unbounded_channel();

        manager
            .subscribe(&realm(), session, tx, topic())
            .await
            .unwrap();
        manager
            .publish(&realm(), session, topic(), List::default(), Dictionary::default())
            .await
            .unwrap();

        assert_matches::assert_matches!(rx.try_recv(), Err(_));
    }

    #[tokio::test]
    async fn replays_cached_payload_to_late_subscriber() {
        let manager = PubSubManager::default();
        let publisher = Id::try_from(1).unwrap();
        let late_subscriber = Id::try_from(2).unwrap();
        let (tx, _rx) = unbounded_channel();

        let publication_id = manager
            .publish(
                &realm(),
                publisher,
                topic(),
                List::from_iter([Value::Integer(42)]),
                Dictionary::default(),
            )
            .await
            .unwrap();

        let (_, cached) = manager
            .subscribe(&realm(), late_subscriber, tx, topic())
            .await
            .unwrap();
        assert_matches::assert_matches!(cached, Some(cached) => {
            assert_eq!(cached.publication_id, publication_id);
            assert_eq!(cached.arguments, List::from_iter([Value::Integer(42)]));
        });
    }

    #[tokio::test]
    async fn deduplicates_subscriptions_per_session() {
        let manager = PubSubManager::default();
        let session = Id::try_from(1).unwrap();
        let (tx, _rx) = unbounded_channel();

        let (first, _) = manager
            .subscribe(&realm(), session, tx.clone(), topic())
            .await
            .unwrap();
        let (second, _) = manager
            .subscribe(&realm(), session, tx, topic())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stops_delivery_after_unsubscribe_and_session_close() {
        let manager = PubSubManager::default();
        let publisher = Id::try_from(1).unwrap();
        let subscriber = Id::try_from(2).unwrap();
        let (tx, mut rx) = unbounded_channel();

        let (subscription_id, _) = manager
            .subscribe(&realm(), subscriber, tx.clone(), topic())
            .await
            .unwrap();
        manager
            .unsubscribe(&realm(), subscriber, subscription_id)
            .await
            .unwrap();
        manager
            .publish(&realm(), publisher, topic(), List::default(), Dictionary::default())
            .await
            .unwrap();
        assert_matches::assert_matches!(rx.try_recv(), Err(_));

        assert_matches::assert_matches!(
            manager.unsubscribe(&realm(), subscriber, subscription_id).await,
            Err(err) => {
                assert_matches::assert_matches!(
                    err.downcast_ref::<InteractionError>(),
                    Some(InteractionError::NoSuchSubscription)
                );
            }
        );

        let other_topic = Uri::try_from("com.example.other").unwrap();
        manager
            .subscribe(&realm(), subscriber, tx, other_topic.clone())
            .await
            .unwrap();
        manager.session_closed(subscriber).await;
        manager
            .publish(&realm(), publisher, other_topic, List::default(), Dictionary::default())
            .await
            .unwrap();
        assert_matches::assert_matches!(rx.try_recv(), Err(_));
    }
}
