//! # Publish/Subscribe Flows
//!
//! End-to-end message flow between bus instances sharing one broker:
//! wildcard routing, fan-out, self-filtering, and payload decode errors.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use topic_bus::adapters::MemoryBroker;
    use topic_bus::ports::BrokerTransport;
    use topic_bus::{Bus, BusConfig, BusEvent};

    use crate::integration::support::{recorder, settle, wait_for_event};

    /// A connected producer/consumer pair over a fresh broker.
    async fn producer_consumer(config: BusConfig) -> (Arc<MemoryBroker>, Bus, Bus) {
        let broker = Arc::new(MemoryBroker::new());
        let producer = Bus::new(config.clone(), Arc::clone(&broker) as Arc<dyn BrokerTransport>);
        let consumer = Bus::new(config, Arc::clone(&broker) as Arc<dyn BrokerTransport>);
        producer.connect().await;
        consumer.connect().await;
        assert!(producer.is_connected().await);
        assert!(consumer.is_connected().await);
        (broker, producer, consumer)
    }

    #[tokio::test]
    async fn test_subscribe_connect_publish_delivers_matching_only() {
        let (_broker, producer, consumer) = producer_consumer(BusConfig::for_testing()).await;
        let (handler, seen) = recorder();
        consumer
            .subscribe("orders.*", handler)
            .await
            .expect("subscribe");

        producer
            .publish("orders.created", &serde_json::json!({ "id": 1 }))
            .await;
        producer
            .publish("shipping.created", &serde_json::json!({ "id": 2 }))
            .await;
        settle().await;

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "orders.created");
        assert_eq!(seen[0].1, serde_json::json!({ "id": 1 }));
    }

    #[tokio::test]
    async fn test_hash_subscription_spans_deep_keys() {
        let (_broker, producer, consumer) = producer_consumer(BusConfig::for_testing()).await;
        let (handler, seen) = recorder();
        consumer.subscribe("logs.#", handler).await.expect("subscribe");

        producer.publish("logs.api.request.failed", &serde_json::json!("deep")).await;
        // `#` needs at least one token after `logs`.
        producer.publish("logs", &serde_json::json!("bare")).await;
        settle().await;

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "logs.api.request.failed");
    }

    #[tokio::test]
    async fn test_message_fans_out_to_every_matching_consumer() {
        let broker = Arc::new(MemoryBroker::new());
        let producer = Bus::new(BusConfig::for_testing(), Arc::clone(&broker) as Arc<dyn BrokerTransport>);
        let first = Bus::new(BusConfig::for_testing(), Arc::clone(&broker) as Arc<dyn BrokerTransport>);
        let second = Bus::new(BusConfig::for_testing(), Arc::clone(&broker) as Arc<dyn BrokerTransport>);
        producer.connect().await;
        first.connect().await;
        second.connect().await;

        let (handler_a, seen_a) = recorder();
        let (handler_b, seen_b) = recorder();
        first.subscribe("metrics.*", handler_a).await.expect("subscribe");
        second.subscribe("metrics.#", handler_b).await.expect("subscribe");

        producer.publish("metrics.cpu", &serde_json::json!(99)).await;
        settle().await;

        assert_eq!(seen_a.lock().expect("lock").len(), 1);
        assert_eq!(seen_b.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_producer_with_no_local_ignores_own_messages() {
        let (_broker, producer, consumer) = producer_consumer(BusConfig::for_testing()).await;
        let (producer_handler, producer_seen) = recorder();
        let (consumer_handler, consumer_seen) = recorder();
        producer
            .subscribe("jobs.*", producer_handler)
            .await
            .expect("subscribe");
        consumer
            .subscribe("jobs.*", consumer_handler)
            .await
            .expect("subscribe");

        producer.publish("jobs.started", &serde_json::json!({})).await;
        settle().await;

        // Default no_local: the publisher filtered its own frame, the
        // other consumer received it.
        assert!(producer_seen.lock().expect("lock").is_empty());
        assert_eq!(consumer_seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_custom_exchange_name_end_to_end() {
        let config = BusConfig {
            exchange_name: "events".to_string(),
            ..BusConfig::for_testing()
        };
        let (_broker, producer, consumer) = producer_consumer(config).await;
        let (handler, seen) = recorder();
        consumer.subscribe("a.#", handler).await.expect("subscribe");

        producer.publish("a.b", &serde_json::json!(true)).await;
        settle().await;
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_inbound_payload_is_dropped() {
        let (broker, _producer, consumer) = producer_consumer(BusConfig::for_testing()).await;
        let mut events = consumer.events();
        let (handler, seen) = recorder();
        consumer
            .subscribe("orders.*", handler)
            .await
            .expect("subscribe");

        broker
            .inject_raw("gd_exchange", "orders.created", b"{truncated".to_vec())
            .expect("inject");

        let event = wait_for_event(&mut events, |e| matches!(e, BusEvent::Error(_))).await;
        let BusEvent::Error(message) = event else {
            unreachable!();
        };
        assert!(message.contains("payload decode failure"));
        assert!(seen.lock().expect("lock").is_empty());
        assert!(consumer.is_connected().await);
    }

    #[tokio::test]
    async fn test_typed_payloads_round_trip_through_json() {
        #[derive(serde::Serialize)]
        struct OrderCreated {
            id: u64,
            sku: String,
        }

        let (_broker, producer, consumer) = producer_consumer(BusConfig::for_testing()).await;
        let (handler, seen) = recorder();
        consumer
            .subscribe("orders.created", handler)
            .await
            .expect("subscribe");

        producer
            .publish(
                "orders.created",
                &OrderCreated {
                    id: 7,
                    sku: "widget".to_string(),
                },
            )
            .await;
        settle().await;

        let seen = seen.lock().expect("lock");
        assert_eq!(seen[0].1, serde_json::json!({ "id": 7, "sku": "widget" }));
    }

    #[tokio::test]
    async fn test_event_stream_reports_connect() {
        use tokio_stream::StreamExt;

        let broker = Arc::new(MemoryBroker::new());
        let bus = Bus::new(BusConfig::for_testing(), broker);
        let mut stream = bus.event_stream();
        bus.connect().await;

        let event = tokio::time::timeout(std::time::Duration::from_millis(500), stream.next())
            .await
            .expect("event within timeout");
        assert_eq!(event, Some(BusEvent::Connected));
    }
}
