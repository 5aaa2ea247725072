mod common;

use common::{
    AutoBroker, Grant, Harness, Sent, connack, pingresp, puback, quiet_options, suback, unsuback,
};
use embassy_time::Duration;
use mqtt_bridge_core::packet::SubAckReturnCode;
use mqtt_bridge_core::{
    ConnectOptions, ConnectReturnCode, ConnectionState, DisconnectReason, Event, MqttError,
    ProtocolError, QoS, SubscribeOutcome, SubscriptionStatus,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn subscribe_id(sent: &[Sent]) -> u16 {
    match sent {
        [Sent::Subscribe { packet_id, .. }] => *packet_id,
        other => panic!("expected a single SUBSCRIBE, got {other:?}"),
    }
}

#[test]
fn granted_qos_below_request_is_recorded() {
    let mut h = Harness::connected(quiet_options("sub-grant"));
    assert_eq!(
        h.engine.subscribe("sensors/+", QoS::AtLeastOnce, h.now),
        Ok(SubscribeOutcome::Sent)
    );
    let sent = h.sent();
    assert_eq!(
        sent,
        vec![Sent::Subscribe {
            packet_id: subscribe_id(&sent),
            filters: vec![("sensors/+".into(), QoS::AtLeastOnce)],
        }]
    );

    h.deliver(&suback(
        subscribe_id(&sent),
        &[SubAckReturnCode::Granted(QoS::AtMostOnce)],
    ));
    assert_eq!(
        h.events(),
        vec![Event::Subscribed {
            filter: "sensors/+".into(),
            granted: QoS::AtMostOnce,
        }]
    );
    let sub = h.engine.subscription("sensors/+").unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.requested, QoS::AtLeastOnce);
    assert_eq!(sub.granted, Some(QoS::AtMostOnce));
}

#[test]
fn grant_above_request_is_clamped() {
    let mut h = Harness::connected(quiet_options("sub-clamp"));
    h.engine.subscribe("a/b", QoS::AtMostOnce, h.now).unwrap();
    let packet_id = subscribe_id(&h.sent());
    h.deliver(&suback(packet_id, &[SubAckReturnCode::Granted(QoS::ExactlyOnce)]));
    assert_eq!(
        h.engine.subscription("a/b").and_then(|sub| sub.granted),
        Some(QoS::AtMostOnce)
    );
}

#[test]
fn refused_subscription_reports_an_error() {
    let mut h = Harness::connected(quiet_options("sub-refused"));
    h.engine.subscribe("secret/#", QoS::AtLeastOnce, h.now).unwrap();
    let packet_id = subscribe_id(&h.sent());
    h.deliver(&suback(packet_id, &[SubAckReturnCode::Failure]));
    assert_eq!(
        h.events(),
        vec![Event::SubscriptionError {
            filter: "secret/#".into(),
            reason: MqttError::SubscribeRejected,
        }]
    );
    assert_eq!(
        h.engine.subscription("secret/#").map(|sub| sub.status),
        Some(SubscriptionStatus::PendingRemoval)
    );
}

#[test]
fn refused_filter_is_dropped_locally_on_unsubscribe() {
    let mut h = Harness::connected(quiet_options("sub-refused-drop"));
    h.engine.subscribe("secret/#", QoS::AtLeastOnce, h.now).unwrap();
    h.engine.subscribe("open/#", QoS::AtLeastOnce, h.now).unwrap();
    let sent = h.sent();
    let [
        Sent::Subscribe {
            packet_id: refused, ..
        },
        Sent::Subscribe {
            packet_id: granted, ..
        },
    ] = sent.as_slice()
    else {
        panic!("expected two SUBSCRIBEs, got {sent:?}");
    };
    h.deliver(&suback(*refused, &[SubAckReturnCode::Failure]));
    h.deliver(&suback(
        *granted,
        &[SubAckReturnCode::Granted(QoS::AtLeastOnce)],
    ));
    h.events();

    let status = h.engine.status();
    assert_eq!(status.subscriptions, 1);
    assert!(h.engine.subscription("secret/#").unwrap().is_refused());

    assert_eq!(h.engine.unsubscribe("secret/#", h.now), Ok(true));
    assert!(h.sent().is_empty());
    assert_eq!(
        h.events(),
        vec![Event::Unsubscribed {
            filter: "secret/#".into()
        }]
    );
    assert!(h.engine.subscription("secret/#").is_none());
    assert_eq!(h.engine.status().subscriptions, 1);
}

#[test]
fn refused_filter_can_be_requested_again() {
    let mut h = Harness::connected(quiet_options("sub-refused-retry"));
    h.engine.subscribe("secret/#", QoS::AtLeastOnce, h.now).unwrap();
    let packet_id = subscribe_id(&h.sent());
    h.deliver(&suback(packet_id, &[SubAckReturnCode::Failure]));
    h.events();

    assert_eq!(
        h.engine.subscribe("secret/#", QoS::AtMostOnce, h.now),
        Ok(SubscribeOutcome::Sent)
    );
    let packet_id = subscribe_id(&h.sent());
    h.deliver(&suback(packet_id, &[SubAckReturnCode::Granted(QoS::AtMostOnce)]));
    assert_eq!(
        h.events(),
        vec![Event::Subscribed {
            filter: "secret/#".into(),
            granted: QoS::AtMostOnce
        }]
    );
    assert_eq!(h.engine.status().subscriptions, 1);
}

#[test]
fn suback_with_wrong_entry_count_is_malformed() {
    let options = quiet_options("sub-count").with_auto_reconnect(false);
    let mut h = Harness::connected(options);
    h.engine.subscribe("a", QoS::AtMostOnce, h.now).unwrap();
    let packet_id = subscribe_id(&h.sent());
    h.deliver(&suback(
        packet_id,
        &[
            SubAckReturnCode::Granted(QoS::AtMostOnce),
            SubAckReturnCode::Granted(QoS::AtMostOnce),
        ],
    ));
    assert_eq!(
        h.events(),
        vec![Event::Disconnected(DisconnectReason::Protocol(
            ProtocolError::MalformedPacket
        ))]
    );
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
}

#[test]
fn invalid_filters_are_rejected() {
    let mut h = Harness::connected(quiet_options("sub-invalid"));
    assert_eq!(
        h.engine.subscribe("a/#/b", QoS::AtMostOnce, h.now),
        Err(MqttError::InvalidTopic)
    );
    assert_eq!(
        h.engine.subscribe("", QoS::AtMostOnce, h.now),
        Err(MqttError::InvalidTopic)
    );
    assert!(h.sent().is_empty());
}

#[test]
fn repeated_subscribe_awaiting_suback_is_coalesced() {
    let mut h = Harness::connected(quiet_options("sub-coalesce"));
    assert_eq!(
        h.engine.subscribe("a/+", QoS::AtLeastOnce, h.now),
        Ok(SubscribeOutcome::Sent)
    );
    assert_eq!(
        h.engine.subscribe("a/+", QoS::AtLeastOnce, h.now),
        Ok(SubscribeOutcome::Coalesced)
    );
    assert_eq!(h.sent().len(), 1);
}

#[test]
fn unsubscribe_removes_filter_on_unsuback() {
    let mut h = Harness::connected(quiet_options("unsub"));
    h.engine.subscribe("a/+", QoS::AtLeastOnce, h.now).unwrap();
    let packet_id = subscribe_id(&h.sent());
    h.deliver(&suback(packet_id, &[SubAckReturnCode::Granted(QoS::AtLeastOnce)]));
    h.events();

    assert_eq!(h.engine.unsubscribe("a/+", h.now), Ok(true));
    let Some(Sent::Unsubscribe { packet_id, filters }) = h.sent().pop() else {
        panic!("expected UNSUBSCRIBE");
    };
    assert_eq!(filters, vec![String::from("a/+")]);
    assert_eq!(
        h.engine.subscription("a/+").map(|sub| sub.status),
        Some(SubscriptionStatus::PendingRemoval)
    );

    h.deliver(&unsuback(packet_id));
    assert_eq!(
        h.events(),
        vec![Event::Unsubscribed {
            filter: "a/+".into()
        }]
    );
    assert!(h.engine.subscription("a/+").is_none());
    assert_eq!(h.engine.unsubscribe("a/+", h.now), Ok(false));
}

#[test]
fn subscriptions_made_offline_go_out_after_connack() {
    let mut h = Harness::new();
    assert_eq!(
        h.engine.subscribe("cmd/#", QoS::ExactlyOnce, h.now),
        Ok(SubscribeOutcome::Deferred)
    );
    assert!(h.sent().is_empty());

    h.connect(quiet_options("sub-offline"));
    let sent = h.establish(false);
    assert!(matches!(
        sent.as_slice(),
        [Sent::Subscribe { filters, .. }] if filters == &vec![(String::from("cmd/#"), QoS::ExactlyOnce)]
    ));
}

#[test]
fn subscriptions_are_replayed_before_resent_messages() {
    let options = quiet_options("replay")
        .with_clean_session(false)
        .with_max_inflight(1);
    let mut h = Harness::connected(options);
    for filter in ["a/#", "b/+"] {
        h.engine.subscribe(filter, QoS::AtLeastOnce, h.now).unwrap();
        let packet_id = subscribe_id(&h.sent());
        h.deliver(&suback(packet_id, &[SubAckReturnCode::Granted(QoS::AtLeastOnce)]));
    }
    let in_flight = h
        .engine
        .publish("a/1", b"1", QoS::AtLeastOnce, false, h.now)
        .unwrap();
    let queued = h
        .engine
        .publish("a/2", b"2", QoS::AtLeastOnce, false, h.now)
        .unwrap();
    h.sent();
    h.events();

    h.drop_transport();
    h.wait_for_open();
    let sent = h.establish(false);
    assert_eq!(sent.len(), 2, "{sent:?}");
    let Sent::Subscribe { filters, .. } = &sent[0] else {
        panic!("expected SUBSCRIBE first, got {sent:?}");
    };
    assert_eq!(
        filters,
        &vec![
            (String::from("a/#"), QoS::AtLeastOnce),
            (String::from("b/+"), QoS::AtLeastOnce)
        ]
    );
    let Sent::Publish {
        dup: true,
        packet_id: Some(packet_id),
        ..
    } = &sent[1]
    else {
        panic!("expected the in-flight PUBLISH second, got {sent:?}");
    };

    h.deliver(&puback(*packet_id));
    let Some(Sent::Publish { dup: false, .. }) = h.sent().pop() else {
        panic!("expected the queued PUBLISH after the window opened");
    };
    let events = h.events();
    assert!(events.contains(&Event::DeliveryComplete(in_flight)));
    assert!(!events.contains(&Event::DeliveryComplete(queued)));
}

#[test]
fn clean_session_connect_forgets_acknowledged_subscriptions() {
    let mut h = Harness::connected(quiet_options("clean"));
    h.engine.subscribe("old/+", QoS::AtLeastOnce, h.now).unwrap();
    let packet_id = subscribe_id(&h.sent());
    h.deliver(&suback(packet_id, &[SubAckReturnCode::Granted(QoS::AtLeastOnce)]));
    h.engine.disconnect(h.now);
    h.sent();

    h.engine.subscribe("new/+", QoS::AtMostOnce, h.now).unwrap();
    h.connect(quiet_options("clean"));
    let sent = h.establish(false);
    assert!(matches!(
        sent.as_slice(),
        [Sent::Subscribe { filters, .. }] if filters == &vec![(String::from("new/+"), QoS::AtMostOnce)]
    ));
    assert!(h.engine.subscription("old/+").is_none());
}

/// Granted levels never exceed the request, and every reconnect re-subscribes before it
/// resends a single PUBLISH.
#[test]
fn replay_order_and_grants_hold_over_random_sessions() {
    const FILTERS: [&str; 4] = ["home/+/temp", "home/#", "alerts", "cmd/+/set"];

    for seed in 0..200u64 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let requested: Vec<QoS> = FILTERS
            .iter()
            .map(|_| QoS::try_from(rng.gen_range(0..=2u8)).unwrap())
            .collect();
        let grant = match rng.gen_range(0..4) {
            0 => Grant::Requested,
            n => Grant::Fixed(QoS::try_from(n as u8 - 1).unwrap()),
        };
        let options = quiet_options("prop-session")
            .with_clean_session(false)
            .with_max_inflight(rng.gen_range(1..=3))
            .with_max_retries(10)
            .with_jitter_seed(seed);
        let mut h = Harness::connected(options);
        let mut broker = AutoBroker::new(grant);
        let mut connected = true;

        for _ in 0..60 {
            match rng.gen_range(0..10) {
                0 | 1 => {
                    let i = rng.gen_range(0..FILTERS.len());
                    h.engine.subscribe(FILTERS[i], requested[i], h.now).unwrap();
                    let sent = h.sent();
                    broker.absorb(&sent);
                }
                2 | 3 => {
                    h.engine
                        .publish("home/kitchen/temp", b"20", QoS::AtLeastOnce, false, h.now)
                        .unwrap();
                    let sent = h.sent();
                    broker.absorb(&sent);
                }
                4..=6 if connected => {
                    let n = rng.gen_range(1..=4);
                    broker.release(&mut h, n);
                }
                7 if connected => {
                    h.drop_transport();
                    h.sent();
                    broker.reset();
                    connected = false;
                }
                8 | 9 if !connected => {
                    h.wait_for_open();
                    let session_present = rng.gen_bool(0.5);
                    let sent = h.establish(session_present);
                    if let Some(first_publish) = sent.iter().position(Sent::is_publish) {
                        assert!(
                            sent[first_publish..].iter().all(|p| !p.is_subscribe()),
                            "seed {seed}: SUBSCRIBE after PUBLISH in {sent:?}"
                        );
                        let active = h
                            .engine
                            .subscriptions()
                            .any(|sub| sub.status != SubscriptionStatus::PendingRemoval);
                        if active {
                            assert!(sent[0].is_subscribe(), "seed {seed}: {sent:?}");
                        }
                    }
                    broker.absorb(&sent);
                    connected = true;
                }
                _ => {}
            }

            for event in h.events() {
                if let Event::Subscribed { filter, granted } = event {
                    let i = FILTERS.iter().position(|f| *f == filter).unwrap();
                    assert!(granted <= requested[i], "seed {seed}: {filter} at {granted}");
                }
            }
            for sub in h.engine.subscriptions() {
                if let Some(granted) = sub.granted {
                    assert!(granted <= sub.requested, "seed {seed}: {}", sub.filter);
                }
            }
        }
    }
}

#[test]
fn keep_alive_sends_one_ping_per_idle_interval() {
    let options = ConnectOptions::new("keepalive").with_keep_alive(Duration::from_secs(10));
    let mut h = Harness::connected(options);

    h.advance(Duration::from_secs(15));
    assert_eq!(h.sent(), vec![Sent::PingReq]);

    h.deliver(&pingresp());
    assert!(h.events().is_empty());
    assert_eq!(h.engine.state(), ConnectionState::Connected);
    assert!(h.sent().is_empty());
}

#[test]
fn unanswered_ping_drops_the_connection() {
    let options = ConnectOptions::new("keepalive-timeout")
        .with_keep_alive(Duration::from_secs(10))
        .with_ping_timeout(Duration::from_secs(5))
        .with_auto_reconnect(false);
    let mut h = Harness::connected(options);

    h.advance(Duration::from_secs(10));
    assert_eq!(h.sent(), vec![Sent::PingReq]);
    h.advance(Duration::from_secs(5));
    assert_eq!(h.sent(), vec![Sent::Close]);
    assert_eq!(
        h.events(),
        vec![Event::Disconnected(DisconnectReason::PingTimeout)]
    );
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
}

#[test]
fn rejected_connect_fails_the_request() {
    let mut h = Harness::new();
    h.connect(quiet_options("rejected"));
    assert_eq!(h.sent(), vec![Sent::Open]);
    assert!(matches!(h.open_transport().as_slice(), [Sent::Connect { .. }]));

    h.deliver(&connack(false, ConnectReturnCode::NotAuthorized));
    let error = MqttError::ConnectRejected(ConnectReturnCode::NotAuthorized);
    assert_eq!(h.engine.take_connect_outcome(), Some(Err(error)));
    assert_eq!(h.events(), vec![Event::ConnectionFailed(error)]);
    assert_eq!(h.sent(), vec![Sent::Close]);
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
}

#[test]
fn missing_connack_times_out() {
    let mut h = Harness::new();
    h.connect(quiet_options("slow").with_connect_timeout(Duration::from_secs(5)));
    h.open_transport();

    h.advance(Duration::from_secs(5));
    assert_eq!(
        h.engine.take_connect_outcome(),
        Some(Err(MqttError::ConnectTimeout))
    );
    assert_eq!(
        h.events(),
        vec![Event::ConnectionFailed(MqttError::ConnectTimeout)]
    );
}

#[test]
fn transport_open_failure_fails_the_connect() {
    let mut h = Harness::new();
    h.connect(quiet_options("unreachable"));
    h.sent();
    h.drop_transport();
    assert_eq!(
        h.engine.take_connect_outcome(),
        Some(Err(MqttError::Transport))
    );
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
    assert_eq!(h.engine.connect(quiet_options("unreachable"), h.now), Ok(()));
}

#[test]
fn reconnect_backs_off_until_attempts_run_out() {
    let options = quiet_options("backoff")
        .with_backoff(Duration::from_secs(1), Duration::from_secs(4))
        .with_max_reconnect_attempts(2);
    let mut h = Harness::connected(options);

    h.drop_transport();
    let events = h.events();
    let Event::Reconnecting { attempt: 1, delay } = &events[1] else {
        panic!("expected first reconnect, got {events:?}");
    };
    assert!((500..=1_000).contains(&delay.as_millis()));
    assert_eq!(h.engine.state(), ConnectionState::Reconnecting);

    h.wait_for_open();
    h.drop_transport();
    let events = h.events();
    let [Event::Reconnecting { attempt: 2, delay }] = events.as_slice() else {
        panic!("expected second reconnect, got {events:?}");
    };
    assert!((1_000..=2_000).contains(&delay.as_millis()));
    assert_eq!(h.engine.status().reconnect_attempt, 2);

    h.wait_for_open();
    h.drop_transport();
    assert_eq!(
        h.events(),
        vec![Event::ConnectionFailed(MqttError::ReconnectExhausted)]
    );
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
    assert_eq!(h.engine.next_deadline(), None);
}

#[test]
fn permanent_rejection_stops_reconnecting() {
    let mut h = Harness::connected(quiet_options("banned"));
    h.drop_transport();
    h.events();

    h.wait_for_open();
    h.open_transport();
    h.deliver(&connack(false, ConnectReturnCode::ServerUnavailable));
    assert!(matches!(
        h.events().as_slice(),
        [Event::Reconnecting { attempt: 2, .. }]
    ));

    h.wait_for_open();
    h.open_transport();
    h.deliver(&connack(false, ConnectReturnCode::BadUserNameOrPassword));
    assert_eq!(
        h.events(),
        vec![Event::ConnectionFailed(MqttError::ConnectRejected(
            ConnectReturnCode::BadUserNameOrPassword
        ))]
    );
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
}

#[test]
fn host_reconnect_skips_the_backoff_delay() {
    let mut h = Harness::connected(quiet_options("impatient"));
    assert_eq!(h.engine.reconnect(h.now), Ok(()));
    assert_eq!(h.engine.take_connect_outcome(), Some(Ok(())));

    h.drop_transport();
    h.sent();
    h.engine.reconnect(h.now).unwrap();
    assert_eq!(h.sent(), vec![Sent::Open]);
    h.establish(false);
    assert_eq!(h.engine.take_connect_outcome(), Some(Ok(())));
    assert!(h.events().contains(&Event::Connected {
        session_present: false,
        reconnect: true
    }));
}

#[test]
fn garbage_from_the_broker_is_a_protocol_error() {
    let mut h = Harness::connected(quiet_options("garbage"));
    h.deliver(&[0xF0, 0x00]);
    let events = h.events();
    assert_eq!(
        events[0],
        Event::Disconnected(DisconnectReason::Protocol(ProtocolError::InvalidPacketType(
            15
        )))
    );
    assert!(matches!(events[1], Event::Reconnecting { attempt: 1, .. }));
}

#[test]
fn shutdown_is_terminal() {
    let mut h = Harness::connected(quiet_options("shutdown"));
    h.engine.subscribe("a", QoS::AtMostOnce, h.now).unwrap();
    h.sent();

    h.engine.shutdown(h.now);
    assert_eq!(h.sent(), vec![Sent::Disconnect, Sent::Close]);
    assert_eq!(
        h.events(),
        vec![
            Event::Disconnected(DisconnectReason::Requested),
            Event::Closed
        ]
    );
    assert_eq!(h.engine.state(), ConnectionState::Closed);
    assert_eq!(
        h.engine.publish("a", b"x", QoS::AtLeastOnce, false, h.now),
        Err(MqttError::NotConnected)
    );
    assert_eq!(
        h.engine.subscribe("b", QoS::AtMostOnce, h.now),
        Err(MqttError::NotConnected)
    );

    h.engine.shutdown(h.now);
    assert!(h.events().is_empty());
}

#[test]
fn connect_while_connected_is_refused() {
    let mut h = Harness::connected(quiet_options("twice"));
    assert_eq!(
        h.engine.connect(quiet_options("twice"), h.now),
        Err(MqttError::AlreadyConnected)
    );
    let status = h.engine.status();
    assert!(status.is_connected());
    assert_eq!(status.reconnect_attempt, 0);
}
