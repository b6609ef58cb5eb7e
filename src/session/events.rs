//! Pure routing of MQTT event-loop events
//!
//! Turns raw `rumqttc` events into the handful of outcomes the link driver
//! acts on, keeping the driver itself free of packet-level matching.

use rumqttc::{ConnectReturnCode, Event, Packet};

/// Routing decision for one event-loop event.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Broker answered the connect attempt.
    ConnAck { code: ConnectReturnCode },
    /// A message arrived on a subscribed topic.
    MessageArrived { topic: String, payload: Vec<u8> },
    /// A QoS 1/2 publish was acknowledged end to end.
    DeliveryAck { pkid: u16 },
    /// A subscription was confirmed.
    SubAck { pkid: u16 },
    /// Broker closed the session on its side.
    BrokerDisconnect,
    /// Keep-alive traffic, outgoing echoes, and everything else.
    Ignored,
}

impl LinkEvent {
    pub fn is_successful_connack(&self) -> bool {
        matches!(
            self,
            LinkEvent::ConnAck {
                code: ConnectReturnCode::Success
            }
        )
    }
}

/// Route a raw event to its [`LinkEvent`].
pub fn route_event(event: &Event) -> LinkEvent {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(ack) => LinkEvent::ConnAck { code: ack.code },
            Packet::Publish(publish) => LinkEvent::MessageArrived {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Packet::PubAck(ack) => LinkEvent::DeliveryAck { pkid: ack.pkid },
            Packet::PubComp(comp) => LinkEvent::DeliveryAck { pkid: comp.pkid },
            Packet::SubAck(ack) => LinkEvent::SubAck { pkid: ack.pkid },
            Packet::Disconnect => LinkEvent::BrokerDisconnect,
            _ => LinkEvent::Ignored,
        },
        Event::Outgoing(_) => LinkEvent::Ignored,
    }
}
