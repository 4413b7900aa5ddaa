//! Message bus channel over MQTT
//!
//! The gateway runs a broker on the device itself once the recovery shell
//! sequence has opened it up. This channel deliberately does not retry in
//! place: a failed poll clears the publish handle and ends the receive loop
//! so the reconciliation loop can re-decide connectivity.

use crate::client::{BusHandler, BusPublisher, MessageBus};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

const CLIENT_ID: &str = "lumi-gateway-rust";
const CHANNEL_CAPACITY: usize = 100;
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Publish handle slot shared between the bus and its publishers. Cleared
/// whenever the connection drops so outbound writes fail fast instead of
/// queueing into a dead session.
type ClientSlot = Arc<RwLock<Option<AsyncClient>>>;

/// MQTT implementation of [`MessageBus`]
pub struct MqttBus {
    options: MqttOptions,
    connect_timeout: Duration,
    eventloop: Option<EventLoop>,
    client: ClientSlot,
}

impl MqttBus {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        let mut options = MqttOptions::new(CLIENT_ID, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        Self {
            options,
            connect_timeout,
            eventloop: None,
            client: Arc::new(RwLock::new(None)),
        }
    }

    fn clear(&mut self) {
        self.eventloop = None;
        *self.client.write().unwrap() = None;
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn connect(&mut self) -> Result<()> {
        self.clear();

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), CHANNEL_CAPACITY);

        // Drive the event loop until the broker acknowledges the session;
        // anything else within the window is a failed connect.
        let ack = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(event) => debug!("Bus event before ack: {event:?}"),
                    Err(e) => return Err(GatewayError::from(e)),
                }
            }
        })
        .await
        .map_err(|_| GatewayError::bus("Broker did not answer within connect timeout"))??;

        if ack.code != ConnectReturnCode::Success {
            return Err(GatewayError::bus(format!(
                "Broker refused connection: {:?}",
                ack.code
            )));
        }

        client.subscribe("#", QoS::AtMostOnce).await?;

        *self.client.write().unwrap() = Some(client);
        self.eventloop = Some(eventloop);

        info!("Bus connected, subscribed to all topics");
        Ok(())
    }

    async fn run(&mut self, handler: &dyn BusHandler) -> Result<()> {
        let Some(mut eventloop) = self.eventloop.take() else {
            return Err(GatewayError::bus("Receive loop started without connect"));
        };

        let result = loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handler.handle(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    break Err(GatewayError::bus("Broker closed the session"));
                }
                Ok(_) => {}
                Err(e) => break Err(GatewayError::from(e)),
            }
        };

        self.clear();
        result
    }

    fn publisher(&self) -> Arc<dyn BusPublisher> {
        Arc::new(MqttPublisher {
            client: self.client.clone(),
        })
    }
}

/// Outbound handle backed by the shared client slot
struct MqttPublisher {
    client: ClientSlot,
}

impl BusPublisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self.client.read().unwrap().clone();
        match client {
            Some(client) => {
                client.try_publish(topic, QoS::AtMostOnce, false, payload)?;
                Ok(())
            }
            None => Err(GatewayError::bus("Bus not connected")),
        }
    }
}
