use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};

use fleetmq_mqtt::{IncomingMessage, MqttClient, MqttClientBuilder, SubscribeHandle};
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings, ShutdownHandler};
use tokio::sync::mpsc;

pub fn port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn broker(port: u16) -> ShutdownHandler {
    let settings = ServerSettings {
        name: "mqtt-server".to_owned(),
        listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)),
        tls: None,
        next_connection_delay_ms: 500,
        connections: ConnectionSettings {
            connection_timeout_ms: 1000,
            max_payload_size: 1024 * 1024,
            max_inflight_count: 15,
            auth: None,
            external_auth: None,
            dynamic_filters: true,
        },
    };

    let mut v5_map = HashMap::new();
    v5_map.insert("-".to_owned(), settings);

    let config = Config {
        router: RouterConfig {
            max_connections: 15,
            max_outgoing_packet_count: 10,
            max_segment_size: 1024 * 1024,
            max_segment_count: 50,
            ..Default::default()
        },
        v5: Some(v5_map),
        ..Default::default()
    };

    let mut broker = Broker::new(config);
    let handler = broker.shutdown_handler();
    std::thread::spawn(move || {
        broker.start().unwrap();
    });

    handler
}

pub async fn client(port: u16, client_id: &str) -> anyhow::Result<MqttClient> {
    let client = MqttClientBuilder::new(client_id)
        .connect("127.0.0.1", port, None, None)
        .await?;
    Ok(client)
}

/// Subscribes `pattern`, forwarding every delivered message onto an
/// unbounded channel so tests can `.recv().await` it like the old
/// broadcast-based `Subscriber`.
pub async fn subscribe_collecting(
    client: &MqttClient,
    pattern: &str,
    qos: rumqttc::v5::mqttbytes::QoS,
) -> anyhow::Result<(SubscribeHandle, mpsc::UnboundedReceiver<IncomingMessage>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = client
        .subscribe(pattern, qos, tx, |msg, tx| {
            let _ = tx.send(msg.clone());
        })
        .await?;
    Ok((handle, rx))
}
