use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::sync::Arc;

use fleetmq::{Config, FleetMq, TcpMode};
use rumqttd::{Broker, Config as BrokerConfig, ConnectionSettings, RouterConfig, ServerSettings, ShutdownHandler};

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

    let config = BrokerConfig {
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

/// Brings up a plain-MQTT-only façade node.
pub async fn node(broker_port: u16, client_id: &str) -> anyhow::Result<Arc<FleetMq>> {
    let config = Config::builder(client_id, "127.0.0.1", broker_port).build();
    Ok(FleetMq::ready(config).await?)
}

/// Brings up a façade node with the TCP fast path enabled.
pub async fn node_with_tcp(broker_port: u16, client_id: &str, secure: bool) -> anyhow::Result<Arc<FleetMq>> {
    let mode = if secure { TcpMode::Secure } else { TcpMode::Plain };
    let config = Config::builder(client_id, "127.0.0.1", broker_port)
        .my_ip("127.0.0.1")
        .tcp_mode(mode)
        .build();
    Ok(FleetMq::ready(config).await?)
}
