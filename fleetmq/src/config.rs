//! Façade construction options: broker address/credentials, the
//! client identity announced to discovery, and which TCP fast path
//! (if any) to stand up alongside the MQTT control plane.

#[cfg(feature = "config")]
use serde::Deserialize;

/// Whether to run a direct TCP fast path next to the MQTT control
/// plane, and whether its frames are AES-256-CBC encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
pub enum TcpMode {
    #[default]
    Disabled,
    Plain,
    Secure,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "config", derive(Deserialize))]
pub struct Config {
    pub client_id: String,
    pub broker_host: String,
    pub broker_port: u16,
    #[cfg_attr(feature = "config", serde(default))]
    pub username: Option<String>,
    #[cfg_attr(feature = "config", serde(default))]
    pub password: Option<String>,
    /// Address announced in the TCP discovery blob; must be routable
    /// from peers. Ignored when `tcp_mode` is `Disabled`.
    #[cfg_attr(feature = "config", serde(default))]
    pub my_ip: Option<String>,
    #[cfg_attr(feature = "config", serde(default))]
    pub tcp_mode: TcpMode,
    /// MQTT "clean session" behavior is delegated entirely to the
    /// broker connection; kept here so it round-trips through the
    /// config file even though `fleetmq-mqtt` does not yet expose a
    /// knob for it.
    #[cfg_attr(feature = "config", serde(default = "default_true"))]
    pub clean_session: bool,
}

#[cfg(feature = "config")]
fn default_true() -> bool {
    true
}

impl Config {
    pub fn builder(client_id: impl Into<String>, broker_host: impl Into<String>, broker_port: u16) -> ConfigBuilder {
        ConfigBuilder::new(client_id, broker_host, broker_port)
    }

    /// Parses a config file in the shape this struct derives, for
    /// embedding applications that would rather keep broker
    /// credentials and `my_ip` out of source.
    #[cfg(feature = "config")]
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    client_id: String,
    broker_host: String,
    broker_port: u16,
    username: Option<String>,
    password: Option<String>,
    my_ip: Option<String>,
    tcp_mode: TcpMode,
    clean_session: bool,
}

impl ConfigBuilder {
    pub fn new(client_id: impl Into<String>, broker_host: impl Into<String>, broker_port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            broker_host: broker_host.into(),
            broker_port,
            clean_session: true,
            ..Default::default()
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn my_ip(mut self, my_ip: impl Into<String>) -> Self {
        self.my_ip = Some(my_ip.into());
        self
    }

    pub fn tcp_mode(mut self, tcp_mode: TcpMode) -> Self {
        self.tcp_mode = tcp_mode;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn build(self) -> Config {
        Config {
            client_id: self.client_id,
            broker_host: self.broker_host,
            broker_port: self.broker_port,
            username: self.username,
            password: self.password,
            my_ip: self.my_ip,
            tcp_mode: self.tcp_mode,
            clean_session: self.clean_session,
        }
    }
}
