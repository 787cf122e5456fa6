use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::gateway::channel::ChannelType;

/// Per-provider connection tuning; response timeouts track how slow each
/// family is allowed to be (reasoning models stream for minutes).
#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    pub max_idle_per_host: usize,
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: 20,
            response_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
        }
    }
}

fn settings_for(channel_type: ChannelType) -> PoolSettings {
    let defaults = PoolSettings::default();
    match channel_type {
        ChannelType::Openai => PoolSettings {
            max_idle_per_host: 100,
            response_timeout: Duration::from_secs(120),
            ..defaults
        },
        ChannelType::Azure => PoolSettings {
            max_idle_per_host: 80,
            response_timeout: Duration::from_secs(90),
            ..defaults
        },
        ChannelType::Anthropic => PoolSettings {
            max_idle_per_host: 50,
            // Claude reasoning can be slow.
            response_timeout: Duration::from_secs(180),
            ..defaults
        },
        ChannelType::Gemini => PoolSettings {
            max_idle_per_host: 50,
            response_timeout: Duration::from_secs(120),
            ..defaults
        },
        // Covers DeepSeek R1-style reasoning upstreams.
        ChannelType::OpenaiCompatible => PoolSettings {
            max_idle_per_host: 40,
            response_timeout: Duration::from_secs(180),
            ..defaults
        },
    }
}

/// One long-lived `reqwest::Client` per provider family, created lazily.
/// HTTP/2 over rustls, TLS >= 1.2, optional single egress proxy.
pub struct ClientPool {
    clients: RwLock<HashMap<ChannelType, reqwest::Client>>,
    proxy: Option<String>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl ClientPool {
    pub fn new(proxy: Option<String>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            proxy,
        }
    }

    pub fn client(&self, channel_type: ChannelType) -> reqwest::Client {
        if let Some(client) = self
            .clients
            .read()
            .ok()
            .and_then(|clients| clients.get(&channel_type).cloned())
        {
            return client;
        }

        let client = self.build_client(channel_type);
        let mut clients = match self.clients.write() {
            Ok(clients) => clients,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients.entry(channel_type).or_insert(client).clone()
    }

    fn build_client(&self, channel_type: ChannelType) -> reqwest::Client {
        let settings = settings_for(channel_type);
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .timeout(settings.response_timeout)
            .connect_timeout(settings.connect_timeout)
            .tcp_keepalive(settings.keep_alive)
            .min_tls_version(reqwest::tls::Version::TLS_1_2);

        if let Some(proxy_url) = self.proxy.as_deref() {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => {
                    tracing::warn!(error = %err, "invalid egress proxy, continuing direct");
                }
            }
        }

        builder.build().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "client builder failed, using defaults");
            reqwest::Client::new()
        })
    }

    pub fn response_timeout(&self, channel_type: ChannelType) -> Duration {
        settings_for(channel_type).response_timeout
    }
}
