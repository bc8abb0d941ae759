use crate::config::{Config, ValidationError};
use crate::tokens::TokenSigner;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use streamer::{ChannelId, SourceSpec};
use url::Url;

pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub logo: Option<String>,
    pub group: Option<String>,
    pub max_connections: u32,
    pub spec: Arc<SourceSpec>,
}

/// Everything the HTTP boundary serves from the configuration, swapped as a
/// whole on reload.
pub struct Catalog {
    channels: HashMap<ChannelId, Channel>,
    users: HashSet<String>,
    allow_anonymous: bool,
    signer: TokenSigner,
    base_url: Option<Url>,
}

impl Catalog {
    pub fn from_config(config: &Config) -> Result<Self, ValidationError> {
        config.validate()?;

        let mut channels = HashMap::new();
        for channel in &config.channels {
            channels.insert(
                channel.id.clone(),
                Channel {
                    id: channel.id.clone(),
                    name: channel.name.clone(),
                    logo: channel.logo.clone(),
                    group: channel.group.clone(),
                    max_connections: channel.max_connections,
                    spec: Arc::new(channel.source_spec()?),
                },
            );
        }

        Ok(Catalog {
            channels,
            users: config.access.users.iter().cloned().collect(),
            allow_anonymous: config.access.allow_anonymous,
            signer: TokenSigner::new(&config.access.token_salt),
            base_url: config.base_url.clone(),
        })
    }

    pub fn channel(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Channels in playlist order.
    pub fn sorted_by_name(&self) -> Vec<&Channel> {
        let mut channels: Vec<_> = self.channels.values().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        channels
    }

    /// Per-channel client limits for the admission controller.
    pub fn limits(&self) -> HashMap<ChannelId, u32> {
        self.channels
            .values()
            .filter(|c| c.max_connections > 0)
            .map(|c| (c.id.clone(), c.max_connections))
            .collect()
    }

    pub fn is_known_user(&self, user: &str) -> bool {
        self.users.contains(user)
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// The current [`Catalog`]. Readers take a snapshot and keep using it for the
/// rest of their request even if a reload happens meanwhile.
pub struct ChannelCatalog {
    current: RwLock<Arc<Catalog>>,
}

impl ChannelCatalog {
    pub fn new(catalog: Catalog) -> Self {
        ChannelCatalog {
            current: RwLock::new(Arc::new(catalog)),
        }
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current.read().clone()
    }

    /// Installs `catalog` and returns the one it replaced.
    pub fn replace(&self, catalog: Catalog) -> Arc<Catalog> {
        std::mem::replace(&mut *self.current.write(), Arc::new(catalog))
    }
}
