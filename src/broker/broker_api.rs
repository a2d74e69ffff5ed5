//! REST side of the broker: who is registered right now.
//!
//! Every registered identifier is a "room" another player can join by connecting to it.
use log::{debug, info, warn};
use reqwest::blocking::Client;
use simple_error::bail;

use super::broker_config::BrokerConfig;
use crate::common::box_error::BoxError;

/// Anything that can enumerate the identifiers registered with a broker.
#[cfg_attr(test, mockall::automock)]
pub trait PeerDirectory {
    fn list_peers(&self) -> Result<Vec<String>, BoxError>;
}

/// Discovery client for a real broker
pub struct BrokerApi {
    config: BrokerConfig,
    client: Client,
}

impl BrokerApi {
    pub fn new(config: BrokerConfig) -> BrokerApi {
        debug!("BrokerApi::new called config: {}", config);
        BrokerApi {
            config,
            client: Client::new(),
        }
    }
}

impl PeerDirectory for BrokerApi {
    /// `GET <path>/<key>/peers`, answered with a json array of identifiers
    fn list_peers(&self) -> Result<Vec<String>, BoxError> {
        let url = self.config.peers_url()?;
        let response = self.client.get(url.clone()).send()?;
        if !response.status().is_success() {
            warn!("broker_api::list_peers {} returned {}", url, response.status());
            bail!("broker discovery failed: {}", response.status());
        }
        let peers: Vec<String> = response.json()?;
        info!("broker lists {} peers", peers.len());
        Ok(peers)
    }
}

/// rooms this player could join.  Our own registration is not a room for us, and a
/// broker we cannot reach just means there is nothing to join yet.
pub fn joinable_rooms(directory: &dyn PeerDirectory, own_name: &str) -> Vec<String> {
    match directory.list_peers() {
        Ok(peers) => peers.into_iter().filter(|p| p != own_name).collect(),
        Err(e) => {
            warn!("cannot list rooms: {}", e);
            vec![]
        }
    }
}
