//! Location of the signaling broker and the urls derived from it.
use std::fmt;
use url::Url;

use crate::common::box_error::BoxError;

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    /// mount point of the broker on the host, always with a leading and no trailing slash
    pub path: String,
    pub key: String,
}

impl BrokerConfig {
    pub fn new(host: &str, port: u16, secure: bool, path: &str, key: &str) -> BrokerConfig {
        let trimmed = path.trim_matches('/');
        BrokerConfig {
            host: host.to_string(),
            port,
            secure,
            path: if trimmed.is_empty() {
                String::new()
            } else {
                format!("/{}", trimmed)
            },
            key: key.to_string(),
        }
    }

    fn base_url(&self, plain: &str, tls: &str) -> Result<Url, BoxError> {
        let scheme = if self.secure { tls } else { plain };
        Ok(Url::parse(&format!("{}://{}:{}", scheme, self.host, self.port))?)
    }

    /// discovery endpoint listing every registered identifier
    pub fn peers_url(&self) -> Result<Url, BoxError> {
        let mut url = self.base_url("http", "https")?;
        url.set_path(&format!("{}/{}/peers", self.path, self.key));
        Ok(url)
    }

    /// websocket a client registering as `id` signals over
    pub fn signaling_url(&self, id: &str) -> Result<Url, BoxError> {
        let mut url = self.base_url("ws", "wss")?;
        url.set_path(&format!("{}/peerjs", self.path));
        url.query_pairs_mut().append_pair("key", &self.key).append_pair("id", id);
        Ok(url)
    }
}

impl fmt::Display for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ host: {}, port: {}, secure: {}, path: {} }}",
            self.host, self.port, self.secure, self.path
        )
    }
}
