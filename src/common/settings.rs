//! Typed view of the jam settings file.
//!
//! The settings hold the player's chosen devices and display name, the broker the
//! client talks to, and the two session timers.  The core only cares about `name`
//! (the identifier requested from the broker); the device ids are handed through to
//! the media/midi layers.
use log::info;
use rand::Rng;
use simple_error::bail;

use crate::broker::broker_config::BrokerConfig;
use crate::common::{box_error::BoxError, config::Config};

pub const DEFAULT_SETTINGS_FILE: &str = "play_away.json";
pub const DEFAULT_INSTRUMENT: &str = "acoustic_grand_piano";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub name: String,
    pub instrument: String,
    pub audio_id: Option<String>,
    pub video_id: Option<String>,
    pub midi_input_id: Option<String>,
    pub midi_output_id: Option<String>,
    pub broker: BrokerConfig,
    pub fatal_backoff_secs: u32,
    pub disconnect_grace_secs: u32,
}

/// defaults used when the settings file is missing a key
pub fn default_params() -> json::JsonValue {
    json::object! {
        "instrument": DEFAULT_INSTRUMENT,
        "brokerHost": "play-away.azurewebsites.net",
        "brokerPort": 443,
        "brokerSecure": true,
        "brokerPath": "/peerjs/playaway",
        "brokerKey": "peerjs",
        "fatalBackoffSecs": 10,
        "disconnectGraceSecs": 11
    }
}

/// anonymous display name for a player who never picked one
pub fn anonymous_name() -> String {
    format!("anon-{}", rand::thread_rng().gen_range(0..1_000_000))
}

impl Settings {
    pub fn load(filename: Option<&str>) -> Result<Settings, BoxError> {
        let filename = filename.unwrap_or(DEFAULT_SETTINGS_FILE);
        info!("Using settings file: {}", filename);
        let config = Config::build(String::from(filename), default_params())?;
        let settings = Settings::from_config(&config)?;
        info!("settings loaded from {}", config.get_filename());
        Ok(settings)
    }

    pub fn from_config(config: &Config) -> Result<Settings, BoxError> {
        let port = config.get_u32_value("brokerPort", None)?;
        let port = match u16::try_from(port) {
            Ok(p) => p,
            Err(_) => bail!("brokerPort {} is out of range", port),
        };
        let broker = BrokerConfig::new(
            &config.get_str_value("brokerHost", None)?,
            port,
            config.get_bool_value("brokerSecure", None)?,
            &config.get_str_value("brokerPath", None)?,
            &config.get_str_value("brokerKey", None)?,
        );
        let settings = Settings {
            name: config.get_str_value("name", Some(anonymous_name()))?,
            instrument: config.get_str_value("instrument", None)?,
            audio_id: config.get_opt_str_value("audioId"),
            video_id: config.get_opt_str_value("videoId"),
            midi_input_id: config.get_opt_str_value("midiInputId"),
            midi_output_id: config.get_opt_str_value("midiOutputId"),
            broker,
            // a zero backoff would hammer the broker, so never go below a second
            fatal_backoff_secs: config.get_u32_value("fatalBackoffSecs", None)?.max(1),
            disconnect_grace_secs: config.get_u32_value("disconnectGraceSecs", None)?.max(1),
        };
        info!("settings: name: {}, broker: {}", settings.name, settings.broker);
        Ok(settings)
    }

    /// the identifier this player asks the broker for
    pub fn requested_peer_id(&self) -> &str {
        &self.name
    }
}
