//! Allows configuration stuff to be read from a json settings file
//!
//! Values are looked up in the file first, then an explicit default handed to the
//! getter, then the defaults object the Config was built with.  Command line flags can
//! override a value in memory with [`Config::set_value`]; nothing is ever written back.
use json::JsonValue;
use log::{info, warn};
use regex::Regex;
use std::{error::Error, fmt, io::ErrorKind};

#[derive(Debug)]
pub struct MissingConfigError {
    key: String,
}

impl fmt::Display for MissingConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Required configuration value '{}' is missing", self.key)
    }
}

impl Error for MissingConfigError {}

pub struct Config {
    filename: String,
    settings: JsonValue,
    defaults: JsonValue,
}

impl Config {
    pub fn build(filename: String, defaults: JsonValue) -> Result<Config, std::io::Error> {
        // filename only contains valid characters and ends in .json
        let filename_regex = Regex::new(r"^[a-zA-Z0-9_\-\.]+\.json$")
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        if !filename_regex.is_match(&filename) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Invalid filename '{}' - must contain only letters, numbers, underscore, dash, dot and end in .json",
                    filename
                ),
            ));
        }

        let mut config = Config {
            filename,
            settings: json::object! {},
            defaults,
        };

        if let Err(err) = config.load_from_file() {
            warn!("Using default settings: {}", err);
        }

        Ok(config)
    }

    pub fn get_filename(&self) -> &str {
        &self.filename
    }

    fn load_from_file(&mut self) -> std::io::Result<()> {
        let raw_data = std::fs::read_to_string(&self.filename)?;
        match json::parse(&raw_data) {
            Ok(parsed) => {
                self.settings = parsed;
                info!("Loaded settings from {}: {}", self.filename, self.settings.dump());
            }
            Err(err) => {
                warn!("Failed to parse config file {}: {}", self.filename, err);
            }
        }
        Ok(())
    }

    pub fn get_str_value(&self, key: &str, default: Option<String>) -> Result<String, MissingConfigError> {
        if let Some(val) = self.settings[key].as_str() {
            return Ok(val.to_string());
        }
        if let Some(def) = default {
            return Ok(def);
        }
        if let Some(val) = self.defaults[key].as_str() {
            return Ok(val.to_string());
        }
        Err(MissingConfigError { key: key.to_string() })
    }

    pub fn get_bool_value(&self, key: &str, default: Option<bool>) -> Result<bool, MissingConfigError> {
        if let Some(val) = self.settings[key].as_bool() {
            return Ok(val);
        }
        if let Some(def) = default {
            return Ok(def);
        }
        if let Some(val) = self.defaults[key].as_bool() {
            return Ok(val);
        }
        Err(MissingConfigError { key: key.to_string() })
    }

    pub fn get_u32_value(&self, key: &str, default: Option<u32>) -> Result<u32, MissingConfigError> {
        if let Some(val) = self.settings[key].as_u32() {
            return Ok(val);
        }
        if let Some(def) = default {
            return Ok(def);
        }
        if let Some(val) = self.defaults[key].as_u32() {
            return Ok(val);
        }
        Err(MissingConfigError { key: key.to_string() })
    }

    /// Optional string lookup.  Device ids are legitimately unset, so a missing key is not an error.
    pub fn get_opt_str_value(&self, key: &str) -> Option<String> {
        self.get_str_value(key, None).ok()
    }

    pub fn set_value(&mut self, key: &str, val: impl Into<JsonValue>) -> Result<(), String> {
        let json_val = val.into();
        match json_val {
            JsonValue::Short(_) | JsonValue::String(_) | JsonValue::Boolean(_) | JsonValue::Number(_) => {
                self.settings[key] = json_val;
                Ok(())
            }
            _ => Err(format!("Unsupported value type for key: {}", key)),
        }
    }
}
