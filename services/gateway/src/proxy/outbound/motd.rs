//! Locally generated status responses and kick messages.

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::MinecraftOptions;
use crate::error::ConfigError;

/// Name reported as the server software.
pub const SOFTWARE: &str = concat!("craftgate ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerSample {
    pub name: String,
    pub id: String,
}

/// Pre-rendered parts of a status response for one outbound.
#[derive(Debug, Clone, PartialEq)]
pub struct Motd {
    description: String,
    favicon: String,
    max: i32,
    online: i32,
    sample: Option<Vec<PlayerSample>>,
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    version: VersionInfo<'a>,
    players: Players<'a>,
    description: Description<'a>,
    #[serde(skip_serializing_if = "str::is_empty")]
    favicon: &'a str,
}

#[derive(Serialize)]
struct VersionInfo<'a> {
    name: &'a str,
    protocol: u32,
}

#[derive(Serialize)]
struct Players<'a> {
    max: i32,
    online: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample: Option<&'a [PlayerSample]>,
}

#[derive(Serialize)]
struct Description<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    text: &'a str,
}

impl Motd {
    /// Expand placeholders and convert the configured sample.
    ///
    /// `{INFO}`, `{NAME}`, `{HOST}` and `{PORT}` in the description become
    /// the software name, the outbound name and its target.
    pub fn new(
        outbound: &str,
        options: &MinecraftOptions,
        target_address: &str,
        target_port: u16,
    ) -> Result<Self, ConfigError> {
        let description = options
            .motd_description
            .replace("{INFO}", SOFTWARE)
            .replace("{NAME}", outbound)
            .replace("{HOST}", target_address)
            .replace("{PORT}", &target_port.to_string());

        let sample = options
            .online_count
            .sample
            .as_ref()
            .map(convert_sample)
            .transpose()?;

        Ok(Self {
            description,
            favicon: options.motd_favicon.clone(),
            max: options.online_count.max,
            online: options.online_count.online,
            sample,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Status JSON for a client speaking `protocol_version`.
    ///
    /// A negative configured online count reports `live_online` instead.
    pub fn render(&self, protocol_version: u32, live_online: i32) -> serde_json::Result<String> {
        let online = if self.online < 0 { live_online } else { self.online };
        serde_json::to_string(&StatusResponse {
            version: VersionInfo {
                name: SOFTWARE,
                protocol: protocol_version,
            },
            players: Players {
                max: self.max,
                online,
                sample: self.sample.as_deref(),
            },
            description: Description {
                text: &self.description,
            },
            favicon: &self.favicon,
        })
    }
}

/// `{"<uuid>": "<name>"}` is used as is; `["<name>", ..]` gets random ids.
fn convert_sample(sample: &Value) -> Result<Vec<PlayerSample>, ConfigError> {
    match sample {
        Value::Object(map) => map
            .iter()
            .map(|(id, name)| {
                let name = name
                    .as_str()
                    .ok_or_else(|| ConfigError::InvalidSample(format!("name for {id} is not a string")))?;
                Ok(PlayerSample {
                    name: name.to_string(),
                    id: id.clone(),
                })
            })
            .collect(),
        Value::Array(names) => names
            .iter()
            .map(|name| {
                let name = name
                    .as_str()
                    .ok_or_else(|| ConfigError::InvalidSample(format!("{name} is not a string")))?;
                Ok(PlayerSample {
                    name: name.to_string(),
                    id: Uuid::new_v4().hyphenated().to_string(),
                })
            })
            .collect(),
        other => Err(ConfigError::InvalidSample(format!(
            "expected an object or an array, got {other}"
        ))),
    }
}

/// Login disconnect reason for a player refused by name access control.
pub fn access_denied_message(player: &str) -> Value {
    json!({
        "text": "",
        "extra": [
            { "text": SOFTWARE, "color": "gold" },
            { "text": "\n\n" },
            { "text": format!("Sorry {player}, you are not allowed to join this server."), "color": "red" },
        ],
    })
}

/// Login disconnect reason when the outbound is full.
pub fn server_full_message(player: &str, max: i32) -> Value {
    json!({
        "text": "",
        "extra": [
            { "text": SOFTWARE, "color": "gold" },
            { "text": "\n\n" },
            { "text": format!("Sorry {player}, the server is full ({max} players)."), "color": "red" },
            { "text": "\nPlease try again later.", "color": "gray" },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OnlineCount;

    fn options(description: &str, sample: Option<Value>) -> MinecraftOptions {
        MinecraftOptions {
            motd_description: description.to_string(),
            online_count: OnlineCount {
                max: 100,
                online: -1,
                enable_max_limit: false,
                sample,
            },
            ..MinecraftOptions::default()
        }
    }

    #[test]
    fn test_placeholders() {
        let motd = Motd::new(
            "lobby",
            &options("{NAME} at {HOST}:{PORT} via {INFO}", None),
            "mc.example.com",
            25565,
        )
        .unwrap();
        assert_eq!(
            motd.description(),
            format!("lobby at mc.example.com:25565 via {SOFTWARE}")
        );
    }

    #[test]
    fn test_render_live_online() {
        let motd = Motd::new("lobby", &options("Hello", None), "", 0).unwrap();
        let status: Value = serde_json::from_str(&motd.render(765, 7).unwrap()).unwrap();
        assert_eq!(status["version"]["protocol"], 765);
        assert_eq!(status["version"]["name"], SOFTWARE);
        assert_eq!(status["players"]["max"], 100);
        assert_eq!(status["players"]["online"], 7);
        assert!(status["players"].get("sample").is_none());
        assert_eq!(status["description"]["text"], "Hello");
        assert!(status.get("favicon").is_none());
    }

    #[test]
    fn test_render_fixed_online() {
        let mut options = options("Hello", None);
        options.online_count.online = 42;
        let motd = Motd::new("lobby", &options, "", 0).unwrap();
        let status: Value = serde_json::from_str(&motd.render(47, 7).unwrap()).unwrap();
        assert_eq!(status["players"]["online"], 42);
    }

    #[test]
    fn test_sample_from_map() {
        let id = "069a79f4-44e9-4726-a5be-fca90e38aaf5";
        let mut sample = serde_json::Map::new();
        sample.insert(id.to_string(), json!("Notch"));
        let motd = Motd::new("lobby", &options("", Some(Value::Object(sample))), "", 0).unwrap();
        let status: Value = serde_json::from_str(&motd.render(47, 0).unwrap()).unwrap();
        assert_eq!(status["players"]["sample"], json!([{ "name": "Notch", "id": id }]));
    }

    #[test]
    fn test_sample_from_names() {
        let motd =
            Motd::new("lobby", &options("", Some(json!(["Steve", "Alex"]))), "", 0).unwrap();
        let sample = motd.sample.as_ref().unwrap();
        assert_eq!(sample.len(), 2);
        assert_eq!(sample[0].name, "Steve");
        assert!(Uuid::parse_str(&sample[0].id).is_ok());
        assert_ne!(sample[0].id, sample[1].id);
    }

    #[test]
    fn test_sample_rejects_other_shapes() {
        assert!(matches!(
            Motd::new("lobby", &options("", Some(json!(3))), "", 0),
            Err(ConfigError::InvalidSample(_))
        ));
        assert!(matches!(
            Motd::new("lobby", &options("", Some(json!([1, 2]))), "", 0),
            Err(ConfigError::InvalidSample(_))
        ));
    }

    #[test]
    fn test_kick_messages_mention_player() {
        let text = access_denied_message("Steve").to_string();
        assert!(text.contains("Sorry Steve"));
        let text = server_full_message("Alex", 20).to_string();
        assert!(text.contains("20 players"));
    }
}
