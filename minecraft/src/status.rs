use serde::{Deserialize, Serialize};

/// The JSON body of a Status Response packet.
///
/// Field casing follows the wire format, which is why the two chat-related
/// flags carry serde renames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub version: StatusVersion,
    pub players: StatusPlayers,
    pub description: StatusDescription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(rename = "enforcesSecureChat")]
    pub enforces_secure_chat: bool,
    #[serde(rename = "previewsChat")]
    pub previews_chat: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusPlayers {
    pub max: u32,
    pub online: u32,
    pub sample: Vec<StatusPlayerSample>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusPlayerSample {
    pub name: String,
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusDescription {
    pub text: String,
}

impl StatusResponse {
    /// A response with empty player sample and chat preview flags off, the
    /// shape vanilla clients expect from a modern server.
    pub fn new(version_name: &str, protocol: i32, motd: &str, online: u32, max: u32) -> Self {
        StatusResponse {
            version: StatusVersion {
                name: version_name.to_string(),
                protocol,
            },
            players: StatusPlayers {
                max,
                online,
                sample: Vec::new(),
            },
            description: StatusDescription {
                text: motd.to_string(),
            },
            favicon: None,
            enforces_secure_chat: false,
            previews_chat: false,
        }
    }

    pub fn with_favicon(mut self, favicon_b64: Option<&str>) -> Self {
        self.favicon = favicon_b64.map(|b64| format!("data:image/png;base64,{}", b64));
        self
    }
}
