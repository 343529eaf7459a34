use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Presence state of a user.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Online => "online",
            Status::Offline => "offline",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Status::Online),
            "offline" => Ok(Status::Offline),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

/// Postal address attached to a user profile.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub pincode: String,
}

/// Public view of a user. Never carries the credential.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub mobile_no: String,
    pub address: Address,
    pub login_id: String,
    pub status: Status,
    /// Unix milliseconds.
    pub last_active: i64,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Reference to a user sent by clients after a REST registration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserRef {
    #[serde(alias = "_id")]
    pub id: Uuid,
}

/// Frames sent from a client over the realtime channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "t", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Login { login_id: String, password: String },
    Connect { user_id: Uuid },
    Registered { user_data: UserRef },
    UpdateStatus { user_id: Uuid, status: Status },
    Disconnect { user_id: Uuid },
    Heartbeat { user_id: Uuid },
}

impl ClientEvent {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Frames sent from the server over the realtime channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "t", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    LoginSuccess {
        user_id: Uuid,
        first_name: String,
        last_name: String,
    },
    LoginError {
        message: String,
    },
    StatusUpdate {
        user_id: Uuid,
        status: Status,
        last_active: i64,
    },
    NewUserRegistered {
        user_data: User,
    },
    Offline {
        user_id: Uuid,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
