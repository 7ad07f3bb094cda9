use std::fmt::Display;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::client::ApiError;
use crate::serde_utils;

/// Envelope codes arrive as either JSON numbers or numeric strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseCode {
    Number(i64),
    Text(String),
}

/// Codes the platform uses for an expired or invalid token.
const AUTH_FAILURE_CODES: [i64; 3] = [401, 11101, 11102];

impl ResponseCode {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ResponseCode::Number(code) => Some(*code),
            ResponseCode::Text(code) => code.trim().parse().ok(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.as_i64() == Some(0)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.as_i64()
            .is_some_and(|code| AUTH_FAILURE_CODES.contains(&code))
    }
}

impl Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseCode::Number(code) => write!(f, "{}", code),
            ResponseCode::Text(code) => write!(f, "{}", code),
        }
    }
}

/// The `{code, data, msg}` wrapper every supervisor and platform response uses.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub code: ResponseCode,
    pub data: Option<T>,
    pub msg: Option<String>,
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn message(&self) -> Option<&str> {
        [self.msg.as_deref(), self.message.as_deref()]
            .into_iter()
            .flatten()
            .find(|m| !m.is_empty())
    }

    /// Fails on any non-zero code, even though the HTTP exchange succeeded.
    pub fn into_result(self) -> Result<Option<T>, ApiError> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(ApiError::Application {
                message: self.message().map(str::to_owned),
                code: self.code,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub retry_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshTokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    Local,
    Sd,
}

impl Storage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Storage::Local => "local",
            Storage::Sd => "sd",
        }
    }
}

impl Display for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoragePathRequest<'a> {
    pub storage: Storage,
    pub path: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameRequest<'a> {
    pub storage: Storage,
    pub old_path: &'a str,
    pub new_path: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadRequest<'a> {
    pub storage: Storage,
    pub path: &'a str,
    /// Cache buster, milliseconds since the epoch.
    pub t: u128,
}

/// Sidecar describing an uploaded model, sent as a JSON string.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "serde_utils::deserialize_optional_timestamp_secs")]
    pub modified: Option<SystemTime>,
    pub storage: Option<Storage>,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileListing {
    pub path: String,
    pub storage: Storage,
    #[serde(default)]
    pub directories: Vec<FileEntry>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryInfo {
    pub path: String,
    pub storage: Storage,
    pub is_directory: bool,
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "serde_utils::deserialize_optional_timestamp_secs")]
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformUserInfo {
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    pub app_id: String,
    pub app_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppList {
    #[serde(default)]
    pub list: Vec<AppInfo>,
}
