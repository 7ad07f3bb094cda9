//! Typed access to the device's supervisor HTTP service.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde_json::Value;
use url::Url;

use crate::client::{ApiClient, ApiError, ApiRequest, FormField, Reauthenticator, join_endpoint};
use crate::poll::{ServiceStatus, StatusProbe};
use crate::rest_types::{
    DownloadRequest, EntryInfo, FileListing, LoginRequest, LoginResponse, RenameRequest, Storage,
    StoragePathRequest,
};
use crate::session::{Session, Tokens};
use crate::upload::{ChunkRequest, ChunkTransport};

const LOGIN_PATH: &str = "api/userMgr/login";
const DEVICE_INFO_PATH: &str = "api/deviceMgr/queryDeviceInfo";
const SERVICE_STATUS_PATH: &str = "api/deviceMgr/queryServiceStatus";
const MODEL_INFO_PATH: &str = "api/deviceMgr/getModelInfo";
const MODEL_UPLOAD_PATH: &str = "api/deviceMgr/uploadModel";
const FILE_LIST_PATH: &str = "api/fileMgr/list";
const FILE_MKDIR_PATH: &str = "api/fileMgr/mkdir";
const FILE_REMOVE_PATH: &str = "api/fileMgr/remove";
const FILE_RENAME_PATH: &str = "api/fileMgr/rename";
const FILE_INFO_PATH: &str = "api/fileMgr/info";
const FILE_DOWNLOAD_PATH: &str = "api/fileMgr/download";
const FILE_UPLOAD_PATH: &str = "api/fileMgr/upload";

const SERVICE_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

async fn login(
    http: &reqwest::Client,
    base_url: &Url,
    credentials: &Credentials,
) -> Result<LoginResponse, ApiError> {
    ApiRequest::post(join_endpoint(base_url, LOGIN_PATH)?)
        .json(&LoginRequest {
            user_name: credentials.username.clone(),
            password: credentials.password.clone(),
        })?
        .fetch(http, None)
        .await
}

/// The supervisor has no refresh token; an expired session is renewed by
/// logging in again with the stored credentials.
pub struct DeviceLogin {
    base_url: Url,
    credentials: Option<Credentials>,
}

impl Reauthenticator for DeviceLogin {
    async fn reauthenticate(&self, http: &reqwest::Client, _tokens: Tokens) -> Result<String, ApiError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ApiError::ReauthRequired("no device password configured, run `rcam set-password`".to_string())
        })?;
        tracing::debug!("Logging in to {} again as {}", self.base_url, credentials.username);
        Ok(login(http, &self.base_url, credentials).await?.token)
    }
}

pub struct SupervisorClient {
    base_url: Url,
    api: ApiClient<DeviceLogin>,
}

impl SupervisorClient {
    pub fn new(
        base_url: Url,
        session: Arc<Session>,
        credentials: Option<Credentials>,
    ) -> Result<Self, ApiError> {
        let reauth = DeviceLogin {
            base_url: base_url.clone(),
            credentials,
        };
        Ok(Self {
            api: ApiClient::new(session, reauth)?,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        join_endpoint(&self.base_url, path)
    }

    /// Logs in and stores the new token in the session.
    pub async fn login(&self, credentials: &Credentials) -> Result<LoginResponse> {
        let response = login(self.api.http(), &self.base_url, credentials).await?;
        let stored = self.api.session().set_tokens(Tokens {
            access_token: Some(response.token.clone()),
            refresh_token: None,
        });
        if let Err(e) = stored {
            tracing::warn!("Device session could not be persisted: {:#}", e);
        }
        Ok(response)
    }

    pub fn logout(&self) -> Result<()> {
        self.api.session().clear()
    }

    pub async fn device_info(&self) -> Result<Value, ApiError> {
        self.api
            .request(&ApiRequest::get(self.endpoint(DEVICE_INFO_PATH)?))
            .await
    }

    pub async fn service_status(&self) -> Result<ServiceStatus, ApiError> {
        let request = ApiRequest::get(self.endpoint(SERVICE_STATUS_PATH)?).timeout(SERVICE_STATUS_TIMEOUT);
        self.api.request(&request).await
    }

    pub async fn model_info(&self) -> Result<Value, ApiError> {
        self.api
            .request(&ApiRequest::get(self.endpoint(MODEL_INFO_PATH)?))
            .await
    }

    pub async fn list(&self, storage: Storage, path: &str) -> Result<FileListing, ApiError> {
        let request = ApiRequest::post(self.endpoint(FILE_LIST_PATH)?).json(&StoragePathRequest { storage, path })?;
        self.api.request(&request).await
    }

    pub async fn mkdir(&self, storage: Storage, path: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post(self.endpoint(FILE_MKDIR_PATH)?).json(&StoragePathRequest { storage, path })?;
        self.api.request_unit(&request).await
    }

    pub async fn remove(&self, storage: Storage, path: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post(self.endpoint(FILE_REMOVE_PATH)?).json(&StoragePathRequest { storage, path })?;
        self.api.request_unit(&request).await
    }

    pub async fn rename(&self, storage: Storage, old_path: &str, new_path: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post(self.endpoint(FILE_RENAME_PATH)?).json(&RenameRequest {
            storage,
            old_path,
            new_path,
        })?;
        self.api.request_unit(&request).await
    }

    pub async fn info(&self, storage: Storage, path: &str) -> Result<EntryInfo, ApiError> {
        let request = ApiRequest::post(self.endpoint(FILE_INFO_PATH)?).json(&StoragePathRequest { storage, path })?;
        self.api.request(&request).await
    }

    pub async fn download(&self, storage: Storage, path: &str) -> Result<Vec<u8>, ApiError> {
        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_millis())
            .unwrap_or_default();
        let request = ApiRequest::post(self.endpoint(FILE_DOWNLOAD_PATH)?).json(&DownloadRequest { storage, path, t })?;
        self.api.download(&request).await
    }

    /// Whether an SD card is mounted. Any failure counts as "no card".
    pub async fn sd_available(&self) -> bool {
        let request = self.endpoint(FILE_LIST_PATH).and_then(|url| {
            ApiRequest::post(url).json(&StoragePathRequest {
                storage: Storage::Sd,
                path: "",
            })
        });
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("SD card probe failed: {}", e);
                return false;
            }
        };
        match self.api.call::<Value>(&request).await {
            Ok(envelope) => envelope.is_success(),
            Err(e) => {
                tracing::debug!("SD card probe failed: {}", e);
                false
            }
        }
    }

    pub fn file_upload(&self, storage: Storage, directory: Option<String>) -> FileUpload<'_> {
        FileUpload {
            client: self,
            storage,
            directory,
        }
    }

    pub fn model_upload(&self) -> ModelUpload<'_> {
        ModelUpload { client: self }
    }
}

impl StatusProbe for SupervisorClient {
    async fn probe(&self) -> Result<ServiceStatus> {
        Ok(self.service_status().await?)
    }
}

fn file_chunk_fields(storage: Storage, directory: Option<&str>, chunk: ChunkRequest) -> Vec<FormField> {
    let mut fields = vec![
        FormField::Bytes {
            name: "file",
            file_name: Some(chunk.file_name),
            data: chunk.data,
        },
        FormField::Text {
            name: "storage",
            value: storage.to_string(),
        },
        FormField::Text {
            name: "offset",
            value: chunk.offset.to_string(),
        },
    ];
    if let Some(directory) = directory {
        fields.push(FormField::Text {
            name: "path",
            value: directory.to_string(),
        });
    }
    fields
}

fn model_chunk_fields(chunk: ChunkRequest) -> Vec<FormField> {
    let mut fields = if chunk.single {
        vec![FormField::Bytes {
            name: "model_file",
            file_name: Some(chunk.file_name),
            data: chunk.data,
        }]
    } else {
        vec![
            FormField::Bytes {
                name: "model_file",
                file_name: None,
                data: chunk.data,
            },
            FormField::Text {
                name: "offset",
                value: chunk.offset.to_string(),
            },
            FormField::Text {
                name: "size",
                value: chunk.total_size.to_string(),
            },
        ]
    };
    if let Some(model_info) = chunk.trailer {
        fields.push(FormField::Text {
            name: "model_info",
            value: model_info,
        });
    }
    fields
}

/// File-manager upload into `directory` on `storage`.
pub struct FileUpload<'a> {
    client: &'a SupervisorClient,
    storage: Storage,
    directory: Option<String>,
}

impl ChunkTransport for FileUpload<'_> {
    type Response = ();

    async fn send_chunk(&self, chunk: ChunkRequest) -> Result<()> {
        let request = ApiRequest::post(self.client.endpoint(FILE_UPLOAD_PATH)?).multipart(file_chunk_fields(
            self.storage,
            self.directory.as_deref(),
            chunk,
        ));
        self.client.api.request_unit(&request).await?;
        Ok(())
    }
}

pub struct ModelUpload<'a> {
    client: &'a SupervisorClient,
}

impl ChunkTransport for ModelUpload<'_> {
    type Response = Option<Value>;

    async fn send_chunk(&self, chunk: ChunkRequest) -> Result<Option<Value>> {
        let request = ApiRequest::post(self.client.endpoint(MODEL_UPLOAD_PATH)?).multipart(model_chunk_fields(chunk));
        Ok(self.client.api.call::<Value>(&request).await?.into_result()?)
    }
}
