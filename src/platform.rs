//! SenseCraft cloud platform client.
//!
//! The platform is split over several services; requests are routed to a
//! base URL by the first segments of their path.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::client::{ApiClient, ApiError, ApiRequest, Reauthenticator, join_endpoint};
use crate::config::PlatformUrls;
use crate::rest_types::{AppInfo, AppList, PlatformUserInfo, RefreshTokenResponse};
use crate::session::{Session, Tokens};

const REFRESH_TOKEN_PATH: &str = "portalapi/auth/refreshToken";
const USER_INFO_PATH: &str = "portalapi/user/getUserOrgInfo";
const APP_LIST_PATH: &str = "aiserverapi/flow/app/v2/list_app";
const APP_VIEW_PATH: &str = "aiserverapi/flow/app/v2/view_app";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformService {
    Portal,
    SenseCraft,
    Train,
}

impl PlatformService {
    pub fn for_path(path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');
        if path.starts_with("portalapi") {
            Some(PlatformService::Portal)
        } else if path.starts_with("aiserverapi") {
            Some(PlatformService::SenseCraft)
        } else if path.starts_with("v1/api") || path.starts_with("v2/api") {
            Some(PlatformService::Train)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlatformEndpoints {
    urls: PlatformUrls,
}

impl PlatformEndpoints {
    pub fn new(urls: PlatformUrls) -> Self {
        Self { urls }
    }

    pub fn base_url(&self, service: PlatformService) -> &Url {
        match service {
            PlatformService::Portal => &self.urls.portal,
            PlatformService::SenseCraft => &self.urls.sensecraft,
            PlatformService::Train => &self.urls.train,
        }
    }

    pub fn resolve(&self, path: &str) -> Result<Url> {
        let service = PlatformService::for_path(path)
            .ok_or_else(|| anyhow!("No SenseCraft service handles {}", path))?;
        Ok(join_endpoint(self.base_url(service), path)?)
    }
}

/// Exchanges the stored refresh token for a new access token. The exchange
/// itself is never retried on an authorization failure.
pub struct RefreshTokenExchange {
    portal: Url,
}

impl Reauthenticator for RefreshTokenExchange {
    async fn reauthenticate(&self, http: &reqwest::Client, tokens: Tokens) -> Result<String, ApiError> {
        let (Some(access_token), Some(refresh_token)) = (tokens.access_token, tokens.refresh_token) else {
            return Err(ApiError::ReauthRequired(
                "no SenseCraft session stored, run `rcam platform set-token`".to_string(),
            ));
        };

        tracing::debug!("Refreshing SenseCraft token");
        let response: RefreshTokenResponse = ApiRequest::get(join_endpoint(&self.portal, REFRESH_TOKEN_PATH)?)
            .query("refreshToken", refresh_token)
            .fetch(http, Some(&access_token))
            .await?;
        Ok(response.token)
    }
}

pub struct PlatformClient {
    endpoints: PlatformEndpoints,
    api: ApiClient<RefreshTokenExchange>,
}

impl PlatformClient {
    pub fn new(urls: PlatformUrls, session: Arc<Session>) -> Result<Self> {
        let reauth = RefreshTokenExchange {
            portal: urls.portal.clone(),
        };
        Ok(Self {
            endpoints: PlatformEndpoints::new(urls),
            api: ApiClient::new(session, reauth)?,
        })
    }

    pub fn set_tokens(&self, access_token: String, refresh_token: Option<String>) -> Result<()> {
        self.api.session().set_tokens(Tokens {
            access_token: Some(access_token),
            refresh_token,
        })
    }

    pub fn logout(&self) -> Result<()> {
        self.api.session().clear()
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let request = query
            .iter()
            .fold(ApiRequest::get(self.endpoints.resolve(path)?), |request, (key, value)| {
                request.query(key, *value)
            });
        Ok(self.api.request(&request).await?)
    }

    pub async fn user_info(&self) -> Result<PlatformUserInfo> {
        self.get(USER_INFO_PATH, &[]).await
    }

    pub async fn apps(&self) -> Result<Vec<AppInfo>> {
        Ok(self.get::<AppList>(APP_LIST_PATH, &[]).await?.list)
    }

    pub async fn app(&self, app_id: &str) -> Result<Value> {
        self.get(APP_VIEW_PATH, &[("app_id", app_id)]).await
    }
}
