use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{
    Method, StatusCode,
    header::AUTHORIZATION,
    multipart::{Form, Part},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

use crate::rest_types::{Envelope, ResponseCode};
use crate::session::{Session, Tokens};

const USER_AGENT: &str = concat!("rcam/", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub enum ApiError {
    Transport(reqwest::Error),
    Status { status: StatusCode, body: String },
    Application {
        code: ResponseCode,
        message: Option<String>,
    },
    Unauthorized { detail: String },
    ReauthRequired(String),
    MissingData,
    Decode(serde_json::Error),
    Url(url::ParseError),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Transport(e) => write!(f, "Request failed: {e}"),
            ApiError::Status { status, body } if body.is_empty() => write!(f, "HTTP {status}"),
            ApiError::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            ApiError::Application { code, message } => write!(
                f,
                "Request rejected with code {code}: {}",
                message.as_deref().unwrap_or("request failed")
            ),
            ApiError::Unauthorized { detail } => write!(f, "Unauthorized ({detail})"),
            ApiError::ReauthRequired(reason) => {
                write!(f, "Session expired, please log in again: {reason}")
            }
            ApiError::MissingData => write!(f, "Response contained no data"),
            ApiError::Decode(e) => write!(f, "Malformed response: {e}"),
            ApiError::Url(e) => write!(f, "Invalid URL: {e}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Transport(e) => Some(e),
            ApiError::Decode(e) => Some(e),
            ApiError::Url(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(e)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e)
    }
}

impl From<url::ParseError> for ApiError {
    fn from(e: url::ParseError) -> Self {
        ApiError::Url(e)
    }
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}

#[derive(Debug, Clone)]
pub enum FormField {
    Text {
        name: &'static str,
        value: String,
    },
    Bytes {
        name: &'static str,
        file_name: Option<String>,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<FormField>),
}

/// A request description that can be sent more than once, so an
/// unauthorized request can be replayed after a token refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    url: Url,
    query: Vec<(String, String)>,
    body: RequestBody,
    timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            query: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ApiError> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn multipart(mut self, fields: Vec<FormField>) -> Self {
        self.body = RequestBody::Multipart(fields);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sends once with `token`, without any refresh handling.
    pub async fn send(
        &self,
        http: &reqwest::Client,
        token: Option<&str>,
    ) -> Result<Envelope<Value>, ApiError> {
        tracing::debug!("{} {}", self.method, self.url);
        let response = self.build(http, token).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        classify_envelope(status, &body)
    }

    /// Like [`ApiRequest::send`], but unwraps the envelope's `data`.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        http: &reqwest::Client,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        decode_data::<T>(self.send(http, token).await?)?
            .into_result()?
            .ok_or(ApiError::MissingData)
    }

    fn build(&self, http: &reqwest::Client, token: Option<&str>) -> reqwest::RequestBuilder {
        let mut builder = http.request(self.method.clone(), self.url.clone());
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, token);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        match &self.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields)),
        }
    }
}

fn build_form(fields: &[FormField]) -> Form {
    fields.iter().fold(Form::new(), |form, field| match field {
        FormField::Text { name, value } => form.text(*name, value.clone()),
        FormField::Bytes {
            name,
            file_name,
            data,
        } => {
            let part = Part::bytes(data.clone());
            let part = match file_name {
                Some(file_name) => part.file_name(file_name.clone()),
                None => part.file_name("blob"),
            };
            form.part(*name, part)
        }
    })
}

/// Obtains a new access token once the current one has been rejected.
pub trait Reauthenticator: Send + Sync {
    fn reauthenticate(
        &self,
        http: &reqwest::Client,
        tokens: Tokens,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;
}

/// Sends `send` with the session's token; on an authorization failure
/// refreshes the session once and replays.
pub async fn with_reauth<T, S, SFut, R, RFut>(
    session: &Session,
    mut send: S,
    reauthenticate: R,
) -> Result<T, ApiError>
where
    S: FnMut(Option<String>) -> SFut,
    SFut: Future<Output = Result<T, ApiError>>,
    R: FnOnce(Tokens) -> RFut,
    RFut: Future<Output = Result<String, ApiError>>,
{
    let token = session.access_token();
    match send(token.clone()).await {
        Err(err) if err.is_unauthorized() => {
            tracing::debug!("{}, refreshing session", err);
            let fresh = session.refresh(token.as_deref(), reauthenticate).await?;
            send(Some(fresh)).await.map_err(|err| match err {
                ApiError::Unauthorized { detail } => {
                    ApiError::ReauthRequired(format!("token rejected after refresh ({detail})"))
                }
                other => other,
            })
        }
        result => result,
    }
}

/// Classifies a JSON response. Authorization failures are detected from the
/// HTTP status or the envelope code, whichever signals first.
pub fn classify_envelope(status: StatusCode, body: &[u8]) -> Result<Envelope<Value>, ApiError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized {
            detail: format!("HTTP {status}"),
        });
    }

    match serde_json::from_slice::<Envelope<Value>>(body) {
        Ok(envelope) if envelope.code.is_auth_failure() => Err(ApiError::Unauthorized {
            detail: format!("code {}", envelope.code),
        }),
        Ok(envelope) if status.is_success() => Ok(envelope),
        Ok(envelope) => Err(ApiError::Status {
            status,
            body: envelope.message().unwrap_or_default().to_string(),
        }),
        Err(_) if !status.is_success() => Err(ApiError::Status {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        }),
        Err(e) => Err(ApiError::Decode(e)),
    }
}

/// Classifies a binary response. Successful bodies are returned untouched;
/// error bodies are decoded as text and parsed as an envelope so the code
/// can be inspected.
pub fn classify_binary(status: StatusCode, body: &[u8]) -> Result<Vec<u8>, ApiError> {
    if status.is_success() {
        return Ok(body.to_vec());
    }

    let text = String::from_utf8_lossy(body);
    match serde_json::from_str::<Envelope<Value>>(&text) {
        Ok(envelope) if envelope.code.is_auth_failure() || status == StatusCode::UNAUTHORIZED => {
            Err(ApiError::Unauthorized {
                detail: format!("code {}", envelope.code),
            })
        }
        Ok(envelope) => Err(ApiError::Application {
            message: Some(envelope.message().unwrap_or("Download failed").to_string()),
            code: envelope.code,
        }),
        Err(_) if status == StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized {
            detail: format!("HTTP {status}"),
        }),
        Err(_) => Err(ApiError::Status {
            status,
            body: text.into_owned(),
        }),
    }
}

fn decode_data<T: DeserializeOwned>(envelope: Envelope<Value>) -> Result<Envelope<T>, ApiError> {
    let data = envelope.data.map(serde_json::from_value).transpose()?;
    Ok(Envelope {
        code: envelope.code,
        data,
        msg: envelope.msg,
        message: envelope.message,
    })
}

/// Resolves `path` below `base`, treating `base` as a directory even when it
/// lacks a trailing slash.
pub fn join_endpoint(base: &Url, path: &str) -> Result<Url, ApiError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let directory = format!("{}/", base.path());
        base.set_path(&directory);
    }
    Ok(base.join(path.trim_start_matches('/'))?)
}

pub fn build_http_client() -> Result<reqwest::Client, ApiError> {
    Ok(reqwest::Client::builder().user_agent(USER_AGENT).build()?)
}

pub struct ApiClient<A> {
    http: reqwest::Client,
    session: Arc<Session>,
    reauth: A,
}

impl<A: Reauthenticator> ApiClient<A> {
    pub fn new(session: Arc<Session>, reauth: A) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_http_client()?,
            session,
            reauth,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Returns the raw envelope, leaving the code check to the caller.
    pub async fn call<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<Envelope<T>, ApiError> {
        let http = &self.http;
        let envelope = with_reauth(
            &self.session,
            move |token: Option<String>| async move { request.send(http, token.as_deref()).await },
            |tokens| self.reauth.reauthenticate(http, tokens),
        )
        .await?;

        decode_data(envelope)
    }

    pub async fn request<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        self.call::<T>(request)
            .await?
            .into_result()?
            .ok_or(ApiError::MissingData)
    }

    /// For endpoints whose `data` carries nothing of interest.
    pub async fn request_unit(&self, request: &ApiRequest) -> Result<(), ApiError> {
        self.call::<Value>(request).await?.into_result()?;
        Ok(())
    }

    pub async fn download(&self, request: &ApiRequest) -> Result<Vec<u8>, ApiError> {
        let http = &self.http;
        with_reauth(
            &self.session,
            move |token: Option<String>| async move {
                tracing::debug!("{} {} (binary)", request.method, request.url);
                let response = request.build(http, token.as_deref()).send().await?;
                let status = response.status();
                let body = response.bytes().await?;
                classify_binary(status, &body)
            },
            |tokens| self.reauth.reauthenticate(http, tokens),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_with(access: Option<&str>, refresh: Option<&str>) -> Session {
        Session::in_memory(Tokens {
            access_token: access.map(str::to_string),
            refresh_token: refresh.map(str::to_string),
        })
    }

    fn unauthorized() -> ApiError {
        ApiError::Unauthorized {
            detail: "code 11101".to_string(),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_refreshes_once_and_replays() {
        let session = session_with(Some("expired"), Some("refresh"));
        let sends = AtomicUsize::new(0);
        let refreshes = AtomicUsize::new(0);

        let result = with_reauth(
            &session,
            |token| {
                sends.fetch_add(1, Ordering::SeqCst);
                async move {
                    match token.as_deref() {
                        Some("fresh") => Ok("replayed response"),
                        _ => Err(unauthorized()),
                    }
                }
            },
            |tokens| {
                refreshes.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));
                    Ok::<_, ApiError>("fresh".to_string())
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "replayed response");
        assert_eq!(sends.load(Ordering::SeqCst), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(session.access_token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_failed_refresh_rejects_without_replay() {
        let session = session_with(Some("expired"), Some("refresh"));
        let sends = AtomicUsize::new(0);
        let refreshes = AtomicUsize::new(0);

        let result: Result<(), ApiError> = with_reauth(
            &session,
            |_| {
                sends.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(unauthorized()) }
            },
            |_| {
                refreshes.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<String, _>(ApiError::Status {
                        status: StatusCode::BAD_GATEWAY,
                        body: String::new(),
                    })
                }
            },
        )
        .await;

        assert!(matches!(result, Err(ApiError::ReauthRequired(_))));
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_terminal() {
        let session = session_with(Some("expired"), Some("refresh"));
        let sends = AtomicUsize::new(0);

        let result: Result<(), ApiError> = with_reauth(
            &session,
            |_| {
                sends.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(unauthorized()) }
            },
            |_| async { Ok::<_, ApiError>("fresh".to_string()) },
        )
        .await;

        assert!(matches!(result, Err(ApiError::ReauthRequired(_))));
        assert_eq!(sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through_without_refresh() {
        let session = session_with(Some("token"), None);
        let refreshes = AtomicUsize::new(0);

        let result: Result<(), ApiError> = with_reauth(
            &session,
            |_| async {
                Err::<(), _>(ApiError::Application {
                    code: ResponseCode::Number(-1),
                    message: None,
                })
            },
            |_| {
                refreshes.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ApiError>("fresh".to_string()) }
            },
        )
        .await;

        assert!(matches!(result, Err(ApiError::Application { .. })));
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_classify_envelope() {
        let ok = classify_envelope(StatusCode::OK, br#"{"code":0,"data":{"a":1}}"#).unwrap();
        assert!(ok.is_success());

        let expired = classify_envelope(StatusCode::OK, br#"{"code":11102,"msg":"expired"}"#);
        assert!(matches!(expired, Err(ApiError::Unauthorized { .. })));

        let http_401 = classify_envelope(StatusCode::UNAUTHORIZED, b"");
        assert!(matches!(http_401, Err(ApiError::Unauthorized { .. })));

        let server_error = classify_envelope(StatusCode::INTERNAL_SERVER_ERROR, b"boom");
        assert!(matches!(
            server_error,
            Err(ApiError::Status { status: StatusCode::INTERNAL_SERVER_ERROR, .. })
        ));

        let garbage = classify_envelope(StatusCode::OK, b"<html>");
        assert!(matches!(garbage, Err(ApiError::Decode(_))));
    }

    #[test]
    fn test_classify_binary_inspects_error_bodies() {
        let bytes = classify_binary(StatusCode::OK, &[0xff, 0x00, 0x7f]).unwrap();
        assert_eq!(bytes, vec![0xff, 0x00, 0x7f]);

        let expired = classify_binary(StatusCode::FORBIDDEN, br#"{"code":11101}"#);
        assert!(matches!(expired, Err(ApiError::Unauthorized { .. })));

        let missing = classify_binary(StatusCode::NOT_FOUND, br#"{"code":-1,"msg":"no such file"}"#);
        match missing {
            Err(ApiError::Application { message, .. }) => {
                assert_eq!(message.as_deref(), Some("no such file"))
            }
            other => panic!("expected application error, got {:?}", other),
        }

        let opaque = classify_binary(StatusCode::BAD_GATEWAY, &[0xde, 0xad]);
        assert!(matches!(
            opaque,
            Err(ApiError::Status { status: StatusCode::BAD_GATEWAY, .. })
        ));
    }

    #[test]
    fn test_join_endpoint_keeps_base_path() {
        let device = Url::parse("http://192.168.42.1").unwrap();
        assert_eq!(
            join_endpoint(&device, "api/userMgr/login").unwrap().as_str(),
            "http://192.168.42.1/api/userMgr/login"
        );

        let proxied = Url::parse("https://example.com/camera").unwrap();
        assert_eq!(
            join_endpoint(&proxied, "/api/fileMgr/list").unwrap().as_str(),
            "https://example.com/camera/api/fileMgr/list"
        );
    }

    #[test]
    fn test_request_is_replayable() {
        let url = Url::parse("http://192.168.42.1/api/fileMgr/upload").unwrap();
        let request = ApiRequest::post(url).multipart(vec![FormField::Text {
            name: "offset",
            value: "0".to_string(),
        }]);
        let http = reqwest::Client::new();

        let first = request.build(&http, Some("a")).build().unwrap();
        let second = request.build(&http, Some("b")).build().unwrap();

        assert_eq!(first.headers()[AUTHORIZATION], "a");
        assert_eq!(second.headers()[AUTHORIZATION], "b");
        assert_eq!(first.url(), second.url());
    }

    struct TestServer {
        base: Url,
        seen: Arc<std::sync::Mutex<Vec<Option<String>>>>,
    }

    impl TestServer {
        fn seen(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    /// Answers each connection with a canned response chosen from the
    /// request's `Authorization` header.
    async fn serve<F>(respond: F) -> TestServer
    where
        F: Fn(Option<&str>) -> (u16, Vec<u8>) + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = seen.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buffer = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buffer[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request).into_owned();
                let token = head.lines().find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("authorization")
                        .then(|| value.trim().to_string())
                });

                let (status, body) = respond(token.as_deref());
                recorded.lock().unwrap().push(token);
                let head = format!(
                    "HTTP/1.1 {} Test\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            }
        });

        TestServer { base, seen }
    }

    struct FixedToken {
        calls: AtomicUsize,
    }

    impl Reauthenticator for FixedToken {
        async fn reauthenticate(&self, _http: &reqwest::Client, _tokens: Tokens) -> Result<String, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("fresh".to_string())
        }
    }

    fn local_client(access: Option<&str>) -> ApiClient<FixedToken> {
        ApiClient {
            http: reqwest::Client::builder().no_proxy().build().unwrap(),
            session: Arc::new(session_with(access, None)),
            reauth: FixedToken {
                calls: AtomicUsize::new(0),
            },
        }
    }

    #[tokio::test]
    async fn test_expired_code_is_replayed_with_new_header() {
        let server = serve(|token| match token {
            Some("fresh") => (200, br#"{"code":0,"data":{"name":"recamera"}}"#.to_vec()),
            _ => (200, br#"{"code":11101,"msg":"token expired"}"#.to_vec()),
        })
        .await;
        let client = local_client(Some("expired"));
        let request = ApiRequest::get(join_endpoint(&server.base, "api/deviceMgr/queryDeviceInfo").unwrap());

        let info: Value = client.request(&request).await.unwrap();

        assert_eq!(info["name"], "recamera");
        assert_eq!(
            server.seen(),
            vec![Some("expired".to_string()), Some("fresh".to_string())]
        );
        assert_eq!(client.reauth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.session().access_token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_download_after_http_401_gets_bytes() {
        let server = serve(|token| match token {
            Some("fresh") => (200, vec![0xff, 0x00, 0x01]),
            _ => (401, Vec::new()),
        })
        .await;
        let client = local_client(None);
        let request = ApiRequest::get(join_endpoint(&server.base, "api/fileMgr/download").unwrap())
            .query("path", "clip.mp4");

        let bytes = client.download(&request).await.unwrap();

        assert_eq!(bytes, vec![0xff, 0x00, 0x01]);
        assert_eq!(server.seen(), vec![None, Some("fresh".to_string())]);
        assert_eq!(client.reauth.calls.load(Ordering::SeqCst), 1);
    }
}
