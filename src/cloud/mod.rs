use crate::binding::{redact, AnyError, ControlPlane};
use crate::registration::BUNDLE_ID;
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE},
    Client, Method, Request, StatusCode, Url,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{fmt, sync::Mutex, time::Duration};

pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
const PUSH_PLATFORM: &str = "android";
const PUSH_LANGUAGE: &str = "zh";
const PUSH_OS: &str = "Android";
const PUSH_OS_VERSION: u32 = 1;
const PHONE_MODEL: &str = "phone:Xiaomi_Mi_10/App:钉钉智能_1.0.0/Android_11";
const SUCCESS_MESSAGE: &str = "success";
const NO_TOKEN_MESSAGE: &str = "no token";

pub struct CloudClient {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
    session: Mutex<Option<CloudSession>>,
}

#[derive(Clone)]
pub struct CloudClientBuilder {
    base_url: String,
    username: String,
    password: String,
    timeout: Duration,
    session: Option<CloudSession>,
}

impl CloudClientBuilder {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            session: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Starts from a cached session instead of logging in on first use.
    pub fn session(mut self, session: Option<CloudSession>) -> Self {
        self.session = session.filter(|s| !s.token.trim().is_empty());
        self
    }

    pub fn build(self) -> Result<CloudClient, CloudError> {
        if self.username.trim().is_empty() {
            return Err(CloudError::Config("account username must not be empty"));
        }
        if self.password.is_empty() {
            return Err(CloudError::Config("account password must not be empty"));
        }

        let mut parsed = Url::parse(self.base_url.trim()).map_err(|err| CloudError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(CloudError::Http)?;

        Ok(CloudClient {
            http,
            base_url: parsed,
            username: self.username.trim().to_string(),
            password: self.password,
            session: Mutex::new(self.session),
        })
    }
}

impl CloudClient {
    pub fn builder(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> CloudClientBuilder {
        CloudClientBuilder::new(base_url, username, password)
    }

    pub fn session(&self) -> Option<CloudSession> {
        self.session.lock().unwrap().clone()
    }

    pub fn current_session_token(&self) -> Option<String> {
        self.session.lock().unwrap().as_ref().map(|s| s.token.clone())
    }

    pub async fn login(&self) -> Result<CloudSession, CloudError> {
        tracing::info!(username = %self.username, api = %self.base_url, "logging in");
        let req = self.build_login_request()?;
        let (status, body) = self.execute(req).await?;
        let session = parse_login_response(status, &body)?;
        tracing::info!(
            user_id = session.user_id.as_deref().unwrap_or("-"),
            token = %redact(&session.token),
            "login succeeded"
        );
        *self.session.lock().unwrap() = Some(session.clone());
        Ok(session)
    }

    /// Logs in first when there is no session. An expired session is
    /// refreshed once and the request retried.
    pub async fn device_list(&self) -> Result<Vec<Device>, CloudError> {
        let token = match self.current_session_token() {
            Some(token) => token,
            None => {
                tracing::info!("no session token, logging in before listing devices");
                self.login().await?.token
            }
        };

        let req = self.build_device_list_request(&token)?;
        let (status, body) = self.execute(req).await?;
        match parse_device_list_response(status, &body) {
            Err(CloudError::NotAuthenticated) => {
                tracing::warn!(status = status.as_u16(), "session token rejected, logging in again");
                let token = self.login().await?.token;
                let req = self.build_device_list_request(&token)?;
                let (status, body) = self.execute(req).await?;
                parse_device_list_response(status, &body)
            }
            other => other,
        }
    }

    pub async fn bind_call_push_token(&self, push_token: &str) -> Result<(), CloudError> {
        let token = self.current_session_token().ok_or(CloudError::NotAuthenticated)?;
        let req = self.build_bind_request(BindTarget::Call, &token, push_token)?;
        let (status, body) = self.execute(req).await?;
        parse_binding_response(status, &body)
    }

    pub async fn bind_message_push_token(&self, push_token: &str) -> Result<(), CloudError> {
        let token = self.current_session_token().ok_or(CloudError::NotAuthenticated)?;
        let req = self.build_bind_request(BindTarget::Message, &token, push_token)?;
        let (status, body) = self.execute(req).await?;
        parse_binding_response(status, &body)
    }

    pub fn build_login_request(&self) -> Result<Request, CloudError> {
        let body = serde_json::to_vec(&LoginRequest {
            username: &self.username,
            password: &self.password,
        })
        .map_err(CloudError::Json)?;
        self.build_request_builder(Method::POST, "v1/api/user/login")?
            .header("formal", "formal")
            .body(body)
            .build()
            .map_err(CloudError::Http)
    }

    pub fn build_device_list_request(&self, session_token: &str) -> Result<Request, CloudError> {
        self.build_request_builder(Method::GET, "v1/api/user/device")?
            .headers(authenticated_headers(session_token)?)
            .build()
            .map_err(CloudError::Http)
    }

    pub fn build_bind_request(
        &self,
        target: BindTarget,
        session_token: &str,
        push_token: &str,
    ) -> Result<Request, CloudError> {
        let body = serde_json::to_vec(&PushTokenBinding::new(push_token)).map_err(CloudError::Json)?;
        self.build_request_builder(Method::POST, target.path())?
            .headers(authenticated_headers(session_token)?)
            .body(body)
            .build()
            .map_err(CloudError::Http)
    }

    fn build_request_builder(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder, CloudError> {
        let url = self.base_url.join(path).map_err(|err| CloudError::Url(err.to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self.http.request(method, url).headers(headers))
    }

    async fn execute(&self, req: Request) -> Result<(StatusCode, String), CloudError> {
        tracing::debug!(method = %req.method(), url = %req.url(), "control-plane request");
        let resp = self.http.execute(req).await.map_err(CloudError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(CloudError::Http)?;
        Ok((status, body))
    }
}

#[async_trait]
impl ControlPlane for CloudClient {
    async fn login(&self) -> Result<(), AnyError> {
        CloudClient::login(self).await?;
        Ok(())
    }

    fn session_token(&self) -> Option<String> {
        self.current_session_token()
    }

    async fn bind_call_push_token(&self, push_token: &str) -> Result<(), AnyError> {
        Ok(CloudClient::bind_call_push_token(self, push_token).await?)
    }

    async fn bind_message_push_token(&self, push_token: &str) -> Result<(), AnyError> {
        Ok(CloudClient::bind_message_push_token(self, push_token).await?)
    }
}

fn authenticated_headers(session_token: &str) -> Result<HeaderMap, CloudError> {
    let mut headers = HeaderMap::new();
    headers.insert("baseurl", HeaderValue::from_static("formal"));
    headers.insert("bundleid", HeaderValue::from_static(BUNDLE_ID));
    headers.insert(
        "token",
        HeaderValue::from_str(session_token.trim()).map_err(CloudError::InvalidHeaderValue)?,
    );
    Ok(headers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTarget {
    Call,
    Message,
}

impl BindTarget {
    fn path(self) -> &'static str {
        match self {
            Self::Call => "v1/api/user/token",
            Self::Message => "v1/api/user/message/token",
        }
    }
}

#[derive(Debug)]
pub enum CloudError {
    Config(&'static str),
    Url(String),
    Http(reqwest::Error),
    Json(serde_json::Error),
    InvalidHeaderValue(reqwest::header::InvalidHeaderValue),
    Api { status: StatusCode, body: String },
    NotAuthenticated,
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::InvalidHeaderValue(err) => write!(f, "invalid header value: {err}"),
            Self::Api { status, body } => write!(f, "api error {}: {}", status.as_u16(), body),
            Self::NotAuthenticated => f.write_str("not authenticated"),
        }
    }
}

impl std::error::Error for CloudError {}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushTokenBinding {
    pub push_token: String,
    pub push_platform: String,
    pub language: String,
    pub os_token: String,
    pub os: String,
    pub os_push_version: u32,
    pub bundleid: String,
    pub phone_model: String,
}

impl PushTokenBinding {
    pub fn new(push_token: &str) -> Self {
        Self {
            push_token: push_token.to_string(),
            push_platform: PUSH_PLATFORM.to_string(),
            language: PUSH_LANGUAGE.to_string(),
            os_token: String::new(),
            os: PUSH_OS.to_string(),
            os_push_version: PUSH_OS_VERSION,
            bundleid: BUNDLE_ID.to_string(),
            phone_model: PHONE_MODEL.to_string(),
        }
    }
}

/// Control-plane login state. Persisted in the vault between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudSession {
    pub token: String,
    #[serde(default, alias = "id", deserialize_with = "lenient_opt_string")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub reflash_key: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub logout_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Device {
    #[serde(default, deserialize_with = "lenient_string")]
    pub uid: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

pub fn parse_login_response(status: StatusCode, body: &str) -> Result<CloudSession, CloudError> {
    if !status.is_success() {
        return Err(CloudError::Api {
            status,
            body: body.to_string(),
        });
    }
    let value: Value = serde_json::from_str(body).map_err(CloudError::Json)?;
    let has_token = value
        .get("token")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.trim().is_empty());
    if !has_token {
        return Err(CloudError::Api {
            status,
            body: body.to_string(),
        });
    }
    serde_json::from_value(value).map_err(CloudError::Json)
}

/// `NotAuthenticated` means the caller should log in again and retry.
pub fn parse_device_list_response(status: StatusCode, body: &str) -> Result<Vec<Device>, CloudError> {
    if status == StatusCode::UNAUTHORIZED
        || ((status.is_success() || status == StatusCode::BAD_REQUEST) && body.contains(NO_TOKEN_MESSAGE))
    {
        return Err(CloudError::NotAuthenticated);
    }
    if !status.is_success() {
        return Err(CloudError::Api {
            status,
            body: body.to_string(),
        });
    }

    let value: Value = serde_json::from_str(body).map_err(CloudError::Json)?;
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => match ["data", "devices", "list"]
            .iter()
            .find_map(|key| map.remove(*key).filter(Value::is_array))
        {
            Some(list) => list,
            None => {
                return Err(CloudError::Api {
                    status,
                    body: body.to_string(),
                })
            }
        },
        _ => {
            return Err(CloudError::Api {
                status,
                body: body.to_string(),
            })
        }
    };
    serde_json::from_value(list).map_err(CloudError::Json)
}

pub fn parse_binding_response(status: StatusCode, body: &str) -> Result<(), CloudError> {
    let accepted = status.is_success()
        && serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(|m| m == SUCCESS_MESSAGE))
            .unwrap_or(false);
    if accepted {
        Ok(())
    } else {
        Err(CloudError::Api {
            status,
            body: body.to_string(),
        })
    }
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_to_string(Value::deserialize(deserializer)?))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_to_string(Value::deserialize(deserializer)?).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CloudClient {
        CloudClient::builder("https://chniot.example.test:6448", "alice", "s3cret")
            .build()
            .unwrap()
    }

    fn json_body(req: &Request) -> Value {
        serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap()
    }

    #[test]
    fn login_request_posts_credentials_with_formal_header() {
        let req = client().build_login_request().unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().as_str(), "https://chniot.example.test:6448/v1/api/user/login");
        assert_eq!(req.headers().get("formal").unwrap(), "formal");
        assert_eq!(req.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        let body = json_body(&req);
        assert_eq!(body["username"], "alice");
        assert_eq!(body["password"], "s3cret");
    }

    #[test]
    fn device_list_request_carries_session_headers() {
        let req = client().build_device_list_request("tok-1").unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.url().path(), "/v1/api/user/device");
        assert_eq!(req.headers().get("token").unwrap(), "tok-1");
        assert_eq!(req.headers().get("baseurl").unwrap(), "formal");
        assert_eq!(req.headers().get("bundleid").unwrap(), BUNDLE_ID);
    }

    #[test]
    fn bind_requests_share_payload_and_differ_by_path() {
        let client = client();
        let call = client.build_bind_request(BindTarget::Call, "tok", "push-abc").unwrap();
        let message = client.build_bind_request(BindTarget::Message, "tok", "push-abc").unwrap();
        assert_eq!(call.url().path(), "/v1/api/user/token");
        assert_eq!(message.url().path(), "/v1/api/user/message/token");

        let body = json_body(&call);
        assert_eq!(body, json_body(&message));
        assert_eq!(body["push_token"], "push-abc");
        assert_eq!(body["push_platform"], "android");
        assert_eq!(body["os_push_version"], 1);
        assert_eq!(body["os_token"], "");
        assert_eq!(body["phone_model"], PHONE_MODEL);
    }

    #[test]
    fn builder_rejects_missing_credentials() {
        let err = CloudClient::builder("https://x.test/", " ", "pw").build().err();
        assert!(matches!(err, Some(CloudError::Config(_))));
        let err = CloudClient::builder("https://x.test/", "bob", "").build().err();
        assert!(matches!(err, Some(CloudError::Config(_))));
    }

    #[test]
    fn cached_session_is_used_until_replaced() {
        let client = CloudClient::builder("https://x.test/", "bob", "pw")
            .session(Some(CloudSession {
                token: "cached".to_string(),
                ..Default::default()
            }))
            .build()
            .unwrap();
        assert_eq!(client.current_session_token().as_deref(), Some("cached"));

        let blank = CloudClient::builder("https://x.test/", "bob", "pw")
            .session(Some(CloudSession::default()))
            .build()
            .unwrap();
        assert_eq!(blank.current_session_token(), None);
    }

    #[test]
    fn parse_login_reads_numeric_id_as_user_id() {
        let session = parse_login_response(
            StatusCode::OK,
            r#"{"token":"t-123","id":42,"reflash_key":"rk","logout_status":0,"time":1700000000}"#,
        )
        .unwrap();
        assert_eq!(session.token, "t-123");
        assert_eq!(session.user_id.as_deref(), Some("42"));
        assert_eq!(session.logout_status.as_deref(), Some("0"));
        assert_eq!(session.time.as_deref(), Some("1700000000"));
    }

    #[test]
    fn parse_login_without_token_is_an_error() {
        let err = parse_login_response(StatusCode::OK, r#"{"message":"wrong password"}"#).unwrap_err();
        assert!(matches!(err, CloudError::Api { .. }));
        let err = parse_login_response(StatusCode::FORBIDDEN, "denied").unwrap_err();
        assert!(matches!(err, CloudError::Api { status, .. } if status == StatusCode::FORBIDDEN));
    }

    #[test]
    fn parse_device_list_detects_expired_session() {
        for (status, body) in [
            (StatusCode::UNAUTHORIZED, ""),
            (StatusCode::BAD_REQUEST, r#"{"message":"no token"}"#),
            (StatusCode::OK, r#"{"message":"no token"}"#),
        ] {
            assert!(matches!(
                parse_device_list_response(status, body),
                Err(CloudError::NotAuthenticated)
            ));
        }
    }

    #[test]
    fn parse_device_list_accepts_bare_and_wrapped_arrays() {
        let bare = parse_device_list_response(StatusCode::OK, r#"[{"uid":"D1","name":"Front","online":1}]"#)
            .unwrap();
        assert_eq!(bare[0].uid, "D1");
        assert_eq!(bare[0].extra["online"], 1);

        let wrapped = parse_device_list_response(StatusCode::OK, r#"{"data":[{"uid":7}]}"#).unwrap();
        assert_eq!(wrapped[0].uid, "7");
        assert_eq!(wrapped[0].name, "");
    }

    #[test]
    fn binding_requires_success_message() {
        assert!(parse_binding_response(StatusCode::OK, r#"{"message":"success"}"#).is_ok());
        assert!(parse_binding_response(StatusCode::OK, r#"{"message":"fail"}"#).is_err());
        assert!(parse_binding_response(StatusCode::OK, "not json").is_err());
        assert!(parse_binding_response(StatusCode::INTERNAL_SERVER_ERROR, r#"{"message":"success"}"#).is_err());
    }
}
