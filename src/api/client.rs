//! Authenticated request pipeline.
//!
//! Every business call goes through `ApiClient::send`. The pre-request hook
//! attaches the API key, the bearer token and a request id. The post-response
//! hook only acts on 401: it refreshes through the single-flight coordinator
//! and re-issues the request once.

use crate::{
    api::{error_from_response, with_api_key},
    error::ApiError,
    session::{AuthStore, SessionManager},
};
use reqwest::{header::HeaderMap, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info_span, instrument, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Debug)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Value>,
    retried: bool,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            retried: false,
        }
    }

    #[must_use]
    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: &str) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn patch(path: &str) -> Self {
        Self::new(Method::PATCH, path)
    }

    #[must_use]
    pub fn delete(path: &str) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Set once the request has been re-issued after a refresh.
    #[must_use]
    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

/// A successful response with its body already read.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Decodes the body as JSON. An empty body decodes as `null`.
    ///
    /// # Errors
    /// Returns `ApiError::Parse` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let body: &[u8] = if self.body.is_empty() {
            b"null"
        } else {
            &self.body
        };

        serde_json::from_slice(body)
            .map_err(|err| ApiError::Parse(format!("Error parsing response body: {err}")))
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone)]
pub struct ApiClient {
    manager: SessionManager,
}

impl ApiClient {
    #[must_use]
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    #[must_use]
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    #[must_use]
    pub fn store(&self) -> &AuthStore {
        self.manager.store()
    }

    /// Sends `request`, recovering once from a 401 through the refresh coordinator.
    ///
    /// # Errors
    /// Returns the transport error, or `ApiError::Http` for any non-success
    /// response that could not be recovered.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        loop {
            let token = self.store().access_token();
            let response = self.dispatch(&request, token.as_ref()).await?;
            let status = response.status();

            if status.is_success() {
                self.store().coordinator().reset_attempts();
                return Ok(ApiResponse {
                    status,
                    headers: response.headers().clone(),
                    body: response.bytes().await?.to_vec(),
                });
            }

            let err = error_from_response(response).await;
            if status != StatusCode::UNAUTHORIZED {
                return Err(err);
            }

            if !self.recover(&mut request, &err, token).await {
                return Err(err);
            }
            debug!("retrying request with refreshed token");
        }
    }

    /// # Errors
    /// See [`ApiClient::send`]; also fails if the body does not decode as `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    /// # Errors
    /// See [`ApiClient::send`].
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).json(to_value(body)?))
            .await?
            .json()
    }

    /// # Errors
    /// See [`ApiClient::send`].
    pub async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::put(path).json(to_value(body)?))
            .await?
            .json()
    }

    /// # Errors
    /// See [`ApiClient::send`].
    pub async fn patch_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::patch(path).json(to_value(body)?))
            .await?
            .json()
    }

    /// # Errors
    /// See [`ApiClient::send`].
    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::delete(path)).await
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&SecretString>,
    ) -> Result<reqwest::Response, ApiError> {
        let config = self.store().config();
        let url = config.endpoint_url(&request.path);
        let request_id = Uuid::new_v4().to_string();

        let mut builder = with_api_key(
            self.store().http().request(request.method.clone(), &url),
            config,
        )
        .header(REQUEST_ID_HEADER, &request_id);

        if let Some(token) = token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let span = info_span!(
            "api.request",
            http.method = %request.method,
            url = %url,
            request_id = %request_id,
            retried = request.retried
        );

        Ok(builder.send().instrument(span).await?)
    }

    /// Decides whether a 401 can be recovered. True means the request should
    /// be re-issued with the refreshed token.
    async fn recover(
        &self,
        request: &mut ApiRequest,
        err: &ApiError,
        token: Option<SecretString>,
    ) -> bool {
        if self.store().config().is_auth_endpoint(&request.path) {
            return false;
        }

        if request.retried {
            debug!("401 on retried request, giving up");
            return false;
        }
        request.retried = true;

        if self.manager.handle_api_error(err) {
            return false;
        }

        if self.store().refresh_token().is_none() {
            self.manager.handle_session_expired();
            return false;
        }

        let rejected = token.as_ref().map(ExposeSecret::expose_secret);
        self.manager.refresh_or_expire(rejected).await
    }
}

fn to_value<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body)
        .map_err(|err| ApiError::Serialization(format!("Failed to encode request body: {err}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        config::ClientConfig,
        session::{MemoryCookieJar, MemoryStore, Persistence, SessionEvent, User},
    };
    use serde_json::json;
    use std::{net::TcpListener, sync::Arc, time::Duration};
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn client(uri: &str) -> (ApiClient, mpsc::UnboundedReceiver<SessionEvent>) {
        let config = ClientConfig::new(uri, SecretString::from("api-key".to_string())).unwrap();
        let persistence = Persistence::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCookieJar::new()),
            "auth-storage",
            Duration::from_secs(60),
        );
        let (manager, events) = SessionManager::new(AuthStore::new(config, persistence).unwrap());
        (ApiClient::new(manager), events)
    }

    fn sign_in(client: &ApiClient, access: &str, refresh: Option<&str>) {
        client.store().set_auth(
            Some(User {
                id: "1".to_string(),
                ..User::default()
            }),
            SecretString::from(access.to_string()),
            refresh.map(|token| SecretString::from(token.to_string())),
        );
    }

    #[test]
    fn empty_body_decodes_as_null() {
        let response = ApiResponse {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: Vec::new(),
        };
        assert_eq!(response.json::<Value>().unwrap(), Value::Null);
        assert_eq!(response.json::<Option<u32>>().unwrap(), None);
    }

    #[tokio::test]
    async fn attaches_api_key_bearer_and_request_id() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/applications"))
            .and(query_param("page", "2"))
            .and(header("x-api-key", "api-key"))
            .and(header("authorization", "Bearer a1"))
            .and(header_exists(REQUEST_ID_HEADER))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
            .mount(&server)
            .await;

        let (client, _events) = client(&server.uri());
        sign_in(&client, "a1", Some("r1"));

        let response = client
            .send(ApiRequest::get("/applications").query("page", "2"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.json::<Value>().unwrap(), json!({"items": []}));
    }

    #[tokio::test]
    async fn non_401_errors_propagate_unchanged() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/contracts"))
            .and(body_json(json!({"amount": 10})))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "code": "VALIDATION",
                "message": "amount too small"
            })))
            .mount(&server)
            .await;

        let (client, _events) = client(&server.uri());
        sign_in(&client, "a1", Some("r1"));

        let err = client
            .post_json::<_, Value>("/contracts", &json!({"amount": 10}))
            .await
            .unwrap_err();
        match err {
            ApiError::Http {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 422);
                assert_eq!(code.as_deref(), Some("VALIDATION"));
                assert_eq!(message, "amount too small");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(client.store().is_authenticated());
    }

    #[tokio::test]
    async fn login_endpoint_401_is_not_recovered() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (client, mut events) = client(&server.uri());
        sign_in(&client, "a1", Some("r1"));

        let err = client
            .send(ApiRequest::post("/auth/login").json(json!({})))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert!(client.store().is_authenticated());
        assert!(events.try_recv().is_err());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_expires_without_refresh_call() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/payments"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (client, mut events) = client(&server.uri());
        sign_in(&client, "a1", None);

        let err = client.get_json::<Value>("/payments").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Expired { .. }
        ));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn second_401_after_refresh_propagates() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "a2",
                "refreshToken": "r2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _events) = client(&server.uri());
        sign_in(&client, "a1", Some("r1"));

        let err = client.get_json::<Value>("/projects").await.unwrap_err();
        assert!(err.is_unauthorized());
        // the refreshed session stays; only the request failed
        assert_eq!(client.store().snapshot().access_token(), Some("a2"));
    }
}
