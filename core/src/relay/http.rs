//! `RelayApi` over HTTPS against the client-server r0 endpoints

use super::api::{
    CreateRoomRequest, CreateRoomResponse, LoginRequest, LoginResponse, MessageContent,
    RelayApi, RelayConnector, SendResponse, SyncResponse, EVENT_TYPE_MESSAGE,
};
use super::RelayError;
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const API_PREFIX: [&str; 3] = ["_matrix", "client", "r0"];

/// Extra time granted to a sync request on top of the server-side poll timeout.
const SYNC_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Clone)]
pub struct HttpRelayApi {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpRelayApi {
    pub fn new(client: reqwest::Client, base_url: &str) -> Result<Self, RelayError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| RelayError::Http(format!("{}: {}", base_url, e)))?;
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RelayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RelayError::Http(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        access_token: Option<&str>,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<T, RelayError> {
        debug!("{} {}", method, url.path());

        let mut builder = self.client.request(method, url);
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(error_from_response(status, &bytes));
        }

        serde_json::from_slice(&bytes).map_err(|e| RelayError::Decode(e.to_string()))
    }
}

fn error_from_response(status: StatusCode, body: &[u8]) -> RelayError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or(ErrorBody {
        errcode: String::new(),
        error: String::from_utf8_lossy(body).into_owned(),
    });

    if parsed.errcode == "M_FORBIDDEN" {
        return RelayError::Forbidden(parsed.error);
    }

    RelayError::Server {
        status: status.as_u16(),
        errcode: parsed.errcode,
        message: parsed.error,
    }
}

#[derive(Serialize)]
struct InviteBody<'a> {
    user_id: &'a str,
}

#[derive(Serialize)]
struct EmptyBody {}

#[derive(Deserialize)]
struct Ignored {}

#[async_trait]
impl RelayApi for HttpRelayApi {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, RelayError> {
        let url = self.endpoint(&["login"])?;
        self.request(Method::POST, url, None, Some(request), None)
            .await
    }

    async fn sync(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncResponse, RelayError> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout.as_millis().to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }
        self.request::<EmptyBody, _>(
            Method::GET,
            url,
            Some(access_token),
            None,
            Some(timeout + SYNC_GRACE),
        )
        .await
    }

    async fn create_room(
        &self,
        access_token: &str,
        request: &CreateRoomRequest,
    ) -> Result<CreateRoomResponse, RelayError> {
        let url = self.endpoint(&["createRoom"])?;
        self.request(Method::POST, url, Some(access_token), Some(request), None)
            .await
    }

    async fn invite(
        &self,
        access_token: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), RelayError> {
        let url = self.endpoint(&["rooms", room_id, "invite"])?;
        let _: Ignored = self
            .request(
                Method::POST,
                url,
                Some(access_token),
                Some(&InviteBody { user_id }),
                None,
            )
            .await?;
        Ok(())
    }

    async fn join(&self, access_token: &str, room_id: &str) -> Result<(), RelayError> {
        let url = self.endpoint(&["rooms", room_id, "join"])?;
        let _: Ignored = self
            .request(Method::POST, url, Some(access_token), Some(&EmptyBody {}), None)
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        access_token: &str,
        room_id: &str,
        txn_id: &str,
        content: &MessageContent,
    ) -> Result<SendResponse, RelayError> {
        let url = self.endpoint(&["rooms", room_id, "send", EVENT_TYPE_MESSAGE, txn_id])?;
        self.request(Method::PUT, url, Some(access_token), Some(content), None)
            .await
    }
}

/// Connects to `https://<host>` with one shared HTTP client.
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| RelayError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl RelayConnector for HttpConnector {
    fn connect(&self, host: &str) -> Result<Arc<dyn RelayApi>, RelayError> {
        let api = HttpRelayApi::new(self.client.clone(), &format!("https://{}", host))?;
        Ok(Arc::new(api))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> HttpRelayApi {
        HttpRelayApi::new(reqwest::Client::new(), "https://relay.example.org/").unwrap()
    }

    #[test]
    fn test_endpoint_escapes_room_ids() {
        let url = api()
            .endpoint(&["rooms", "!abc:relay.example.org", "send", EVENT_TYPE_MESSAGE, "m1.0"])
            .unwrap();

        assert_eq!(
            url.as_str(),
            "https://relay.example.org/_matrix/client/r0/rooms/!abc:relay.example.org/send/m.room.message/m1.0"
        );

        let url = api().endpoint(&["rooms", "a/b", "join"]).unwrap();
        assert!(url.as_str().ends_with("/rooms/a%2Fb/join"));
    }

    #[test]
    fn test_forbidden_errcode_maps_to_forbidden() {
        let error = error_from_response(
            StatusCode::FORBIDDEN,
            br#"{"errcode":"M_FORBIDDEN","error":"not in room"}"#,
        );
        assert_eq!(error, RelayError::Forbidden("not in room".to_string()));
        assert!(error.is_forbidden());
    }

    #[test]
    fn test_other_errors_keep_status_and_errcode() {
        let error = error_from_response(
            StatusCode::TOO_MANY_REQUESTS,
            br#"{"errcode":"M_LIMIT_EXCEEDED","error":"slow down"}"#,
        );
        assert_eq!(
            error,
            RelayError::Server {
                status: 429,
                errcode: "M_LIMIT_EXCEEDED".to_string(),
                message: "slow down".to_string(),
            }
        );

        let error = error_from_response(StatusCode::BAD_GATEWAY, b"upstream down");
        assert!(matches!(error, RelayError::Server { status: 502, .. }));
    }
}
