//! Profile and friend list lookups against the TalkSphere REST API.

use std::fmt;

use async_trait::async_trait;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;

/// A user as seen by the client. The email is the identity; the name is only
/// for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub name: String,
}

impl Identity {
    /// Uses the local part of the email as display name.
    pub fn new(email: impl Into<String>) -> Self {
        let email = email.into();
        let name = email.split('@').next().unwrap_or_default().to_string();
        Self { email, name }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EdgeState {
    Requested,
    Accepted,
}

/// A friendship seen from the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendEdge {
    pub friend: Identity,
    pub state: EdgeState,
}

#[async_trait]
pub trait ProfileApi: Send + Sync {
    async fn current_user(&self) -> Result<Identity, Error>;
    async fn friends(&self) -> Result<Vec<FriendEdge>, Error>;
    async fn friend_requests(&self) -> Result<Vec<FriendEdge>, Error>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    body: T,
}

/// What an error status carries, when the server got far enough to say.
#[derive(Debug, Default, Deserialize)]
struct FailureBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UserDataBody {
    #[serde(rename = "userData", default)]
    user_data: Option<UserData>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    email: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FriendsBody {
    #[serde(default)]
    friends: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RequestsBody {
    #[serde(default)]
    requests: Vec<String>,
}

fn unwrap_envelope<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    let envelope: Envelope<T> = serde_json::from_slice(bytes)
        .map_err(|e| Error::Network(format!("malformed response: {}", e)))?;
    if !envelope.success {
        return Err(Error::Network(
            envelope
                .message
                .unwrap_or_else(|| "request was not successful".to_string()),
        ));
    }
    Ok(envelope.body)
}

/// Friend emails may repeat; the first occurrence wins.
fn edges(emails: Vec<String>, state: EdgeState) -> Vec<FriendEdge> {
    emails
        .into_iter()
        .filter(|email| !email.is_empty())
        .unique()
        .map(|email| FriendEdge {
            friend: Identity::new(email),
            state,
        })
        .collect()
}

/// [`ProfileApi`] over HTTP, authenticated by the session cookie.
#[derive(Debug, Clone)]
pub struct HttpProfileApi {
    base: Url,
    cookie: Option<String>,
    agent: ureq::Agent,
}

impl HttpProfileApi {
    pub fn new(base: &str, cookie: Option<String>) -> Result<Self, Error> {
        let base = Url::parse(base).map_err(|e| Error::Validation(format!("api url: {}", e)))?;
        // 401 and 404 still carry the {success, message} envelope
        let config = ureq::Agent::config_builder().http_status_as_error(false).build();
        Ok(Self {
            base,
            cookie,
            agent: ureq::Agent::new_with_config(config),
        })
    }

    async fn request(&self, post: bool, path: &str) -> Result<Vec<u8>, Error> {
        let url = self
            .base
            .join(path)
            .map_err(|e| Error::Validation(format!("api url: {}", e)))?;
        let cookie = self.cookie.clone();
        let agent = self.agent.clone();
        debug!("{} {}", if post { "POST" } else { "GET" }, url);

        // ureq is blocking
        tokio::task::spawn_blocking(move || {
            let response = if post {
                let mut req = agent.post(url.as_str()).header("Accept", "application/json");
                if let Some(cookie) = &cookie {
                    req = req.header("Cookie", cookie);
                }
                req.send_empty()
            } else {
                let mut req = agent.get(url.as_str()).header("Accept", "application/json");
                if let Some(cookie) = &cookie {
                    req = req.header("Cookie", cookie);
                }
                req.call()
            };
            let response = response.map_err(|e| Error::Network(format!("{}: {}", url, e)))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .read_to_vec()
                .map_err(|e| Error::Network(format!("{}: {}", url, e)))?;
            if status.is_success() {
                return Ok(bytes);
            }
            match serde_json::from_slice::<FailureBody>(&bytes) {
                Ok(FailureBody {
                    message: Some(message),
                }) => Err(Error::Network(message)),
                _ => Err(Error::Network(format!("{}: http status {}", url, status))),
            }
        })
        .await
        .map_err(|e| Error::Network(e.to_string()))?
    }
}

#[async_trait]
impl ProfileApi for HttpProfileApi {
    async fn current_user(&self) -> Result<Identity, Error> {
        let bytes = self.request(true, "/api/user/data").await?;
        let body: UserDataBody = unwrap_envelope(&bytes)?;
        let user = body
            .user_data
            .ok_or_else(|| Error::Network("response carries no user data".to_string()))?;
        let mut identity = Identity::new(user.email);
        if let Some(name) = user.name.filter(|name| !name.is_empty()) {
            identity.name = name;
        }
        Ok(identity)
    }

    async fn friends(&self) -> Result<Vec<FriendEdge>, Error> {
        let bytes = self.request(false, "/api/user/getFriendList").await?;
        let body: FriendsBody = unwrap_envelope(&bytes)?;
        Ok(edges(body.friends, EdgeState::Accepted))
    }

    async fn friend_requests(&self) -> Result<Vec<FriendEdge>, Error> {
        let bytes = self.request(false, "/api/user/getFriendRequests").await?;
        let body: RequestsBody = unwrap_envelope(&bytes)?;
        Ok(edges(body.requests, EdgeState::Requested))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    use super::*;

    fn serve_once(body: &'static str) -> (String, mpsc::Receiver<Vec<String>>) {
        serve_status("200 OK", body)
    }

    /// Serves one canned JSON response and reports the request head.
    fn serve_status(status: &'static str, body: &'static str) -> (String, mpsc::Receiver<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());
            let mut head = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                head.push(line);
            }
            write!(
                socket,
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            )
            .unwrap();
            sender.send(head).unwrap();
        });
        (base, receiver)
    }

    #[test]
    fn test_friend_list_is_deduplicated() {
        let body: FriendsBody = unwrap_envelope(
            br#"{"success":true,"friends":["bob@x.com","carol@y.org","bob@x.com"]}"#,
        )
        .unwrap();
        let friends = edges(body.friends, EdgeState::Accepted);
        assert_eq!(friends.len(), 2);
        assert_eq!(friends[0].friend.name, "bob");
        assert_eq!(friends[1].friend, Identity::new("carol@y.org"));
    }

    #[test]
    fn test_unsuccessful_envelope_carries_message() {
        let err = unwrap_envelope::<FriendsBody>(br#"{"success":false,"message":"Not Authorized"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Network(ref m) if m == "Not Authorized"));
    }

    #[tokio::test]
    async fn test_friend_requests_over_http_send_cookie() {
        let (base, head) = serve_once(r#"{"success":true,"requests":["dave@x.com"]}"#);
        let api = HttpProfileApi::new(&base, Some("token=abc".into())).unwrap();

        let requests = api.friend_requests().await.unwrap();
        assert_eq!(
            requests,
            vec![FriendEdge {
                friend: Identity::new("dave@x.com"),
                state: EdgeState::Requested,
            }]
        );
        let head = head.recv().unwrap();
        assert!(head[0].starts_with("GET /api/user/getFriendRequests"));
        assert!(head.iter().any(|h| h.eq_ignore_ascii_case("cookie: token=abc")));
    }

    #[tokio::test]
    async fn test_current_user_falls_back_to_email_name() {
        let (base, head) = serve_once(r#"{"success":true,"userData":{"email":"alice@x.com"}}"#);
        let api = HttpProfileApi::new(&base, None).unwrap();

        let me = api.current_user().await.unwrap();
        assert_eq!(me, Identity::new("alice@x.com"));
        assert!(head.recv().unwrap()[0].starts_with("POST /api/user/data"));
    }

    #[tokio::test]
    async fn test_rejected_session_reports_server_message() {
        let (base, _head) = serve_status(
            "401 Unauthorized",
            r#"{"success":false,"message":"Not Authorized, token failed"}"#,
        );
        let api = HttpProfileApi::new(&base, Some("token=stale".into())).unwrap();

        let err = api.current_user().await.unwrap_err();
        assert!(matches!(err, Error::Network(ref m) if m == "Not Authorized, token failed"));
    }

    #[tokio::test]
    async fn test_error_status_without_envelope_names_the_status() {
        let (base, _head) = serve_status("502 Bad Gateway", "<html>bad gateway</html>");
        let api = HttpProfileApi::new(&base, None).unwrap();

        let err = api.friends().await.unwrap_err();
        assert!(matches!(err, Error::Network(ref m) if m.contains("502")));
    }
}
