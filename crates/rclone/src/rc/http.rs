use super::{Params, RcError, Transport};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::fmt;
use tracing::trace;

/// Talks to `rclone rcd` over HTTP: each method is a `POST` of a JSON
/// object to `<address><method>`.
pub struct HttpTransport {
  client: Client,
  address: String,
  credentials: Option<(String, String)>,
}

impl fmt::Debug for HttpTransport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpTransport")
      .field("address", &self.address)
      .field(
        "username",
        &self.credentials.as_ref().map(|(username, _)| username),
      )
      .finish()
  }
}

impl HttpTransport {
  /// Basic auth is sent when either `username` or `password` is set.
  pub fn new(address: impl Into<String>, username: &str, password: &str) -> Result<Self, reqwest::Error> {
    let credentials = if username.is_empty() && password.is_empty() {
      None
    } else {
      Some((username.to_owned(), password.to_owned()))
    };

    Ok(HttpTransport {
      client: Client::builder().build()?,
      address: address.into(),
      credentials,
    })
  }

  #[inline]
  pub fn address(&self) -> &str {
    &self.address
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn call(&self, method: &str, params: Params) -> Result<Params, RcError> {
    let url = format!("{}{}", self.address, method);
    let mut request = self.client.post(&url).json(&params);
    if let Some((username, password)) = &self.credentials {
      request = request.basic_auth(username, Some(password));
    }

    let response = request
      .send()
      .await
      .map_err(|e| RcError::transport(method, e))?;
    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| RcError::transport(method, e))?;
    trace!(method, %status, "Remote control replied");

    let out: Params =
      serde_json::from_str(body.trim()).map_err(|source| RcError::InvalidResponse {
        method: method.to_owned(),
        source,
      })?;

    if status != StatusCode::OK {
      return Err(RcError::failed(method, &out));
    }

    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use hyper::{
    header,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
  };
  use serde_json::{json, Value};
  use std::convert::Infallible;

  async fn handle(request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let path = request.uri().path().to_owned();
    let header_value = |name: header::HeaderName| {
      request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    };
    let auth = header_value(header::AUTHORIZATION);
    let content_type = header_value(header::CONTENT_TYPE);
    let body = hyper::body::to_bytes(request.into_body()).await.unwrap();
    let input: Value = serde_json::from_slice(&body).unwrap();

    let (status, reply): (u16, Value) = match path.as_str() {
      "/operations/stat" => (
        200,
        json!({ "input": input, "auth": auth, "contentType": content_type }),
      ),
      "/operations/purge" => (500, json!({ "error": "directory not found", "status": 500 })),
      _ => (404, Value::String("404 page not found".into())),
    };

    let body = match reply {
      Value::String(s) => s,
      reply => reply.to_string(),
    };
    Ok(
      Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap(),
    )
  }

  fn spawn_server() -> String {
    let make_service = make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_service);
    let address = format!("http://{}/", server.local_addr());
    tokio::spawn(server);
    address
  }

  fn params(value: Value) -> Params {
    value.as_object().unwrap().clone()
  }

  #[tokio::test]
  async fn posts_json() {
    let transport = HttpTransport::new(spawn_server(), "", "").unwrap();
    let out = transport
      .call("operations/stat", params(json!({ "fs": "r:", "remote": "x" })))
      .await
      .unwrap();

    assert_eq!(out["input"], json!({ "fs": "r:", "remote": "x" }));
    assert_eq!(out["auth"], Value::Null);
    assert_eq!(out["contentType"], json!("application/json"));
  }

  #[tokio::test]
  async fn sends_basic_auth() {
    let transport = HttpTransport::new(spawn_server(), "user", "pass").unwrap();
    let out = transport
      .call("operations/stat", Params::new())
      .await
      .unwrap();

    // base64("user:pass")
    assert_eq!(out["auth"], json!("Basic dXNlcjpwYXNz"));
  }

  #[tokio::test]
  async fn non_ok_status_fails_with_error_field() {
    let transport = HttpTransport::new(spawn_server(), "", "").unwrap();
    let err = transport
      .call("operations/purge", Params::new())
      .await
      .unwrap_err();

    assert_eq!(
      err.to_string(),
      r#"operation "operations/purge" failed: directory not found"#
    );
  }

  #[tokio::test]
  async fn non_json_reply_is_invalid() {
    let transport = HttpTransport::new(spawn_server(), "", "").unwrap();
    let err = transport.call("core/nope", Params::new()).await.unwrap_err();
    assert!(matches!(err, RcError::InvalidResponse { .. }));
  }

  #[tokio::test]
  async fn unreachable_server_is_transport_error() {
    let transport = HttpTransport::new("http://127.0.0.1:1/", "", "").unwrap();
    let err = transport.call("core/noop", Params::new()).await.unwrap_err();
    assert!(matches!(err, RcError::Transport { .. }));
  }

  #[test]
  fn debug_hides_password() {
    let transport = HttpTransport::new("http://localhost:5572/", "user", "hunter2").unwrap();
    let debug = format!("{:?}", transport);
    assert!(debug.contains("user"));
    assert!(!debug.contains("hunter2"));
  }
}
