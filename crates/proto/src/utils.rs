use std::{fmt, future::Future, time::Duration};
use tracing::{field, warn, Span};

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

pub(crate) trait Record: Sized {
  fn record_field(self, field: &'static str) -> Self;

  #[inline]
  fn record_request(self) -> Self {
    self.record_field("request")
  }

  #[inline]
  fn record_response(self) -> Self {
    self.record_field("response")
  }
}

impl<T: fmt::Debug> Record for T {
  #[inline]
  fn record_field(self, field: &'static str) -> Self {
    Span::current().record(field, &field::debug(&self));
    self
  }
}

#[inline]
pub(crate) fn record_request<T: fmt::Debug>(request: T) -> T {
  request.record_request()
}

/// Reads the deadline a client attached to the call, if any.
pub(crate) fn request_timeout<T>(request: &tonic::Request<T>) -> Option<Duration> {
  request
    .metadata()
    .get(GRPC_TIMEOUT_HEADER)
    .and_then(|v| v.to_str().ok())
    .and_then(parse_grpc_timeout)
}

/// Parses a `grpc-timeout` header value: at most 8 ASCII digits followed by
/// one of the units `H`, `M`, `S`, `m`, `u` or `n`.
pub(crate) fn parse_grpc_timeout(value: &str) -> Option<Duration> {
  if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
    return None;
  }

  let (digits, unit) = value.split_at(value.len() - 1);
  if !digits.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }

  let amount: u64 = digits.parse().ok()?;
  let duration = match unit {
    "H" => Duration::from_secs(amount * 60 * 60),
    "M" => Duration::from_secs(amount * 60),
    "S" => Duration::from_secs(amount),
    "m" => Duration::from_millis(amount),
    "u" => Duration::from_micros(amount),
    "n" => Duration::from_nanos(amount),
    _ => return None,
  };

  Some(duration)
}

/// Runs `future` to completion, or until `timeout` elapses. An expired call
/// drops the future, which cancels whatever it was waiting on.
pub(crate) async fn with_timeout<F, T, E>(
  timeout: Option<Duration>,
  future: F,
) -> Result<T, tonic::Status>
where
  F: Future<Output = Result<T, E>>,
  E: Into<tonic::Status>,
{
  let result = match timeout {
    None => future.await,
    Some(timeout) => match tokio::time::timeout(timeout, future).await {
      Ok(result) => result,
      Err(_) => {
        warn!(?timeout, "Request deadline exceeded");
        return Err(tonic::Status::deadline_exceeded(format!(
          "request did not complete within {:?}",
          timeout
        )));
      }
    },
  };

  result.map_err(Into::into)
}
