use std::future::Future;
use thiserror::Error;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why a call stopped before its future completed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
  #[error("operation was cancelled")]
  Cancelled,
  #[error("deadline exceeded")]
  DeadlineExceeded,
}

/// Cancellation signal and optional deadline, passed explicitly from the
/// orchestrators down to every remote call.
///
/// Interrupting a call drops its future. Lock guards held further up the
/// stack are released by their owners as they unwind, never by the token.
#[derive(Debug, Clone)]
pub struct Context {
  token: CancellationToken,
  deadline: Option<Instant>,
}

impl Context {
  pub fn new(token: CancellationToken) -> Self {
    Context {
      token,
      deadline: None,
    }
  }

  /// A context that is never cancelled and has no deadline.
  pub fn background() -> Self {
    Context::new(CancellationToken::new())
  }

  /// Bound the context by `timeout` from now. An earlier deadline wins.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    let deadline = Instant::now() + timeout;
    self.deadline = Some(match self.deadline {
      Some(current) if current < deadline => current,
      _ => deadline,
    });
    self
  }

  /// A context cancelled together with this one, which can also be
  /// cancelled on its own.
  pub fn child(&self) -> Self {
    Context {
      token: self.token.child_token(),
      deadline: self.deadline,
    }
  }

  pub fn cancel(&self) {
    self.token.cancel()
  }

  #[inline]
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  #[inline]
  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// Fails fast when the context is already done.
  pub fn check(&self) -> Result<(), Interrupted> {
    if self.is_cancelled() {
      return Err(Interrupted::Cancelled);
    }

    match self.deadline {
      Some(deadline) if deadline <= Instant::now() => Err(Interrupted::DeadlineExceeded),
      _ => Ok(()),
    }
  }

  /// Drive `future` until it completes, the context is cancelled, or the
  /// deadline passes, whichever comes first.
  pub async fn run<F, T, E>(&self, future: F) -> Result<T, E>
  where
    F: Future<Output = Result<T, E>>,
    E: From<Interrupted>,
  {
    let deadline = self.deadline;
    let bounded = async move {
      match deadline {
        None => future.await,
        Some(deadline) => match time::timeout_at(deadline, future).await {
          Ok(result) => result,
          Err(_) => Err(Interrupted::DeadlineExceeded.into()),
        },
      }
    };

    tokio::select! {
      biased;
      _ = self.token.cancelled() => Err(Interrupted::Cancelled.into()),
      result = bounded => result,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn slow() -> Result<(), Interrupted> {
    time::sleep(Duration::from_secs(30)).await;
    Ok(())
  }

  #[tokio::test]
  async fn completes_when_undisturbed() {
    let ctx = Context::background();
    let value = ctx.run(async { Ok::<_, Interrupted>(5) }).await.unwrap();
    assert_eq!(value, 5);
  }

  #[tokio::test]
  async fn cancellation_interrupts() {
    let ctx = Context::background();
    let child = ctx.child();
    ctx.cancel();

    assert_eq!(child.run(slow()).await, Err(Interrupted::Cancelled));
    assert_eq!(child.check(), Err(Interrupted::Cancelled));
  }

  #[tokio::test]
  async fn cancelling_child_leaves_parent() {
    let ctx = Context::background();
    let child = ctx.child();
    child.cancel();

    assert!(child.is_cancelled());
    assert!(!ctx.is_cancelled());
  }

  #[tokio::test]
  async fn deadline_interrupts() {
    let ctx = Context::background().with_timeout(Duration::from_millis(10));
    assert_eq!(ctx.run(slow()).await, Err(Interrupted::DeadlineExceeded));
  }

  #[test]
  fn earlier_deadline_wins() {
    let ctx = Context::background()
      .with_timeout(Duration::from_secs(1))
      .with_timeout(Duration::from_secs(60));
    let deadline = ctx.deadline().unwrap();
    assert!(deadline <= Instant::now() + Duration::from_secs(1));
  }
}
