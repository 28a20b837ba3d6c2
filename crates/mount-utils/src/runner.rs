use crate::{path_state, MountError, MountPoint, PathState, Result};
use futures::channel::oneshot::{channel as oneshot, Receiver, Sender};
use once_cell::sync::OnceCell;
use std::{
  fs,
  future::Future,
  panic::{catch_unwind, RefUnwindSafe, UnwindSafe},
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};
use tracing::{debug, error, warn, Span};

struct MounterMessage {
  span: Span,
  run: Box<dyn FnOnce(Span) + Send + UnwindSafe + RefUnwindSafe>,
}

impl MounterMessage {
  fn new(span: Span, f: impl FnOnce(Span) + Send + UnwindSafe + RefUnwindSafe + 'static) -> Self {
    Self {
      span,
      run: Box::new(f),
    }
  }
}

// Span is not declared unwind safe, but holds nothing a panic could leave inconsistent.
impl UnwindSafe for MounterMessage {}

type MounterDispatcher = crossbeam::channel::Sender<MounterMessage>;

// Note: All these methods are to be run in a separate thread, ensuring
// that only one runs at once, and that it does not block async processing.
pub trait MounterImpl: Sized + Send + Sync + UnwindSafe + RefUnwindSafe + 'static {
  fn new(unmount_command: PathBuf) -> Result<Self>;

  /// Unmount unmounts given target. If a force_after is provided, will retry
  /// after that amount of time with force option.
  fn unmount(&self, target: PathBuf, force_after: Option<Duration>) -> Result<()>;

  /// List returns a list of all mounted filesystems. Guaranteed to be a
  /// consistent snapshot.
  fn list(&self) -> Result<Vec<MountPoint>>;

  /// Heuristic check. Returns a not-found error when the directory does not exist.
  fn is_likely_not_mount_point(&self, file: PathBuf) -> Result<bool>;

  fn is_not_mount_point(&self, file: PathBuf) -> Result<bool> {
    // The heuristic is reliable when it says "mounted".
    let not_mnt = match self.is_likely_not_mount_point(file.clone()) {
      Ok(v) => v,
      Err(e) if e.is_permission_error() => {
        // stat() was refused (e.g. NFS with root_squash); the mount table decides.
        true
      }
      Err(e) => return Err(e),
    };

    if !not_mnt {
      return Ok(false);
    }

    // The kernel records resolved paths in the mount table.
    let resolved_file = fs::canonicalize(&file)?;

    // Bind mounts share the parent's device, so scan the table as well.
    let mounted = self.list()?.iter().any(|mp| mp.matches(&resolved_file));
    Ok(!mounted)
  }

  fn cleanup_mount_point(&self, path: PathBuf, extensive: bool) -> Result<()> {
    let corrupted = match path_state(&path)? {
      PathState::NotExists => {
        warn!("Unmount skipped because path does not exist: {}", path.display());
        return Ok(());
      }
      PathState::Exists => false,
      PathState::Corrupted => true,
    };

    if !corrupted && self.remove_path_if_not_mount_point(&path, extensive)? {
      return Ok(());
    }

    debug!("{} is a mountpoint, unmounting", path.display());
    self.unmount(path.clone(), None)?;

    if self.remove_path_if_not_mount_point(&path, extensive)? {
      debug!("{} is unmounted, deleted the directory", path.display());
      return Ok(());
    }

    Err(MountError::new(format!(
      "failed to unmount path {}",
      path.display()
    )))
  }

  /// Returns whether `path` was not a mount point, removing it if so.
  fn remove_path_if_not_mount_point(&self, path: &Path, extensive: bool) -> Result<bool> {
    let result = if extensive {
      self.is_not_mount_point(path.to_path_buf())
    } else {
      self.is_likely_not_mount_point(path.to_path_buf())
    };

    match result {
      Ok(true) => {
        warn!("{} is not a mountpoint, deleting", path.display());
        fs::remove_dir(path)?;
        Ok(true)
      }
      Ok(false) => Ok(false),
      Err(e) if e.is_not_found() => {
        debug!("{} does not exist", path.display());
        Ok(true)
      }
      Err(e) => Err(e),
    }
  }
}

static DISPATCHER: OnceCell<MounterDispatcher> = OnceCell::new();

fn dispatcher() -> Result<&'static MounterDispatcher> {
  DISPATCHER
    .get_or_try_init(|| {
      let (sender, receiver) = crossbeam::channel::unbounded::<MounterMessage>();

      std::thread::Builder::new()
        .name("mount-utils:dispatch".into())
        .spawn(move || {
          while let Ok(msg) = receiver.recv() {
            if let Err(e) = catch_unwind(move || {
              let MounterMessage { span, run } = msg;
              run(span)
            }) {
              error!("Failed to run mount function in dispatcher: {:?}", e);
            }
          }
        })
        .map(|_| sender)
    })
    .map_err(|e| MountError::Dispatcher(format!("failed to spawn dispatcher: {:?}", e)))
}

pub(crate) fn run<R: 'static, F: 'static>(f: F) -> impl Future<Output = Result<R>>
where
  F: FnOnce() -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
  R: UnwindSafe + RefUnwindSafe + Send,
{
  struct OuterMsg<R, F>
  where
    F: FnOnce() -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
    R: UnwindSafe + RefUnwindSafe,
  {
    run: F,
    sender: Sender<Result<R>>,
  }

  impl<R, F> UnwindSafe for OuterMsg<R, F>
  where
    F: FnOnce() -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
    R: UnwindSafe + RefUnwindSafe,
  {
  }

  impl<R, F> RefUnwindSafe for OuterMsg<R, F>
  where
    F: FnOnce() -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
    R: UnwindSafe + RefUnwindSafe,
  {
  }

  let span = Span::current();
  let (sender, receiver) = oneshot();

  match dispatcher() {
    Ok(dispatch) => {
      let msg = OuterMsg { run: f, sender };
      let message = MounterMessage::new(span, move |span| {
        let OuterMsg { run, sender } = msg;
        let result = {
          let _enter = span.enter();
          run()
        };

        let _ = sender.send(result);
      });

      // A rejected message drops its sender, which `read` reports.
      if dispatch.send(message).is_err() {
        error!("Mount dispatcher is no longer running");
      }
    }
    Err(e) => {
      let _ = sender.send(Err(e));
    }
  };

  read(receiver)
}

pub(crate) fn run_inst<T: MounterImpl, R: 'static, F: 'static>(
  mounter: Arc<T>,
  f: F,
) -> impl Future<Output = Result<R>>
where
  F: FnOnce(&T) -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
  R: UnwindSafe + RefUnwindSafe + Send,
{
  run(move || f(&*mounter))
}

async fn read<R>(receiver: Receiver<Result<R>>) -> Result<R> {
  match receiver.await {
    Ok(r) => r,
    Err(_) => Err(MountError::Dispatcher(
      "request was cancelled (thread panicked?)".into(),
    )),
  }
}

pub trait MounterWrapper {
  type Mounter: MounterImpl;

  fn new(inner: Arc<Self::Mounter>) -> Self;

  fn mounter(&self) -> &Arc<Self::Mounter>;
}
