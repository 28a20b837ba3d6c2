use crate::{runner::MounterImpl, MountError, MountPoint, Result, DEFAULT_UNMOUNT_COMMAND};
use crossbeam::{scope, select};
use duct::cmd;
use std::{
  fs, io,
  num::NonZeroUsize,
  os::unix::fs::MetadataExt,
  path::{Path, PathBuf},
  process::Output,
  time::Duration,
};
use tracing::{info, warn};

const PROC_MOUNTS_PATH: &str = "/proc/mounts";
const MAX_LIST_TRIES: usize = 3;
const EXPECTED_FIELDS_PER_MOUNTS_LINE: usize = 6;

pub struct OsMounter {
  unmount_command: PathBuf,
}

impl MounterImpl for OsMounter {
  fn new(unmount_command: PathBuf) -> Result<Self> {
    let unmount_command = if unmount_command.as_os_str().is_empty() {
      PathBuf::from(DEFAULT_UNMOUNT_COMMAND)
    } else {
      unmount_command
    };

    Ok(OsMounter { unmount_command })
  }

  fn unmount(&self, target: PathBuf, force_after: Option<Duration>) -> Result<()> {
    info!("Unmounting {}", target.display());
    let expression = cmd!(&self.unmount_command, &target)
      .stderr_to_stdout()
      .stdout_capture()
      .unchecked();

    let output = match force_after {
      None => Some(expression.run()),
      Some(duration) => {
        let handle = expression.start()?;
        let handle = &handle;
        scope(|s| {
          let (sender, receiver) = crossbeam::channel::bounded(1);

          s.spawn(move |_| {
            let result = handle.wait().map(Clone::clone);
            let _ = sender.send(result);
          });

          let output = select! {
            recv(receiver) -> result => result.ok(),
            default(duration) => None,
          };

          if output.is_none() {
            let _ = handle.kill();
          }

          output
        })
        .map_err(|e| MountError::new(format!("Failed to spawn threads: {:?}", e)))?
      }
    };

    match output {
      Some(output) => check_output(&self.unmount_command, &target, output?),
      None => {
        warn!(
          "Unmount of {} did not finish within {:?}, forcing",
          target.display(),
          force_after
        );
        let output = cmd!(&self.unmount_command, "-f", &target)
          .stderr_to_stdout()
          .stdout_capture()
          .unchecked()
          .run()?;
        check_output(&self.unmount_command, &target, output)
      }
    }
  }

  fn list(&self) -> Result<Vec<MountPoint>> {
    list_proc_mounts(Path::new(PROC_MOUNTS_PATH))
  }

  fn is_likely_not_mount_point(&self, file: PathBuf) -> Result<bool> {
    let stat = fs::metadata(&file)?;
    let parent = file.parent().unwrap_or(&file);
    let parent_stat = fs::metadata(parent)?;

    // A different device than the parent means something is mounted here.
    Ok(stat.dev() == parent_stat.dev())
  }
}

fn check_output(command: &Path, target: &Path, output: Output) -> Result<()> {
  if output.status.success() {
    return Ok(());
  }

  Err(MountError::CommandFailed {
    command: format!("{} {}", command.display(), target.display()),
    output: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
  })
}

pub(crate) fn is_mount_point_match(mp: &MountPoint, dir: &Path) -> bool {
  let deleted_dir = format!("{}\\040(deleted)", dir.display());
  mp.path() == dir || mp.path() == Path::new(&deleted_dir)
}

pub(crate) fn is_corrupted_mount_errno(code: i32) -> bool {
  matches!(
    code,
    libc::ENOTCONN | libc::ESTALE | libc::EIO | libc::EACCES
  )
}

fn list_proc_mounts(mount_file_path: &Path) -> Result<Vec<MountPoint>> {
  let attempts = NonZeroUsize::new(MAX_LIST_TRIES)
    .ok_or_else(|| MountError::new("at least one read attempt is required"))?;
  let content = consistent_read(mount_file_path, attempts)?;

  parse_proc_mounts(&content)
}

/// Repeatedly reads a file until it gets the same content twice. Files in
/// /proc that are larger than a page may change between read() syscalls.
fn consistent_read(path: &Path, attempts: NonZeroUsize) -> io::Result<Vec<u8>> {
  let mut old_content = fs::read(path)?;

  for _ in 0..attempts.get() {
    let new_content = fs::read(path)?;
    if new_content == old_content {
      return Ok(new_content);
    }

    old_content = new_content;
  }

  Err(io::Error::new(
    io::ErrorKind::Other,
    format!(
      "could not get consistent content of '{}' after {} attempts",
      path.display(),
      attempts.get()
    ),
  ))
}

fn parse_proc_mounts(content: &[u8]) -> Result<Vec<MountPoint>> {
  let mut out = Vec::new();
  let s = std::str::from_utf8(content)
    .map_err(|_| MountError::new("proc mounts contain invalid UTF8"))?;
  for line in s.lines() {
    if line.is_empty() {
      continue;
    }

    let fields = line.split_whitespace().collect::<Vec<_>>();
    if fields.len() != EXPECTED_FIELDS_PER_MOUNTS_LINE {
      return Err(MountError::new(format!(
        "wrong number of fields (expected {}, got {})",
        EXPECTED_FIELDS_PER_MOUNTS_LINE,
        fields.len()
      )));
    }

    let freq = fields[4]
      .parse()
      .map_err(|e| MountError::new(format!("invalid freq: {:?}", e)))?;
    let pass = fields[5]
      .parse()
      .map_err(|e| MountError::new(format!("invalid pass: {:?}", e)))?;

    out.push(MountPoint {
      device: fields[0].to_owned(),
      path: PathBuf::from(fields[1]),
      ty: fields[2].to_owned(),
      opts: fields[3].split(',').map(str::to_owned).collect(),
      freq,
      pass,
    })
  }

  Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathState {
  Exists,
  NotExists,
  Corrupted,
}

/// Stat `path`, telling a missing path apart from a mount whose backend is gone.
pub(crate) fn path_state(path: &Path) -> io::Result<PathState> {
  match path.metadata() {
    Ok(_) => Ok(PathState::Exists),
    Err(e) => match e.raw_os_error() {
      Some(libc::ENOENT) => Ok(PathState::NotExists),
      Some(code) if is_corrupted_mount_errno(code) => Ok(PathState::Corrupted),
      _ => Err(e),
    },
  }
}
