use crate::options::{parse_go_duration, MountOptions};
use clap::Parser;
use std::{collections::HashMap, fmt, path::PathBuf, time::Duration};
use thiserror::Error;

pub const DEFAULT_DRIVER_NAME: &str = "rclone.csi.k8s.io";
pub const DEFAULT_ENDPOINT: &str = "unix:///tmp/csi.sock";
pub const DEFAULT_RCD_ADDRESS: &str = "http://localhost:5572/";
pub const DEFAULT_MOUNT_TYPE: &str = "mount2";

/// Mount options used when none are given on the command line.
pub const DEFAULT_MOUNT_OPT: &[(&str, &str)] = &[
  ("AllowOther", "true"),
  ("AsyncRead", "true"),
  ("AttrTimeout", "1s"),
  ("MaxReadAhead", "131072"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("invalid DriverOptions: {0} required")]
  Required(&'static str),
}

fn parse_key_val(value: &str) -> Result<(String, String), String> {
  match value.split_once('=') {
    Some((key, val)) if !key.is_empty() => Ok((key.to_owned(), val.to_owned())),
    _ => Err(format!("expected KEY=VALUE, got {:?}", value)),
  }
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
  match parse_go_duration(value) {
    Some(nanos) if nanos > 0 => Ok(Duration::from_nanos(nanos as u64)),
    _ => Err(format!("expected a positive duration such as 30s, got {:?}", value)),
  }
}

/// Command line and environment configuration of the driver.
#[derive(Parser, Clone)]
#[command(name = "csi-rclone", version, about = "CSI driver for rclone remotes", long_about = None)]
pub struct DriverOptions {
  /// Node id reported to the container orchestrator
  #[arg(long, env = "CSI_RCLONE_NODE_ID", default_value = "")]
  pub node_id: String,

  /// Name of the driver
  #[arg(long, env = "CSI_RCLONE_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
  pub driver_name: String,

  /// CSI endpoint, unix:// or tcp://
  #[arg(long = "driver-endpoint", env = "CSI_RCLONE_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
  pub endpoint: String,

  /// Address of the rclone remote control server
  #[arg(long = "rcd-address", env = "CSI_RCLONE_RCD_ADDRESS", default_value = DEFAULT_RCD_ADDRESS)]
  pub address: String,

  /// Username for the remote control server
  #[arg(long = "rcd-username", env = "CSI_RCLONE_RCD_USERNAME", default_value = "")]
  pub username: String,

  /// Password for the remote control server
  #[arg(
    long = "rcd-password",
    env = "CSI_RCLONE_RCD_PASSWORD",
    default_value = "",
    hide_env_values = true
  )]
  pub password: String,

  /// Timeout applied to every remote control call, e.g. 30s
  #[arg(long = "rcd-timeout", env = "CSI_RCLONE_RCD_TIMEOUT", value_parser = parse_timeout)]
  pub rc_timeout: Option<Duration>,

  /// rclone remote that holds the volumes
  #[arg(long, env = "CSI_RCLONE_REMOTE", default_value = "")]
  pub remote: String,

  /// rclone mount type
  #[arg(long = "mounttype", env = "CSI_RCLONE_MOUNT_TYPE", default_value = DEFAULT_MOUNT_TYPE)]
  pub mount_type: String,

  /// rclone mount options as KEY=VALUE, replacing the defaults
  #[arg(
    long = "mountopt",
    env = "CSI_RCLONE_MOUNT_OPT",
    value_parser = parse_key_val,
    value_delimiter = ','
  )]
  pub mount_opt: Vec<(String, String)>,

  /// rclone vfs options as KEY=VALUE
  #[arg(
    long = "vfsopt",
    env = "CSI_RCLONE_VFS_OPT",
    value_parser = parse_key_val,
    value_delimiter = ','
  )]
  pub vfs_opt: Vec<(String, String)>,

  /// Directory for metadata staging files [default: <tmp>/<driver name>]
  #[arg(long, env = "CSI_RCLONE_WORK_DIR")]
  pub work_dir: Option<PathBuf>,
}

impl fmt::Debug for DriverOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DriverOptions")
      .field("node_id", &self.node_id)
      .field("driver_name", &self.driver_name)
      .field("endpoint", &self.endpoint)
      .field("address", &self.address)
      .field("username", &self.username)
      .field("password", &format!("length={}", self.password.len()))
      .field("rc_timeout", &self.rc_timeout)
      .field("remote", &self.remote)
      .field("mount_type", &self.mount_type)
      .field("mount_opt", &self.mount_opt_map().keys().collect::<Vec<_>>())
      .field("vfs_opt", &self.vfs_opt_map().keys().collect::<Vec<_>>())
      .field("work_dir", &self.work_dir())
      .finish()
  }
}

impl Default for DriverOptions {
  fn default() -> Self {
    DriverOptions {
      node_id: String::new(),
      driver_name: DEFAULT_DRIVER_NAME.to_owned(),
      endpoint: DEFAULT_ENDPOINT.to_owned(),
      address: DEFAULT_RCD_ADDRESS.to_owned(),
      username: String::new(),
      password: String::new(),
      rc_timeout: None,
      remote: String::new(),
      mount_type: DEFAULT_MOUNT_TYPE.to_owned(),
      mount_opt: Vec::new(),
      vfs_opt: Vec::new(),
      work_dir: None,
    }
  }
}

impl DriverOptions {
  pub fn validate(&self) -> Result<(), ConfigError> {
    let required = [
      ("DriverName", &self.driver_name),
      ("NodeId", &self.node_id),
      ("Endpoint", &self.endpoint),
      ("Remote", &self.remote),
      ("MountType", &self.mount_type),
    ];
    if let Some((name, _)) = required.iter().find(|(_, value)| value.is_empty()) {
      return Err(ConfigError::Required(*name));
    }

    match (self.username.is_empty(), self.password.is_empty()) {
      (true, false) => Err(ConfigError::Required("Username")),
      (false, true) => Err(ConfigError::Required("Password")),
      _ => Ok(()),
    }
  }

  /// Mount options, falling back to [DEFAULT_MOUNT_OPT] when none were given.
  pub fn mount_opt_map(&self) -> HashMap<String, String> {
    if self.mount_opt.is_empty() {
      return DEFAULT_MOUNT_OPT
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    }

    self.mount_opt.iter().cloned().collect()
  }

  pub fn vfs_opt_map(&self) -> HashMap<String, String> {
    self.vfs_opt.iter().cloned().collect()
  }

  pub fn mount_options(&self) -> serde_json::Result<MountOptions> {
    MountOptions::from_maps(
      self.mount_type.clone(),
      &self.mount_opt_map(),
      &self.vfs_opt_map(),
    )
  }

  pub fn work_dir(&self) -> PathBuf {
    match &self.work_dir {
      Some(dir) => dir.clone(),
      None => std::env::temp_dir().join(&self.driver_name),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  fn valid() -> DriverOptions {
    DriverOptions {
      node_id: "node-1".into(),
      remote: "r:".into(),
      ..Default::default()
    }
  }

  #[test]
  fn defaults_match_flags() {
    let parsed = DriverOptions::try_parse_from(vec!["csi-rclone"]).unwrap();
    assert_eq!(parsed.driver_name, DEFAULT_DRIVER_NAME);
    assert_eq!(parsed.endpoint, DEFAULT_ENDPOINT);
    assert_eq!(parsed.address, DEFAULT_RCD_ADDRESS);
    assert_eq!(parsed.mount_type, DEFAULT_MOUNT_TYPE);
    assert_eq!(parsed.rc_timeout, None);
    assert_eq!(parsed.mount_opt_map(), DriverOptions::default().mount_opt_map());
  }

  #[test]
  fn parses_flags() {
    let parsed = DriverOptions::try_parse_from(vec![
      "csi-rclone",
      "--node-id",
      "node-1",
      "--remote",
      "s3:bucket",
      "--mountopt",
      "AllowOther=false,AttrTimeout=5s",
      "--vfsopt",
      "CacheMode=full",
      "--rcd-timeout",
      "1m",
      "--work-dir",
      "/var/lib/csi-rclone",
    ])
    .unwrap();

    assert_eq!(parsed.node_id, "node-1");
    assert_eq!(parsed.remote, "s3:bucket");
    assert_eq!(parsed.mount_opt_map().len(), 2);
    assert_eq!(parsed.vfs_opt_map()["CacheMode"], "full");
    assert_eq!(parsed.rc_timeout, Some(Duration::from_secs(60)));
    assert_eq!(parsed.work_dir(), PathBuf::from("/var/lib/csi-rclone"));
    assert_eq!(parsed.validate(), Ok(()));

    let options = parsed.mount_options().unwrap();
    assert_eq!(
      options.mount_opt(),
      r#"{"AllowOther":false,"AttrTimeout":5000000000}"#
    );
    assert_eq!(options.vfs_opt(), r#"{"CacheMode":"full"}"#);
  }

  #[test_case("novalue" ; "missing separator")]
  #[test_case("=x" ; "missing key")]
  fn rejects_bad_key_values(value: &str) {
    assert!(DriverOptions::try_parse_from(vec!["csi-rclone", "--mountopt", value]).is_err());
  }

  #[test]
  fn rejects_bad_timeout() {
    assert!(DriverOptions::try_parse_from(vec!["csi-rclone", "--rcd-timeout", "soon"]).is_err());
  }

  #[test_case(|o: &mut DriverOptions| o.driver_name.clear(), "DriverName")]
  #[test_case(|o: &mut DriverOptions| o.node_id.clear(), "NodeId")]
  #[test_case(|o: &mut DriverOptions| o.endpoint.clear(), "Endpoint")]
  #[test_case(|o: &mut DriverOptions| o.remote.clear(), "Remote")]
  #[test_case(|o: &mut DriverOptions| o.mount_type.clear(), "MountType")]
  #[test_case(|o: &mut DriverOptions| o.password = "p".into(), "Username")]
  #[test_case(|o: &mut DriverOptions| o.username = "u".into(), "Password")]
  fn validation(change: fn(&mut DriverOptions), missing: &'static str) {
    let mut options = valid();
    change(&mut options);
    assert_eq!(options.validate(), Err(ConfigError::Required(missing)));
  }

  #[test]
  fn credentials_together_are_valid() {
    let options = DriverOptions {
      username: "u".into(),
      password: "p".into(),
      ..valid()
    };
    assert_eq!(options.validate(), Ok(()));
  }

  #[test]
  fn work_dir_defaults_under_tmp() {
    let options = valid();
    assert_eq!(options.work_dir(), std::env::temp_dir().join(DEFAULT_DRIVER_NAME));
  }

  #[test]
  fn debug_hides_password() {
    let options = DriverOptions {
      password: "hunter2".into(),
      ..valid()
    };
    assert!(!format!("{:?}", options).contains("hunter2"));
  }
}
