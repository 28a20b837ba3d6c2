use serde_json::Value;
use std::{
  collections::{BTreeMap, HashMap},
  fmt,
};

/// Volume context keys that override the driver's mount defaults.
pub const MOUNT_TYPE_KEY: &str = "mountType";
pub const MOUNT_OPT_KEY: &str = "mountOpt";
pub const VFS_OPT_KEY: &str = "vfsOpt";

/// Encode an option map as the JSON object string `mount/mount` expects.
///
/// Values are typed the way rclone parses them: `true`/`false` become
/// booleans, base-10 integers become numbers, Go durations become integer
/// nanoseconds, everything else stays a string. An empty map encodes as an
/// empty string so the option is left out of the call.
pub fn marshal_opt(opt: &HashMap<String, String>) -> serde_json::Result<String> {
  if opt.is_empty() {
    return Ok(String::new());
  }

  let out: BTreeMap<&str, Value> = opt
    .iter()
    .map(|(k, v)| (k.as_str(), typed_value(v)))
    .collect();

  serde_json::to_string(&out)
}

fn typed_value(value: &str) -> Value {
  match value {
    "true" => Value::Bool(true),
    "false" => Value::Bool(false),
    v => {
      if let Ok(i) = v.parse::<i64>() {
        Value::from(i)
      } else if let Some(nanos) = parse_go_duration(v) {
        Value::from(nanos)
      } else {
        Value::String(v.to_owned())
      }
    }
  }
}

fn unit_nanos(unit: &str) -> Option<u64> {
  let nanos = match unit {
    "ns" => 1,
    "us" | "\u{b5}s" | "\u{3bc}s" => 1_000,
    "ms" => 1_000_000,
    "s" => 1_000_000_000,
    "m" => 60 * 1_000_000_000,
    "h" => 60 * 60 * 1_000_000_000,
    _ => return None,
  };
  Some(nanos)
}

/// Fraction digits as an integer and the power of ten dividing it. Digits
/// past the point where the integer would exceed 2^63 are dropped.
fn leading_fraction(fraction: &str) -> (u64, f64) {
  let mut digits: u64 = 0;
  let mut divisor = 1.0;
  for d in fraction.bytes() {
    let next = match digits
      .checked_mul(10)
      .and_then(|x| x.checked_add(u64::from(d - b'0')))
    {
      Some(next) if next <= 1 << 63 => next,
      _ => break,
    };
    digits = next;
    divisor *= 10.0;
  }
  (digits, divisor)
}

/// Parse a duration such as `300ms`, `1.5h` or `2h45m` into nanoseconds.
pub fn parse_go_duration(value: &str) -> Option<i64> {
  let (negative, mut rest) = match value.as_bytes().first() {
    Some(b'-') => (true, &value[1..]),
    Some(b'+') => (false, &value[1..]),
    _ => (false, value),
  };

  if rest == "0" {
    return Some(0);
  }
  if rest.is_empty() {
    return None;
  }

  let not_digit = |c: char| !c.is_ascii_digit();
  let mut total: u64 = 0;
  while !rest.is_empty() {
    let end = rest.find(not_digit).unwrap_or_else(|| rest.len());
    let (whole, tail) = rest.split_at(end);

    let (fraction, tail) = match tail.strip_prefix('.') {
      Some(tail) => {
        let end = tail.find(not_digit).unwrap_or_else(|| tail.len());
        tail.split_at(end)
      }
      None => ("", tail),
    };
    if whole.is_empty() && fraction.is_empty() {
      return None;
    }

    let end = tail
      .find(|c: char| c == '.' || c.is_ascii_digit())
      .unwrap_or_else(|| tail.len());
    let (unit, tail) = tail.split_at(end);
    let scale = unit_nanos(unit)?;

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos = whole.checked_mul(scale)?;
    let (digits, divisor) = leading_fraction(fraction);
    if digits > 0 {
      nanos = nanos.checked_add((digits as f64 * (scale as f64 / divisor)) as u64)?;
    }

    total = total.checked_add(nanos)?;
    rest = tail;
  }

  if total > i64::MAX as u64 {
    return None;
  }

  let total = total as i64;
  Some(if negative { -total } else { total })
}

/// What `mount/mount` is told besides the source and target.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
  mount_type: String,
  mount_opt: String,
  vfs_opt: String,
}

impl fmt::Debug for MountOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MountOptions")
      .field("mount_type", &self.mount_type)
      .field("mount_opt", &format!("length={}", self.mount_opt.len()))
      .field("vfs_opt", &format!("length={}", self.vfs_opt.len()))
      .finish()
  }
}

impl MountOptions {
  pub fn new(
    mount_type: impl Into<String>,
    mount_opt: impl Into<String>,
    vfs_opt: impl Into<String>,
  ) -> Self {
    MountOptions {
      mount_type: mount_type.into(),
      mount_opt: mount_opt.into(),
      vfs_opt: vfs_opt.into(),
    }
  }

  /// Encode the driver-wide option maps.
  pub fn from_maps(
    mount_type: impl Into<String>,
    mount_opt: &HashMap<String, String>,
    vfs_opt: &HashMap<String, String>,
  ) -> serde_json::Result<Self> {
    Ok(MountOptions::new(
      mount_type,
      marshal_opt(mount_opt)?,
      marshal_opt(vfs_opt)?,
    ))
  }

  #[inline]
  pub fn mount_type(&self) -> &str {
    &self.mount_type
  }

  #[inline]
  pub fn mount_opt(&self) -> &str {
    &self.mount_opt
  }

  #[inline]
  pub fn vfs_opt(&self) -> &str {
    &self.vfs_opt
  }

  /// Apply per-volume overrides from a volume context. A key that is
  /// present replaces the default as-is, including with an empty value.
  pub fn with_overrides(&self, context: &HashMap<String, String>) -> Self {
    let pick = |key: &str, default: &str| {
      context
        .get(key)
        .map(String::as_str)
        .unwrap_or(default)
        .to_owned()
    };

    MountOptions {
      mount_type: pick(MOUNT_TYPE_KEY, &self.mount_type),
      mount_opt: pick(MOUNT_OPT_KEY, &self.mount_opt),
      vfs_opt: pick(VFS_OPT_KEY, &self.vfs_opt),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test_case("0", Some(0))]
  #[test_case("1s", Some(1_000_000_000))]
  #[test_case("250ms", Some(250_000_000))]
  #[test_case("1m30s", Some(90_000_000_000))]
  #[test_case("1.5h", Some(5_400_000_000_000))]
  #[test_case("-2us", Some(-2_000))]
  #[test_case("3\u{b5}s", Some(3_000) ; "micro sign")]
  #[test_case(".5s", Some(500_000_000))]
  #[test_case("0.57m", Some(34_200_000_000))]
  #[test_case("0.071m", Some(4_260_000_000))]
  #[test_case("0.142m", Some(8_520_000_000))]
  #[test_case("1.001s", Some(1_001_000_000))]
  #[test_case("0.000000001s", Some(1) ; "nanosecond fraction")]
  #[test_case("10", None ; "missing unit")]
  #[test_case("1d", None ; "unknown unit")]
  #[test_case("s", None ; "missing number")]
  #[test_case("1.5.5s", None)]
  #[test_case("", None)]
  fn go_durations(value: &str, expected: Option<i64>) {
    assert_eq!(parse_go_duration(value), expected);
  }

  #[test]
  fn default_mount_options() {
    let opt = map(&[
      ("AllowOther", "true"),
      ("AsyncRead", "true"),
      ("AttrTimeout", "1s"),
      ("MaxReadAhead", "131072"),
    ]);

    assert_eq!(
      marshal_opt(&opt).unwrap(),
      r#"{"AllowOther":true,"AsyncRead":true,"AttrTimeout":1000000000,"MaxReadAhead":131072}"#
    );
  }

  #[test]
  fn fractional_durations_are_exact() {
    let opt = map(&[("AttrTimeout", "0.57m")]);
    assert_eq!(marshal_opt(&opt).unwrap(), r#"{"AttrTimeout":34200000000}"#);
  }

  #[test]
  fn strings_and_negatives() {
    let opt = map(&[("CacheMode", "full"), ("Umask", "-18"), ("ReadOnly", "false")]);
    assert_eq!(
      marshal_opt(&opt).unwrap(),
      r#"{"CacheMode":"full","ReadOnly":false,"Umask":-18}"#
    );
  }

  #[test]
  fn empty_map_is_omitted() {
    assert_eq!(marshal_opt(&HashMap::new()).unwrap(), "");
  }

  #[test]
  fn overrides_apply_per_key() {
    let defaults = MountOptions::new("mount2", r#"{"AllowOther":true}"#, "");
    let merged = defaults.with_overrides(&map(&[
      (MOUNT_TYPE_KEY, "cmount"),
      (MOUNT_OPT_KEY, ""),
      ("unrelated", "x"),
    ]));

    assert_eq!(merged, MountOptions::new("cmount", "", ""));
    assert_eq!(defaults.with_overrides(&HashMap::new()), defaults);
  }

  #[test]
  fn debug_hides_option_blobs() {
    let options = MountOptions::new("mount2", r#"{"Secret":"x"}"#, "");
    let debug = format!("{:?}", options);
    assert!(!debug.contains("Secret"));
    assert!(debug.contains("mount2"));
  }
}
