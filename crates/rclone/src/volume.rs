use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use sha1::{Digest, Sha1};

/// Name of the metadata object stored under each volume's directory.
pub const METADATA_FILENAME: &str = ".csi-metadata";

/// Derive the volume id for `name`: base58 (Bitcoin alphabet) of its SHA-1.
pub fn derive_id(name: &str) -> String {
  let digest = Sha1::digest(name.as_bytes());
  bs58::encode(digest.as_slice()).into_string()
}

/// Join `path` onto a backend root, without doubling the separator when
/// the root is a bare remote (`name:`) or already ends in `/`.
pub fn backend_path(root: &str, path: &str) -> String {
  if root.is_empty() || root.ends_with(':') || root.ends_with('/') {
    format!("{}{}", root, path)
  } else {
    format!("{}/{}", root, path)
  }
}

/// Location of the metadata object for `id`, relative to the remote root.
pub fn metadata_path(id: &str) -> String {
  format!("{}/{}", id, METADATA_FILENAME)
}

/// How stored metadata disagrees with a create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
  Identity { stored: String, requested: String },
  Capacity { stored: u64, requested: u64 },
}

/// The persisted record of a volume. Field order is part of the on-disk
/// format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
  remote: String,
  name: String,
  capacity: u64,
  id: String,
}

impl Volume {
  pub fn new(remote: impl Into<String>, name: impl Into<String>, capacity: u64) -> Self {
    let name = name.into();
    Volume {
      remote: remote.into(),
      id: derive_id(&name),
      name,
      capacity,
    }
  }

  pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
    serde_json::from_slice(bytes)
  }

  /// Compact JSON, or tab-indented with a trailing newline when `pretty`.
  pub fn to_json(&self, pretty: bool) -> serde_json::Result<Vec<u8>> {
    if !pretty {
      return serde_json::to_vec(self);
    }

    let mut out = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    self.serialize(&mut ser)?;
    out.push(b'\n');
    Ok(out)
  }

  #[inline]
  pub fn remote(&self) -> &str {
    &self.remote
  }

  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[inline]
  pub fn capacity(&self) -> u64 {
    self.capacity
  }

  #[inline]
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn set_capacity(&mut self, capacity: u64) {
    self.capacity = capacity;
  }

  /// Where the volume's data lives on the backend.
  pub fn backend_path(&self) -> String {
    backend_path(&self.remote, &self.id)
  }

  /// Compare stored metadata (`self`) against a requested volume. The id is
  /// checked before the capacity. Name and remote are not compared.
  pub fn conflict_with(&self, requested: &Volume) -> Option<Conflict> {
    if self.id != requested.id {
      return Some(Conflict::Identity {
        stored: self.id.clone(),
        requested: requested.id.clone(),
      });
    }

    if self.capacity != requested.capacity {
      return Some(Conflict::Capacity {
        stored: self.capacity,
        requested: requested.capacity,
      });
    }

    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  #[test]
  fn id_is_deterministic() {
    let id = derive_id("pvc-0c1a7b3e");
    assert_eq!(id, derive_id("pvc-0c1a7b3e"));
    assert_ne!(id, derive_id("pvc-0c1a7b3f"));
  }

  #[test_case("", "43LNwPunkRCSovrjPyoxpukWVtnU" ; "empty name")]
  #[test_case("abc", "3N3SPh7RsDDNbZDaMRaauXML5RG8" ; "abc")]
  fn id_matches_existing_metadata(name: &str, expected: &str) {
    assert_eq!(derive_id(name), expected);
  }

  #[test]
  fn id_is_path_safe() {
    let id = derive_id("some/name with spaces");
    assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
  }

  #[test_case("remote:", "id", "remote:id" ; "remote root")]
  #[test_case("remote:bucket", "id", "remote:bucket/id" ; "remote bucket")]
  #[test_case("remote:bucket/", "id", "remote:bucket/id" ; "remote bucket trailing slash")]
  #[test_case("/srv/data", "id", "/srv/data/id" ; "local path")]
  fn backend_paths(root: &str, path: &str, expected: &str) {
    assert_eq!(backend_path(root, path), expected);
  }

  #[test]
  fn pretty_json_layout() {
    let volume = Volume::new("remote:", "abc", 1024);
    let json = String::from_utf8(volume.to_json(true).unwrap()).unwrap();

    assert_eq!(
      json,
      format!(
        "{{\n\t\"remote\": \"remote:\",\n\t\"name\": \"abc\",\n\t\"capacity\": 1024,\n\t\"id\": \"{}\"\n}}\n",
        volume.id()
      )
    );
    assert_eq!(Volume::from_json(json.as_bytes()).unwrap(), volume);
  }

  #[test]
  fn compact_json_keeps_field_order() {
    let volume = Volume::new("r:", "n", 1);
    let json = String::from_utf8(volume.to_json(false).unwrap()).unwrap();
    assert!(json.starts_with("{\"remote\":\"r:\",\"name\":\"n\",\"capacity\":1,\"id\":"));
  }

  #[test]
  fn conflicts() {
    let stored = Volume::new("r:", "x", 100);

    assert_eq!(stored.conflict_with(&Volume::new("other:", "x", 100)), None);
    assert_eq!(
      stored.conflict_with(&Volume::new("r:", "x", 200)),
      Some(Conflict::Capacity {
        stored: 100,
        requested: 200
      })
    );
    assert!(matches!(
      stored.conflict_with(&Volume::new("r:", "y", 200)),
      Some(Conflict::Identity { .. })
    ));
  }
}
