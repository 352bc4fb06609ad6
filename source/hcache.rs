// The durable caches: one directory per folder, one file per key. Values for message headers are
// a versioned msgpack blob; a version bump silently invalidates old entries. The same store
// doubles as the body cache with raw values.

use crate::email::{Body, Email, Envelope};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::{fs, io, path};

// Key and folder names are percent-escaped into file names; "/" in particular appears both in
// mandatory keys ("/UIDVALIDITY") and in canonical folder paths.
fn escape(name: &str) -> String {
  let mut escaped = String::with_capacity(name.len());
  for byte in name.bytes() {
    match byte {
      b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
        escaped.push(char::from(byte))
      }
      _ => escaped.push_str(&format!("%{byte:02X}")),
    }
  }
  escaped
}

fn unescape(name: &str) -> Option<String> {
  let mut bytes = Vec::with_capacity(name.len());
  let mut rest = name.bytes();
  while let Some(byte) = rest.next() {
    if byte == b'%' {
      let high = rest.next()?;
      let low = rest.next()?;
      let hex = [high, low];
      let hex = std::str::from_utf8(&hex).ok()?;
      bytes.push(u8::from_str_radix(hex, 16).ok()?);
    } else {
      bytes.push(byte);
    }
  }
  String::from_utf8(bytes).ok()
}

pub struct Store {
  directory: path::PathBuf,
}

impl Store {
  pub fn open(root: &path::Path, folder: &str) -> anyhow::Result<Store> {
    let directory = root.join(escape(folder));
    fs::create_dir_all(&directory)
      .with_context(|| format!("couldn't create cache directory {directory:?}"))?;
    Ok(Store { directory })
  }

  fn key_path(&self, key: &str) -> path::PathBuf {
    self.directory.join(escape(key))
  }

  pub fn get(&self, key: &str) -> Option<Vec<u8>> {
    fs::read(self.key_path(key)).ok()
  }

  // Writes go through a temp file so a crash can't leave a half-written value behind.
  pub fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
    let tmp = self
      .directory
      .join(format!(".{}", uuid::Uuid::new_v4().hyphenated()));
    fs::write(&tmp, value).with_context(|| format!("couldn't write {tmp:?}"))?;
    fs::rename(&tmp, self.key_path(key)).with_context(|| format!("couldn't commit {key:?}"))
  }

  pub fn delete(&self, key: &str) -> anyhow::Result<()> {
    match fs::remove_file(self.key_path(key)) {
      Ok(()) => Ok(()),
      Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(error) => Err(error).with_context(|| format!("couldn't delete {key:?}")),
    }
  }

  pub fn keys(&self) -> anyhow::Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(&self.directory)? {
      let entry = entry?;
      let name = entry.file_name();
      let Some(name) = name.to_str() else {
        continue;
      };
      if name.starts_with('.') {
        continue; // Abandoned temp files.
      }
      if let Some(key) = unescape(name) {
        keys.push(key);
      }
    }
    Ok(keys)
  }

  pub fn clear(&self) -> anyhow::Result<()> {
    for key in self.keys()? {
      self.delete(&key)?;
    }
    Ok(())
  }
}

// Bump when the serialised shape changes; stale entries then read as misses.
const VERSION: u8 = 1;

const UIDVALIDITY_KEY: &str = "/UIDVALIDITY";
const UIDNEXT_KEY: &str = "/UIDNEXT";
const MODSEQ_KEY: &str = "/MODSEQ";

#[derive(Debug, Serialize, Deserialize)]
pub struct CachedEmail {
  pub envelope: Envelope,
  pub body: Option<Body>,
  pub received: i64,
}

pub struct HeaderCache {
  store: Store,
}

impl HeaderCache {
  pub fn open(root: &path::Path, folder: &str) -> anyhow::Result<HeaderCache> {
    Ok(HeaderCache {
      store: Store::open(root, folder)?,
    })
  }

  fn get_u32(&self, key: &str) -> Option<u32> {
    let bytes = self.store.get(key)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
  }

  fn get_u64(&self, key: &str) -> Option<u64> {
    let bytes = self.store.get(key)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
  }

  pub fn uidvalidity(&self) -> Option<u32> {
    self.get_u32(UIDVALIDITY_KEY)
  }

  pub fn set_uidvalidity(&self, uidvalidity: u32) -> anyhow::Result<()> {
    self.store.put(UIDVALIDITY_KEY, &uidvalidity.to_le_bytes())
  }

  pub fn uidnext(&self) -> Option<u32> {
    self.get_u32(UIDNEXT_KEY)
  }

  pub fn set_uidnext(&self, uidnext: u32) -> anyhow::Result<()> {
    self.store.put(UIDNEXT_KEY, &uidnext.to_le_bytes())
  }

  pub fn modseq(&self) -> Option<u64> {
    self.get_u64(MODSEQ_KEY)
  }

  pub fn set_modseq(&self, modseq: u64) -> anyhow::Result<()> {
    self.store.put(MODSEQ_KEY, &modseq.to_le_bytes())
  }

  pub fn email(&self, uid: u32) -> Option<CachedEmail> {
    let bytes = self.store.get(&uid.to_string())?;
    match bytes.split_first() {
      Some((&VERSION, payload)) => rmp_serde::from_slice(payload).ok(),
      _ => None,
    }
  }

  pub fn put_email(&self, uid: u32, email: &Email) -> anyhow::Result<()> {
    let cached = CachedEmail {
      envelope: email.envelope.clone(),
      body: email.body.clone(),
      received: email.received,
    };
    let mut value = vec![VERSION];
    value.extend(rmp_serde::to_vec(&cached).context("couldn't serialise headers")?);
    self.store.put(&uid.to_string(), &value)
  }

  pub fn delete_email(&self, uid: u32) -> anyhow::Result<()> {
    self.store.delete(&uid.to_string())
  }

  pub fn uids(&self) -> anyhow::Result<Vec<u32>> {
    Ok(
      self
        .store
        .keys()?
        .into_iter()
        .filter_map(|key| key.parse().ok())
        .collect(),
    )
  }

  pub fn clear(&self) -> anyhow::Result<()> {
    self.store.clear()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn escaping_round_trips() {
    for name in ["INBOX", "/UIDVALIDITY", "imap://u@h/折り紙", "a b%c"] {
      assert_eq!(Some(name.to_string()), unescape(&escape(name)), "{name}");
    }
    // Escaped names are plain file names.
    assert!(!escape("/UIDVALIDITY").contains('/'));
  }

  #[test]
  fn mandatory_keys() {
    let directory = tempfile::tempdir().unwrap();
    let hcache = HeaderCache::open(directory.path(), "imap://u@h/INBOX").unwrap();
    assert_eq!(None, hcache.uidvalidity());
    hcache.set_uidvalidity(42).unwrap();
    hcache.set_uidnext(100).unwrap();
    hcache.set_modseq(1 << 40).unwrap();
    assert_eq!(Some(42), hcache.uidvalidity());
    assert_eq!(Some(100), hcache.uidnext());
    assert_eq!(Some(1 << 40), hcache.modseq());
  }

  #[test]
  fn emails_round_trip() {
    let directory = tempfile::tempdir().unwrap();
    let hcache = HeaderCache::open(directory.path(), "folder").unwrap();
    let reply = regex::Regex::new(crate::email::DEFAULT_REPLY_REGEX).unwrap();
    let envelope = crate::email::parse_header(
      b"From: a@x\r\nSubject: Re: hi\r\nMessage-ID: <1@x>\r\n\r\n",
      &reply,
    );
    let mut email = Email::new(envelope, 123);
    email.body = Some(Body::default());
    hcache.put_email(7, &email).unwrap();

    let cached = hcache.email(7).unwrap();
    assert_eq!(email.envelope, cached.envelope);
    assert_eq!(Some("hi"), cached.envelope.real_subj());
    assert_eq!(123, cached.received);
    assert_eq!(vec![7], hcache.uids().unwrap());

    hcache.delete_email(7).unwrap();
    assert!(hcache.email(7).is_none());
  }

  #[test]
  fn version_mismatch_is_a_miss() {
    let directory = tempfile::tempdir().unwrap();
    let hcache = HeaderCache::open(directory.path(), "folder").unwrap();
    hcache.store.put("9", &[VERSION + 1, 0, 0]).unwrap();
    assert!(hcache.email(9).is_none());
    // The stray value still lists as a uid until overwritten.
    assert_eq!(vec![9], hcache.uids().unwrap());
  }

  #[test]
  fn clear_drops_everything() {
    let directory = tempfile::tempdir().unwrap();
    let hcache = HeaderCache::open(directory.path(), "folder").unwrap();
    hcache.set_uidvalidity(1).unwrap();
    hcache.put_email(1, &Email::default()).unwrap();
    hcache.clear().unwrap();
    assert_eq!(None, hcache.uidvalidity());
    assert!(hcache.uids().unwrap().is_empty());
  }
}
