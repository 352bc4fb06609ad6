// https://www.rfc-editor.org/rfc/rfc5322 - Internet Message Format
// https://www.rfc-editor.org/rfc/rfc2047 - MIME part three: message header extensions
// https://www.rfc-editor.org/rfc/rfc2045 - MIME part one: format of Internet message bodies

use crate::codec;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

// The flags a server can hold an opinion about. "old" is local bookkeeping (seen in a previous
// session but still unread) and never leaves the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
  pub read: bool,
  pub old: bool,
  pub deleted: bool,
  pub flagged: bool,
  pub replied: bool,
  pub draft: bool,
}

impl Flags {
  // The wire names of the flags that differ between `self` (local) and `remote`, split into the
  // additions and the removals a server must apply to converge on `self`.
  pub fn diff(&self, remote: &Flags) -> (Vec<&'static str>, Vec<&'static str>) {
    let mut add = Vec::new();
    let mut delete = Vec::new();
    for (local, remote, name) in [
      (self.read, remote.read, "\\Seen"),
      (self.deleted, remote.deleted, "\\Deleted"),
      (self.flagged, remote.flagged, "\\Flagged"),
      (self.replied, remote.replied, "\\Answered"),
      (self.draft, remote.draft, "\\Draft"),
    ] {
      if local && !remote {
        add.push(name);
      } else if !local && remote {
        delete.push(name);
      }
    }
    (add, delete)
  }

  pub fn from_imap<S: AsRef<[u8]>>(flags: &[S]) -> Flags {
    let mut result = Flags::default();
    for flag in flags {
      match flag.as_ref() {
        b"\\Seen" => result.read = true,
        b"\\Deleted" => result.deleted = true,
        b"\\Flagged" => result.flagged = true,
        b"\\Answered" => result.replied = true,
        b"\\Draft" => result.draft = true,
        _ => (), // \Recent and keywords are not tracked.
      }
    }
    result
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
  Text,
  Multipart,
  Message,
  Application,
  Audio,
  Image,
  Video,
  #[default]
  Other,
}

impl ContentType {
  pub fn parse(name: &str) -> ContentType {
    match name.to_ascii_lowercase().as_str() {
      "text" => ContentType::Text,
      "multipart" => ContentType::Multipart,
      "message" => ContentType::Message,
      "application" => ContentType::Application,
      "audio" => ContentType::Audio,
      "image" => ContentType::Image,
      "video" => ContentType::Video,
      _ => ContentType::Other,
    }
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
  #[default]
  SevenBit,
  EightBit,
  Binary,
  Base64,
  QuotedPrintable,
}

impl Encoding {
  pub fn parse(name: &str) -> Encoding {
    match name.to_ascii_lowercase().as_str() {
      "8bit" => Encoding::EightBit,
      "binary" => Encoding::Binary,
      "base64" => Encoding::Base64,
      "quoted-printable" => Encoding::QuotedPrintable,
      _ => Encoding::SevenBit,
    }
  }
}

// One node of the MIME tree. Offsets are relative to the start of the containing message so mbox
// can seek straight to a part; IMAP fills in whatever BODYSTRUCTURE reported.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
  pub content_type: ContentType,
  pub subtype: String,
  pub encoding: Encoding,
  pub disposition: Option<String>,
  pub parameters: Vec<(String, String)>,
  pub offset: u64,
  pub hdr_offset: u64,
  pub length: u64,
  pub lines: u64,
  pub parts: Vec<Body>,
  // Only for message/rfc822.
  pub envelope: Option<Box<Envelope>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub from: Option<String>,
  pub to: Option<String>,
  pub cc: Option<String>,
  pub subject: Option<String>,
  // Byte offset into `subject` past the reply prefixes; maintained by `compute_real_subj`.
  pub real_subj_offset: usize,
  pub message_id: Option<String>,
  pub references: Vec<String>,
  pub in_reply_to: Vec<String>,
  pub date: Option<i64>,
  pub return_path: Option<String>,
}

impl Envelope {
  // The subject with reply prefixes stripped, used for threading and scoring.
  pub fn real_subj(&self) -> Option<&str> {
    self
      .subject
      .as_deref()
      .map(|subject| &subject[self.real_subj_offset.min(subject.len())..])
  }

  // Idempotent; reapplied to every message when the pattern changes.
  pub fn compute_real_subj(&mut self, reply_regex: &regex::Regex) {
    self.real_subj_offset = match self.subject.as_deref() {
      Some(subject) => match reply_regex.find(subject) {
        Some(found) if found.start() == 0 => found.end(),
        _ => 0,
      },
      None => 0,
    };
  }

  // Strict identity used to reattach state to messages after an external mailbox rewrite.
  pub fn same_message(&self, other: &Envelope) -> bool {
    self.message_id == other.message_id
      && self.from == other.from
      && self.to == other.to
      && self.subject == other.subject
      && self.date == other.date
  }
}

pub const DEFAULT_REPLY_REGEX: &str = r"(?i)^(re(\[[0-9]+\])?:[ \t]*)+";

// https://www.rfc-editor.org/rfc/rfc2047#section-2
// encoded-word = "=?" charset "?" encoding "?" encoded-text "?="
fn decode_encoded_word(word: &str) -> Option<String> {
  let rest = word.strip_prefix("=?")?.strip_suffix("?=")?;
  let mut pieces = rest.splitn(3, '?');
  let charset = pieces.next()?;
  // RFC 2231 language suffixes ("utf-8*en") are ignored.
  let charset = charset.split('*').next()?;
  let encoding = pieces.next()?;
  let payload = pieces.next()?;
  let bytes = match encoding {
    "b" | "B" => codec::standard_engine().decode(payload).ok()?,
    "q" | "Q" => codec::quoted_printable_decode(payload.as_bytes(), true),
    _ => return None,
  };
  codec::to_utf8(&bytes, &[charset, "utf-8"])
}

pub fn rfc2047_decode(raw: &[u8]) -> String {
  let raw = String::from_utf8_lossy(raw);
  let mut output = String::new();
  let mut last_was_encoded = false;
  let mut pending_space = String::new();
  for token in raw.split_inclusive(char::is_whitespace) {
    let (word, space) = match token.find(char::is_whitespace) {
      Some(at) => token.split_at(at),
      None => (token, ""),
    };
    match decode_encoded_word(word) {
      Some(decoded) => {
        // https://www.rfc-editor.org/rfc/rfc2047#section-6.2
        // White space between adjacent encoded-words is not displayed.
        if !last_was_encoded {
          output.push_str(&pending_space);
        }
        output.push_str(&decoded);
        last_was_encoded = true;
      }
      None => {
        output.push_str(&pending_space);
        output.push_str(word);
        last_was_encoded = false;
      }
    }
    pending_space = space.to_string();
  }
  output.push_str(&pending_space);
  output.trim_end().to_string()
}

pub fn parse_msg_ids(raw: &str) -> Vec<String> {
  let mut ids = Vec::new();
  let mut rest = raw;
  while let Some(start) = rest.find('<') {
    match rest[start..].find('>') {
      Some(end) => {
        ids.push(rest[start..start + end + 1].to_string());
        rest = &rest[start + end + 1..];
      }
      None => break,
    }
  }
  ids
}

pub fn parse_date(raw: &str) -> Option<i64> {
  // Strip a trailing "(TZ)" comment which rfc2822 parsing chokes on.
  let raw = match raw.rfind('(') {
    Some(at) => raw[..at].trim(),
    None => raw.trim(),
  };
  chrono::DateTime::parse_from_rfc2822(raw)
    .ok()
    .map(|date| date.timestamp())
}

// Splits a message into its header block and the body offset (past the blank line). Accepts both
// CRLF and bare LF line endings.
pub fn body_offset(message: &[u8]) -> usize {
  if let Some(at) = memchr::memmem::find(message, b"\r\n\r\n") {
    return at + 4;
  }
  if let Some(at) = memchr::memmem::find(message, b"\n\n") {
    return at + 2;
  }
  message.len()
}

// Parses the headers of interest out of a raw header block, unfolding continuation lines.
// Unknown headers are skipped, not errors; mail in the wild is what it is.
pub fn parse_header(header: &[u8], reply_regex: &regex::Regex) -> Envelope {
  let mut envelope = Envelope::default();
  let mut current: Option<(String, Vec<u8>)> = None;
  let commit = |current: &mut Option<(String, Vec<u8>)>, envelope: &mut Envelope| {
    let Some((name, value)) = current.take() else {
      return;
    };
    let trimmed: Vec<u8> = {
      let start = value.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(value.len());
      let end = value.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |at| at + 1);
      value[start..end].to_vec()
    };
    let text = || rfc2047_decode(&trimmed);
    match name.as_str() {
      "from" => envelope.from = Some(text()),
      "to" => envelope.to = Some(text()),
      "cc" => envelope.cc = Some(text()),
      "subject" => envelope.subject = Some(text()),
      "message-id" => {
        envelope.message_id = parse_msg_ids(&String::from_utf8_lossy(&trimmed)).into_iter().next()
      }
      "references" => envelope.references = parse_msg_ids(&String::from_utf8_lossy(&trimmed)),
      "in-reply-to" => {
        envelope.in_reply_to = parse_msg_ids(&String::from_utf8_lossy(&trimmed))
      }
      "date" => envelope.date = parse_date(&String::from_utf8_lossy(&trimmed)),
      "return-path" => envelope.return_path = Some(text()),
      _ => (),
    }
  };
  for line in header.split(|byte| *byte == b'\n') {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
      break;
    }
    if line[0] == b' ' || line[0] == b'\t' {
      // Folded continuation of the previous header.
      if let Some((_, value)) = current.as_mut() {
        value.push(b' ');
        value.extend_from_slice(line.trim_ascii_start());
      }
      continue;
    }
    commit(&mut current, &mut envelope);
    if let Some(colon) = memchr::memchr(b':', line) {
      let name = String::from_utf8_lossy(&line[..colon]).trim().to_ascii_lowercase();
      current = Some((name, line[colon + 1..].to_vec()));
    }
  }
  commit(&mut current, &mut envelope);
  envelope.compute_real_subj(reply_regex);
  envelope
}

// Backend-private message state; the closed set of backends this store knows about.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Private {
  #[default]
  None,
  Imap(crate::imap::EmailData),
  Mbox(crate::mbox::EmailData),
  Pop(crate::pop::EmailData),
}

// A message as seen locally. `index` tracks the position in the owning mailbox's email vector,
// `virtual_index` the position among visible messages.
#[derive(Clone, Debug, Default)]
pub struct Email {
  pub index: usize,
  pub virtual_index: Option<usize>,
  // Cleared when the server announces an expunge; inactive messages are excluded from every
  // message set and dropped at the next sync.
  pub active: bool,
  pub flags: Flags,
  pub tagged: bool,
  pub purge: bool,
  pub changed: bool,
  pub envelope: Envelope,
  pub body: Option<Body>,
  pub received: i64,
  pub private: Private,
}

impl Email {
  pub fn new(envelope: Envelope, received: i64) -> Email {
    Email {
      active: true,
      envelope,
      received,
      ..Email::default()
    }
  }

  pub fn imap(&self) -> Option<&crate::imap::EmailData> {
    match &self.private {
      Private::Imap(data) => Some(data),
      _ => None,
    }
  }

  pub fn imap_mut(&mut self) -> Option<&mut crate::imap::EmailData> {
    match &mut self.private {
      Private::Imap(data) => Some(data),
      _ => None,
    }
  }

  pub fn mbox(&self) -> Option<&crate::mbox::EmailData> {
    match &self.private {
      Private::Mbox(data) => Some(data),
      _ => None,
    }
  }

  pub fn pop(&self) -> Option<&crate::pop::EmailData> {
    match &self.private {
      Private::Pop(data) => Some(data),
      _ => None,
    }
  }
}
