// https://www.rfc-editor.org/rfc/rfc4155 - the application/mbox media type
//
// The local backends: mbox ("From " separated) and MMDF ("\x01\x01\x01\x01" bracketed) in one
// module, since they differ only in framing. Flags persist in Status/X-Status headers; sync is a
// two-phase rewrite that leaves the prefix of untouched messages alone.

use crate::{
  email::{Email, Flags, Private},
  mailbox::{Check, Kind, Mailbox},
  store::{MailStore, Path, MMDF_SEPARATOR},
  Config,
};
use anyhow::Context as _;
use std::{
  fs,
  io::{self, Read as _, Seek as _, Write as _},
  os::unix::io::AsRawFd as _,
  path,
  time,
};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmailData {
  // Where the message's framing starts: the "From " line or the leading MMDF separator.
  pub offset: u64,
  pub header_offset: u64,
  pub body_offset: u64,
  // One past the last body byte, before the next message's framing.
  pub end_offset: u64,
  pub lines: u64,
  // The original "From sender date" line, kept verbatim across rewrites (mbox only).
  pub from_line: Vec<u8>,
}

// Advisory fcntl lock released on every exit path. The guard owns a duplicated descriptor so the
// caller keeps full use of its own; closing any descriptor drops the process's locks on the file,
// which is exactly the release we want.
struct Lock {
  file: fs::File,
}

impl Lock {
  const ATTEMPTS: u32 = 5;

  fn acquire(file: &fs::File, exclusive: bool) -> anyhow::Result<Lock> {
    let file = file
      .try_clone()
      .map_err(|error| anyhow::Error::new(crate::Error::FileError).context(error))?;
    let mut flock: nix::libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = if exclusive {
      nix::libc::F_WRLCK as nix::libc::c_short
    } else {
      nix::libc::F_RDLCK as nix::libc::c_short
    };
    flock.l_whence = nix::libc::SEEK_SET as nix::libc::c_short;
    let mut attempt = 0;
    loop {
      if crate::aborted() {
        return Err(anyhow::Error::new(crate::Error::Aborted));
      }
      match nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&flock)) {
        Ok(_) => return Ok(Lock { file }),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => {
          attempt += 1;
          if attempt >= Self::ATTEMPTS {
            return Err(anyhow::Error::new(crate::Error::Locked))
              .context("mailbox is locked by another process");
          }
          log::debug!("mailbox locked, retrying ({attempt}/{})", Self::ATTEMPTS);
          std::thread::sleep(time::Duration::from_millis(250 * u64::from(attempt)));
        }
        Err(error) => {
          return Err(anyhow::Error::new(crate::Error::FileError).context(error))
        }
      }
    }
  }
}

impl Drop for Lock {
  fn drop(&mut self) {
    let mut flock: nix::libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = nix::libc::F_UNLCK as nix::libc::c_short;
    flock.l_whence = nix::libc::SEEK_SET as nix::libc::c_short;
    let _ = nix::fcntl::fcntl(self.file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&flock));
  }
}

// Status: "RO", X-Status: "AF": how mbox persists flags inside the file itself.
fn flags_from_headers(header: &[u8]) -> Flags {
  let mut flags = Flags::default();
  for line in header.split(|byte| *byte == b'\n') {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let lower: Vec<u8> = line
      .iter()
      .take(9)
      .map(|byte| byte.to_ascii_lowercase())
      .collect();
    let value = if lower.starts_with(b"status:") {
      &line[7..]
    } else if lower.starts_with(b"x-status:") {
      &line[9..]
    } else {
      continue;
    };
    for byte in value {
      match byte {
        b'R' => flags.read = true,
        b'O' => flags.old = true,
        b'A' => flags.replied = true,
        b'F' => flags.flagged = true,
        b'D' => flags.deleted = true,
        _ => (),
      }
    }
  }
  flags
}

fn status_headers(flags: &Flags) -> Vec<u8> {
  let mut headers = Vec::new();
  let mut status = String::new();
  if flags.read {
    status.push('R');
  }
  if flags.old {
    status.push('O');
  }
  if !status.is_empty() {
    headers.extend_from_slice(format!("Status: {status}\n").as_bytes());
  }
  let mut x_status = String::new();
  if flags.replied {
    x_status.push('A');
  }
  if flags.flagged {
    x_status.push('F');
  }
  if !x_status.is_empty() {
    headers.extend_from_slice(format!("X-Status: {x_status}\n").as_bytes());
  }
  headers
}

fn is_status_line(line: &[u8]) -> bool {
  let lower: Vec<u8> = line
    .iter()
    .take(9)
    .map(|byte| byte.to_ascii_lowercase())
    .collect();
  lower.starts_with(b"status:") || lower.starts_with(b"x-status:")
}

fn content_length(header: &[u8]) -> Option<u64> {
  for line in header.split(|byte| *byte == b'\n') {
    let lower: Vec<u8> = line
      .iter()
      .take(15)
      .map(|byte| byte.to_ascii_lowercase())
      .collect();
    if lower.starts_with(b"content-length:") {
      return String::from_utf8_lossy(&line[15..]).trim().parse().ok();
    }
  }
  None
}

struct RawMessage {
  offset: u64,
  header_offset: u64,
  body_offset: u64,
  end_offset: u64,
  from_line: Vec<u8>,
}

fn starts_message(content: &[u8], at: usize, kind: Kind) -> bool {
  match kind {
    Kind::Mmdf => content[at..].starts_with(MMDF_SEPARATOR),
    _ => content[at..].starts_with(b"From ") && (at == 0 || content[at - 1] == b'\n'),
  }
}

// Where the body ends: the Content-Length hint when it checks out (the declared end must be
// followed by the next separator or EOF), the next separator otherwise.
fn find_end(content: &[u8], body_offset: usize, kind: Kind, hint: Option<u64>) -> usize {
  if let Some(hint) = hint {
    let candidate = body_offset.saturating_add(hint as usize);
    if candidate <= content.len() {
      let valid = candidate == content.len()
        || starts_message(content, candidate, kind)
        || (content[candidate] == b'\n'
          && (candidate + 1 == content.len() || starts_message(content, candidate + 1, kind)));
      if valid {
        return match kind {
          Kind::Mmdf => candidate,
          _ if candidate < content.len() && content[candidate] == b'\n' => candidate + 1,
          _ => candidate,
        };
      }
      log::debug!("Content-Length {hint} doesn't line up, scanning instead");
    }
  }
  let mut position = body_offset;
  while position < content.len() {
    match memchr::memchr(b'\n', &content[position..]) {
      Some(at) => {
        let line_start = position + at + 1;
        if line_start >= content.len() || starts_message(content, line_start, kind) {
          return line_start;
        }
        position = line_start;
      }
      None => break,
    }
  }
  content.len()
}

fn scan(content: &[u8], base: u64, kind: Kind) -> anyhow::Result<Vec<RawMessage>> {
  let mut messages = Vec::new();
  let mut position = 0;
  // Leading blank lines are tolerated.
  while position < content.len() && (content[position] == b'\n' || content[position] == b'\r') {
    position += 1;
  }
  while position < content.len() {
    if crate::aborted() {
      return Err(anyhow::Error::new(crate::Error::Aborted));
    }
    let offset = position;
    let header_offset = match kind {
      Kind::Mmdf => {
        anyhow::ensure!(
          content[position..].starts_with(MMDF_SEPARATOR),
          corrupt(base, position)
        );
        position + MMDF_SEPARATOR.len()
      }
      _ => {
        anyhow::ensure!(starts_message(content, position, kind), corrupt(base, position));
        match memchr::memchr(b'\n', &content[position..]) {
          Some(at) => position + at + 1,
          None => anyhow::bail!(corrupt(base, position)),
        }
      }
    };
    let from_line = match kind {
      Kind::Mmdf => Vec::new(),
      _ => content[offset..header_offset - 1].to_vec(),
    };
    let header = &content[header_offset..];
    let body_offset = header_offset + crate::email::body_offset(header);
    let header = &content[header_offset..body_offset.min(content.len())];
    let end_offset = match kind {
      Kind::Mmdf => {
        // The body runs to the closing separator line.
        let mut end = body_offset;
        loop {
          if end >= content.len() {
            anyhow::bail!(corrupt(base, offset)); // Unterminated message.
          }
          if content[end..].starts_with(MMDF_SEPARATOR) && (end == 0 || content[end - 1] == b'\n')
          {
            break;
          }
          match memchr::memchr(b'\n', &content[end..]) {
            Some(at) => end += at + 1,
            None => anyhow::bail!(corrupt(base, offset)),
          }
        }
        end
      }
      _ => find_end(content, body_offset, kind, content_length(header)),
    };
    messages.push(RawMessage {
      offset: base + offset as u64,
      header_offset: base + header_offset as u64,
      body_offset: base + body_offset as u64,
      end_offset: base + end_offset as u64,
      from_line,
    });
    position = match kind {
      Kind::Mmdf => end_offset + MMDF_SEPARATOR.len(),
      _ => end_offset,
    };
    // Blank padding between messages.
    while position < content.len() && content[position] == b'\n' {
      position += 1;
    }
  }
  Ok(messages)
}

fn corrupt(base: u64, position: usize) -> anyhow::Error {
  anyhow::Error::new(crate::Error::MailboxCorrupt)
    .context(format!("bad separator at byte {}", base + position as u64))
}

#[derive(Debug)]
pub struct MboxMailbox {
  file: fs::File,
  mailbox: Mailbox,
  kind: Kind,
  file_path: path::PathBuf,
  size: u64,
  tmp_dir: path::PathBuf,
  // Trust the size alone when deciding whether anything happened; some setups touch mtimes.
  check_size_only: bool,
  reply_regex: regex::Regex,
}

impl MboxMailbox {
  pub fn open(
    spec: &str,
    kind: Kind,
    config: &Config,
    readonly: bool,
  ) -> anyhow::Result<MboxMailbox> {
    let file_path = path::PathBuf::from(spec);
    let mut readonly = readonly;
    let file = if readonly {
      fs::File::open(&file_path)
    } else {
      match fs::OpenOptions::new().read(true).write(true).open(&file_path) {
        Ok(file) => Ok(file),
        Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
          // Degrade rather than fail; the UI shows the mailbox read-only.
          log::warn!("{spec} isn't writable, opening read-only");
          readonly = true;
          fs::File::open(&file_path)
        }
        Err(error) => Err(error),
      }
    }
    .map_err(|error| anyhow::Error::new(crate::Error::FileError).context(error))
    .with_context(|| format!("couldn't open {spec}"))?;
    let mut mailbox = Mailbox::new(kind, Path::local(spec));
    mailbox.readonly = readonly;
    let mut this = MboxMailbox {
      file,
      mailbox,
      kind,
      file_path,
      size: 0,
      tmp_dir: config.tmp_dir.clone(),
      check_size_only: config.check_mbox_size,
      reply_regex: regex::Regex::new(&config.reply_regex)
        .with_context(|| format!("invalid reply pattern {:?}", config.reply_regex))?,
    };
    this.reload()?;
    Ok(this)
  }

  fn read_all(&mut self) -> anyhow::Result<Vec<u8>> {
    self.file.rewind()?;
    let mut content = Vec::new();
    self
      .file
      .read_to_end(&mut content)
      .map_err(|error| anyhow::Error::new(crate::Error::FileError).context(error))?;
    Ok(content)
  }

  fn build_email(&self, content_base: u64, content: &[u8], raw: RawMessage) -> Email {
    let header =
      &content[(raw.header_offset - content_base) as usize..(raw.body_offset - content_base) as usize];
    let body = &content[(raw.body_offset - content_base) as usize..(raw.end_offset - content_base) as usize];
    let envelope = crate::email::parse_header(header, &self.reply_regex);
    let received = envelope.date.unwrap_or(0);
    let mut email = Email::new(envelope, received);
    email.flags = flags_from_headers(header);
    email.private = Private::Mbox(EmailData {
      offset: raw.offset,
      header_offset: raw.header_offset,
      body_offset: raw.body_offset,
      end_offset: raw.end_offset,
      lines: body.iter().filter(|byte| **byte == b'\n').count() as u64,
      from_line: raw.from_line,
    });
    email
  }

  // Full parse from scratch, reconciling unsaved local flag edits with the file's view by strict
  // envelope identity.
  fn reload(&mut self) -> anyhow::Result<()> {
    let _lock = Lock::acquire(&self.file, !self.mailbox.readonly)?;
    let content = self.read_all()?;
    let previous: Vec<Email> = std::mem::take(&mut self.mailbox.emails);
    self.mailbox.v2r.clear();
    for raw in scan(&content, 0, self.kind)? {
      let mut email = self.build_email(0, &content, raw);
      if let Some(old) = previous
        .iter()
        .find(|old| old.changed && old.envelope.same_message(&email.envelope))
      {
        email.flags = old.flags;
        email.changed = true;
        email.tagged = old.tagged;
      }
      self.mailbox.push(email);
    }
    self.mailbox.rebuild();
    self.mailbox.changed = self.mailbox.emails.iter().any(|email| email.changed);
    let metadata = self.file.metadata()?;
    self.size = metadata.len();
    self.mailbox.mtime = metadata.modified().ok();
    Ok(())
  }

  // The byte at the old end of file must begin a fresh message for the append fast path.
  fn valid_append_boundary(&self, content: &[u8]) -> bool {
    let at = self.size as usize;
    if at == 0 || content.len() <= at {
      return false;
    }
    match self.kind {
      Kind::Mmdf => content[at..].starts_with(MMDF_SEPARATOR),
      _ => content[at - 1] == b'\n' && content[at..].starts_with(b"From "),
    }
  }

  fn mbox_check(&mut self) -> anyhow::Result<Check> {
    let metadata = fs::metadata(&self.file_path)
      .map_err(|error| anyhow::Error::new(crate::Error::FileError).context(error))?;
    let size = metadata.len();
    let mtime = metadata.modified().ok();
    if size == self.size && (self.check_size_only || mtime == self.mailbox.mtime) {
      return Ok(Check::Ok);
    }
    if size > self.size {
      let _lock = Lock::acquire(&self.file, false)?;
      let content = self.read_all()?;
      if self.valid_append_boundary(&content) {
        // Parse only the appended tail; existing offsets are untouched.
        let base = self.size;
        for raw in scan(&content[base as usize..], base, self.kind)? {
          let email = self.build_email(base, &content[base as usize..], raw);
          self.mailbox.push(email);
        }
        self.mailbox.rebuild();
        self.size = size;
        self.mailbox.mtime = mtime;
        return Ok(Check::NewMail);
      }
    }
    // Someone rewrote the file under us.
    log::info!("{} changed externally, reparsing", self.file_path.display());
    self.reload()?;
    Ok(Check::Reopened)
  }

  // One message in its on-disk form, with Status headers rewritten from the current flags and
  // "From " body lines quoted.
  fn write_message(&self, out: &mut Vec<u8>, content: &[u8], email: &Email) -> EmailData {
    let data = email.mbox().cloned().unwrap_or_default();
    let offset = out.len() as u64;
    match self.kind {
      Kind::Mmdf => out.extend_from_slice(MMDF_SEPARATOR),
      _ => {
        if data.from_line.is_empty() {
          out.extend_from_slice(from_line(&email.envelope, email.received).as_bytes());
        } else {
          out.extend_from_slice(&data.from_line);
        }
        out.push(b'\n');
      }
    }
    let header_offset = out.len() as u64;
    let header = &content[data.header_offset as usize..data.body_offset as usize];
    // Strip the old Status lines and the final blank line, then re-emit.
    let mut body_separator = &b"\n"[..];
    for line in header.split_inclusive(|byte| *byte == b'\n') {
      let bare = line.strip_suffix(b"\n").unwrap_or(line);
      let bare = bare.strip_suffix(b"\r").unwrap_or(bare);
      if bare.is_empty() {
        body_separator = line;
        continue;
      }
      if is_status_line(bare) {
        continue;
      }
      out.extend_from_slice(line);
    }
    out.extend_from_slice(&status_headers(&email.flags));
    out.extend_from_slice(body_separator);
    let body_offset = out.len() as u64;
    let body = &content[data.body_offset as usize..data.end_offset as usize];
    match self.kind {
      Kind::Mmdf => {
        out.extend_from_slice(body);
        if !body.ends_with(b"\n") {
          out.push(b'\n');
        }
        out.extend_from_slice(MMDF_SEPARATOR);
      }
      _ => {
        for line in body.split_inclusive(|byte| *byte == b'\n') {
          // ">From " quoting; consumers handle both shapes.
          if line.starts_with(b"From ") {
            out.push(b'>');
          }
          out.extend_from_slice(line);
        }
        if !body.ends_with(b"\n") {
          out.push(b'\n');
        }
      }
    }
    let end_offset = match self.kind {
      Kind::Mmdf => out.len() as u64 - MMDF_SEPARATOR.len() as u64,
      _ => out.len() as u64,
    };
    EmailData {
      offset,
      header_offset,
      body_offset,
      end_offset,
      lines: body.iter().filter(|byte| **byte == b'\n').count() as u64,
      from_line: data.from_line,
    }
  }

  fn recovery_path(&self) -> path::PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = nix::unistd::gethostname()
      .ok()
      .and_then(|name| name.into_string().ok())
      .unwrap_or_else(|| "localhost".to_string());
    self
      .tmp_dir
      .join(format!("mstore.{user}-{host}-{}", std::process::id()))
  }

  // Two-phase rewrite: the untouched prefix stays as is, everything from the first dirty message
  // on is rebuilt in a temp file and copied back. A failed copy-back leaves the rebuilt segment
  // under a recovery name.
  fn mbox_sync(&mut self) -> anyhow::Result<()> {
    if !self.mailbox.changed && self.mailbox.counts.deleted == 0 {
      // Untouched mailboxes stay byte-identical, mtime included.
      return Ok(());
    }
    anyhow::ensure!(!self.mailbox.readonly, "mailbox is read-only");
    if self.mailbox.dontwrite {
      return Ok(());
    }
    // Someone may have changed the file since the last look; reconcile before rewriting over it.
    self.mbox_check()?;
    let _lock = Lock::acquire(&self.file, true)?;
    let content = self.read_all()?;
    let first = self
      .mailbox
      .emails
      .iter()
      .position(|email| email.changed || email.flags.deleted || email.purge);
    let Some(first) = first else {
      return Ok(());
    };
    let base_offset = self
      .mailbox
      .emails[first]
      .mbox()
      .map(|data| data.offset)
      .context("message without mbox data")?;

    // Phase one: rebuild the tail in memory and spool it to a temp file.
    let mut segment = Vec::new();
    let mut new_data = Vec::new();
    for email in &self.mailbox.emails[first..] {
      if email.flags.deleted || email.purge || !email.active {
        new_data.push(None);
        continue;
      }
      let data = self.write_message(&mut segment, &content, email);
      new_data.push(Some(data));
    }
    let tmp_path = self
      .tmp_dir
      .join(format!(".mstore-sync-{}", uuid::Uuid::new_v4().hyphenated()));
    {
      let mut tmp = fs::File::create(&tmp_path)
        .map_err(|error| anyhow::Error::new(crate::Error::FileError).context(error))
        .with_context(|| format!("couldn't create {tmp_path:?}"))?;
      tmp.write_all(&segment)?;
      tmp.sync_all()?;
    }

    // Phase two: splice the segment over the original tail.
    let commit = (|| -> anyhow::Result<()> {
      self.file.seek(io::SeekFrom::Start(base_offset))?;
      self.file.write_all(&segment)?;
      self.file.set_len(base_offset + segment.len() as u64)?;
      self.file.sync_all()?;
      Ok(())
    })();
    if let Err(error) = commit {
      let recovery = self.recovery_path();
      let kept = fs::rename(&tmp_path, &recovery).is_ok();
      return Err(anyhow::Error::new(crate::Error::FileError).context(error)).with_context(|| {
        if kept {
          format!("mailbox write failed; rebuilt tail kept at {recovery:?}")
        } else {
          "mailbox write failed".to_string()
        }
      });
    }
    let _ = fs::remove_file(&tmp_path);

    // Adopt the new offsets, drop what was deleted.
    for (email, data) in self.mailbox.emails[first..].iter_mut().zip(new_data) {
      match data {
        Some(mut data) => {
          data.offset += base_offset;
          data.header_offset += base_offset;
          data.body_offset += base_offset;
          data.end_offset += base_offset;
          email.private = Private::Mbox(data);
          email.changed = false;
        }
        None => email.active = false,
      }
    }
    for email in &mut self.mailbox.emails[..first] {
      email.changed = false;
    }
    self.mailbox.compress();
    self.mailbox.changed = false;

    // Keep the "new mail since last read" heuristics: atime stays just behind mtime. The stored
    // stamp is re-read afterwards so it matches what utimes actually wrote.
    if let Ok(modified) = self.file.metadata()?.modified() {
      if let Ok(since_epoch) = modified.duration_since(time::UNIX_EPOCH) {
        use nix::sys::time::TimeValLike as _;
        let mtime = nix::sys::time::TimeVal::microseconds(since_epoch.as_micros() as i64);
        let atime = nix::sys::time::TimeVal::microseconds(since_epoch.as_micros() as i64 - 1);
        let _ = nix::sys::stat::utimes(&self.file_path, &atime, &mtime);
      }
    }
    let metadata = self.file.metadata()?;
    self.size = metadata.len();
    self.mailbox.mtime = metadata.modified().ok();
    Ok(())
  }

  fn raw_message(&mut self, index: usize) -> anyhow::Result<Vec<u8>> {
    let data = self
      .mailbox
      .emails
      .get(index)
      .and_then(|email| email.mbox())
      .cloned()
      .with_context(|| format!("no message at index {index}"))?;
    let mut buffer = vec![0; (data.end_offset - data.header_offset) as usize];
    self.file.seek(io::SeekFrom::Start(data.header_offset))?;
    self
      .file
      .read_exact(&mut buffer)
      .map_err(|error| anyhow::Error::new(crate::Error::FileError).context(error))?;
    Ok(buffer)
  }

  fn mbox_append(&mut self, message: &[u8], flags: Flags) -> anyhow::Result<()> {
    anyhow::ensure!(!self.mailbox.readonly, "mailbox is read-only");
    let lock = Lock::acquire(&self.file, true)?;
    let end = self.file.seek(io::SeekFrom::End(0))?;
    let mut out = Vec::new();
    append_framing(&mut out, message, flags, self.kind, !ends_with_newline(&mut self.file, end)?)?;
    self.file.seek(io::SeekFrom::End(0))?;
    self.file.write_all(&out)?;
    self.file.sync_all()?;
    drop(lock);
    // Pick the new message up through the ordinary append fast path.
    self.mbox_check()?;
    Ok(())
  }
}

// Whether the last byte of the file is a newline; an empty file counts as properly terminated.
fn ends_with_newline(file: &mut fs::File, end: u64) -> anyhow::Result<bool> {
  if end == 0 {
    return Ok(true);
  }
  let mut last = [0; 1];
  file.seek(io::SeekFrom::Start(end - 1))?;
  file.read_exact(&mut last)?;
  Ok(last[0] == b'\n')
}

fn from_line(envelope: &crate::email::Envelope, received: i64) -> String {
  let sender = envelope
    .return_path
    .as_deref()
    .unwrap_or("MAILER-DAEMON")
    .to_string();
  let date = chrono::DateTime::from_timestamp(received, 0)
    .unwrap_or_else(chrono::Utc::now)
    .format("%a %b %e %H:%M:%S %Y");
  format!("From {sender} {date}")
}

// Frames one message for appending to an mbox/MMDF file, Status headers included.
pub(crate) fn append_framing(
  out: &mut Vec<u8>,
  message: &[u8],
  flags: Flags,
  kind: Kind,
  separate: bool,
) -> anyhow::Result<()> {
  let split = crate::email::body_offset(message);
  let (header, body) = message.split_at(split.min(message.len()));
  match kind {
    Kind::Mmdf => out.extend_from_slice(MMDF_SEPARATOR),
    _ => {
      if separate {
        // The separator must start on a fresh line.
        out.push(b'\n');
      }
      let envelope = crate::email::parse_header(
        header,
        &regex::Regex::new(crate::email::DEFAULT_REPLY_REGEX).unwrap(),
      );
      let received = envelope.date.unwrap_or_else(|| chrono::Utc::now().timestamp());
      out.extend_from_slice(from_line(&envelope, received).as_bytes());
      out.push(b'\n');
    }
  }
  let mut body_separator = &b"\n"[..];
  for line in header.split_inclusive(|byte| *byte == b'\n') {
    let bare = line.strip_suffix(b"\n").unwrap_or(line);
    let bare = bare.strip_suffix(b"\r").unwrap_or(bare);
    if bare.is_empty() {
      body_separator = line;
      continue;
    }
    if is_status_line(bare) {
      continue;
    }
    out.extend_from_slice(line);
  }
  if !header.ends_with(b"\n") {
    out.push(b'\n');
  }
  out.extend_from_slice(&status_headers(&flags));
  out.extend_from_slice(body_separator);
  match kind {
    Kind::Mmdf => {
      out.extend_from_slice(body);
      if !body.ends_with(b"\n") {
        out.push(b'\n');
      }
      out.extend_from_slice(MMDF_SEPARATOR);
    }
    _ => {
      for line in body.split_inclusive(|byte| *byte == b'\n') {
        if line.starts_with(b"From ") {
          out.push(b'>');
        }
        out.extend_from_slice(line);
      }
      if !body.ends_with(b"\n") {
        out.push(b'\n');
      }
    }
  }
  Ok(())
}

impl MailStore for MboxMailbox {
  fn kind(&self) -> Kind {
    self.kind
  }

  fn mailbox(&self) -> &Mailbox {
    &self.mailbox
  }

  fn mailbox_mut(&mut self) -> &mut Mailbox {
    &mut self.mailbox
  }

  fn check(&mut self) -> anyhow::Result<Check> {
    self.mbox_check()
  }

  fn sync(&mut self) -> anyhow::Result<()> {
    self.mbox_sync()
  }

  fn message(&mut self, index: usize) -> anyhow::Result<Vec<u8>> {
    self.raw_message(index)
  }

  fn append(&mut self, message: &[u8], flags: Flags) -> anyhow::Result<()> {
    self.mbox_append(message, flags)
  }

  fn copy_messages(&mut self, indices: &[usize], destination: &str) -> anyhow::Result<()> {
    // Local copies go through plain file appends on the destination path.
    let kind = match crate::store::probe(destination) {
      Ok(kind @ (Kind::Mbox | Kind::Mmdf)) => kind,
      Ok(_) => anyhow::bail!("can't copy from a local mailbox to a remote one directly"),
      // A missing destination becomes a sibling of the source.
      Err(_) => self.kind,
    };
    let mut destination_file = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(destination)
      .map_err(|error| anyhow::Error::new(crate::Error::FileError).context(error))
      .with_context(|| format!("couldn't open {destination}"))?;
    let _lock = Lock::acquire(&destination_file, true)?;
    let end = destination_file.metadata()?.len();
    let mut separate = !ends_with_newline(&mut destination_file, end)?;
    destination_file.seek(io::SeekFrom::End(0))?;
    for &index in indices {
      let flags = self
        .mailbox
        .flags_of(index)
        .with_context(|| format!("no message at index {index}"))?;
      let message = self.raw_message(index)?;
      let mut out = Vec::new();
      append_framing(&mut out, &message, flags, kind, separate)?;
      destination_file.write_all(&out)?;
      separate = false; // Every framed message ends with a newline.
    }
    destination_file.sync_all()?;
    Ok(())
  }

  fn close(self: Box<Self>) -> anyhow::Result<()> {
    // Nothing buffered; the lock (if any) died with its guard long ago.
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mailbox::FlagBit;
  use pretty_assertions::assert_eq;
  use std::io::Write as _;

  fn config() -> Config {
    Config {
      tmp_dir: std::env::temp_dir(),
      ..Config::default()
    }
  }

  fn write_file(path: &path::Path, content: &[u8]) {
    let mut file = fs::File::create(path).unwrap();
    file.write_all(content).unwrap();
    file.sync_all().unwrap();
  }

  const TWO_MESSAGES: &[u8] = b"From alice Thu Jan  1 00:00:00 1970\n\
      From: alice@example.com\n\
      Subject: first\n\
      Message-ID: <1@x>\n\
      \n\
      body one\n\
      \n\
      From bob Thu Jan  1 00:00:01 1970\n\
      From: bob@example.com\n\
      Subject: second\n\
      Message-ID: <2@x>\n\
      \n\
      body two\n";

  #[test]
  fn mbox_parses_messages() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(&path, TWO_MESSAGES);
    let mbox = MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    assert_eq!(2, mbox.mailbox.msg_count());
    assert_eq!(
      Some("first".to_string()),
      mbox.mailbox.emails[0].envelope.subject
    );
    assert_eq!(
      Some("second".to_string()),
      mbox.mailbox.emails[1].envelope.subject
    );
    let data = mbox.mailbox.emails[0].mbox().unwrap();
    assert_eq!(0, data.offset);
    assert!(data.body_offset > data.header_offset);
  }

  #[test]
  fn mmdf_parses_messages() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mmdf");
    write_file(&path, b"\x01\x01\x01\x01\nFrom: a\n\nbody\n\x01\x01\x01\x01\n");
    let mbox = MboxMailbox::open(path.to_str().unwrap(), Kind::Mmdf, &config(), false).unwrap();
    assert_eq!(1, mbox.mailbox.msg_count());
    assert_eq!(Some("a".to_string()), mbox.mailbox.emails[0].envelope.from);
    let data = mbox.mailbox.emails[0].mbox().unwrap();
    // "body\n" is five bytes.
    assert_eq!(5, data.end_offset - data.body_offset);
  }

  #[test]
  fn append_fast_path_leaves_offsets_alone() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(&path, TWO_MESSAGES);
    let mut mbox =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    let offsets: Vec<u64> = mbox
      .mailbox
      .emails
      .iter()
      .map(|email| email.mbox().unwrap().offset)
      .collect();

    // An external writer appends one message at the old end of file.
    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file
      .write_all(
        b"From carol Thu Jan  1 00:00:02 1970\n\
          From: carol@example.com\n\
          Subject: third\n\
          \n\
          body three\n",
      )
      .unwrap();
    file.sync_all().unwrap();
    drop(file);

    assert_eq!(Check::NewMail, mbox.mbox_check().unwrap());
    assert_eq!(3, mbox.mailbox.msg_count());
    assert_eq!(
      Some("third".to_string()),
      mbox.mailbox.emails[2].envelope.subject
    );
    let unchanged: Vec<u64> = mbox.mailbox.emails[..2]
      .iter()
      .map(|email| email.mbox().unwrap().offset)
      .collect();
    assert_eq!(offsets, unchanged);
  }

  #[test]
  fn unchanged_sync_is_a_no_op() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(&path, TWO_MESSAGES);
    let before_mtime = fs::metadata(&path).unwrap().modified().unwrap();
    let mut mbox =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    mbox.mbox_sync().unwrap();
    assert_eq!(TWO_MESSAGES.to_vec(), fs::read(&path).unwrap());
    assert_eq!(before_mtime, fs::metadata(&path).unwrap().modified().unwrap());
  }

  #[test]
  fn sync_rewrites_flags_and_deletions() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(&path, TWO_MESSAGES);
    let mut mbox =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    mbox.mailbox.set_flag(0, FlagBit::Read, true);
    mbox.mailbox.set_flag(1, FlagBit::Deleted, true);
    mbox.mbox_sync().unwrap();

    assert_eq!(1, mbox.mailbox.msg_count());
    assert!(!mbox.mailbox.changed);
    let rewritten = fs::read(&path).unwrap();
    let text = String::from_utf8_lossy(&rewritten);
    assert!(text.contains("Status: R\n"), "{text}");
    assert!(!text.contains("second"), "{text}");

    // The file reopens to the same single read message.
    let reopened =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    assert_eq!(1, reopened.mailbox.msg_count());
    assert!(reopened.mailbox.emails[0].flags.read);
    assert_eq!(
      Some("first".to_string()),
      reopened.mailbox.emails[0].envelope.subject
    );
  }

  #[test]
  fn sync_again_is_idempotent() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(&path, TWO_MESSAGES);
    let mut mbox =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    mbox.mailbox.set_flag(0, FlagBit::Flagged, true);
    mbox.mbox_sync().unwrap();
    let after_first = fs::read(&path).unwrap();
    mbox.mbox_sync().unwrap();
    assert_eq!(after_first, fs::read(&path).unwrap());
  }

  #[test]
  fn external_rewrite_reconciles_unsaved_flags() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(&path, TWO_MESSAGES);
    let mut mbox =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    mbox.mailbox.set_flag(1, FlagBit::Flagged, true);

    // Another client rewrites the whole file (same messages, reordered).
    let mut reordered = Vec::new();
    let at = memchr::memmem::find(TWO_MESSAGES, b"\nFrom bob").unwrap() + 1;
    reordered.extend_from_slice(&TWO_MESSAGES[at..]);
    reordered.extend_from_slice(b"\n");
    reordered.extend_from_slice(&TWO_MESSAGES[..at]);
    write_file(&path, &reordered);

    assert_eq!(Check::Reopened, mbox.mbox_check().unwrap());
    assert_eq!(2, mbox.mailbox.msg_count());
    // The unsaved flag followed the message to its new position.
    let flagged = mbox
      .mailbox
      .emails
      .iter()
      .find(|email| email.envelope.subject.as_deref() == Some("second"))
      .unwrap();
    assert!(flagged.flags.flagged);
    assert!(flagged.changed);
  }

  #[test]
  fn from_lines_in_bodies_are_quoted_on_rewrite() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(
      &path,
      b"From a Thu Jan  1 00:00:00 1970\n\
        Subject: q\n\
        Content-Length: 21\n\
        \n\
        >From the start\nhello\n",
    );
    let mut mbox =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    assert_eq!(1, mbox.mailbox.msg_count());
    mbox.mailbox.set_flag(0, FlagBit::Read, true);
    mbox.mbox_sync().unwrap();
    let rewritten = fs::read(&path).unwrap();
    // The pre-quoted line stays as it was.
    assert!(
      String::from_utf8_lossy(&rewritten).contains(">From the start\n"),
      "{}",
      String::from_utf8_lossy(&rewritten)
    );
  }

  #[test]
  fn appends_frame_messages() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(&path, TWO_MESSAGES);
    let mut mbox =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap();
    mbox
      .mbox_append(
        b"From: dave@example.com\nSubject: via append\n\nFrom here it looks fine\n",
        Flags {
          read: true,
          ..Flags::default()
        },
      )
      .unwrap();
    assert_eq!(3, mbox.mailbox.msg_count());
    let added = &mbox.mailbox.emails[2];
    assert_eq!(Some("via append".to_string()), added.envelope.subject);
    assert!(added.flags.read);
    // The "From " line inside the body was quoted on disk.
    let content = fs::read(&path).unwrap();
    assert!(String::from_utf8_lossy(&content).contains("\n>From here"));
  }

  #[test]
  fn content_length_hints_are_verified() {
    // A wrong hint is ignored, the separator scan wins.
    let content = b"From a Thu Jan  1 00:00:00 1970\n\
        Subject: one\n\
        Content-Length: 9999\n\
        \n\
        short\n\
        From b Thu Jan  1 00:00:01 1970\n\
        Subject: two\n\
        \n\
        other\n";
    let messages = scan(content, 0, Kind::Mbox).unwrap();
    assert_eq!(2, messages.len());
  }

  #[test]
  fn corrupt_files_are_rejected() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("mbox");
    write_file(&path, b"this is not an mbox\n");
    let error =
      MboxMailbox::open(path.to_str().unwrap(), Kind::Mbox, &config(), false).unwrap_err();
    assert_eq!(
      Some(&crate::Error::MailboxCorrupt),
      error.downcast_ref::<crate::Error>()
    );
  }
}
