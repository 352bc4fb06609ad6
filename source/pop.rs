// https://www.rfc-editor.org/rfc/rfc1939 - POP3
// https://www.rfc-editor.org/rfc/rfc2449 - CAPA
// https://www.rfc-editor.org/rfc/rfc2595 - STLS / AUTH PLAIN
//
// The smallest sibling backend: one short-lived transaction per session, client-side flags only,
// deletions queued locally and flushed by QUIT.

use crate::{
  codec,
  connection::{ReadWrite, Stream, Transport},
  email::{Email, Flags, Private},
  hcache,
  mailbox::{Check, Kind, Mailbox},
  store::{MailStore, Path, Url},
  Config,
};
use anyhow::Context as _;
use std::collections::HashSet;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmailData {
  // 1-based message number, stable for the duration of the session.
  pub number: u32,
  // UIDL identity, stable across sessions.
  pub uid: String,
  pub size: u64,
}

// https://www.rfc-editor.org/rfc/rfc1939#section-3
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
  Authorization,
  Transaction,
  Update,
}

pub struct PopMailbox<RW> {
  stream: Stream<RW>,
  mailbox: Mailbox,
  capabilities: HashSet<String>,
  // The APOP challenge from the banner, when the server offered one.
  timestamp: Option<String>,
  state: State,
  bcache: Option<hcache::Store>,
}

// "+OK rest" or "-ERR rest".
fn split_status(line: &[u8]) -> anyhow::Result<(bool, String)> {
  let line = line.strip_suffix(b"\r\n").or_else(|| line.strip_suffix(b"\n")).unwrap_or(line);
  if let Some(rest) = line.strip_prefix(b"+OK") {
    return Ok((true, String::from_utf8_lossy(rest).trim().to_string()));
  }
  if let Some(rest) = line.strip_prefix(b"-ERR") {
    return Ok((false, String::from_utf8_lossy(rest).trim().to_string()));
  }
  Err(anyhow::Error::new(crate::Error::ProtocolError)).with_context(|| codec::summarize(line))
}

// A timestamp is only usable for APOP when it looks like a msg-id.
fn apop_timestamp(banner: &str) -> Option<String> {
  let start = banner.find('<')?;
  let end = banner[start..].find('>')? + start;
  let candidate = &banner[start..=end];
  candidate.contains('@').then(|| candidate.to_string())
}

fn command<RW>(stream: &mut Stream<RW>, parts: &[&[u8]], log: usize) -> anyhow::Result<String>
where
  RW: ReadWrite,
{
  stream.send(&[parts, &[&b"\r\n"[..]]].concat(), log)?;
  let line = stream.readln()?;
  match split_status(&line)? {
    (true, rest) => Ok(rest),
    (false, rest) => Err(anyhow::Error::new(crate::Error::ServerNo).context(rest)),
  }
}

// A successful command followed by a dot-terminated body, unstuffed.
fn command_multiline<RW>(
  stream: &mut Stream<RW>,
  parts: &[&[u8]],
  log: usize,
) -> anyhow::Result<Vec<u8>>
where
  RW: ReadWrite,
{
  command(stream, parts, log)?;
  let mut payload = Vec::new();
  loop {
    let line = stream.readln()?;
    if line == b".\r\n" || line == b".\n" {
      break;
    }
    // https://www.rfc-editor.org/rfc/rfc1939#section-3
    // Lines starting with the termination octet are byte-stuffed.
    match line.strip_prefix(b".") {
      Some(rest) => payload.extend_from_slice(rest),
      None => payload.extend_from_slice(&line),
    }
  }
  Ok(payload)
}

fn capa<RW>(stream: &mut Stream<RW>) -> anyhow::Result<HashSet<String>>
where
  RW: ReadWrite,
{
  let mut capabilities = HashSet::new();
  match command_multiline(stream, &[b"CAPA"], 1) {
    Ok(payload) => {
      for line in payload.split(|byte| *byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
          continue;
        }
        let name = line.split(|byte| *byte == b' ').next().unwrap_or(line);
        capabilities.insert(String::from_utf8_lossy(name).to_ascii_uppercase());
        if line.to_ascii_uppercase().starts_with(b"SASL") {
          for mechanism in String::from_utf8_lossy(line).split_whitespace().skip(1) {
            capabilities.insert(format!("SASL={}", mechanism.to_ascii_uppercase()));
          }
        }
      }
    }
    // Pre-CAPA servers answer -ERR; that's fine, commands get probed instead.
    Err(error) if error.downcast_ref() == Some(&crate::Error::ServerNo) => (),
    Err(error) => return Err(error),
  }
  Ok(capabilities)
}

// The Authorization-state prelude: banner and capabilities, before any TLS upgrade.
pub struct Greeting<RW> {
  stream: Stream<RW>,
  capabilities: HashSet<String>,
  timestamp: Option<String>,
}

pub fn greet<RW>(mut stream: Stream<RW>) -> anyhow::Result<Greeting<RW>>
where
  RW: ReadWrite,
{
  let banner = stream.readln()?;
  let (ok, rest) = split_status(&banner)?;
  anyhow::ensure!(ok, "server refused the connection: {rest}");
  let timestamp = apop_timestamp(&rest);
  let capabilities = capa(&mut stream)?;
  Ok(Greeting {
    stream,
    capabilities,
    timestamp,
  })
}

impl Greeting<Transport> {
  // https://www.rfc-editor.org/rfc/rfc2595#section-4
  pub fn upgrade_tls(mut self, host: &str) -> anyhow::Result<Greeting<Transport>> {
    command(&mut self.stream, &[b"STLS"], 1)?;
    let mut stream = self.stream.try_map(|transport| transport.upgraded(host))?;
    // The timestamp from the plaintext banner is void after the upgrade.
    let capabilities = capa(&mut stream)?;
    Ok(Greeting {
      stream,
      capabilities,
      timestamp: None,
    })
  }
}

impl<RW> std::fmt::Debug for PopMailbox<RW> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PopMailbox").finish_non_exhaustive()
  }
}

impl<RW> PopMailbox<RW>
where
  RW: ReadWrite,
{
  fn command(&mut self, parts: &[&[u8]], log: usize) -> anyhow::Result<String> {
    command(&mut self.stream, parts, log)
  }

  fn command_multiline(&mut self, parts: &[&[u8]], log: usize) -> anyhow::Result<Vec<u8>> {
    command_multiline(&mut self.stream, parts, log)
  }

  fn authenticate(&mut self, url: &Url, config: &Config, secure: bool) -> anyhow::Result<()> {
    let credentials = crate::credentials(url, config)?;
    let methods: Vec<&str> = if config.pop_authenticators.is_empty() {
      vec!["apop", "plain", "user"]
    } else {
      config
        .pop_authenticators
        .iter()
        .map(String::as_str)
        .collect()
    };
    let cleartext_allowed = secure || !config.ssl_force_tls;
    for method in methods {
      let outcome = match method.to_ascii_lowercase().as_str() {
        "apop" => self.auth_apop(&credentials),
        "plain" | "sasl" => self.auth_plain(&credentials, cleartext_allowed),
        "user" => self.auth_user(&credentials, cleartext_allowed),
        "oauthbearer" | "xoauth2" => {
          self.auth_oauth(&credentials, config.pop_oauth_refresh_command.as_deref())
        }
        other => {
          log::warn!("unknown POP authentication method {other:?}");
          continue;
        }
      };
      match outcome {
        Ok(true) => {
          self.state = State::Transaction;
          return Ok(());
        }
        Ok(false) => continue, // Unavailable here; try the next one.
        Err(error) if error.downcast_ref() == Some(&crate::Error::ServerNo) => {
          if config.pop_auth_try_all {
            continue;
          }
          return Err(anyhow::Error::new(crate::Error::AuthFailed).context(error));
        }
        Err(error) => return Err(error),
      }
    }
    Err(anyhow::Error::new(crate::Error::AuthFailed)).context("no authenticator succeeded")
  }

  // https://www.rfc-editor.org/rfc/rfc1939#section-7
  // APOP: MD5 of "<timestamp>password".
  fn auth_apop(&mut self, credentials: &crate::imap::auth::Credentials) -> anyhow::Result<bool> {
    let Some(timestamp) = self.timestamp.clone() else {
      return Ok(false);
    };
    let digest = md5::compute(format!("{timestamp}{}", credentials.password));
    self.command(
      &[
        b"APOP ",
        credentials.user.as_bytes(),
        b" ",
        codec::hex(&digest.0).as_bytes(),
      ],
      2,
    )?;
    Ok(true)
  }

  fn auth_plain(
    &mut self,
    credentials: &crate::imap::auth::Credentials,
    cleartext_allowed: bool,
  ) -> anyhow::Result<bool> {
    if !self.capabilities.contains("SASL=PLAIN") {
      return Ok(false);
    }
    if !cleartext_allowed {
      log::warn!("refusing AUTH PLAIN over an unencrypted connection");
      return Ok(false);
    }
    self.command(&[b"AUTH PLAIN"], 1)?;
    let reply = crate::imap::auth::plain(&credentials.user, &credentials.password);
    self.stream.send(&[reply.as_bytes(), b"\r\n"], 0)?;
    let line = self.stream.readln()?;
    match split_status(&line)? {
      (true, _) => Ok(true),
      (false, rest) => Err(anyhow::Error::new(crate::Error::ServerNo).context(rest)),
    }
  }

  fn auth_user(
    &mut self,
    credentials: &crate::imap::auth::Credentials,
    cleartext_allowed: bool,
  ) -> anyhow::Result<bool> {
    if !cleartext_allowed {
      log::warn!("refusing USER/PASS over an unencrypted connection");
      return Ok(false);
    }
    self.command(&[b"USER ", credentials.user.as_bytes()], 2)?;
    self.command(&[b"PASS ", credentials.password.as_bytes()], 1)?;
    Ok(true)
  }

  fn auth_oauth(
    &mut self,
    credentials: &crate::imap::auth::Credentials,
    refresh_command: Option<&str>,
  ) -> anyhow::Result<bool> {
    let Some(command) = refresh_command else {
      return Ok(false);
    };
    let token = crate::imap::auth::refresh_token(command)?;
    self.command(&[b"AUTH XOAUTH2"], 1)?;
    let reply = crate::imap::auth::xoauth2(&credentials.user, &token);
    self.stream.send(&[reply.as_bytes(), b"\r\n"], 0)?;
    let line = self.stream.readln()?;
    match split_status(&line)? {
      (true, _) => Ok(true),
      (false, rest) => Err(anyhow::Error::new(crate::Error::ServerNo).context(rest)),
    }
  }

  // LIST + UIDL to enumerate, then TOP 0 per message for the headers.
  fn load_messages(&mut self, config: &Config) -> anyhow::Result<()> {
    let stat = self.command(&[b"STAT"], 1)?;
    let count: u32 = stat
      .split_whitespace()
      .next()
      .and_then(|count| count.parse().ok())
      .with_context(|| format!("unusable STAT reply {stat:?}"))?;
    let mut sizes = std::collections::HashMap::new();
    for line in String::from_utf8_lossy(&self.command_multiline(&[b"LIST"], 1)?)
      .lines()
      .filter(|line| !line.is_empty())
    {
      let mut fields = line.split_whitespace();
      if let (Some(number), Some(size)) = (fields.next(), fields.next()) {
        if let (Ok(number), Ok(size)) = (number.parse::<u32>(), size.parse::<u64>()) {
          sizes.insert(number, size);
        }
      }
    }
    let mut uids = std::collections::HashMap::new();
    if let Ok(payload) = self.command_multiline(&[b"UIDL"], 1) {
      for line in String::from_utf8_lossy(&payload).lines().filter(|line| !line.is_empty()) {
        let mut fields = line.split_whitespace();
        if let (Some(number), Some(uid)) = (fields.next(), fields.next()) {
          if let Ok(number) = number.parse::<u32>() {
            uids.insert(number, uid.to_string());
          }
        }
      }
    }
    let reply_regex = regex::Regex::new(&config.reply_regex)
      .with_context(|| format!("invalid reply pattern {:?}", config.reply_regex))?;
    for number in 1..=count {
      if crate::aborted() {
        return Err(anyhow::Error::new(crate::Error::Aborted));
      }
      let header = self.command_multiline(&[b"TOP ", number.to_string().as_bytes(), b" 0"], 2)?;
      let envelope = crate::email::parse_header(&header, &reply_regex);
      let received = envelope.date.unwrap_or(0);
      let mut email = Email::new(envelope, received);
      email.private = Private::Pop(EmailData {
        number,
        uid: uids.get(&number).cloned().unwrap_or_default(),
        size: sizes.get(&number).copied().unwrap_or(0),
      });
      self.mailbox.push(email);
    }
    self.mailbox.rebuild();
    Ok(())
  }

  fn quit(&mut self) -> anyhow::Result<()> {
    if self.state == State::Update {
      return Ok(());
    }
    self.command(&[b"QUIT"], 1)?;
    self.state = State::Update;
    Ok(())
  }
}

impl PopMailbox<Transport> {
  pub fn open(
    stream: Stream<Transport>,
    url: Url,
    config: &Config,
  ) -> anyhow::Result<PopMailbox<Transport>> {
    let mut greeting = greet(stream)?;
    let mut secure = url.scheme.tls();
    if !secure && greeting.capabilities.contains("STLS") {
      greeting = greeting.upgrade_tls(&url.host)?;
      secure = true;
    }
    anyhow::ensure!(
      secure || !config.ssl_force_tls,
      "refusing an unencrypted connection to {}",
      url.host
    );
    PopMailbox::from_greeting(greeting, &url, config, secure)
  }
}

impl<RW> PopMailbox<RW>
where
  RW: ReadWrite,
{
  // Authentication and the initial message list, shared with the scripted tests.
  pub fn from_greeting(
    greeting: Greeting<RW>,
    url: &Url,
    config: &Config,
    secure: bool,
  ) -> anyhow::Result<PopMailbox<RW>> {
    let mut mailbox = Mailbox::new(Kind::Pop, Path::new(&url.canonical()));
    mailbox.readonly = false;
    let bcache = match &config.body_cache {
      Some(root) => Some(hcache::Store::open(root, mailbox.path.canon())?),
      None => None,
    };
    let mut this = PopMailbox {
      stream: greeting.stream,
      mailbox,
      capabilities: greeting.capabilities,
      timestamp: greeting.timestamp,
      state: State::Authorization,
      bcache,
    };
    this.authenticate(url, config, secure)?;
    this.load_messages(config)?;
    Ok(this)
  }
}

impl<RW> MailStore for PopMailbox<RW>
where
  RW: ReadWrite,
{
  fn kind(&self) -> Kind {
    Kind::Pop
  }

  fn mailbox(&self) -> &Mailbox {
    &self.mailbox
  }

  fn mailbox_mut(&mut self) -> &mut Mailbox {
    &mut self.mailbox
  }

  fn check(&mut self) -> anyhow::Result<Check> {
    // The maildrop is locked for the whole session; nothing changes under us.
    if self.state == State::Transaction {
      self.command(&[b"NOOP"], 1)?;
    }
    Ok(Check::Ok)
  }

  // Deletions flush as DELE + QUIT; the Update state is where the server actually drops them.
  fn sync(&mut self) -> anyhow::Result<()> {
    anyhow::ensure!(self.state == State::Transaction, "session is already closed");
    let deleted: Vec<u32> = self
      .mailbox
      .emails
      .iter()
      .filter(|email| email.active && email.flags.deleted)
      .filter_map(|email| email.pop().map(|data| data.number))
      .collect();
    if deleted.is_empty() {
      // Other flags are client-side only; nothing to push.
      self.mailbox.changed = false;
      for email in &mut self.mailbox.emails {
        email.changed = false;
      }
      return Ok(());
    }
    for number in &deleted {
      self.command(&[b"DELE ", number.to_string().as_bytes()], 2)?;
    }
    self.quit()?;
    for email in &mut self.mailbox.emails {
      if email.flags.deleted {
        email.active = false;
        if let (Some(bcache), Some(data)) = (&self.bcache, email.pop()) {
          let _ = bcache.delete(&data.uid);
        }
      }
      email.changed = false;
    }
    self.mailbox.compress();
    self.mailbox.changed = false;
    Ok(())
  }

  fn message(&mut self, index: usize) -> anyhow::Result<Vec<u8>> {
    let data = self
      .mailbox
      .emails
      .get(index)
      .and_then(|email| email.pop())
      .cloned()
      .with_context(|| format!("no message at index {index}"))?;
    if !data.uid.is_empty() {
      if let Some(bcache) = &self.bcache {
        if let Some(bytes) = bcache.get(&data.uid) {
          log::debug!("body cache hit for {}", data.uid);
          return Ok(bytes);
        }
      }
    }
    anyhow::ensure!(self.state == State::Transaction, "session is already closed");
    let payload = self.command_multiline(&[b"RETR ", data.number.to_string().as_bytes()], 2)?;
    if !data.uid.is_empty() {
      if let Some(bcache) = &self.bcache {
        let _ = bcache.put(&data.uid, &payload);
      }
    }
    Ok(payload)
  }

  fn append(&mut self, _message: &[u8], _flags: Flags) -> anyhow::Result<()> {
    anyhow::bail!("POP3 mailboxes can't receive uploads")
  }

  fn copy_messages(&mut self, _indices: &[usize], _destination: &str) -> anyhow::Result<()> {
    anyhow::bail!("POP3 has no server-side copy; fetch and append instead")
  }

  fn close(mut self: Box<Self>) -> anyhow::Result<()> {
    self.quit()
  }
}
