// https://www.rfc-editor.org/rfc/rfc3501#section-6.2 - LOGIN / AUTHENTICATE
// https://www.rfc-editor.org/rfc/rfc2195 - CRAM-MD5
// https://www.rfc-editor.org/rfc/rfc2595#section-6 - PLAIN
// https://www.rfc-editor.org/rfc/rfc4505 - ANONYMOUS
// https://www.rfc-editor.org/rfc/rfc7628 - OAUTHBEARER / (and the older XOAUTH2 shape)

use super::protocol::{CommandQueue, CommandStatus, Completion, Event, Part};
use super::quote_string;
use crate::{codec, connection::ReadWrite};
use anyhow::Context as _;
use base64::Engine as _;
use std::{collections, process, str};
use zeroize::Zeroize as _;

#[derive(Clone, Debug)]
pub struct Credentials {
  pub user: String,
  pub password: String,
}

impl Drop for Credentials {
  fn drop(&mut self) {
    self.user.zeroize();
    self.password.zeroize();
  }
}

pub type Capabilities = collections::HashSet<String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
  Login,
  Plain,
  CramMd5,
  OAuthBearer,
  XOAuth2,
  Anonymous,
  // No corpus crate links a GSSAPI/Kerberos engine; the name is accepted so a configured list
  // degrades to the next method instead of erroring out.
  Gssapi,
}

impl Method {
  pub fn parse(name: &str) -> Option<Method> {
    match name.to_ascii_lowercase().as_str() {
      "login" => Some(Method::Login),
      "plain" => Some(Method::Plain),
      "cram-md5" => Some(Method::CramMd5),
      "oauthbearer" => Some(Method::OAuthBearer),
      "xoauth2" => Some(Method::XOAuth2),
      "anonymous" => Some(Method::Anonymous),
      "gssapi" => Some(Method::Gssapi),
      _ => None,
    }
  }

  // Tried in this order when the user didn't configure a list. ANONYMOUS and GSSAPI only run
  // when asked for by name.
  const DEFAULT_ORDER: [Method; 5] = [
    Method::CramMd5,
    Method::OAuthBearer,
    Method::XOAuth2,
    Method::Plain,
    Method::Login,
  ];

  fn advertised(&self, capabilities: &Capabilities) -> bool {
    match self {
      // https://www.rfc-editor.org/rfc/rfc3501#section-7.2.1
      // LOGINDISABLED withdraws the plaintext LOGIN command.
      Method::Login => !capabilities.contains("LOGINDISABLED"),
      Method::Plain => capabilities.contains("AUTH=PLAIN"),
      Method::CramMd5 => capabilities.contains("AUTH=CRAM-MD5"),
      Method::OAuthBearer => capabilities.contains("AUTH=OAUTHBEARER"),
      Method::XOAuth2 => capabilities.contains("AUTH=XOAUTH2"),
      Method::Anonymous => capabilities.contains("AUTH=ANONYMOUS"),
      Method::Gssapi => false,
    }
  }

  fn plaintext(&self) -> bool {
    matches!(self, Method::Login | Method::Plain)
  }
}

#[derive(Debug, PartialEq)]
pub enum Outcome {
  Success,
  Failure,
  Unavailable,
}

pub struct Authentication<'a> {
  pub credentials: &'a Credentials,
  pub host: &'a str,
  pub port: u16,
  // Whether the transport already encrypts; plaintext methods refuse to run otherwise unless
  // `allow_cleartext`.
  pub secure: bool,
  pub allow_cleartext: bool,
  pub oauth_refresh_command: Option<&'a str>,
}

// https://www.rfc-editor.org/rfc/rfc2595#section-6
// Non-US-ASCII characters are permitted as long as they are represented in UTF-8.
pub fn plain(user: &str, password: &str) -> String {
  codec::standard_engine().encode(format!("\0{user}\0{password}"))
}

// The reply to a CRAM-MD5 challenge: base64 of "user hex(hmac-md5(password, challenge))".
pub fn cram_md5(user: &str, password: &str, challenge: &[u8]) -> String {
  let digest = codec::hmac_md5(password.as_bytes(), challenge);
  codec::standard_engine().encode(format!("{user} {}", codec::hex(&digest)))
}

// https://www.rfc-editor.org/rfc/rfc7628#section-3.1
pub fn oauth_bearer(user: &str, host: &str, port: u16, token: &str) -> String {
  codec::standard_engine().encode(format!(
    "n,a={user},\x01host={host}\x01port={port}\x01auth=Bearer {token}\x01\x01"
  ))
}

pub fn xoauth2(user: &str, token: &str) -> String {
  codec::standard_engine().encode(format!("user={user}\x01auth=Bearer {token}\x01\x01"))
}

// Runs the configured refresh command and takes the first line of its output as the token.
pub fn refresh_token(command: &str) -> anyhow::Result<String> {
  log::info!("refreshing OAuth token");
  let output = process::Command::new("/bin/sh")
    .arg("-c")
    .arg(command)
    .output()
    .with_context(|| format!("couldn't run {command:?}"))?;
  anyhow::ensure!(output.status.success(), "{command:?} failed");
  let mut stdout = output.stdout;
  let token = str::from_utf8(
    stdout
      .split(|byte| *byte == b'\n')
      .next()
      .with_context(|| format!("{command:?} didn't output anything"))?,
  )
  .with_context(|| format!("{command:?} didn't output UTF-8"))?
  .trim()
  .to_string();
  stdout.zeroize();
  anyhow::ensure!(!token.is_empty(), "{command:?} produced an empty token");
  Ok(token)
}

// Drives one AUTHENTICATE exchange: each "+" challenge goes through `respond`, which returns the
// encoded reply (or None to abort with "*").
fn challenge_loop<RW>(
  queue: &mut CommandQueue<RW>,
  mechanism: &str,
  events: &mut Vec<Event>,
  mut respond: impl FnMut(&[u8]) -> anyhow::Result<Option<Vec<u8>>>,
) -> anyhow::Result<Completion>
where
  RW: ReadWrite,
{
  let (tag, send_events) = queue.send(&[Part::text(format!("AUTHENTICATE {mechanism}"))])?;
  events.extend(send_events);
  loop {
    match queue.step()? {
      Event::NeedContinuation(challenge) => match respond(&challenge)? {
        Some(reply) => queue.respond(&reply, false)?,
        // https://www.rfc-editor.org/rfc/rfc3501#section-6.2.2
        // The client may cancel with "*".
        None => queue.respond(b"*", true)?,
      },
      Event::Completed {
        tag: completed,
        status,
        code,
        text,
      } if completed == tag => return Ok(Completion { status, code, text }),
      event => events.push(event),
    }
  }
}

fn outcome_of(completion: &Completion) -> Outcome {
  match completion.status {
    CommandStatus::Ok => Outcome::Success,
    CommandStatus::No => Outcome::Failure,
    // A BAD usually means the server doesn't know the mechanism at all.
    CommandStatus::Bad => Outcome::Unavailable,
  }
}

fn run_method<RW>(
  queue: &mut CommandQueue<RW>,
  method: Method,
  auth: &Authentication<'_>,
  events: &mut Vec<Event>,
) -> anyhow::Result<(Outcome, Option<Completion>)>
where
  RW: ReadWrite,
{
  let Authentication {
    credentials,
    host,
    port,
    oauth_refresh_command,
    ..
  } = auth;
  match method {
    Method::Login => {
      let (completion, login_events) = queue.exec(&[
        Part::text(format!("LOGIN {} ", quote_string(&credentials.user))),
        Part::Secret(quote_string(&credentials.password)),
      ])?;
      events.extend(login_events);
      Ok((outcome_of(&completion), Some(completion)))
    }
    Method::Plain => {
      let reply = plain(&credentials.user, &credentials.password);
      let completion = challenge_loop(queue, "PLAIN", events, |_| Ok(Some(reply.clone().into_bytes())))?;
      Ok((outcome_of(&completion), Some(completion)))
    }
    Method::CramMd5 => {
      let engine = codec::standard_engine();
      let completion = challenge_loop(queue, "CRAM-MD5", events, |challenge| {
        let challenge = engine
          .decode(challenge)
          .with_context(|| "CRAM-MD5 challenge isn't base64")?;
        Ok(Some(
          cram_md5(&credentials.user, &credentials.password, &challenge).into_bytes(),
        ))
      })?;
      Ok((outcome_of(&completion), Some(completion)))
    }
    Method::OAuthBearer | Method::XOAuth2 => {
      let Some(command) = oauth_refresh_command else {
        return Ok((Outcome::Unavailable, None));
      };
      let token = refresh_token(command)?;
      let (mechanism, reply) = match method {
        Method::OAuthBearer => (
          "OAUTHBEARER",
          oauth_bearer(&credentials.user, host, *port, &token),
        ),
        _ => ("XOAUTH2", xoauth2(&credentials.user, &token)),
      };
      let mut sent = false;
      let completion = challenge_loop(queue, mechanism, events, |challenge| {
        if !sent {
          sent = true;
          return Ok(Some(reply.clone().into_bytes()));
        }
        // https://www.rfc-editor.org/rfc/rfc7628#section-3.2.3
        // The server answers a failed bearer with a challenge carrying the error; the client
        // must send a %x01 response to read the final NO.
        log::warn!("server rejected the bearer token: {}", codec::escape(challenge));
        Ok(Some(b"\x01".to_vec()))
      })?;
      Ok((outcome_of(&completion), Some(completion)))
    }
    Method::Anonymous => {
      let completion = challenge_loop(queue, "ANONYMOUS", events, |_| {
        Ok(Some(codec::standard_engine().encode("anonymous").into_bytes()))
      })?;
      Ok((outcome_of(&completion), Some(completion)))
    }
    Method::Gssapi => Ok((Outcome::Unavailable, None)),
  }
}

// Tries the configured methods (or the default order) until one succeeds. A hard failure stops
// the cascade unless `try_all`; an unadvertised or inapplicable method just steps over. Returns
// the events seen on the way and the winning completion (whose code may carry fresh
// capabilities).
pub fn authenticate<RW>(
  queue: &mut CommandQueue<RW>,
  capabilities: &Capabilities,
  methods: &[String],
  try_all: bool,
  auth: &Authentication<'_>,
) -> anyhow::Result<(Vec<Event>, Completion)>
where
  RW: ReadWrite,
{
  let methods: Vec<Method> = if methods.is_empty() {
    Method::DEFAULT_ORDER.to_vec()
  } else {
    methods
      .iter()
      .filter_map(|name| match Method::parse(name) {
        Some(method) => Some(method),
        None => {
          log::warn!("unknown authentication method {name:?}");
          None
        }
      })
      .collect()
  };
  anyhow::ensure!(!methods.is_empty(), "no usable authentication method");
  let mut events = Vec::new();
  for method in methods {
    if !method.advertised(capabilities) && method != Method::Login {
      log::debug!("{method:?} is not advertised");
      continue;
    }
    if method.plaintext() && !auth.secure && !auth.allow_cleartext {
      log::warn!("refusing {method:?} over an unencrypted connection");
      continue;
    }
    log::info!("authenticating with {method:?}");
    match run_method(queue, method, auth, &mut events)? {
      (Outcome::Success, Some(completion)) => return Ok((events, completion)),
      (Outcome::Success, None) => unreachable!("success without a completion"),
      (Outcome::Unavailable, _) => continue,
      (Outcome::Failure, _) => {
        if try_all {
          continue;
        }
        return Err(anyhow::Error::new(crate::Error::AuthFailed))
          .with_context(|| format!("{method:?} was rejected"));
      }
    }
  }
  Err(anyhow::Error::new(crate::Error::AuthFailed)).context("no authenticator succeeded")
}
