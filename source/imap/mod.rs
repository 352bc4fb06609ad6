// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc4315 - UIDPLUS
// https://www.rfc-editor.org/rfc/rfc4549 - Synchronization Operations for Disconnected IMAP4 Clients
// https://www.rfc-editor.org/rfc/rfc7162 - CONDSTORE / QRESYNC

pub mod auth;
pub mod bodystructure;
pub mod msg_set;
pub mod parser;
pub mod protocol;

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
use auth::{Authentication, Capabilities};
use parser::Status;
use protocol::{Code, CommandQueue, Event, Part, UntaggedData};
use std::collections::HashMap;

// Per-message IMAP state. `flags_remote` is the last server-observed flag set; sync converges the
// two and writes the local set back into it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmailData {
  pub uid: u32,
  // 1-based; 0 while the mapping for this session is unknown.
  pub msn: u32,
  pub flags_remote: Flags,
  pub modseq: u64,
}

// https://www.rfc-editor.org/rfc/rfc3501#section-3
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
  Authenticated,
  Selected,
  Logout,
}

// https://www.rfc-editor.org/rfc/rfc3501#section-9
// quoted = DQUOTE *QUOTED-CHAR DQUOTE
pub(crate) fn quote_string(value: &str) -> String {
  let mut quoted = String::with_capacity(value.len() + 2);
  quoted.push('"');
  for character in value.chars() {
    if character == '"' || character == '\\' {
      quoted.push('\\');
    }
    quoted.push(character);
  }
  quoted.push('"');
  quoted
}

fn collect_capabilities(into: &mut Capabilities, names: Vec<String>) {
  into.clear();
  for name in names {
    into.insert(name.to_ascii_uppercase());
  }
}

// The connection bring-up stages shared by the real transport and the scripted tests: greeting,
// capability discovery and authentication. TLS upgrade and compression only exist for the real
// transport because they swap the stream type.
pub struct Opening<RW> {
  queue: CommandQueue<RW>,
  capabilities: Capabilities,
  authenticated: bool,
}

impl<RW> Opening<RW>
where
  RW: ReadWrite,
{
  pub fn start(stream: Stream<RW>, pipeline_depth: usize) -> anyhow::Result<Opening<RW>> {
    let mut queue = CommandQueue::new(stream, pipeline_depth);
    let (status, code) = queue.greeting()?;
    let mut opening = Opening {
      queue,
      capabilities: Capabilities::new(),
      authenticated: status == Status::Preauth,
    };
    match (status, code) {
      (Status::Ok | Status::Preauth, Some(Code::Capability(names))) => {
        collect_capabilities(&mut opening.capabilities, names)
      }
      (Status::Ok | Status::Preauth, _) => opening.refresh_capabilities()?,
      (status, _) => {
        return Err(anyhow::Error::new(crate::Error::ProtocolError))
          .with_context(|| format!("unusable greeting {status:?}"))
      }
    }
    Ok(opening)
  }

  fn refresh_capabilities(&mut self) -> anyhow::Result<()> {
    let (completion, events) = self.queue.exec(&[Part::text("CAPABILITY")])?;
    completion.ok()?;
    for event in events {
      if let Event::Untagged(UntaggedData::Capability(names)) = event {
        collect_capabilities(&mut self.capabilities, names);
      }
    }
    Ok(())
  }

  pub fn authenticate(&mut self, url: &Url, config: &Config, secure: bool) -> anyhow::Result<()> {
    if self.authenticated {
      return Ok(());
    }
    let credentials = crate::credentials(url, config)?;
    let authentication = Authentication {
      credentials: &credentials,
      host: &url.host,
      port: url.port(),
      secure,
      allow_cleartext: !config.ssl_force_tls,
      oauth_refresh_command: config.imap_oauth_refresh_command.as_deref(),
    };
    let (events, completion) = auth::authenticate(
      &mut self.queue,
      &self.capabilities,
      &config.imap_authenticators,
      config.imap_auth_try_all,
      &authentication,
    )?;
    self.authenticated = true;
    // https://www.rfc-editor.org/rfc/rfc3501#section-6.2.2
    // Capabilities can change across authentication; the tagged OK may announce them directly.
    let mut fresh = None;
    for event in events {
      if let Event::Untagged(UntaggedData::Capability(names)) = event {
        fresh = Some(names);
      }
    }
    if let Some(Code::Capability(names)) = completion.code {
      fresh = Some(names);
    }
    match fresh {
      Some(names) => collect_capabilities(&mut self.capabilities, names),
      None => self.refresh_capabilities()?,
    }
    self.queue.literal_plus = self.capabilities.contains("LITERAL+");
    Ok(())
  }
}

impl Opening<Transport> {
  // https://www.rfc-editor.org/rfc/rfc3501#section-6.2.1
  // STARTTLS is only valid before authentication; capabilities must be re-read afterwards.
  pub fn upgrade_tls(mut self, host: &str) -> anyhow::Result<Opening<Transport>> {
    anyhow::ensure!(!self.authenticated, "TLS upgrade after authentication");
    let (completion, _) = self.queue.exec(&[Part::text("STARTTLS")])?;
    completion.ok()?;
    self.queue = self
      .queue
      .try_map_stream(|stream| stream.try_map(|transport| transport.upgraded(host)))?;
    self.refresh_capabilities()?;
    Ok(self)
  }

  // https://www.rfc-editor.org/rfc/rfc4978
  pub fn enable_deflate(mut self) -> anyhow::Result<Opening<Transport>> {
    let (completion, _) = self.queue.exec(&[Part::text("COMPRESS DEFLATE")])?;
    match completion.status {
      protocol::CommandStatus::Ok => {
        self.queue = self
          .queue
          .try_map_stream(|stream| Ok(stream.map(Transport::deflated)))?;
      }
      // A NO (e.g. already compressed) leaves the session usable.
      _ => log::warn!("server declined COMPRESS DEFLATE"),
    }
    Ok(self)
  }
}

pub struct ImapMailbox<RW> {
  queue: CommandQueue<RW>,
  mailbox: Mailbox,
  url: Url,
  capabilities: Capabilities,
  state: State,
  uidvalidity: u32,
  uid_next: u32,
  modseq: u64,
  permanent_flags: Vec<String>,
  uid_hash: HashMap<u32, usize>,
  // MSN - 1 to email index; holes are messages this session hasn't mapped yet.
  msn: Vec<Option<usize>>,
  // Messages the server told us about that we have no headers for yet.
  unknown_uids: Vec<u32>,
  exists: u32,
  reopen_needed: bool,
  // Set when the server changed UIDVALIDITY under a selected session; the reopen then drops
  // every UID-keyed cache instead of carrying local edits over.
  uidvalidity_changed: bool,
  flags_changed: bool,
  new_mail: bool,
  hcache: Option<hcache::HeaderCache>,
  bcache: Option<hcache::Store>,
  peek: bool,
  check_recent: bool,
  condstore: bool,
  qresync: bool,
  use_idle: bool,
  keep_alive: std::time::Duration,
  reply_regex: regex::Regex,
}

const HEADER_ITEMS: &str = "FLAGS UID INTERNALDATE RFC822.SIZE ENVELOPE BODYSTRUCTURE";

impl ImapMailbox<Transport> {
  pub fn open(
    stream: Stream<Transport>,
    url: Url,
    config: &Config,
    readonly: bool,
  ) -> anyhow::Result<ImapMailbox<Transport>> {
    let mut opening = Opening::start(stream, config.imap_pipeline_depth)?;
    let mut secure = url.scheme.tls();
    if !secure && opening.capabilities.contains("STARTTLS") {
      opening = opening.upgrade_tls(&url.host)?;
      secure = true;
    }
    anyhow::ensure!(
      secure || !config.ssl_force_tls,
      "refusing an unencrypted connection to {}",
      url.host
    );
    opening.authenticate(&url, config, secure)?;
    if config.imap_deflate && opening.capabilities.contains("COMPRESS=DEFLATE") {
      opening = opening.enable_deflate()?;
    }
    ImapMailbox::select(opening, url, config, readonly)
  }
}

impl<RW> ImapMailbox<RW>
where
  RW: ReadWrite,
{
  // SELECT (or EXAMINE) and the initial resynchronisation, shared with the scripted tests.
  pub fn select(
    opening: Opening<RW>,
    url: Url,
    config: &Config,
    readonly: bool,
  ) -> anyhow::Result<ImapMailbox<RW>> {
    let Opening {
      queue,
      capabilities,
      authenticated,
    } = opening;
    anyhow::ensure!(authenticated, "selecting a mailbox before authentication");
    let folder = url.canonical_mailbox();
    let mut mailbox = Mailbox::new(Kind::Imap, Path::new(&url.canonical()));
    mailbox.readonly = readonly;
    let hcache = match &config.header_cache {
      Some(root) => Some(hcache::HeaderCache::open(root, mailbox.path.canon())?),
      None => None,
    };
    let bcache = match &config.body_cache {
      Some(root) => Some(hcache::Store::open(root, mailbox.path.canon())?),
      None => None,
    };
    let mut this = ImapMailbox {
      queue,
      mailbox,
      url,
      capabilities,
      state: State::Authenticated,
      uidvalidity: 0,
      uid_next: 0,
      modseq: 0,
      permanent_flags: Vec::new(),
      uid_hash: HashMap::new(),
      msn: Vec::new(),
      unknown_uids: Vec::new(),
      exists: 0,
      reopen_needed: false,
      uidvalidity_changed: false,
      flags_changed: false,
      new_mail: false,
      hcache,
      bcache,
      peek: config.imap_peek,
      check_recent: config.mail_check_recent,
      condstore: false,
      qresync: false,
      use_idle: config.imap_idle,
      keep_alive: config.imap_keep_alive,
      reply_regex: regex::Regex::new(&config.reply_regex)
        .with_context(|| format!("invalid reply pattern {:?}", config.reply_regex))?,
    };
    this.condstore = config.imap_condstore && this.capabilities.contains("CONDSTORE");
    this.qresync = config.imap_qresync && this.capabilities.contains("QRESYNC");
    if this.qresync && this.capabilities.contains("ENABLE") {
      // https://www.rfc-editor.org/rfc/rfc7162#section-3.2.3
      // A client making use of QRESYNC MUST issue "ENABLE QRESYNC" once it is authenticated.
      let (completion, events) = this.queue.exec(&[Part::text("ENABLE QRESYNC")])?;
      completion.ok()?;
      let mut enabled = false;
      for event in events {
        if let Event::Untagged(UntaggedData::Enabled(names)) = event {
          enabled |= names.iter().any(|name| name.eq_ignore_ascii_case("QRESYNC"));
        }
      }
      this.qresync = enabled;
    } else {
      this.qresync = false;
    }
    this.select_folder(&folder)?;
    this.load_messages()?;
    Ok(this)
  }

  fn cached_validity(&self) -> (u32, u32, u64) {
    match &self.hcache {
      Some(hcache) => (
        hcache.uidvalidity().unwrap_or(0),
        hcache.uidnext().unwrap_or(0),
        hcache.modseq().unwrap_or(0),
      ),
      None => (0, 0, 0),
    }
  }

  fn select_folder(&mut self, folder: &str) -> anyhow::Result<()> {
    let verb = if self.mailbox.readonly { "EXAMINE" } else { "SELECT" };
    let encoded = quote_string(&codec::utf8_to_utf7(folder));
    let (cached_uidvalidity, _, cached_modseq) = self.cached_validity();
    let command = if self.qresync && cached_uidvalidity != 0 && cached_modseq != 0 {
      // https://www.rfc-editor.org/rfc/rfc7162#section-3.2.5
      format!("{verb} {encoded} (QRESYNC ({cached_uidvalidity} {cached_modseq}))")
    } else {
      format!("{verb} {encoded}")
    };
    let (completion, events) = self.queue.exec(&[Part::text(command)])?;
    let completion = completion.ok()?;
    self.state = State::Selected;
    match completion.code {
      Some(Code::ReadOnly) => self.mailbox.readonly = true,
      Some(Code::ReadWrite) => (),
      _ => (),
    }
    self.apply_events(events);
    Ok(())
  }

  // Builds the message list: from the header cache plus a catch-up fetch when UIDVALIDITY held,
  // from scratch otherwise.
  fn load_messages(&mut self) -> anyhow::Result<()> {
    let (cached_uidvalidity, _, cached_modseq) = self.cached_validity();
    if cached_uidvalidity != 0 && cached_uidvalidity == self.uidvalidity {
      self.load_cached_messages()?;
      let mut delta = self.condstore && cached_modseq != 0;
      if delta {
        // https://www.rfc-editor.org/rfc/rfc7162#section-3.1.3
        let (completion, events) = self.queue.exec(&[Part::text(format!(
          "UID FETCH 1:* (FLAGS UID) (CHANGEDSINCE {cached_modseq})"
        ))])?;
        completion.ok()?;
        self.apply_events(events);
        // Without QRESYNC the delta can't announce expunges; fall back to a full
        // reconciliation when the counts disagree.
        let active = self.mailbox.emails.iter().filter(|email| email.active).count();
        if !self.qresync && active != self.exists as usize {
          delta = false;
        }
      }
      if !delta && self.exists > 0 {
        // Bind every MSN, reconcile every flag, and notice cached messages the server no
        // longer has.
        let (completion, events) = self
          .queue
          .exec(&[Part::text(format!("FETCH 1:{} (UID FLAGS)", self.exists))])?;
        completion.ok()?;
        self.apply_events(events);
        self.drop_unmapped();
      } else if !delta {
        self.drop_unmapped();
      }
      self.fetch_unknown()?;
    } else {
      // A UIDVALIDITY change invalidates every cached UID.
      if let Some(hcache) = &self.hcache {
        if cached_uidvalidity != 0 {
          log::info!(
            "uidvalidity changed ({cached_uidvalidity} -> {}), dropping cached headers",
            self.uidvalidity
          );
        }
        hcache.clear()?;
      }
      if self.exists > 0 {
        let (completion, events) = self.queue.exec(&[Part::text(format!(
          "FETCH 1:{} ({HEADER_ITEMS})",
          self.exists
        ))])?;
        completion.ok()?;
        self.apply_events(events);
      }
    }
    self.persist_validity()?;
    self.mailbox.rebuild();
    Ok(())
  }

  fn load_cached_messages(&mut self) -> anyhow::Result<()> {
    let Some(hcache) = &self.hcache else {
      return Ok(());
    };
    let mut uids = hcache.uids()?;
    uids.sort_unstable();
    for uid in uids {
      let Some(cached) = hcache.email(uid) else {
        continue;
      };
      let mut email = Email::new(cached.envelope, cached.received);
      email.envelope.compute_real_subj(&self.reply_regex);
      email.body = cached.body;
      email.private = Private::Imap(EmailData {
        uid,
        ..EmailData::default()
      });
      let index = self.mailbox.push(email);
      self.uid_hash.insert(uid, index);
    }
    log::debug!("loaded {} cached header(s)", self.uid_hash.len());
    Ok(())
  }

  fn persist_validity(&self) -> anyhow::Result<()> {
    if let Some(hcache) = &self.hcache {
      hcache.set_uidvalidity(self.uidvalidity)?;
      hcache.set_uidnext(self.uid_next)?;
      hcache.set_modseq(self.modseq)?;
    }
    Ok(())
  }

  // After a full MSN-space fetch, any cached message that didn't get an MSN binding is no longer
  // on the server.
  fn drop_unmapped(&mut self) {
    for email in self.mailbox.emails.iter_mut() {
      if !email.active {
        continue;
      }
      if let Some(data) = email.imap() {
        if data.msn == 0 {
          let uid = data.uid;
          email.active = false;
          self.uid_hash.remove(&uid);
          if let Some(hcache) = &self.hcache {
            let _ = hcache.delete_email(uid);
          }
        }
      }
    }
  }

  // Fetches full headers for UIDs the server mentioned without giving us an envelope.
  fn fetch_unknown(&mut self) -> anyhow::Result<()> {
    if self.unknown_uids.is_empty() {
      return Ok(());
    }
    let set = msg_set::UidSet::new(std::mem::take(&mut self.unknown_uids));
    let mut pos = 0;
    loop {
      let mut items = String::new();
      if set.compress(&mut items, &mut pos, msg_set::MAX_CMDLEN) == 0 {
        break;
      }
      let (completion, events) = self
        .queue
        .exec(&[Part::text(format!("UID FETCH {items} ({HEADER_ITEMS})"))])?;
      completion.ok()?;
      self.apply_events(events);
    }
    Ok(())
  }

  fn apply_events(&mut self, events: Vec<Event>) {
    for event in events {
      self.apply_event(event);
    }
  }

  fn apply_event(&mut self, event: Event) {
    match event {
      Event::Untagged(untagged) => self.apply_untagged(untagged),
      Event::Completed { status, text, .. } => {
        // Completions of queued commands; failures were already turned into errors upstream.
        if status != protocol::CommandStatus::Ok {
          log::warn!("command failed late: {text}");
        }
      }
      Event::NeedContinuation(_) => log::warn!("stray continuation request"),
    }
  }

  fn apply_untagged(&mut self, untagged: UntaggedData) {
    match untagged {
      UntaggedData::Exists(count) => {
        let known = self.exists;
        self.exists = count;
        if count < known {
          // The server shrank the mailbox without telling us which messages went away.
          self.reopen_needed = true;
        } else if (count as usize) > self.msn.len() {
          self.new_mail = true;
        }
      }
      UntaggedData::Recent(count) => {
        // Only worth acting on when the caller wants recency reported; fetch_new backs off if
        // the EXISTS count says there's nothing to pull.
        if count > 0 && self.check_recent {
          self.new_mail = true;
        }
      }
      UntaggedData::Expunge(msn) => {
        self.apply_expunge(msn);
        self.exists = self.exists.saturating_sub(1);
      }
      UntaggedData::Vanished { uids, earlier } => self.apply_vanished(&uids, earlier),
      UntaggedData::Fetch(data) => self.apply_fetch(data),
      UntaggedData::Flags(_) => (),
      UntaggedData::Condition { status, code, text } => {
        if status == Status::Bye {
          log::info!("server said goodbye: {text}");
        }
        if let Some(code) = code {
          self.apply_code(code, &text);
        }
      }
      UntaggedData::Capability(names) => collect_capabilities(&mut self.capabilities, names),
      UntaggedData::Enabled(_) => (),
      UntaggedData::List { .. } | UntaggedData::Status { .. } | UntaggedData::Search(_) => (),
    }
  }

  fn apply_code(&mut self, code: Code, text: &str) {
    match code {
      Code::Alert => log::warn!("server alert: {text}"),
      Code::UidValidity(uidvalidity) => {
        if self.uidvalidity != 0 && self.uidvalidity != uidvalidity {
          // Fatal for the selected session: every UID-keyed cache is garbage now.
          log::warn!(
            "uidvalidity changed mid-session ({} -> {uidvalidity})",
            self.uidvalidity
          );
          self.reopen_needed = true;
          self.uidvalidity_changed = true;
        }
        self.uidvalidity = uidvalidity;
      }
      Code::UidNext(uid_next) => self.uid_next = uid_next,
      Code::HighestModSeq(modseq) => self.modseq = self.modseq.max(modseq),
      Code::NoModSeq => {
        self.condstore = false;
        self.qresync = false;
      }
      Code::PermanentFlags(flags) => self.permanent_flags = flags,
      Code::ReadOnly => self.mailbox.readonly = true,
      Code::ReadWrite => (),
      Code::Capability(names) => collect_capabilities(&mut self.capabilities, names),
      Code::AppendUid { uid, .. } => log::debug!("appended as uid {uid}"),
      Code::CopyUid { .. } => (),
      Code::Modified(_) => self.flags_changed = true,
      Code::Unseen(_) | Code::TryCreate | Code::Other(_) => (),
    }
  }

  // https://www.rfc-editor.org/rfc/rfc3501#section-7.4.1
  // The expunged message is gone and every MSN above it shifts down by one.
  fn apply_expunge(&mut self, msn: u32) {
    if msn == 0 {
      return;
    }
    let position = (msn - 1) as usize;
    if position >= self.msn.len() {
      // An expunge for an MSN we never mapped: the session is out of step.
      self.reopen_needed = true;
      return;
    }
    if let Some(index) = self.msn.remove(position) {
      if let Some(email) = self.mailbox.emails.get_mut(index) {
        email.active = false;
        if let Some(data) = email.imap_mut() {
          let uid = data.uid;
          data.msn = 0;
          self.uid_hash.remove(&uid);
          if let Some(hcache) = &self.hcache {
            let _ = hcache.delete_email(uid);
          }
        }
      }
    }
    for (position, slot) in self.msn.iter().enumerate().skip(position) {
      if let Some(index) = slot {
        if let Some(data) = self.mailbox.emails[*index].imap_mut() {
          data.msn = (position + 1) as u32;
        }
      }
    }
  }

  // https://www.rfc-editor.org/rfc/rfc7162#section-3.2.10
  // The EARLIER form reports removals that predate this session's EXISTS count; the live form
  // shrinks the currently selected view like EXPUNGE does.
  fn apply_vanished(&mut self, ranges: &[(u32, u32)], earlier: bool) {
    let mut uids: Vec<u32> = self
      .uid_hash
      .keys()
      .copied()
      .filter(|uid| ranges.iter().any(|(start, end)| start <= uid && uid <= end))
      .collect();
    uids.sort_unstable();
    for uid in uids {
      let Some(&index) = self.uid_hash.get(&uid) else {
        continue;
      };
      let msn = self.mailbox.emails[index].imap().map_or(0, |data| data.msn);
      if msn > 0 {
        self.apply_expunge(msn);
      } else {
        let email = &mut self.mailbox.emails[index];
        email.active = false;
        self.uid_hash.remove(&uid);
        if let Some(hcache) = &self.hcache {
          let _ = hcache.delete_email(uid);
        }
      }
      if !earlier {
        self.exists = self.exists.saturating_sub(1);
      }
    }
  }

  fn bind_msn(&mut self, msn: u32, index: usize) {
    if msn == 0 {
      return;
    }
    let position = (msn - 1) as usize;
    if self.msn.len() <= position {
      self.msn.resize(position + 1, None);
    }
    self.msn[position] = Some(index);
    if let Some(data) = self.mailbox.emails[index].imap_mut() {
      data.msn = msn;
    }
  }

  fn apply_fetch(&mut self, data: protocol::FetchData) {
    let index = data
      .uid
      .and_then(|uid| self.uid_hash.get(&uid).copied())
      .or_else(|| {
        self
          .msn
          .get((data.msn.max(1) - 1) as usize)
          .copied()
          .flatten()
      });
    let index = match (index, &data.envelope) {
      (Some(index), _) => index,
      (None, Some(_)) => {
        // A header fetch for a message we don't have yet.
        let Some(uid) = data.uid else {
          log::warn!("header fetch without a UID, ignoring");
          return;
        };
        let mut email = Email::new(data.envelope.clone().unwrap(), 0);
        email.envelope.compute_real_subj(&self.reply_regex);
        email.private = Private::Imap(EmailData {
          uid,
          ..EmailData::default()
        });
        let index = self.mailbox.push(email);
        self.uid_hash.insert(uid, index);
        index
      }
      (None, None) => {
        // Flags for a message we have no headers for: remember it for a header fetch.
        if let Some(uid) = data.uid {
          if !self.unknown_uids.contains(&uid) {
            self.unknown_uids.push(uid);
          }
        }
        return;
      }
    };
    if let Some(uid) = data.uid {
      self.uid_hash.insert(uid, index);
      if let Some(imap) = self.mailbox.emails[index].imap_mut() {
        imap.uid = uid;
      }
    }
    self.bind_msn(data.msn, index);
    let email = &mut self.mailbox.emails[index];
    if let Some(flags) = &data.flags {
      let parsed = Flags::from_imap(flags);
      let previous_remote = email.imap().map(|imap| imap.flags_remote);
      if let Some(imap) = email.imap_mut() {
        imap.flags_remote = parsed;
      }
      if email.changed {
        // Local edits win until sync pushes them; note the server moved underneath us.
        if previous_remote != Some(parsed) {
          self.flags_changed = true;
        }
      } else {
        let old = email.flags.old;
        if (Flags { old, ..parsed }) != email.flags {
          self.flags_changed = true;
        }
        email.flags = Flags { old, ..parsed };
      }
    }
    if let Some(modseq) = data.modseq {
      if let Some(imap) = email.imap_mut() {
        imap.modseq = modseq;
      }
      self.modseq = self.modseq.max(modseq);
    }
    if let Some(size) = data.size {
      if let Some(body) = &mut email.body {
        if body.length == 0 {
          body.length = u64::from(size);
        }
      }
    }
    if let Some(body) = data.body {
      email.body = Some(body);
    }
    if let Some(envelope) = &data.envelope {
      if email.received == 0 {
        email.received = envelope.date.unwrap_or(0);
      }
    }
    if let Some(internaldate) = &data.internaldate {
      if let Some(received) = parse_internal_date(internaldate) {
        email.received = received;
      }
    }
    // Cache the finished record, not the bare envelope the fetch started with.
    if data.envelope.is_some() {
      let email = &self.mailbox.emails[index];
      if let (Some(hcache), Some(imap)) = (&self.hcache, email.imap()) {
        let _ = hcache.put_email(imap.uid, email);
      }
    }
  }

  // Fetches headers for messages the server announced via EXISTS.
  fn fetch_new(&mut self) -> anyhow::Result<()> {
    let first = self.msn.len() + 1;
    if (self.exists as usize) < first {
      self.new_mail = false;
      return Ok(());
    }
    let (completion, events) = self.queue.exec(&[Part::text(format!(
      "FETCH {first}:{} ({HEADER_ITEMS})",
      self.exists
    ))])?;
    completion.ok()?;
    self.apply_events(events);
    self.new_mail = false;
    self.persist_validity()?;
    self.mailbox.rebuild();
    Ok(())
  }

  // Nudges the server when the session has sat idle past the keep-alive horizon.
  pub fn keepalive(&mut self) -> anyhow::Result<()> {
    if self.queue.idle() < self.keep_alive {
      return Ok(());
    }
    log::debug!("keep-alive NOOP after {:?} idle", self.queue.idle());
    let (completion, events) = self.queue.exec(&[Part::text("NOOP")])?;
    completion.ok()?;
    self.apply_events(events);
    Ok(())
  }

  fn poll(&mut self) -> anyhow::Result<()> {
    let events = if self.use_idle && self.capabilities.contains("IDLE") {
      // https://www.rfc-editor.org/rfc/rfc2177
      // Enter IDLE just long enough to drain whatever the server has pending.
      let (tag, mut events) = self.queue.send(&[Part::text("IDLE")])?;
      loop {
        match self.queue.step()? {
          Event::NeedContinuation(_) => break,
          event => events.push(event),
        }
      }
      self.queue.respond(b"DONE", true)?;
      let (completion, done_events) = self.queue.wait(&tag)?;
      completion.ok()?;
      events.extend(done_events);
      events
    } else {
      let (completion, events) = self.queue.exec(&[Part::text("NOOP")])?;
      completion.ok()?;
      events
    };
    self.apply_events(events);
    Ok(())
  }

  // Full reopen after a de-sync or a UIDVALIDITY change: every UID-keyed structure is discarded,
  // local flag edits are carried over only when the UID space survived.
  fn reopen(&mut self) -> anyhow::Result<()> {
    let previous_uidvalidity = self.uidvalidity;
    let mut local_edits: HashMap<u32, Flags> = HashMap::new();
    if !self.uidvalidity_changed {
      for email in &self.mailbox.emails {
        if email.changed && email.active {
          if let Some(data) = email.imap() {
            local_edits.insert(data.uid, email.flags);
          }
        }
      }
    }
    self.mailbox.emails.clear();
    self.mailbox.v2r.clear();
    self.uid_hash.clear();
    self.msn.clear();
    self.unknown_uids.clear();
    self.exists = 0;
    self.uidvalidity = 0;
    self.reopen_needed = false;
    let folder = self.url.canonical_mailbox();
    self.select_folder(&folder)?;
    if self.uidvalidity_changed || self.uidvalidity != previous_uidvalidity {
      if let Some(hcache) = &self.hcache {
        hcache.clear()?;
      }
      local_edits.clear();
      self.uidvalidity_changed = false;
    }
    self.load_messages()?;
    for (uid, flags) in local_edits {
      if let Some(&index) = self.uid_hash.get(&uid) {
        let email = &mut self.mailbox.emails[index];
        email.flags = flags;
        email.changed = true;
        self.mailbox.changed = true;
      }
    }
    self.mailbox.recount();
    Ok(())
  }

  fn imap_check(&mut self) -> anyhow::Result<Check> {
    self.poll()?;
    if self.reopen_needed {
      self.reopen()?;
      return Ok(Check::Reopened);
    }
    if self.new_mail || (self.exists as usize) > self.msn.len() {
      let before = self.mailbox.msg_count();
      self.fetch_new()?;
      if self.mailbox.msg_count() > before {
        return Ok(Check::NewMail);
      }
    }
    if std::mem::take(&mut self.flags_changed) {
      self.mailbox.recount();
      return Ok(Check::FlagsChanged);
    }
    Ok(Check::Ok)
  }

  fn imap_sync(&mut self) -> anyhow::Result<()> {
    anyhow::ensure!(self.state == State::Selected, "sync on an unselected mailbox");
    if self.mailbox.readonly || self.mailbox.dontwrite {
      return Ok(());
    }
    // https://www.rfc-editor.org/rfc/rfc4314#section-2.1
    // "s" covers \Seen, "t" covers \Deleted, "w" the rest.
    type Getter = fn(&Flags) -> bool;
    let bits: [(&str, Getter, char); 5] = [
      ("\\Seen", |flags: &Flags| flags.read, 's'),
      ("\\Flagged", |flags: &Flags| flags.flagged, 'w'),
      ("\\Answered", |flags: &Flags| flags.replied, 'w'),
      ("\\Draft", |flags: &Flags| flags.draft, 'w'),
      ("\\Deleted", |flags: &Flags| flags.deleted, 't'),
    ];
    let mut events = Vec::new();
    for (name, get, right) in bits {
      if !self.mailbox.rights.has(right) {
        continue;
      }
      for (suffix, invert) in [("+", false), ("-", true)] {
        // +FLAGS for local-set/remote-unset, -FLAGS for the inverse, changed messages only.
        let commands = msg_set::build(
          &mut self.mailbox,
          "UID STORE",
          &format!("{suffix}FLAGS.SILENT ({name})"),
          false,
          |email| {
            email.changed
              && email.imap().is_some_and(|data| {
                let local = get(&email.flags);
                let remote = get(&data.flags_remote);
                if invert {
                  !local && remote
                } else {
                  local && !remote
                }
              })
          },
        );
        for (command, _) in commands {
          let (_, queue_events) = self.queue.queue(&[Part::text(command)])?;
          events.extend(queue_events);
        }
      }
    }
    events.extend(self.queue.flush()?);
    self.apply_events(events);
    // The server confirmed the stores: the remote view now matches the local one.
    for email in &mut self.mailbox.emails {
      if email.changed {
        let flags = email.flags;
        if let Some(data) = email.imap_mut() {
          data.flags_remote = flags;
        }
        email.changed = false;
      }
    }
    // Deletions: UID EXPUNGE only touches our messages, EXPUNGE is the blunt fallback.
    if self.mailbox.rights.has('e') && self.mailbox.emails.iter().any(|email| {
      email.active && email.flags.deleted
    }) {
      let events = if self.capabilities.contains("UIDPLUS") {
        let mut events = Vec::new();
        let commands = msg_set::build(&mut self.mailbox, "UID EXPUNGE", "", false, |email| {
          email.flags.deleted
        });
        for (command, _) in commands {
          let (_, queue_events) = self.queue.queue(&[Part::text(command)])?;
          events.extend(queue_events);
        }
        events.extend(self.queue.flush()?);
        events
      } else {
        let (completion, events) = self.queue.exec(&[Part::text("EXPUNGE")])?;
        completion.ok()?;
        events
      };
      self.apply_events(events);
    }
    self.mailbox.compress();
    // Compress renumbered the email vector; the maps must follow.
    self.uid_hash.clear();
    for slot in self.msn.iter_mut() {
      *slot = None;
    }
    for (index, email) in self.mailbox.emails.iter().enumerate() {
      if let Some(data) = email.imap() {
        if data.uid != 0 {
          self.uid_hash.insert(data.uid, index);
        }
        if data.msn != 0 {
          let position = (data.msn - 1) as usize;
          if self.msn.len() <= position {
            self.msn.resize(position + 1, None);
          }
          self.msn[position] = Some(index);
        }
      }
    }
    self.mailbox.changed = false;
    self.persist_validity()?;
    Ok(())
  }

  fn fetch_message(&mut self, index: usize) -> anyhow::Result<Vec<u8>> {
    let uid = self
      .mailbox
      .emails
      .get(index)
      .and_then(|email| email.imap())
      .map(|data| data.uid)
      .with_context(|| format!("no message at index {index}"))?;
    let cache_key = format!("{}-{uid}", self.uidvalidity);
    if let Some(bcache) = &self.bcache {
      if let Some(bytes) = bcache.get(&cache_key) {
        log::debug!("body cache hit for uid {uid}");
        return Ok(bytes);
      }
    }
    // https://www.rfc-editor.org/rfc/rfc3501#section-6.4.5
    // BODY.PEEK does not implicitly set \Seen.
    let item = if self.peek { "BODY.PEEK[]" } else { "BODY[]" };
    let (completion, events) = self
      .queue
      .exec(&[Part::text(format!("UID FETCH {uid} ({item})"))])?;
    completion.ok()?;
    let mut payload = None;
    for event in events {
      match event {
        Event::Untagged(UntaggedData::Fetch(data))
          if data.uid == Some(uid) && data.section.is_some() =>
        {
          payload = data.section;
        }
        event => self.apply_event(event),
      }
    }
    let payload = payload.with_context(|| format!("BODY[] missing for uid {uid}"))?;
    if !self.peek {
      // The fetch set \Seen server-side.
      let email = &mut self.mailbox.emails[index];
      if let Some(data) = email.imap_mut() {
        data.flags_remote.read = true;
      }
      if !email.changed {
        email.flags.read = true;
      }
    }
    if let Some(bcache) = &self.bcache {
      let _ = bcache.put(&cache_key, &payload);
    }
    Ok(payload)
  }

  fn imap_append(&mut self, message: &[u8], flags: Flags) -> anyhow::Result<()> {
    let folder = self.url.canonical_mailbox();
    let encoded = quote_string(&codec::utf8_to_utf7(&folder));
    let date = chrono::Local::now().format("%d-%b-%Y %H:%M:%S %z");
    let (completion, events) = self.queue.exec(&[
      Part::text(format!(
        "APPEND {encoded} ({}) \"{date}\" ",
        flag_list(&flags)
      )),
      Part::Literal(message.to_vec()),
    ])?;
    let completion = completion.ok()?;
    if let Some(Code::AppendUid { uid, .. }) = &completion.code {
      log::debug!("APPEND assigned uid {uid}");
    }
    self.apply_events(events);
    Ok(())
  }

  fn imap_copy(&mut self, indices: &[usize], destination: &str) -> anyhow::Result<()> {
    let targets: std::collections::HashSet<usize> = indices.iter().copied().collect();
    let encoded = quote_string(&codec::utf8_to_utf7(destination));
    let commands = msg_set::build(&mut self.mailbox, "UID COPY", &encoded, false, |email| {
      targets.contains(&email.index)
    });
    anyhow::ensure!(!commands.is_empty(), "nothing to copy");
    for (command, _) in commands {
      let (completion, events) = self.queue.exec(&[Part::text(command)])?;
      let completion = completion.ok()?;
      if let Some(Code::CopyUid { uidvalidity, .. }) = &completion.code {
        // https://www.rfc-editor.org/rfc/rfc4315#section-3
        log::debug!("copied into uidvalidity {uidvalidity}");
      }
      self.apply_events(events);
    }
    Ok(())
  }

  fn logout(&mut self) -> anyhow::Result<()> {
    if self.state == State::Selected {
      // CLOSE would expunge; UNSELECT (or a no-op EXAMINE) doesn't.
      let verb = if self.capabilities.contains("UNSELECT") {
        "UNSELECT".to_string()
      } else {
        format!(
          "EXAMINE {}",
          quote_string(&codec::utf8_to_utf7(&self.url.canonical_mailbox()))
        )
      };
      let (completion, _) = self.queue.exec(&[Part::text(verb)])?;
      let _ = completion.ok();
      self.state = State::Authenticated;
    }
    let (completion, _) = self.queue.exec(&[Part::text("LOGOUT")])?;
    let _ = completion.ok();
    self.state = State::Logout;
    Ok(())
  }

  // https://www.rfc-editor.org/rfc/rfc3501#section-7.1
  // What the server lets this session store permanently; "\*" means new keywords are accepted.
  pub fn permanent_flags(&self) -> &[String] {
    &self.permanent_flags
  }

  // Folder listing for the session layer; not part of the per-mailbox trait.
  pub fn list(&mut self) -> anyhow::Result<Vec<(String, Option<char>)>> {
    let (completion, events) = self.queue.exec(&[Part::text("LIST \"\" \"*\"")])?;
    completion.ok()?;
    let mut folders = Vec::new();
    for event in events {
      if let Event::Untagged(UntaggedData::List { flags, separator, mailbox, .. }) = event {
        if flags.iter().any(|flag| flag.eq_ignore_ascii_case("\\Noselect")) {
          continue;
        }
        let name = codec::utf7_to_utf8(&mailbox)
          .with_context(|| format!("{} isn't modified UTF-7", codec::escape(&mailbox)))?;
        folders.push((name, separator));
      }
    }
    Ok(folders)
  }

  #[cfg(test)]
  pub(crate) fn testing_state(&self) -> (u32, u32, u64, usize) {
    (self.uidvalidity, self.uid_next, self.modseq, self.msn.len())
  }

  #[cfg(test)]
  pub(crate) fn testing_msn_uid(&self, msn: u32) -> Option<u32> {
    self
      .msn
      .get((msn - 1) as usize)
      .copied()
      .flatten()
      .and_then(|index| self.mailbox.emails[index].imap())
      .map(|data| data.uid)
  }
}

fn flag_list(flags: &Flags) -> String {
  let mut names = Vec::new();
  if flags.read {
    names.push("\\Seen");
  }
  if flags.replied {
    names.push("\\Answered");
  }
  if flags.flagged {
    names.push("\\Flagged");
  }
  if flags.deleted {
    names.push("\\Deleted");
  }
  if flags.draft {
    names.push("\\Draft");
  }
  names.join(" ")
}

// INTERNALDATE: "dd-Mon-yyyy hh:mm:ss +zzzz", day possibly space-padded.
fn parse_internal_date(raw: &str) -> Option<i64> {
  chrono::DateTime::parse_from_str(raw.trim(), "%e-%b-%Y %H:%M:%S %z")
    .ok()
    .map(|date| date.timestamp())
}

impl<RW> MailStore for ImapMailbox<RW>
where
  RW: ReadWrite,
{
  fn kind(&self) -> Kind {
    Kind::Imap
  }

  fn mailbox(&self) -> &Mailbox {
    &self.mailbox
  }

  fn mailbox_mut(&mut self) -> &mut Mailbox {
    &mut self.mailbox
  }

  fn check(&mut self) -> anyhow::Result<Check> {
    self.imap_check()
  }

  fn sync(&mut self) -> anyhow::Result<()> {
    self.imap_sync()
  }

  fn message(&mut self, index: usize) -> anyhow::Result<Vec<u8>> {
    self.fetch_message(index)
  }

  fn append(&mut self, message: &[u8], flags: Flags) -> anyhow::Result<()> {
    self.imap_append(message, flags)
  }

  fn copy_messages(&mut self, indices: &[usize], destination: &str) -> anyhow::Result<()> {
    self.imap_copy(indices, destination)
  }

  fn close(mut self: Box<Self>) -> anyhow::Result<()> {
    self.persist_validity()?;
    self.logout()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::testing::Script;
  use pretty_assertions::assert_eq;

  fn config() -> Config {
    Config {
      user: Some("user".to_string()),
      password: Some("secret".to_string()),
      ..Config::default()
    }
  }

  fn url() -> Url {
    Url::parse("imap://user@example.com/INBOX").unwrap()
  }

  // A full scripted open: greeting, AUTHENTICATE PLAIN, SELECT with three messages.
  fn opened(script: &str) -> ImapMailbox<Script> {
    let stream = Stream::new(Script::new(script.as_bytes()));
    let mut opening = Opening::start(stream, 4).unwrap();
    opening.authenticate(&url(), &config(), true).unwrap();
    ImapMailbox::select(opening, url(), &config(), false).unwrap()
  }

  fn standard_open_script(extra: &str) -> String {
    format!(
      "* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN LITERAL+ UIDPLUS] ready\r\n\
       + \r\n\
       a0000 OK [CAPABILITY IMAP4rev1 AUTH=PLAIN LITERAL+ UIDPLUS] authenticated\r\n\
       * 3 EXISTS\r\n\
       * OK [UIDVALIDITY 9] UIDs valid\r\n\
       * OK [UIDNEXT 44] next\r\n\
       * FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
       a0001 OK [READ-WRITE] SELECT completed\r\n\
       * 1 FETCH (UID 10 FLAGS (\\Seen) INTERNALDATE \"01-Jan-2020 00:00:00 +0000\" RFC822.SIZE 10 ENVELOPE (NIL \"one\" ((NIL NIL \"a\" \"x\")) NIL NIL NIL NIL NIL NIL \"<1@x>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 10 1))\r\n\
       * 2 FETCH (UID 11 FLAGS () INTERNALDATE \"01-Jan-2020 00:00:00 +0000\" RFC822.SIZE 10 ENVELOPE (NIL \"two\" ((NIL NIL \"b\" \"x\")) NIL NIL NIL NIL NIL NIL \"<2@x>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 10 1))\r\n\
       * 3 FETCH (UID 12 FLAGS (\\Flagged) INTERNALDATE \"01-Jan-2020 00:00:00 +0000\" RFC822.SIZE 10 ENVELOPE (NIL \"three\" ((NIL NIL \"c\" \"x\")) NIL NIL NIL NIL NIL NIL \"<3@x>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 10 1))\r\n\
       a0002 OK FETCH completed\r\n\
       {extra}"
    )
  }

  #[test]
  fn open_builds_the_message_list() {
    let imap = opened(&standard_open_script(""));
    assert_eq!(3, imap.mailbox.msg_count());
    assert_eq!(3, imap.mailbox.vcount());
    let (uidvalidity, uid_next, _, msns) = imap.testing_state();
    assert_eq!(9, uidvalidity);
    assert_eq!(44, uid_next);
    assert_eq!(3, msns);
    assert_eq!(Some(10), imap.testing_msn_uid(1));
    assert_eq!(Some("one".to_string()), imap.mailbox.emails[0].envelope.subject);
    assert!(imap.mailbox.emails[0].flags.read);
    assert!(imap.mailbox.emails[2].flags.flagged);
    imap.mailbox.assert_invariants();
  }

  #[test]
  fn expunge_renumbers_msns() {
    // Five messages, then "* 3 EXPUNGE" during a NOOP.
    let script = format!(
      "* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready\r\n\
       + \r\n\
       a0000 OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] authenticated\r\n\
       * 5 EXISTS\r\n\
       * OK [UIDVALIDITY 9] v\r\n\
       * OK [UIDNEXT 6] n\r\n\
       a0001 OK SELECT done\r\n\
       {fetches}\
       a0002 OK FETCH done\r\n\
       * 3 EXPUNGE\r\n\
       a0003 OK NOOP done\r\n",
      fetches = (1..=5)
        .map(|msn| format!(
          "* {msn} FETCH (UID {uid} FLAGS () RFC822.SIZE 5 ENVELOPE (NIL \"m{msn}\" NIL NIL NIL NIL NIL NIL NIL \"<{msn}@x>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 5 1))\r\n",
          uid = msn
        ))
        .collect::<String>()
    );
    let mut imap = opened(&script);
    assert_eq!(5, imap.mailbox.msg_count());
    assert_eq!(Check::Ok, imap.imap_check().unwrap());
    // The message that was MSN 4 is now MSN 3, MSN 5 became 4, and the count dropped.
    assert_eq!(Some(4), imap.testing_msn_uid(3));
    assert_eq!(Some(5), imap.testing_msn_uid(4));
    assert_eq!(4, imap.exists);
    let expunged = imap
      .mailbox
      .emails
      .iter()
      .find(|email| email.imap().map(|data| data.uid) == Some(3))
      .unwrap();
    assert!(!expunged.active);
    // And it no longer participates in message sets.
    let commands = msg_set::build(&mut imap.mailbox, "UID FETCH", "(FLAGS)", false, |_| true);
    assert_eq!(vec![("UID FETCH 1:2,4:5 (FLAGS)".to_string(), 4)], commands);
  }

  #[test]
  fn new_mail_is_fetched_incrementally() {
    let script = standard_open_script(
      "* 4 EXISTS\r\n\
       a0003 OK NOOP done\r\n\
       * 4 FETCH (UID 13 FLAGS () RFC822.SIZE 5 ENVELOPE (NIL \"four\" NIL NIL NIL NIL NIL NIL NIL \"<4@x>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 5 1))\r\n\
       a0004 OK FETCH done\r\n",
    );
    let mut imap = opened(&script);
    assert_eq!(Check::NewMail, imap.imap_check().unwrap());
    assert_eq!(4, imap.mailbox.msg_count());
    assert_eq!(Some(13), imap.testing_msn_uid(4));
  }

  #[test]
  fn flag_updates_from_the_server() {
    let script = standard_open_script(
      "* 2 FETCH (UID 11 FLAGS (\\Seen))\r\n\
       a0003 OK NOOP done\r\n",
    );
    let mut imap = opened(&script);
    assert!(!imap.mailbox.emails[1].flags.read);
    assert_eq!(Check::FlagsChanged, imap.imap_check().unwrap());
    assert!(imap.mailbox.emails[1].flags.read);
    assert_eq!(
      Some(true),
      imap.mailbox.emails[1].imap().map(|data| data.flags_remote.read)
    );
  }

  #[test]
  fn sync_converges_flags() {
    let script = standard_open_script(
      "* 2 FETCH (UID 11 FLAGS (\\Seen))\r\n\
       a0003 OK STORE done\r\n\
       a0004 OK EXPUNGE done\r\n",
    );
    let mut imap = opened(&script);
    // Mark UID 11 read locally.
    imap.mailbox.set_flag(1, crate::mailbox::FlagBit::Read, true);
    assert!(imap.mailbox.emails[1].changed);
    imap.imap_sync().unwrap();
    // Flag convergence: local equals remote everywhere.
    for email in &imap.mailbox.emails {
      assert_eq!(
        email.flags,
        email.imap().unwrap().flags_remote,
        "{:?}",
        email.envelope.subject
      );
      assert!(!email.changed);
    }
    assert!(!imap.mailbox.changed);
  }

  #[test]
  fn sync_expunges_deleted_messages() {
    let script = standard_open_script(
      "a0003 OK STORE done\r\n\
       * VANISHED 11\r\n\
       a0004 OK expunged\r\n",
    );
    let mut imap = opened(&script);
    imap.mailbox.set_flag(1, crate::mailbox::FlagBit::Deleted, true);
    imap.imap_sync().unwrap();
    assert_eq!(2, imap.mailbox.msg_count());
    assert!(imap
      .mailbox
      .emails
      .iter()
      .all(|email| email.imap().map(|data| data.uid) != Some(11)));
    imap.mailbox.assert_invariants();
  }

  #[test]
  fn uidvalidity_change_purges_uids() {
    let script = standard_open_script(
      "* OK [UIDVALIDITY 10] changed\r\n\
       a0003 OK NOOP done\r\n\
       * 1 EXISTS\r\n\
       * OK [UIDVALIDITY 10] v\r\n\
       * OK [UIDNEXT 2] n\r\n\
       a0004 OK SELECT done\r\n\
       * 1 FETCH (UID 1 FLAGS () RFC822.SIZE 5 ENVELOPE (NIL \"fresh\" NIL NIL NIL NIL NIL NIL NIL \"<f@x>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 5 1))\r\n\
       a0005 OK FETCH done\r\n",
    );
    let mut imap = opened(&script);
    assert_eq!(Check::Reopened, imap.imap_check().unwrap());
    // No email retains a UID from the previous session.
    assert_eq!(1, imap.mailbox.msg_count());
    for email in &imap.mailbox.emails {
      assert_eq!(Some(1), email.imap().map(|data| data.uid));
    }
    let (uidvalidity, ..) = imap.testing_state();
    assert_eq!(10, uidvalidity);
  }

  #[test]
  fn message_bodies_are_fetched_by_uid() {
    let script = standard_open_script(
      "* 2 FETCH (UID 11 BODY[] {5}\r\nhello)\r\n\
       a0003 OK FETCH done\r\n",
    );
    let mut imap = opened(&script);
    let body = imap.fetch_message(1).unwrap();
    assert_eq!(b"hello".to_vec(), body);
  }

  #[test]
  fn internal_dates() {
    assert_eq!(
      Some(1577836800),
      parse_internal_date("01-Jan-2020 00:00:00 +0000")
    );
    assert_eq!(
      Some(1577836800),
      parse_internal_date(" 1-Jan-2020 01:00:00 +0100")
    );
    assert_eq!(None, parse_internal_date("not a date"));
  }

  #[test]
  fn flag_lists() {
    let flags = Flags {
      read: true,
      draft: true,
      ..Flags::default()
    };
    assert_eq!("\\Seen \\Draft", flag_list(&flags));
    assert_eq!("", flag_list(&Flags::default()));
  }
}
