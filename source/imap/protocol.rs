// https://www.rfc-editor.org/rfc/rfc3501#section-2.2 - commands, responses, tags
// https://www.rfc-editor.org/rfc/rfc7888 - non-synchronizing literals
//
// The protocol engine. Commands are tagged, optionally queued for pipelining, and the reply
// stream is consumed one logical line at a time through `step`, which turns every server line
// into an owned event the mailbox layer applies to its state.

use super::parser::{self, parser as grammar};
use crate::{
  codec,
  connection::{ReadWrite, Stream},
  email,
};
use anyhow::Context as _;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
  New,
  Queued,
  Sent,
  Completed,
}

#[derive(Debug)]
struct Slot {
  tag: String,
  state: SlotState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
  Ok,
  No,
  Bad,
}

// Owned mirror of the parser's response codes, free of the line buffer's lifetime.
#[derive(Clone, Debug, PartialEq)]
pub enum Code {
  Alert,
  Capability(Vec<String>),
  PermanentFlags(Vec<String>),
  ReadOnly,
  ReadWrite,
  TryCreate,
  UidValidity(u32),
  UidNext(u32),
  Unseen(u32),
  HighestModSeq(u64),
  NoModSeq,
  AppendUid { uidvalidity: u32, uid: u32 },
  CopyUid { uidvalidity: u32, from: Vec<(u32, u32)>, to: Vec<(u32, u32)> },
  Modified(Vec<(u32, u32)>),
  Other(String),
}

fn own_ranges(ranges: Vec<parser::Range>) -> Vec<(u32, u32)> {
  ranges.into_iter().map(|parser::Range(a, b)| (a, b)).collect()
}

fn own_strings(strings: Vec<&[u8]>) -> Vec<String> {
  strings
    .into_iter()
    .map(|bytes| String::from_utf8_lossy(bytes).to_string())
    .collect()
}

fn own_code(code: parser::RespCode<'_>) -> Code {
  match code {
    parser::RespCode::Alert => Code::Alert,
    parser::RespCode::Capability(cs) => Code::Capability(own_strings(cs)),
    parser::RespCode::PermanentFlags(fs) => Code::PermanentFlags(own_strings(fs)),
    parser::RespCode::ReadOnly => Code::ReadOnly,
    parser::RespCode::ReadWrite => Code::ReadWrite,
    parser::RespCode::TryCreate => Code::TryCreate,
    parser::RespCode::UidValidity(n) => Code::UidValidity(n),
    parser::RespCode::UidNext(n) => Code::UidNext(n),
    parser::RespCode::Unseen(n) => Code::Unseen(n),
    parser::RespCode::HighestModSeq(n) => Code::HighestModSeq(n),
    parser::RespCode::NoModSeq => Code::NoModSeq,
    parser::RespCode::AppendUid { uidvalidity, uid } => Code::AppendUid { uidvalidity, uid },
    parser::RespCode::CopyUid { uidvalidity, from, to } => Code::CopyUid {
      uidvalidity,
      from: own_ranges(from),
      to: own_ranges(to),
    },
    parser::RespCode::Modified(s) => Code::Modified(own_ranges(s)),
    parser::RespCode::Other(o) => Code::Other(String::from_utf8_lossy(o).to_string()),
  }
}

// Every FETCH attribute folded into one record; servers send them in any order.
#[derive(Debug, Default, PartialEq)]
pub struct FetchData {
  pub msn: u32,
  pub uid: Option<u32>,
  pub flags: Option<Vec<String>>,
  pub modseq: Option<u64>,
  pub internaldate: Option<String>,
  pub size: Option<u32>,
  pub envelope: Option<email::Envelope>,
  pub body: Option<email::Body>,
  pub section: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq)]
pub enum UntaggedData {
  Condition {
    status: parser::Status,
    code: Option<Code>,
    text: String,
  },
  Capability(Vec<String>),
  Enabled(Vec<String>),
  Flags(Vec<String>),
  List {
    flags: Vec<String>,
    separator: Option<char>,
    mailbox: Vec<u8>,
    subscribed: bool,
  },
  Status {
    mailbox: Vec<u8>,
    status: parser::StatusData,
  },
  Search(Vec<u32>),
  Exists(u32),
  Recent(u32),
  Expunge(u32),
  Fetch(FetchData),
  Vanished {
    earlier: bool,
    uids: Vec<(u32, u32)>,
  },
}

fn own_untagged(untagged: parser::Untagged<'_>) -> UntaggedData {
  match untagged {
    parser::Untagged::Condition(condition) => UntaggedData::Condition {
      status: condition.status,
      code: condition.code.map(own_code),
      text: String::from_utf8_lossy(condition.text).to_string(),
    },
    parser::Untagged::Capability(cs) => UntaggedData::Capability(own_strings(cs)),
    parser::Untagged::Enabled(cs) => UntaggedData::Enabled(own_strings(cs)),
    parser::Untagged::Flags(fs) => UntaggedData::Flags(own_strings(fs)),
    parser::Untagged::List { flags, separator, mailbox, subscribed } => UntaggedData::List {
      flags: own_strings(flags),
      separator: separator.map(char::from),
      mailbox: mailbox.into_bytes(),
      subscribed,
    },
    parser::Untagged::Status { mailbox, status } => UntaggedData::Status {
      mailbox: mailbox.into_bytes(),
      status,
    },
    parser::Untagged::Search(ns) => UntaggedData::Search(ns),
    parser::Untagged::Exists(n) => UntaggedData::Exists(n),
    parser::Untagged::Recent(n) => UntaggedData::Recent(n),
    parser::Untagged::Expunge(n) => UntaggedData::Expunge(n),
    parser::Untagged::Fetch { msn, atts } => {
      let mut data = FetchData {
        msn,
        ..FetchData::default()
      };
      for att in atts {
        match att {
          parser::FetchAtt::Flags(fs) => data.flags = Some(own_strings(fs)),
          parser::FetchAtt::Uid(uid) => data.uid = Some(uid),
          parser::FetchAtt::ModSeq(modseq) => data.modseq = Some(modseq),
          parser::FetchAtt::InternalDate(date) => data.internaldate = Some(date),
          parser::FetchAtt::Rfc822Size(size) => data.size = Some(size),
          parser::FetchAtt::Envelope(envelope) => data.envelope = Some(*envelope),
          parser::FetchAtt::Body(body) => data.body = Some(*body),
          parser::FetchAtt::Section { payload, .. } => {
            data.section = payload.map(|payload| payload.into_owned())
          }
        }
      }
      UntaggedData::Fetch(data)
    }
    parser::Untagged::Vanished { earlier, uids } => UntaggedData::Vanished {
      earlier,
      uids: own_ranges(uids),
    },
  }
}

#[derive(Debug, PartialEq)]
pub enum Event {
  NeedContinuation(Vec<u8>),
  Completed {
    tag: String,
    status: CommandStatus,
    code: Option<Code>,
    text: String,
  },
  Untagged(UntaggedData),
}

#[derive(Debug, PartialEq)]
pub struct Completion {
  pub status: CommandStatus,
  pub code: Option<Code>,
  pub text: String,
}

impl Completion {
  // The common policy: NO fails the command, BAD means the session can't be trusted.
  pub fn ok(self) -> anyhow::Result<Completion> {
    match self.status {
      CommandStatus::Ok => Ok(self),
      CommandStatus::No => {
        Err(anyhow::Error::new(crate::Error::ServerNo).context(self.text))
      }
      CommandStatus::Bad => {
        Err(anyhow::Error::new(crate::Error::ProtocolError).context(self.text))
      }
    }
  }
}

// One piece of an outgoing command. Literals either synchronise on a "+" continuation or use
// LITERAL+ when the server advertised it. Secret parts never reach the logs.
#[derive(Clone, Debug)]
pub enum Part {
  Text(String),
  Secret(String),
  Literal(Vec<u8>),
}

impl Part {
  pub fn text(text: impl Into<String>) -> Part {
    Part::Text(text.into())
  }
}

pub struct CommandQueue<RW> {
  stream: Stream<RW>,
  // Tag prefix rotor and counter: "a0000", "a0001", ... "b0000" once the counter wraps.
  seqid: u8,
  counter: u16,
  slots: VecDeque<Slot>,
  // Serialised commands not yet written to the wire.
  backlog: Vec<u8>,
  pipeline_depth: usize,
  pub literal_plus: bool,
}

impl<RW> CommandQueue<RW>
where
  RW: ReadWrite,
{
  pub fn new(stream: Stream<RW>, pipeline_depth: usize) -> CommandQueue<RW> {
    CommandQueue {
      stream,
      seqid: 0,
      counter: 0,
      slots: VecDeque::new(),
      backlog: Vec::new(),
      pipeline_depth,
      literal_plus: false,
    }
  }

  // For TLS upgrades and compression enablement; only sound between commands, which the type
  // can't see but the two call sites guarantee.
  pub fn try_map_stream<RW2, F>(self, map: F) -> anyhow::Result<CommandQueue<RW2>>
  where
    F: FnOnce(Stream<RW>) -> anyhow::Result<Stream<RW2>>,
  {
    Ok(CommandQueue {
      stream: map(self.stream)?,
      seqid: self.seqid,
      counter: self.counter,
      slots: self.slots,
      backlog: self.backlog,
      pipeline_depth: self.pipeline_depth,
      literal_plus: self.literal_plus,
    })
  }

  pub fn idle(&self) -> std::time::Duration {
    self.stream.idle()
  }

  pub fn into_stream(self) -> Stream<RW> {
    self.stream
  }

  fn next_tag(&mut self) -> String {
    let tag = format!("{}{:04}", char::from(b'a' + self.seqid), self.counter);
    self.counter += 1;
    if self.counter == 10000 {
      self.counter = 0;
      self.seqid = (self.seqid + 1) % 26;
    }
    tag
  }

  pub fn outstanding(&self) -> usize {
    self.slots.len()
  }

  // The greeting is the one line that arrives outside the tagged discipline.
  pub fn greeting(&mut self) -> anyhow::Result<(parser::Status, Option<Code>)> {
    let line = self.stream.readln()?;
    let condition = grammar::greeting(&line)
      .map_err(|_| anyhow::Error::new(crate::Error::ProtocolError))
      .with_context(|| codec::summarize(&line))?;
    Ok((condition.status, condition.code.map(own_code)))
  }

  // A literal bigger than this is a lying or hostile server, not a message.
  const MAX_LITERAL: u32 = 128 * 1024 * 1024;

  // Reads one logical line: a physical line plus any literals it announces.
  fn read_logical_line(&mut self) -> anyhow::Result<Vec<u8>> {
    let mut assembled = Vec::new();
    loop {
      let line = self.stream.readln()?;
      let literal = grammar::trailing_literal(&line).ok();
      assembled.extend_from_slice(&line);
      match literal {
        Some(length) if length > Self::MAX_LITERAL => {
          return Err(anyhow::Error::new(crate::Error::ProtocolError))
            .with_context(|| format!("refusing a {length} byte literal"));
        }
        Some(length) => {
          assembled.extend_from_slice(&self.stream.read_exact(length as usize)?)
        }
        None => break,
      }
    }
    Ok(assembled)
  }

  // One protocol step: read a server line and turn it into an event. Untagged data carries no
  // completion; a tagged line resolves its slot.
  pub fn step(&mut self) -> anyhow::Result<Event> {
    let line = self.read_logical_line()?;
    let response = grammar::response(&line)
      .map_err(|_| anyhow::Error::new(crate::Error::ProtocolError))
      .with_context(|| codec::summarize(&line))?;
    match response {
      parser::Response::Continuation(text) => Ok(Event::NeedContinuation(text.to_vec())),
      parser::Response::Untagged(untagged) => Ok(Event::Untagged(own_untagged(untagged))),
      parser::Response::Tagged { tag, condition } => {
        let position = self
          .slots
          .iter()
          .position(|slot| slot.tag.as_bytes() == tag && slot.state == SlotState::Sent)
          .ok_or_else(|| anyhow::Error::new(crate::Error::ProtocolError))
          .with_context(|| format!("unexpected tag {}", codec::escape(tag)))?;
        let mut slot = self.slots.remove(position).unwrap();
        slot.state = SlotState::Completed;
        let status = match condition.status {
          parser::Status::Ok => CommandStatus::Ok,
          parser::Status::No => CommandStatus::No,
          parser::Status::Bad => CommandStatus::Bad,
          parser::Status::Bye | parser::Status::Preauth => {
            return Err(anyhow::Error::new(crate::Error::ProtocolError))
              .with_context(|| codec::summarize(&line))
          }
        };
        Ok(Event::Completed {
          tag: slot.tag,
          status,
          code: condition.code.map(own_code),
          text: String::from_utf8_lossy(condition.text).to_string(),
        })
      }
    }
  }

  fn write_backlog(&mut self) -> anyhow::Result<()> {
    if self.backlog.is_empty() {
      return Ok(());
    }
    let backlog = std::mem::take(&mut self.backlog);
    self.stream.send(&[&backlog], 1)?;
    for slot in self.slots.iter_mut() {
      if slot.state == SlotState::Queued {
        slot.state = SlotState::Sent;
      }
    }
    Ok(())
  }

  // One event off the wire while draining a full pipeline; a failed queued command aborts.
  fn drain_one(&mut self, events: &mut Vec<Event>) -> anyhow::Result<()> {
    self.write_backlog()?;
    match self.step()? {
      Event::Completed { status: CommandStatus::No, text, .. } => {
        Err(anyhow::Error::new(crate::Error::ServerNo).context(text))
      }
      Event::Completed { status: CommandStatus::Bad, text, .. } => {
        Err(anyhow::Error::new(crate::Error::ProtocolError).context(text))
      }
      event => {
        events.push(event);
        Ok(())
      }
    }
  }

  // Writes the command now, driving continuations for any literal parts. Events observed while
  // waiting for a "+" are handed back for the caller to apply.
  fn transmit(&mut self, tag: &str, parts: &[Part]) -> anyhow::Result<Vec<Event>> {
    self.write_backlog()?;
    let mut events = Vec::new();
    self.stream.send(&[tag.as_bytes(), b" "], 2)?;
    for part in parts {
      match part {
        Part::Text(text) => self.stream.send(&[text.as_bytes()], 1)?,
        Part::Secret(text) => self.stream.send(&[text.as_bytes()], 0)?,
        Part::Literal(bytes) => {
          // https://www.rfc-editor.org/rfc/rfc7888#section-3
          let marker = if self.literal_plus {
            format!("{{{}+}}\r\n", bytes.len())
          } else {
            format!("{{{}}}\r\n", bytes.len())
          };
          self.stream.send(&[marker.as_bytes()], 1)?;
          if !self.literal_plus {
            loop {
              match self.step()? {
                Event::NeedContinuation(_) => break,
                // The server may refuse the literal with an early tagged NO.
                Event::Completed {
                  tag: completed,
                  status,
                  text,
                  ..
                } if completed == tag => {
                  let kind = match status {
                    CommandStatus::Bad => crate::Error::ProtocolError,
                    _ => crate::Error::ServerNo,
                  };
                  return Err(anyhow::Error::new(kind).context(text));
                }
                event => events.push(event),
              }
            }
          }
          self.stream.send(&[bytes], 0)?;
        }
      }
    }
    self.stream.send(&[b"\r\n"], 0)?;
    Ok(events)
  }

  // Sends a command and returns its tag without waiting for completion.
  pub fn send(&mut self, parts: &[Part]) -> anyhow::Result<(String, Vec<Event>)> {
    // The pipeline is bounded; drain the oldest before over-filling.
    let mut events = Vec::new();
    while self.slots.len() >= self.pipeline_depth + 2 {
      self.drain_one(&mut events)?;
    }
    let tag = self.next_tag();
    self.slots.push_back(Slot {
      tag: tag.clone(),
      // Sent already: the transmit below may observe this command's own completion.
      state: SlotState::Sent,
    });
    let transmit_events = self.transmit(&tag, parts)?;
    events.extend(transmit_events);
    Ok((tag, events))
  }

  // Serialises a literal-free command into the backlog; nothing touches the wire until the next
  // send, wait or flush. Literal parts would need continuations, so they refuse to queue unless
  // LITERAL+ lets them go in one piece.
  pub fn queue(&mut self, parts: &[Part]) -> anyhow::Result<(String, Vec<Event>)> {
    let mut events = Vec::new();
    while self.slots.len() >= self.pipeline_depth + 2 {
      self.drain_one(&mut events)?;
    }
    // Serialise aside first so a refusal can't leave half a command in the backlog.
    let mut serialised = Vec::new();
    for part in parts {
      match part {
        Part::Text(text) => serialised.extend_from_slice(text.as_bytes()),
        // The backlog is logged wholesale on write; secrets don't belong in it.
        Part::Secret(_) => anyhow::bail!("can't queue a secret part"),
        Part::Literal(bytes) => {
          anyhow::ensure!(
            self.literal_plus,
            "can't queue a literal without LITERAL+"
          );
          serialised.extend_from_slice(format!("{{{}+}}\r\n", bytes.len()).as_bytes());
          serialised.extend_from_slice(bytes);
        }
      }
    }
    let tag = self.next_tag();
    self.backlog.extend_from_slice(tag.as_bytes());
    self.backlog.push(b' ');
    self.backlog.extend_from_slice(&serialised);
    self.backlog.extend_from_slice(b"\r\n");
    self.slots.push_back(Slot {
      tag: tag.clone(),
      state: SlotState::Queued,
    });
    Ok((tag, events))
  }

  // Steps until `tag` completes; everything else seen on the way is returned as events.
  pub fn wait(&mut self, tag: &str) -> anyhow::Result<(Completion, Vec<Event>)> {
    self.write_backlog()?;
    let mut events = Vec::new();
    loop {
      match self.step()? {
        Event::Completed {
          tag: completed,
          status,
          code,
          text,
        } if completed == tag => {
          return Ok((Completion { status, code, text }, events));
        }
        event => events.push(event),
      }
    }
  }

  // Send and wait; the usual shape for unpipelined commands.
  pub fn exec(&mut self, parts: &[Part]) -> anyhow::Result<(Completion, Vec<Event>)> {
    let (tag, mut events) = self.send(parts)?;
    let (completion, wait_events) = self.wait(&tag)?;
    events.extend(wait_events);
    Ok((completion, events))
  }

  // Drains every outstanding slot. A NO or BAD on any queued command aborts the drain; the
  // caller marks the mailbox inconsistent.
  pub fn flush(&mut self) -> anyhow::Result<Vec<Event>> {
    self.write_backlog()?;
    let mut events = Vec::new();
    while let Some(slot) = self.slots.front() {
      let tag = slot.tag.clone();
      let (completion, wait_events) = self.wait(&tag)?;
      events.extend(wait_events);
      completion.ok()?;
    }
    Ok(events)
  }

  // Answers a server challenge during AUTHENTICATE; `payload` is already encoded.
  pub fn respond(&mut self, payload: &[u8], log: bool) -> anyhow::Result<()> {
    self
      .stream
      .send(&[payload, b"\r\n"], if log { 2 } else { 0 })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::testing::Script;
  use pretty_assertions::assert_eq;

  fn queue_over(script: &'static [u8]) -> CommandQueue<Script> {
    CommandQueue::new(Stream::new(Script::new(script)), 2)
  }

  #[test]
  fn exec_resolves_its_tag() {
    let mut queue = queue_over(b"* 3 EXISTS\r\na0000 OK NOOP done\r\n");
    let (completion, events) = queue.exec(&[Part::text("NOOP")]).unwrap();
    assert_eq!(CommandStatus::Ok, completion.status);
    assert_eq!(vec![Event::Untagged(UntaggedData::Exists(3))], events);
    assert_eq!(0, queue.outstanding());
  }

  #[test]
  fn tags_rotate() {
    let mut queue = queue_over(b"");
    assert_eq!("a0000", queue.next_tag());
    assert_eq!("a0001", queue.next_tag());
    queue.counter = 9999;
    assert_eq!("a9999", queue.next_tag());
    assert_eq!("b0000", queue.next_tag());
    queue.seqid = 25;
    queue.counter = 9999;
    assert_eq!("z9999", queue.next_tag());
    assert_eq!("a0000", queue.next_tag());
  }

  #[test]
  fn queued_commands_share_one_write() {
    let mut queue = queue_over(
      b"a0000 OK done\r\n\
        a0001 OK done\r\n",
    );
    queue.queue(&[Part::text("NOOP")]).unwrap();
    queue.queue(&[Part::text("CHECK")]).unwrap();
    // Nothing on the wire yet.
    assert_eq!(2, queue.outstanding());
    queue.flush().unwrap();
    assert_eq!(0, queue.outstanding());
    let outgoing = queue.stream.into_rw().outgoing;
    assert_eq!(b"a0000 NOOP\r\na0001 CHECK\r\n".to_vec(), outgoing);
  }

  #[test]
  fn flush_aborts_on_no() {
    let mut queue = queue_over(
      b"a0000 OK done\r\n\
        a0001 NO nope\r\n",
    );
    queue.queue(&[Part::text("NOOP")]).unwrap();
    queue.queue(&[Part::text("CHECK")]).unwrap();
    let error = queue.flush().unwrap_err();
    assert_eq!(
      Some(&crate::Error::ServerNo),
      error.downcast_ref::<crate::Error>()
    );
  }

  #[test]
  fn literals_wait_for_continuation() {
    let mut queue = queue_over(
      b"+ go ahead\r\n\
        a0000 OK APPEND done\r\n",
    );
    let (completion, _) = queue
      .exec(&[
        Part::text("APPEND INBOX (\\Seen) "),
        Part::Literal(b"From: a\r\n\r\nbody".to_vec()),
      ])
      .unwrap();
    assert_eq!(CommandStatus::Ok, completion.status);
    let outgoing = queue.stream.into_rw().outgoing;
    assert_eq!(
      b"a0000 APPEND INBOX (\\Seen) {15}\r\nFrom: a\r\n\r\nbody\r\n".to_vec(),
      outgoing
    );
  }

  #[test]
  fn literal_plus_skips_the_continuation() {
    let mut queue = queue_over(b"a0000 OK APPEND done\r\n");
    queue.literal_plus = true;
    queue
      .exec(&[Part::text("APPEND INBOX "), Part::Literal(b"x".to_vec())])
      .unwrap();
    let outgoing = queue.stream.into_rw().outgoing;
    assert_eq!(b"a0000 APPEND INBOX {1+}\r\nx\r\n".to_vec(), outgoing);
  }

  #[test]
  fn bad_is_a_protocol_error() {
    let mut queue = queue_over(b"a0000 BAD syntax\r\n");
    let (completion, _) = queue.exec(&[Part::text("BOGUS")]).unwrap();
    let error = completion.ok().unwrap_err();
    assert_eq!(
      Some(&crate::Error::ProtocolError),
      error.downcast_ref::<crate::Error>()
    );
  }

  #[test]
  fn unknown_tags_are_rejected() {
    let mut queue = queue_over(b"zzzz OK hm\r\n");
    queue.send(&[Part::text("NOOP")]).unwrap();
    let error = queue.step().unwrap_err();
    assert_eq!(
      Some(&crate::Error::ProtocolError),
      error.downcast_ref::<crate::Error>()
    );
  }

  #[test]
  fn fetch_events_fold_attributes() {
    let mut queue = queue_over(
      b"* 1 FETCH (UID 7 FLAGS (\\Seen \\Flagged) MODSEQ (12) RFC822.SIZE 100)\r\n\
        a0000 OK done\r\n",
    );
    let (_, events) = queue.exec(&[Part::text("NOOP")]).unwrap();
    assert_eq!(
      vec![Event::Untagged(UntaggedData::Fetch(FetchData {
        msn: 1,
        uid: Some(7),
        flags: Some(vec!["\\Seen".to_string(), "\\Flagged".to_string()]),
        modseq: Some(12),
        size: Some(100),
        ..FetchData::default()
      }))],
      events
    );
  }

  #[test]
  fn greeting_carries_capabilities() {
    let mut queue =
      queue_over(b"* OK [CAPABILITY IMAP4rev1 LITERAL+ AUTH=PLAIN] Dovecot ready.\r\n");
    let (status, code) = queue.greeting().unwrap();
    assert_eq!(parser::Status::Ok, status);
    assert_eq!(
      Some(Code::Capability(vec![
        "IMAP4rev1".to_string(),
        "LITERAL+".to_string(),
        "AUTH=PLAIN".to_string(),
      ])),
      code
    );
  }
}
