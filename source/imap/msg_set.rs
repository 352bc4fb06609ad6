// https://www.rfc-editor.org/rfc/rfc3501#section-9 - sequence-set
// https://www.rfc-editor.org/rfc/rfc7162#section-4 - [...] a client should limit the length of
// the command lines it generates to approximately 8192 octets.

use crate::{
  email::Email,
  mailbox::{Mailbox, Sort},
};

pub const MAX_CMDLEN: usize = 8192;

// A sorted, deduplicated set of UIDs with the compressed wire form: consecutive runs collapse to
// "a:b", singletons stay bare.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UidSet {
  uids: Vec<u32>,
}

impl UidSet {
  pub fn new(mut uids: Vec<u32>) -> UidSet {
    uids.sort_unstable();
    uids.dedup();
    UidSet { uids }
  }

  pub fn len(&self) -> usize {
    self.uids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.uids.is_empty()
  }

  pub fn uids(&self) -> &[u32] {
    &self.uids
  }

  // Appends items to `out` starting at element `*pos`, never growing `out` past `budget` bytes.
  // Returns how many UIDs were consumed; zero means the set is exhausted (or the very first item
  // wouldn't fit, which only happens with an unreasonably small budget).
  pub fn compress(&self, out: &mut String, pos: &mut usize, budget: usize) -> usize {
    let mut consumed = 0;
    while *pos < self.uids.len() {
      let start = self.uids[*pos];
      let mut end_at = *pos;
      while end_at + 1 < self.uids.len() && self.uids[end_at + 1] == self.uids[end_at] + 1 {
        end_at += 1;
      }
      // A run that stops at the final element still closes with ":last"; a final singleton is
      // written bare.
      let item = if end_at == *pos {
        format!("{start}")
      } else {
        format!("{start}:{}", self.uids[end_at])
      };
      let separator = usize::from(!out.is_empty());
      if out.len() + separator + item.len() > budget {
        break;
      }
      if separator == 1 {
        out.push(',');
      }
      out.push_str(&item);
      consumed += end_at - *pos + 1;
      *pos = end_at + 1;
    }
    consumed
  }

  pub fn to_string_unbounded(&self) -> String {
    let mut out = String::new();
    let mut pos = 0;
    self.compress(&mut out, &mut pos, usize::MAX);
    out
  }
}

// Expands "1:4,6,8:10" back into the sorted UID list.
pub fn parse(input: &str) -> Option<Vec<u32>> {
  let mut uids = Vec::new();
  for item in input.split(',') {
    match item.split_once(':') {
      Some((start, end)) => {
        let (start, end) = (start.parse::<u32>().ok()?, end.parse::<u32>().ok()?);
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        uids.extend(start..=end);
      }
      None => uids.push(item.parse().ok()?),
    }
  }
  uids.sort_unstable();
  uids.dedup();
  Some(uids)
}

// Restores the mailbox sort key when emission is over, error paths included.
struct SortGuard<'a> {
  mailbox: &'a mut Mailbox,
  saved: Sort,
}

impl<'a> SortGuard<'a> {
  fn new(mailbox: &'a mut Mailbox) -> SortGuard<'a> {
    let saved = mailbox.sort;
    mailbox.sort = Sort::Uid;
    SortGuard { mailbox, saved }
  }
}

impl Drop for SortGuard<'_> {
  fn drop(&mut self) {
    self.mailbox.sort = self.saved;
  }
}

// Collects the UIDs of active messages matching `predicate` and yields ready-to-send commands
// "<prefix> <uid-set> <postfix>", each within the command-line budget.
pub fn build(
  mailbox: &mut Mailbox,
  prefix: &str,
  postfix: &str,
  invert: bool,
  predicate: impl Fn(&Email) -> bool,
) -> Vec<(String, usize)> {
  let guard = SortGuard::new(mailbox);
  let uids = UidSet::new(
    guard
      .mailbox
      .emails
      .iter()
      .filter(|email| email.active && predicate(email) != invert)
      .filter_map(|email| email.imap().map(|data| data.uid))
      .filter(|uid| *uid != 0)
      .collect(),
  );
  let overhead = prefix.len() + 1 + if postfix.is_empty() { 0 } else { postfix.len() + 1 };
  let budget = MAX_CMDLEN.saturating_sub(overhead);
  let mut commands = Vec::new();
  let mut pos = 0;
  loop {
    let mut set = String::new();
    let consumed = uids.compress(&mut set, &mut pos, budget);
    if consumed == 0 {
      break;
    }
    let command = if postfix.is_empty() {
      format!("{prefix} {set}")
    } else {
      format!("{prefix} {set} {postfix}")
    };
    commands.push((command, consumed));
  }
  commands
}
