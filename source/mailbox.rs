use crate::email::{Email, Flags};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
  Imap,
  Pop,
  Mbox,
  Mmdf,
}

// What a mailbox check observed since the last look.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
  Ok,
  NewMail,
  FlagsChanged,
  Reopened,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sort {
  // Insertion order; message-set emission requires this and restores the previous key after.
  #[default]
  Order,
  Uid,
  Date,
  Score,
  Subject,
}

// https://www.rfc-editor.org/rfc/rfc4314#section-2.1
// The subset of ACL rights the store consults before offering an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rights(u32);

impl Rights {
  pub const ALL: Rights = Rights(u32::MAX);

  pub fn parse(rights: &str) -> Rights {
    let mut bits = 0;
    for right in rights.chars() {
      if right.is_ascii_lowercase() {
        bits |= 1 << (u32::from(right) - u32::from('a'));
      }
    }
    Rights(bits)
  }

  pub fn has(&self, right: char) -> bool {
    debug_assert!(right.is_ascii_lowercase());
    self.0 & (1 << (u32::from(right) - u32::from('a'))) != 0
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagBit {
  Read,
  Old,
  Deleted,
  Flagged,
  Replied,
  Draft,
  Tagged,
  Purge,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
  pub tagged: usize,
  pub deleted: usize,
  pub new: usize,
  pub unread: usize,
  pub flagged: usize,
}

// Per-folder state shared by every backend. The backend owns protocol specifics; this type owns
// the email list and the visible-index mapping.
#[derive(Debug)]
pub struct Mailbox {
  pub kind: Kind,
  pub path: crate::store::Path,
  pub emails: Vec<Email>,
  // Visible position to real index; emails[v2r[v]].virtual_index == Some(v).
  pub v2r: Vec<usize>,
  pub counts: Counts,
  pub readonly: bool,
  pub dontwrite: bool,
  pub changed: bool,
  pub rights: Rights,
  pub mtime: Option<std::time::SystemTime>,
  pub sort: Sort,
}

impl Mailbox {
  pub fn new(kind: Kind, path: crate::store::Path) -> Mailbox {
    Mailbox {
      kind,
      path,
      emails: Vec::new(),
      v2r: Vec::new(),
      counts: Counts::default(),
      readonly: false,
      dontwrite: false,
      changed: false,
      rights: Rights::ALL,
      mtime: None,
      sort: Sort::default(),
    }
  }

  pub fn msg_count(&self) -> usize {
    self.emails.len()
  }

  pub fn vcount(&self) -> usize {
    self.v2r.len()
  }

  pub fn push(&mut self, mut email: Email) -> usize {
    let index = self.emails.len();
    email.index = index;
    self.emails.push(email);
    index
  }

  // Re-establishes every index-related invariant: emails[i].index == i, v2r lists the active
  // messages in order, and virtual_index mirrors v2r.
  pub fn rebuild(&mut self) {
    self.v2r.clear();
    for (index, email) in self.emails.iter_mut().enumerate() {
      email.index = index;
      if email.active {
        email.virtual_index = Some(self.v2r.len());
        self.v2r.push(index);
      } else {
        email.virtual_index = None;
      }
    }
    self.recount();
  }

  pub fn recount(&mut self) {
    let mut counts = Counts::default();
    for email in &self.emails {
      if !email.active {
        continue;
      }
      if email.tagged {
        counts.tagged += 1;
      }
      if email.flags.deleted {
        counts.deleted += 1;
      }
      if !email.flags.read {
        counts.unread += 1;
        if !email.flags.old {
          counts.new += 1;
        }
      }
      if email.flags.flagged {
        counts.flagged += 1;
      }
    }
    self.counts = counts;
  }

  // Drops messages that are no longer active (expunged or rewritten away) and renumbers the
  // survivors.
  pub fn compress(&mut self) {
    self.emails.retain(|email| email.active);
    self.rebuild();
  }

  // The one mutation the UI performs. Flag edits mark both the message and the mailbox dirty so
  // sync knows what to push; tag/purge are client-side and don't.
  pub fn set_flag(&mut self, index: usize, bit: FlagBit, value: bool) {
    let Some(email) = self.emails.get_mut(index) else {
      return;
    };
    let flag = match bit {
      FlagBit::Read => &mut email.flags.read,
      FlagBit::Old => &mut email.flags.old,
      FlagBit::Deleted => &mut email.flags.deleted,
      FlagBit::Flagged => &mut email.flags.flagged,
      FlagBit::Replied => &mut email.flags.replied,
      FlagBit::Draft => &mut email.flags.draft,
      FlagBit::Tagged => {
        if email.tagged != value {
          email.tagged = value;
          self.recount();
        }
        return;
      }
      FlagBit::Purge => {
        email.purge = value;
        return;
      }
    };
    if *flag != value {
      *flag = value;
      email.changed = true;
      self.changed = true;
      self.recount();
    }
  }

  pub fn flags_of(&self, index: usize) -> Option<Flags> {
    self.emails.get(index).map(|email| email.flags)
  }

  #[cfg(test)]
  pub fn assert_invariants(&self) {
    assert!(self.vcount() <= self.msg_count());
    for (index, email) in self.emails.iter().enumerate() {
      assert_eq!(index, email.index);
      if let Some(virtual_index) = email.virtual_index {
        assert_eq!(index, self.v2r[virtual_index]);
      }
    }
    for (virtual_index, &index) in self.v2r.iter().enumerate() {
      assert_eq!(Some(virtual_index), self.emails[index].virtual_index);
    }
  }
}
