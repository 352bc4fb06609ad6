// Ordered scoring rules applied to each message; thresholds turn totals into automatic flag
// changes. A rule marked exact (or valued +-9999) ends evaluation for that message.

use crate::{
  email::Email,
  mailbox::{FlagBit, Mailbox, Sort},
};
use anyhow::Context as _;

const SHORT_CIRCUIT: i64 = 9999;

#[derive(Debug)]
struct Rule {
  pattern: regex::Regex,
  value: i64,
  exact: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Thresholds {
  pub read: Option<i64>,
  pub flag: Option<i64>,
  pub delete: Option<i64>,
}

#[derive(Debug, Default)]
pub struct Scoring {
  rules: Vec<Rule>,
  need_rescore: bool,
}

impl Scoring {
  pub fn add(&mut self, pattern: &str, value: i64, exact: bool) -> anyhow::Result<()> {
    let pattern = regex::Regex::new(pattern)
      .with_context(|| format!("invalid score pattern {pattern:?}"))?;
    self.rules.push(Rule {
      pattern,
      value,
      exact,
    });
    self.need_rescore = true;
    Ok(())
  }

  pub fn clear(&mut self) {
    self.rules.clear();
    self.need_rescore = true;
  }

  pub fn need_rescore(&self) -> bool {
    self.need_rescore
  }

  // Matches against the fields scoring traditionally sees: sender and subject.
  fn matches(rule: &Rule, email: &Email) -> bool {
    let envelope = &email.envelope;
    envelope
      .from
      .as_deref()
      .is_some_and(|from| rule.pattern.is_match(from))
      || envelope
        .real_subj()
        .is_some_and(|subject| rule.pattern.is_match(subject))
  }

  pub fn score(&self, email: &Email) -> i64 {
    let mut total = 0;
    for rule in &self.rules {
      if !Self::matches(rule, email) {
        continue;
      }
      total += rule.value;
      if rule.exact || rule.value.abs() == SHORT_CIRCUIT {
        break;
      }
    }
    total
  }

  // Rescoring every message; returns whether the caller should resort (only when the visible
  // order actually depends on scores).
  pub fn apply(&mut self, mailbox: &mut Mailbox, thresholds: &Thresholds) -> bool {
    for index in 0..mailbox.emails.len() {
      if !mailbox.emails[index].active {
        continue;
      }
      let score = self.score(&mailbox.emails[index]);
      if let Some(read) = thresholds.read {
        if score <= read {
          mailbox.set_flag(index, FlagBit::Read, true);
        }
      }
      if let Some(flag) = thresholds.flag {
        if score >= flag {
          mailbox.set_flag(index, FlagBit::Flagged, true);
        }
      }
      if let Some(delete) = thresholds.delete {
        if score <= delete {
          mailbox.set_flag(index, FlagBit::Deleted, true);
        }
      }
    }
    self.need_rescore = false;
    mailbox.sort == Sort::Score
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::email::Envelope;
  use crate::mailbox::Kind;
  use pretty_assertions::assert_eq;

  fn email(from: &str, subject: &str) -> Email {
    let mut envelope = Envelope {
      from: Some(from.to_string()),
      subject: Some(subject.to_string()),
      ..Envelope::default()
    };
    envelope.compute_real_subj(&regex::Regex::new(crate::email::DEFAULT_REPLY_REGEX).unwrap());
    Email::new(envelope, 0)
  }

  #[test]
  fn scores_sum_in_rule_order() {
    let mut scoring = Scoring::default();
    scoring.add("boss@example", 10, false).unwrap();
    scoring.add("URGENT", 5, false).unwrap();
    assert_eq!(15, scoring.score(&email("boss@example.com", "URGENT: budget")));
    assert_eq!(10, scoring.score(&email("boss@example.com", "lunch")));
    assert_eq!(0, scoring.score(&email("noreply@example.com", "newsletter")));
  }

  #[test]
  fn exact_rules_stop_evaluation() {
    let mut scoring = Scoring::default();
    scoring.add("list@", 1, true).unwrap();
    scoring.add("list@", 100, false).unwrap();
    assert_eq!(1, scoring.score(&email("list@example.com", "x")));

    let mut scoring = Scoring::default();
    scoring.add("spam", -9999, false).unwrap();
    scoring.add("spam", 1, false).unwrap();
    assert_eq!(-9999, scoring.score(&email("spam@example.com", "x")));
  }

  #[test]
  fn subjects_match_without_reply_prefixes() {
    let mut scoring = Scoring::default();
    scoring.add("^release", 7, false).unwrap();
    // "Re: release 1.2" scores because the pattern sees the stripped subject.
    assert_eq!(7, scoring.score(&email("a@x", "Re: release 1.2")));
  }

  #[test]
  fn thresholds_set_flags() {
    let mut mailbox = Mailbox::new(Kind::Mbox, crate::store::Path::local("scored"));
    mailbox.push(email("boss@example.com", "raise"));
    mailbox.push(email("spammer@junk.example", "offer"));
    mailbox.rebuild();

    let mut scoring = Scoring::default();
    scoring.add("boss@", 50, false).unwrap();
    scoring.add("junk.example", -50, false).unwrap();
    assert!(scoring.need_rescore());
    let thresholds = Thresholds {
      read: Some(-10),
      flag: Some(40),
      delete: Some(-40),
    };
    scoring.apply(&mut mailbox, &thresholds);
    assert!(!scoring.need_rescore());

    assert!(mailbox.emails[0].flags.flagged);
    assert!(!mailbox.emails[0].flags.read);
    assert!(mailbox.emails[1].flags.read);
    assert!(mailbox.emails[1].flags.deleted);
  }

  #[test]
  fn resort_only_when_sorting_by_score() {
    let mut mailbox = Mailbox::new(Kind::Mbox, crate::store::Path::local("scored"));
    let mut scoring = Scoring::default();
    assert!(!scoring.apply(&mut mailbox, &Thresholds::default()));
    mailbox.sort = Sort::Score;
    assert!(scoring.apply(&mut mailbox, &Thresholds::default()));
  }
}
