use mstore::{
  email::Flags,
  mailbox::{Check, FlagBit, Kind},
  store::{probe, MailStore as _, Session},
};
use std::{fs, io::Write as _};
use test_log::test;

mod common;

fn write_mbox(path: &std::path::Path, subjects: &[&str]) {
  let mut file = fs::File::create(path).unwrap();
  for (i, subject) in subjects.iter().enumerate() {
    if i > 0 {
      file.write_all(b"\n").unwrap();
    }
    file
      .write_all(b"From sender@example.com Thu Jan  1 12:00:00 2004\n")
      .unwrap();
    file
      .write_all(common::email(subject, "body text").as_bytes())
      .unwrap();
  }
  file.sync_all().unwrap();
}

#[test]
fn mbox_lifecycle_through_the_session() {
  let directory = tempfile::tempdir().unwrap();
  let path = directory.path().join("inbox");
  write_mbox(&path, &["one", "two", "three"]);
  let session = Session::new(common::config());

  let mut mailbox = session.open(path.to_str().unwrap(), false).unwrap();
  assert_eq!(Kind::Mbox, mailbox.kind());
  assert_eq!(3, mailbox.mailbox().msg_count());
  assert_eq!(3, mailbox.mailbox().counts.unread);

  // Read the second message, delete the third, push it all back.
  let body = mailbox.message(1).unwrap();
  assert!(String::from_utf8_lossy(&body).contains("Subject: two"));
  mailbox.mailbox_mut().set_flag(0, FlagBit::Read, true);
  mailbox.mailbox_mut().set_flag(2, FlagBit::Deleted, true);
  mailbox.sync().unwrap();
  assert_eq!(2, mailbox.mailbox().msg_count());
  mailbox.close().unwrap();

  // A fresh open sees what sync wrote.
  let mut mailbox = session.open(path.to_str().unwrap(), false).unwrap();
  assert_eq!(2, mailbox.mailbox().msg_count());
  assert!(mailbox.mailbox().emails[0].flags.read);
  assert_eq!(
    Some("two".to_string()),
    mailbox.mailbox().emails[1].envelope.subject
  );
  assert_eq!(1, mailbox.mailbox().counts.unread);
  mailbox.close().unwrap();
}

#[test]
fn external_appends_are_new_mail() {
  let directory = tempfile::tempdir().unwrap();
  let path = directory.path().join("inbox");
  write_mbox(&path, &["existing"]);
  let session = Session::new(common::config());
  let mut mailbox = session.open(path.to_str().unwrap(), false).unwrap();
  assert_eq!(Check::Ok, mailbox.check().unwrap());

  // A delivery agent appends a message starting exactly at the old end of file.
  let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
  file
    .write_all(
      format!(
        "From sender@example.com Thu Jan  1 13:00:00 2004\n{}",
        common::email("delivered", "fresh")
      )
      .as_bytes(),
    )
    .unwrap();
  file.sync_all().unwrap();
  drop(file);

  assert_eq!(Check::NewMail, mailbox.check().unwrap());
  assert_eq!(2, mailbox.mailbox().msg_count());
  assert_eq!(
    Some("delivered".to_string()),
    mailbox.mailbox().emails[1].envelope.subject
  );
  mailbox.close().unwrap();
}

#[test]
fn mmdf_is_probed_and_parsed() {
  let directory = tempfile::tempdir().unwrap();
  let path = directory.path().join("mmdf");
  fs::write(&path, b"\x01\x01\x01\x01\nFrom: a\n\nbody\n\x01\x01\x01\x01\n").unwrap();
  assert_eq!(Kind::Mmdf, probe(path.to_str().unwrap()).unwrap());

  let session = Session::new(common::config());
  let mailbox = session.open(path.to_str().unwrap(), false).unwrap();
  assert_eq!(Kind::Mmdf, mailbox.kind());
  assert_eq!(1, mailbox.mailbox().msg_count());
  assert_eq!(Some("a".to_string()), mailbox.mailbox().emails[0].envelope.from);
  mailbox.close().unwrap();
}

#[test]
fn appends_and_copies_between_local_mailboxes() {
  let directory = tempfile::tempdir().unwrap();
  let source_path = directory.path().join("source");
  let archive_path = directory.path().join("archive");
  write_mbox(&source_path, &["keep me"]);
  let session = Session::new(common::config());

  let mut source = session.open(source_path.to_str().unwrap(), false).unwrap();
  source
    .append(
      common::email("appended", "hello").as_bytes(),
      Flags {
        read: true,
        ..Flags::default()
      },
    )
    .unwrap();
  assert_eq!(2, source.mailbox().msg_count());

  source
    .copy_messages(&[0, 1], archive_path.to_str().unwrap())
    .unwrap();
  source.close().unwrap();

  let archive = session.open(archive_path.to_str().unwrap(), false).unwrap();
  assert_eq!(2, archive.mailbox().msg_count());
  assert_eq!(
    Some("keep me".to_string()),
    archive.mailbox().emails[0].envelope.subject
  );
  // The appended message kept its read flag through the copy.
  assert!(archive.mailbox().emails[1].flags.read);
  archive.close().unwrap();
}

#[test]
fn copies_across_backends_via_the_session() {
  let directory = tempfile::tempdir().unwrap();
  let source_path = directory.path().join("source");
  let target_path = directory.path().join("target");
  write_mbox(&source_path, &["moving"]);
  write_mbox(&target_path, &["already there"]);
  let session = Session::new(common::config());

  let mut source = session.open(source_path.to_str().unwrap(), false).unwrap();
  let mut target = session.open(target_path.to_str().unwrap(), false).unwrap();
  session
    .copy_across(source.as_mut(), &[0], target.as_mut())
    .unwrap();
  target.check().unwrap();
  assert_eq!(2, target.mailbox().msg_count());
  source.close().unwrap();
  target.close().unwrap();
}
