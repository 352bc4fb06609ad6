use mstore::{
  connection::Stream,
  imap::{ImapMailbox, Opening},
  mailbox::FlagBit,
  pop,
  store::{MailStore as _, Url},
};
use test_log::test;

mod common;

fn imap_url() -> Url {
  Url::parse("imap://user@example.com/INBOX").unwrap()
}

// Greeting, AUTHENTICATE PLAIN, SELECT with two messages and a full header fetch.
fn first_session_script() -> String {
  "* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready\r\n\
   + \r\n\
   a0000 OK [CAPABILITY IMAP4rev1 AUTH=PLAIN UIDPLUS] done\r\n\
   * 2 EXISTS\r\n\
   * OK [UIDVALIDITY 77] v\r\n\
   * OK [UIDNEXT 12] n\r\n\
   a0001 OK [READ-WRITE] selected\r\n\
   * 1 FETCH (UID 10 FLAGS () INTERNALDATE \"01-Jan-2020 00:00:00 +0000\" RFC822.SIZE 64 ENVELOPE (\"Wed, 1 Jan 2020 00:00:00 +0000\" \"cached subject\" ((\"Alice\" NIL \"alice\" \"example.com\")) NIL NIL NIL NIL NIL NIL \"<m1@example.com>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 64 2))\r\n\
   * 2 FETCH (UID 11 FLAGS (\\Seen) INTERNALDATE \"01-Jan-2020 00:00:00 +0000\" RFC822.SIZE 64 ENVELOPE (\"Wed, 1 Jan 2020 00:00:00 +0000\" \"second subject\" ((NIL NIL \"bob\" \"example.com\")) NIL NIL NIL NIL NIL NIL \"<m2@example.com>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 64 2))\r\n\
   a0002 OK fetched\r\n\
   a0003 OK examined\r\n\
   * BYE see you\r\n\
   a0004 OK logout\r\n"
    .to_string()
}

// Same mailbox later: UIDVALIDITY still 77, so headers come from the cache and only flags travel.
fn second_session_script() -> String {
  "* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready\r\n\
   + \r\n\
   a0000 OK [CAPABILITY IMAP4rev1 AUTH=PLAIN UIDPLUS] done\r\n\
   * 2 EXISTS\r\n\
   * OK [UIDVALIDITY 77] v\r\n\
   * OK [UIDNEXT 12] n\r\n\
   a0001 OK [READ-WRITE] selected\r\n\
   * 1 FETCH (UID 10 FLAGS (\\Flagged))\r\n\
   * 2 FETCH (UID 11 FLAGS (\\Seen))\r\n\
   a0002 OK fetched\r\n\
   a0003 OK examined\r\n\
   * BYE see you\r\n\
   a0004 OK logout\r\n"
    .to_string()
}

fn open_imap(script: &str, config: &mstore::Config) -> ImapMailbox<common::Script> {
  let stream = Stream::new(common::Script::new(script.as_bytes()));
  let mut opening = Opening::start(stream, config.imap_pipeline_depth).unwrap();
  opening.authenticate(&imap_url(), config, true).unwrap();
  ImapMailbox::select(opening, imap_url(), config, false).unwrap()
}

#[test]
fn headers_survive_sessions_through_the_cache() {
  let cache = tempfile::tempdir().unwrap();
  let config = mstore::Config {
    header_cache: Some(cache.path().to_path_buf()),
    ..common::config()
  };

  let imap = open_imap(&first_session_script(), &config);
  assert_eq!(2, imap.mailbox().msg_count());
  assert_eq!(
    Some("cached subject".to_string()),
    imap.mailbox().emails[0].envelope.subject
  );
  Box::new(imap).close().unwrap();

  // The second session's FETCH responses carry no envelopes at all; the subjects can only have
  // come from the header cache.
  let imap = open_imap(&second_session_script(), &config);
  assert_eq!(2, imap.mailbox().msg_count());
  assert_eq!(
    Some("cached subject".to_string()),
    imap.mailbox().emails[0].envelope.subject
  );
  assert_eq!(
    Some("Alice <alice@example.com>".to_string()),
    imap.mailbox().emails[0].envelope.from
  );
  // And the flags are the server's fresh view.
  assert!(imap.mailbox().emails[0].flags.flagged);
  assert!(imap.mailbox().emails[1].flags.read);
  Box::new(imap).close().unwrap();
}

#[test]
fn flag_edits_round_trip_over_the_wire() {
  let config = common::config();
  let script = "* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready\r\n\
     + \r\n\
     a0000 OK [CAPABILITY IMAP4rev1 AUTH=PLAIN UIDPLUS] done\r\n\
     * 1 EXISTS\r\n\
     * OK [UIDVALIDITY 77] v\r\n\
     * OK [UIDNEXT 2] n\r\n\
     a0001 OK selected\r\n\
     * 1 FETCH (UID 1 FLAGS () RFC822.SIZE 5 ENVELOPE (NIL \"x\" NIL NIL NIL NIL NIL NIL NIL \"<x@x>\") BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 5 1))\r\n\
     a0002 OK fetched\r\n\
     * 1 FETCH (UID 1 FLAGS (\\Seen))\r\n\
     a0003 OK stored\r\n";
  let mut imap = open_imap(script, &config);
  imap.mailbox_mut().set_flag(0, FlagBit::Read, true);
  imap.sync().unwrap();
  let email = &imap.mailbox().emails[0];
  assert!(email.flags.read);
  assert!(!email.changed);
}

#[test]
fn pop_session_end_to_end() {
  let config = mstore::Config {
    user: Some("mrose".to_string()),
    password: Some("tanstaaf".to_string()),
    ssl_force_tls: false,
    ..common::config()
  };
  let url = Url::parse("pop://mrose@example.com/").unwrap();
  // RFC 1939's APOP example timestamp and password.
  let script = "+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>\r\n\
     +OK\r\nTOP\r\nUIDL\r\n.\r\n\
     +OK maildrop locked and ready\r\n\
     +OK 1 120\r\n\
     +OK\r\n1 120\r\n.\r\n\
     +OK\r\n1 whqtswO00WBw418f9t5JxYwZ\r\n.\r\n\
     +OK\r\nFrom: pop@example.com\r\nSubject: via pop\r\n\r\n.\r\n\
     +OK message follows\r\nFrom: pop@example.com\r\nSubject: via pop\r\n\r\nthe body\r\n.\r\n\
     +OK deleted\r\n\
     +OK bye\r\n";
  let stream = Stream::new(common::Script::new(script.as_bytes()));
  let greeting = pop::greet(stream).unwrap();
  let mut mailbox = pop::PopMailbox::from_greeting(greeting, &url, &config, false).unwrap();
  assert_eq!(1, mailbox.mailbox().msg_count());
  assert_eq!(
    Some("via pop".to_string()),
    mailbox.mailbox().emails[0].envelope.subject
  );

  let body = mailbox.message(0).unwrap();
  assert!(String::from_utf8_lossy(&body).ends_with("the body\r\n"));

  mailbox.mailbox_mut().set_flag(0, FlagBit::Deleted, true);
  mailbox.sync().unwrap();
  assert_eq!(0, mailbox.mailbox().msg_count());
}
