use std::io;

// A scripted peer for driving the protocol engines without a server: reads drain the canned
// bytes, writes accumulate for later inspection.
pub struct Script {
  incoming: io::Cursor<Vec<u8>>,
  pub outgoing: Vec<u8>,
}

impl Script {
  pub fn new(incoming: &[u8]) -> Script {
    Script {
      incoming: io::Cursor::new(incoming.to_vec()),
      outgoing: Vec::new(),
    }
  }
}

impl mstore::connection::ReadWrite for Script {
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
    io::Read::read(&mut self.incoming, buffer)
  }

  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
    self.outgoing.extend_from_slice(buffer);
    Ok(())
  }
}

pub fn config() -> mstore::Config {
  mstore::Config {
    user: Some("user".to_string()),
    password: Some("secret".to_string()),
    tmp_dir: std::env::temp_dir(),
    ..mstore::Config::default()
  }
}

#[allow(dead_code)]
pub fn email(subject: &str, body: &str) -> String {
  format!(
    "From: sender@example.com\n\
     To: recipient@example.com\n\
     Subject: {subject}\n\
     Message-ID: <{subject}@example.com>\n\
     Date: Thu, 1 Jan 2004 12:00:00 +0000\n\
     \n\
     {body}\n"
  )
}
