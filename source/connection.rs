// https://www.rfc-editor.org/rfc/rfc4978 - The IMAP COMPRESS Extension
//
// The transport layer: a buffered line reader over anything byte-shaped, the rustls client
// stream, and the optional raw-deflate wrapping negotiated by COMPRESS=DEFLATE.

use crate::codec;
use anyhow::Context as _;
use std::{io, net, time};

pub trait ReadWrite {
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()>;
}

impl ReadWrite for net::TcpStream {
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
    io::Read::read(self, buffer)
  }

  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
    io::Write::write_all(self, buffer)
  }
}

#[ouroboros::self_referencing]
pub struct TLSStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ClientConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl ReadWrite for TLSStream {
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| io::Read::read(fields.tls_stream, buffer))
  }

  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
    self.with_mut(|fields| io::Write::write_all(fields.tls_stream, buffer))
  }
}

// Wraps an established TCP stream; used both for implicit TLS (imaps, pops) and for upgrades
// (STARTTLS, STLS) after the in-protocol handshake.
pub fn tls(tcp_stream: net::TcpStream, host: &str) -> anyhow::Result<TLSStream> {
  let mut root_store = rustls::RootCertStore::empty();
  for certificate in rustls_native_certs::load_native_certs()? {
    root_store.add(&rustls::Certificate(certificate.0))?
  }
  Ok(
    TLSStreamBuilder {
      tcp_stream,
      tls_connection: rustls::ClientConnection::new(
        std::sync::Arc::new(
          rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
        ),
        host
          .try_into()
          .with_context(|| format!("couldn't convert {host} to server name"))?,
      )?,
      tls_stream_builder: |tcp_stream, tls_connection| {
        rustls::Stream::new(tls_connection, tcp_stream)
      },
    }
    .build(),
  )
}

// https://www.rfc-editor.org/rfc/rfc4978#section-4
// Raw deflate (no zlib header) in both directions, each write flushed with a sync marker so the
// peer can decode it immediately.
pub struct Deflated<RW> {
  inner: RW,
  compress: flate2::Compress,
  decompress: flate2::Decompress,
  pending: Vec<u8>,
}

impl<RW> Deflated<RW> {
  pub fn new(inner: RW) -> Deflated<RW> {
    Deflated {
      inner,
      compress: flate2::Compress::new(flate2::Compression::default(), false),
      decompress: flate2::Decompress::new(false),
      pending: Vec::new(),
    }
  }
}

impl<RW> ReadWrite for Deflated<RW>
where
  RW: ReadWrite,
{
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
      if !self.pending.is_empty() {
        let before_in = self.decompress.total_in();
        let before_out = self.decompress.total_out();
        self
          .decompress
          .decompress(&self.pending, buffer, flate2::FlushDecompress::None)
          .map_err(io::Error::other)?;
        let consumed = (self.decompress.total_in() - before_in) as usize;
        let produced = (self.decompress.total_out() - before_out) as usize;
        self.pending.drain(..consumed);
        if produced > 0 {
          return Ok(produced);
        }
      }
      let mut chunk = [0; 32 * 1024];
      match self.inner.read(&mut chunk)? {
        0 => return Ok(0),
        length => self.pending.extend_from_slice(&chunk[..length]),
      }
    }
  }

  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
    let mut out = Vec::new();
    let before = self.compress.total_in();
    loop {
      out.reserve(buffer.len() / 2 + 128);
      let consumed = (self.compress.total_in() - before) as usize;
      self
        .compress
        .compress_vec(&buffer[consumed..], &mut out, flate2::FlushCompress::Sync)
        .map_err(io::Error::other)?;
      let consumed = (self.compress.total_in() - before) as usize;
      // The sync flush is complete once all input is in and the output buffer wasn't filled.
      if consumed == buffer.len() && out.len() < out.capacity() {
        break;
      }
    }
    self.inner.write_all(&out)
  }
}

// The concrete stack a session runs over. Compression wraps whichever of the two base transports
// is active; it can only be enabled, never undone.
pub enum Transport {
  Plain(net::TcpStream),
  Tls(TLSStream),
  PlainDeflate(Deflated<net::TcpStream>),
  TlsDeflate(Deflated<TLSStream>),
}

impl Transport {
  pub fn upgraded(self, host: &str) -> anyhow::Result<Transport> {
    match self {
      Transport::Plain(tcp_stream) => Ok(Transport::Tls(tls(tcp_stream, host)?)),
      _ => anyhow::bail!("TLS upgrade is only possible on a plaintext connection"),
    }
  }

  pub fn deflated(self) -> Transport {
    match self {
      Transport::Plain(tcp_stream) => Transport::PlainDeflate(Deflated::new(tcp_stream)),
      Transport::Tls(tls_stream) => Transport::TlsDeflate(Deflated::new(tls_stream)),
      deflated => deflated,
    }
  }
}

impl ReadWrite for Transport {
  fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
    match self {
      Transport::Plain(rw) => rw.read(buffer),
      Transport::Tls(rw) => rw.read(buffer),
      Transport::PlainDeflate(rw) => rw.read(buffer),
      Transport::TlsDeflate(rw) => rw.read(buffer),
    }
  }

  fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
    match self {
      Transport::Plain(rw) => rw.write_all(buffer),
      Transport::Tls(rw) => rw.write_all(buffer),
      Transport::PlainDeflate(rw) => rw.write_all(buffer),
      Transport::TlsDeflate(rw) => rw.write_all(buffer),
    }
  }
}

// Line-oriented view of a transport. Reads are buffered; `last_read` feeds the keep-alive
// observer that decides when an idle session needs a NOOP.
pub struct Stream<RW> {
  rw: RW,
  buffer: Vec<u8>,
  start: usize,
  last_read: time::Instant,
}

impl<RW> Stream<RW>
where
  RW: ReadWrite,
{
  pub fn new(rw: RW) -> Stream<RW> {
    Stream {
      rw,
      buffer: Vec::new(),
      start: 0,
      last_read: time::Instant::now(),
    }
  }

  // Swaps the underlying transport while keeping any buffered-but-unconsumed bytes, for TLS
  // upgrades and compression enablement (both happen at points where the buffer is empty anyway).
  pub fn map<RW2, F>(self, map: F) -> Stream<RW2>
  where
    F: FnOnce(RW) -> RW2,
  {
    Stream {
      rw: map(self.rw),
      buffer: self.buffer,
      start: self.start,
      last_read: self.last_read,
    }
  }

  // Like `map` for fallible swaps (the TLS handshake can fail).
  pub fn try_map<RW2, F>(self, map: F) -> anyhow::Result<Stream<RW2>>
  where
    F: FnOnce(RW) -> anyhow::Result<RW2>,
  {
    Ok(Stream {
      rw: map(self.rw)?,
      buffer: self.buffer,
      start: self.start,
      last_read: self.last_read,
    })
  }

  pub fn idle(&self) -> time::Duration {
    self.last_read.elapsed()
  }

  pub fn into_rw(self) -> RW {
    self.rw
  }

  fn fill(&mut self) -> anyhow::Result<()> {
    if crate::aborted() {
      return Err(anyhow::Error::new(crate::Error::Aborted));
    }
    let mut chunk = [0; 32 * 1024];
    match self.rw.read(&mut chunk) {
      Ok(0) => Err(anyhow::Error::new(crate::Error::NetworkLost)).context("end of stream"),
      Ok(length) => {
        self.buffer.extend_from_slice(&chunk[..length]);
        self.last_read = time::Instant::now();
        Ok(())
      }
      Err(error) => {
        Err(anyhow::Error::new(crate::Error::NetworkLost).context(error))
      }
    }
  }

  fn compact(&mut self) {
    if self.start == self.buffer.len() {
      self.buffer.clear();
      self.start = 0;
    } else if self.start > 64 * 1024 {
      self.buffer.drain(..self.start);
      self.start = 0;
    }
  }

  // One CRLF-terminated line, terminator included. A bare LF is tolerated (some POP servers).
  pub fn readln(&mut self) -> anyhow::Result<Vec<u8>> {
    loop {
      if let Some(position) = memchr::memchr(b'\n', &self.buffer[self.start..]) {
        let line = self.buffer[self.start..self.start + position + 1].to_vec();
        self.start += position + 1;
        self.compact();
        log::debug!("< {}", codec::summarize(&line));
        return Ok(line);
      }
      self.fill()?;
    }
  }

  // Exactly `length` raw bytes; used for IMAP literals.
  pub fn read_exact(&mut self, length: usize) -> anyhow::Result<Vec<u8>> {
    while self.buffer.len() - self.start < length {
      self.fill()?;
    }
    let bytes = self.buffer[self.start..self.start + length].to_vec();
    self.start += length;
    self.compact();
    log::debug!("< ...literal of {length} byte(s)...");
    Ok(bytes)
  }

  // Sends the concatenation of `buffers`; only the first `log` of them appear in the trace so
  // credentials and message literals stay out of the logs.
  pub fn send(&mut self, buffers: &[&[u8]], log: usize) -> anyhow::Result<()> {
    if log::log_enabled!(log::Level::Debug) && log > 0 {
      log::debug!(
        "> {}{}",
        codec::escape(&buffers[..log.min(buffers.len())].concat()),
        if log < buffers.len() { "...omitted..." } else { "" }
      );
    } else {
      log::debug!("> ...omitted...");
    }
    for buffer in buffers {
      self
        .rw
        .write_all(buffer)
        .map_err(|error| anyhow::Error::new(crate::Error::NetworkLost).context(error))?;
    }
    Ok(())
  }
}
