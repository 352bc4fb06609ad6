// https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3 - mailbox naming (modified UTF-7)
// https://www.rfc-editor.org/rfc/rfc2152 - UTF-7
// https://www.rfc-editor.org/rfc/rfc2045#section-6.7 - quoted-printable
// https://www.rfc-editor.org/rfc/rfc2104 - HMAC
// https://www.rfc-editor.org/rfc/rfc2195 - CRAM-MD5

use base64::Engine as _;

static MUTF7_ENGINE: once_cell::sync::Lazy<base64::engine::GeneralPurpose> =
  once_cell::sync::Lazy::new(|| {
    base64::engine::GeneralPurpose::new(
      &base64::alphabet::IMAP_MUTF7,
      base64::engine::general_purpose::GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::RequireNone)
        // https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
        // The padding bits of the last octet must be zero; anything else is an alternative (and
        // therefore rejected) encoding.
        .with_decode_allow_trailing_bits(false),
    )
  });

static STANDARD_ENGINE: once_cell::sync::Lazy<base64::engine::GeneralPurpose> =
  once_cell::sync::Lazy::new(|| {
    base64::engine::GeneralPurpose::new(
      &base64::alphabet::STANDARD,
      base64::engine::general_purpose::PAD,
    )
  });

fn mutf7_engine() -> &'static base64::engine::GeneralPurpose {
  &MUTF7_ENGINE
}

pub fn standard_engine() -> &'static base64::engine::GeneralPurpose {
  &STANDARD_ENGINE
}

// Decodes one &...- run (without the delimiters) into UTF-16BE code units, then into characters.
// Every violation of the canonical form is a None: superfluous base64 characters, non-zero
// padding bits (delegated to the engine), odd octet counts, lone surrogates and code points that
// should have been written as printable US-ASCII.
fn decode_run(run: &[u8], output: &mut String) -> Option<()> {
  let engine = mutf7_engine();
  let bytes = engine.decode(run).ok()?;
  if bytes.is_empty() || bytes.len() % 2 != 0 {
    return None;
  }
  // A canonical run spends ceil(8n/6) base64 characters on n octets; one more means six or more
  // unused bits.
  if run.len() != (bytes.len() * 8).div_ceil(6) {
    return None;
  }
  let mut decoder = encoding_rs::UTF_16BE.new_decoder_without_bom_handling();
  let mut decoded = String::new();
  decoded.try_reserve(decoder.max_utf8_buffer_length_without_replacement(bytes.len())?).ok()?;
  let (result, _) = decoder.decode_to_string_without_replacement(&bytes, &mut decoded, true);
  match result {
    encoding_rs::DecoderResult::InputEmpty => (),
    _ => return None, // Lone surrogates and truncated pairs end up here.
  }
  for character in decoded.chars() {
    if matches!(u32::from(character), 0x20..=0x7e) {
      // https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
      // The modified BASE64 MUST NOT be used to represent any printing US-ASCII character which
      // can represent itself.
      return None;
    }
  }
  output.push_str(&decoded);
  Some(())
}

pub fn utf7_to_utf8(input: &[u8]) -> Option<String> {
  let mut output = String::new();
  let mut i = 0;
  // Two adjacent base64 runs should have been a single one, track where the last one ended.
  let mut run_ended_at = None;
  while i < input.len() {
    match input[i] {
      b'&' => {
        let start = i;
        loop {
          i += 1;
          if i == input.len() {
            return None; // The "-" terminator is mandatory.
          }
          if input[i] == b'-' {
            break;
          }
        }
        if start + 1 == i {
          // https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
          // The character "&" (0x26) is represented by the two-octet sequence "&-".
          output.push('&');
        } else {
          if run_ended_at == Some(start) {
            return None;
          }
          decode_run(&input[start + 1..i], &mut output)?;
          run_ended_at = Some(i + 1);
        }
      }
      // https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
      // In modified UTF-7, printable US-ASCII characters, except for "&", represent themselves;
      // that is, characters with octet values 0x20-0x25 and 0x27-0x7e.
      c @ 0x20..=0x25 | c @ 0x27..=0x7e => output.push(c as char),
      _ => return None,
    }
    i += 1;
  }
  Some(output)
}

pub fn utf8_to_utf7(input: &str) -> String {
  let engine = mutf7_engine();
  let mut output = String::new();
  let mut pending: Vec<u8> = Vec::new();
  let flush = |pending: &mut Vec<u8>, output: &mut String| {
    if !pending.is_empty() {
      output.push('&');
      output.push_str(&engine.encode(&pending));
      output.push('-');
      pending.clear();
    }
  };
  for character in input.chars() {
    match u32::from(character) {
      0x26 => {
        flush(&mut pending, &mut output);
        output.push_str("&-");
      }
      c @ 0x20..=0x25 | c @ 0x27..=0x7e => {
        flush(&mut pending, &mut output);
        output.push(char::from_u32(c).unwrap());
      }
      _ => {
        // https://www.rfc-editor.org/rfc/rfc2152
        // Unicode is encoded using Modified Base64 by first converting Unicode 16-bit quantities
        // to an octet stream (with the most significant octet first). Code points above U+FFFF
        // become a surrogate pair.
        let mut units = [0u16; 2];
        for unit in character.encode_utf16(&mut units) {
          pending.extend_from_slice(&unit.to_be_bytes());
        }
      }
    }
  }
  flush(&mut pending, &mut output);
  output
}

fn hex_value(byte: u8) -> Option<u8> {
  match byte {
    b'0'..=b'9' => Some(byte - b'0'),
    b'A'..=b'F' => Some(byte - b'A' + 10),
    b'a'..=b'f' => Some(byte - b'a' + 10),
    _ => None,
  }
}

// https://www.rfc-editor.org/rfc/rfc2045#section-6.7
// Lenient on malformed escapes (kept verbatim), strict on well-formed ones. `q_encoding` follows
// https://www.rfc-editor.org/rfc/rfc2047#section-4.2 where "_" stands for space.
pub fn quoted_printable_decode(input: &[u8], q_encoding: bool) -> Vec<u8> {
  let mut output = Vec::with_capacity(input.len());
  let mut i = 0;
  while i < input.len() {
    match input[i] {
      b'=' => match (input.get(i + 1).copied(), input.get(i + 2).copied()) {
        (Some(b'\r'), Some(b'\n')) => i += 2, // Soft line break.
        (Some(b'\n'), _) => i += 1,
        (Some(high), Some(low)) => match (hex_value(high), hex_value(low)) {
          (Some(high), Some(low)) => {
            output.push(high << 4 | low);
            i += 2;
          }
          _ => output.push(b'='),
        },
        _ => output.push(b'='),
      },
      b'_' if q_encoding => output.push(b' '),
      byte => output.push(byte),
    }
    i += 1;
  }
  output
}

// https://www.rfc-editor.org/rfc/rfc2104
// HMAC-MD5 with the 64-octet block size; longer keys are replaced by their digest first.
pub fn hmac_md5(key: &[u8], message: &[u8]) -> [u8; 16] {
  const BLOCK: usize = 64;
  let mut block = [0u8; BLOCK];
  if key.len() > BLOCK {
    block[..16].copy_from_slice(&md5::compute(key).0);
  } else {
    block[..key.len()].copy_from_slice(key);
  }
  let mut inner = [0u8; BLOCK];
  let mut outer = [0u8; BLOCK];
  for i in 0..BLOCK {
    inner[i] = block[i] ^ 0x36;
    outer[i] = block[i] ^ 0x5c;
  }
  let inner_digest = md5::compute([&inner[..], message].concat());
  md5::compute([&outer[..], &inner_digest.0[..]].concat()).0
}

pub fn hex(bytes: &[u8]) -> String {
  let mut string = String::with_capacity(bytes.len() * 2);
  for byte in bytes {
    string.push_str(&format!("{byte:02x}"));
  }
  string
}

// Charset conversion for header payloads. Each label in `charsets` is tried until one decodes the
// input without replacement; when none does, the first label decodes with U+FFFD squashed to a
// single "?" so stateful target charsets stay valid.
pub fn to_utf8(input: &[u8], charsets: &[&str]) -> Option<String> {
  for (i, label) in charsets.iter().enumerate() {
    let encoding = match encoding_rs::Encoding::for_label(label.as_bytes()) {
      Some(encoding) => encoding,
      None => continue,
    };
    let (decoded, _, replaced) = encoding.decode(input);
    if !replaced {
      return Some(decoded.into_owned());
    }
    if i == charsets.len() - 1 {
      return Some(decoded.replace('\u{fffd}', "?"));
    }
  }
  None
}

pub fn escape(bytes: &[u8]) -> String {
  let mut string = String::new();
  for byte in bytes {
    string += &std::ascii::escape_default(*byte).to_string();
  }
  string
}

pub fn summarize(bytes: &[u8]) -> String {
  let stop = bytes
    .windows(2)
    .position(|window| window == b"\r\n")
    .unwrap_or(bytes.len());
  let stop = std::cmp::min(stop + 2 /* \r\n */, bytes.len());
  let mut string = escape(&bytes[..stop]);
  if stop < bytes.len() {
    string += "...omitted...";
  }
  string
}
