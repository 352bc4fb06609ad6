// https://www.rfc-editor.org/rfc/rfc2234#section-2.3
// https://www.rfc-editor.org/rfc/rfc3501#section-9
// https://www.rfc-editor.org/rfc/rfc4315#section-4
// https://www.rfc-editor.org/rfc/rfc7162#section-7
//
// The server side of the wire. Lines are parsed one logical unit at a time: the protocol layer
// splices any {n} literals into the buffer before handing it over, so a rule like literal() can
// assume its payload is present.

use crate::email;
use std::{borrow, str};

// Inclusive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Range(pub u32, pub u32);

#[derive(Debug, PartialEq)]
pub enum Mailbox<'input> {
  Inbox,
  Other(borrow::Cow<'input, [u8]>),
}

impl Mailbox<'_> {
  pub fn into_bytes(self) -> Vec<u8> {
    match self {
      Mailbox::Inbox => b"INBOX".to_vec(),
      Mailbox::Other(borrow::Cow::Owned(mailbox)) => mailbox,
      Mailbox::Other(borrow::Cow::Borrowed(mailbox)) => mailbox.to_vec(),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
  Ok,
  No,
  Bad,
  Bye,
  Preauth,
}

#[derive(Debug, PartialEq)]
pub enum RespCode<'input> {
  Alert,
  Capability(Vec<&'input [u8]>),
  PermanentFlags(Vec<&'input [u8]>),
  ReadOnly,
  ReadWrite,
  TryCreate,
  UidValidity(u32),
  UidNext(u32),
  Unseen(u32),
  HighestModSeq(u64),
  NoModSeq,
  AppendUid { uidvalidity: u32, uid: u32 },
  CopyUid { uidvalidity: u32, from: Vec<Range>, to: Vec<Range> },
  Modified(Vec<Range>),
  Other(&'input [u8]),
}

#[derive(Debug, PartialEq)]
pub struct Condition<'input> {
  pub status: Status,
  pub code: Option<RespCode<'input>>,
  pub text: &'input [u8],
}

#[derive(Debug, Default, PartialEq)]
pub struct StatusData {
  pub messages: Option<u32>,
  pub recent: Option<u32>,
  pub uidnext: Option<u32>,
  pub uidvalidity: Option<u32>,
  pub unseen: Option<u32>,
  pub highestmodseq: Option<u64>,
}

#[derive(Debug, PartialEq)]
pub enum FetchAtt<'input> {
  Flags(Vec<&'input [u8]>),
  Uid(u32),
  ModSeq(u64),
  InternalDate(String),
  Rfc822Size(u32),
  Envelope(Box<email::Envelope>),
  Body(Box<email::Body>),
  Section {
    section: &'input [u8],
    payload: Option<borrow::Cow<'input, [u8]>>,
  },
}

#[derive(Debug, PartialEq)]
pub enum Untagged<'input> {
  Condition(Condition<'input>),
  Capability(Vec<&'input [u8]>),
  Enabled(Vec<&'input [u8]>),
  Flags(Vec<&'input [u8]>),
  List {
    flags: Vec<&'input [u8]>,
    separator: Option<u8>,
    mailbox: Mailbox<'input>,
    subscribed: bool,
  },
  Status {
    mailbox: Mailbox<'input>,
    status: StatusData,
  },
  Search(Vec<u32>),
  Exists(u32),
  Recent(u32),
  Expunge(u32),
  Fetch {
    msn: u32,
    atts: Vec<FetchAtt<'input>>,
  },
  Vanished {
    earlier: bool,
    uids: Vec<Range>,
  },
}

#[derive(Debug, PartialEq)]
pub enum Response<'input> {
  Tagged {
    tag: &'input [u8],
    condition: Condition<'input>,
  },
  Untagged(Untagged<'input>),
  Continuation(&'input [u8]),
}

fn parse_u32(n: &[u8]) -> u32 {
  // Guaranteed ASCII digits by the BNF.
  str::from_utf8(n).unwrap().parse().unwrap_or(u32::MAX)
}

fn parse_u64(n: &[u8]) -> u64 {
  str::from_utf8(n).unwrap().parse().unwrap_or(u64::MAX)
}

fn nstring_text(value: Option<borrow::Cow<'_, [u8]>>) -> Option<String> {
  value.map(|value| email::rfc2047_decode(&value))
}

// addr-name / addr-mailbox / addr-host into a display form.
fn format_address(
  name: Option<borrow::Cow<'_, [u8]>>,
  mailbox: Option<borrow::Cow<'_, [u8]>>,
  host: Option<borrow::Cow<'_, [u8]>>,
) -> Option<String> {
  // https://www.rfc-editor.org/rfc/rfc3501#section-7.4.2
  // [RFC-2822] group syntax is indicated by a special form of address structure in which the host
  // name field is NIL.
  let (mailbox, host) = (mailbox?, host?);
  let address = format!(
    "{}@{}",
    String::from_utf8_lossy(&mailbox),
    String::from_utf8_lossy(&host)
  );
  Some(match nstring_text(name) {
    Some(name) if !name.is_empty() => format!("{name} <{address}>"),
    _ => address,
  })
}

fn join_addresses(addresses: Vec<Option<String>>) -> Option<String> {
  let addresses: Vec<String> = addresses.into_iter().flatten().collect();
  if addresses.is_empty() {
    None
  } else {
    Some(addresses.join(", "))
  }
}

// The naive l:$(CHAR8()*<{n}>) in literal() would push every CHAR8() into a vector before
// discarding it: https://github.com/kevinmehall/rust-peg/pull/292
// Instead, use an undocumented escape hatch to do a fast skip:
// https://github.com/kevinmehall/rust-peg/issues/284
trait ParserHacks {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()>;
}

impl ParserHacks for [u8] {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()> {
    if self.len() >= position + n {
      return peg::RuleResult::Matched(position + n, ());
    }
    peg::RuleResult::Failed
  }
}

peg::parser! {
  pub grammar parser() for [u8] {
    // CR = %x0D
    rule CR() = "\r"
    // LF = %x0A
    rule LF() = "\n"
    // CRLF = CR LF
    rule CRLF() = CR() LF()
    // CHAR = %x01-7F
    rule CHAR() -> u8
      = [b'\x01'..=b'\x7f']
    // CHAR8 = %x01-ff
    rule CHAR8() = [b'\x01'..=b'\xff']
    // CTL = %x00-1F / %x7F
    rule CTL() = [b'\x00'..=b'\x1f'] / "\x7f"
    // DQUOTE = %x22
    rule DQUOTE() -> u8
      = "\""
      { b'"' }
    rule SP() = " "
    // TEXT-CHAR = <any CHAR except CR and LF>
    rule TEXT_CHAR() -> u8
      = !(CR() / LF()) c:CHAR()
      { c }
    // DIGIT = %x30-39
    rule DIGIT() = [b'\x30'..=b'\x39']
    // digit-nz = %x31-39
    rule digit_nz() = [b'\x31'..=b'\x39']

    // number = 1*DIGIT
    rule number() -> u32
      = n:$(DIGIT()+)
      { parse_u32(n) }
    rule number64() -> u64
      = n:$(DIGIT()+)
      { parse_u64(n) }
    // nz-number = digit-nz *DIGIT
    rule nz_number() -> u32
      = n:$(digit_nz() DIGIT()*)
      { parse_u32(n) }
    // uniqueid = nz-number
    rule uniqueid() -> u32 = nz_number()
    // text = 1*TEXT-CHAR
    rule text() = TEXT_CHAR()+

    // nil = "NIL"
    rule nil() = "NIL"
    // list-wildcards = "%" / "*"
    rule list_wildcards() = "%" / "*"
    // quoted-specials = DQUOTE / "\"
    rule quoted_specials() -> u8
      = c:(DQUOTE() / ("\\" { b'\\' }))
      { c }
    // QUOTED-CHAR = <any TEXT-CHAR except quoted-specials> / "\" quoted-specials
    rule QUOTED_CHAR() -> u8
      = !quoted_specials() c:TEXT_CHAR() { c } / "\\" c:quoted_specials()
      { c }
    // resp-specials = "]"
    rule resp_specials() = "]"
    // atom-specials = "(" / ")" / "{" / SP / CTL / list-wildcards / quoted-specials / resp-specials
    rule atom_specials() = "(" / ")" / "{" / SP() / CTL() / list_wildcards() / quoted_specials() / resp_specials()
    // ATOM-CHAR = <any CHAR except atom-specials>
    rule ATOM_CHAR() = !atom_specials() CHAR()
    // atom = 1*ATOM-CHAR
    rule atom() = ATOM_CHAR()+
    // ASTRING-CHAR = ATOM-CHAR / resp-specials
    rule ASTRING_CHAR() = ATOM_CHAR() / resp_specials()
    // quoted = DQUOTE *QUOTED-CHAR DQUOTE
    rule quoted() -> Vec<u8>
      = DQUOTE() q:(QUOTED_CHAR()*) DQUOTE()
      { q }
    // literal = "{" number "}" CRLF *CHAR8
    rule literal() -> &'input [u8]
      = "{" n:number() "}" CRLF() position!() l:$(##skip(usize::try_from(n).unwrap() /* not much we can do */))
      { l }
    // string = quoted / literal
    rule string() -> borrow::Cow<'input, [u8]>
      = q:quoted() { borrow::Cow::Owned(q) } / l:literal() { borrow::Cow::Borrowed(l) }
    // astring = 1*ASTRING-CHAR / string
    rule astring() -> borrow::Cow<'input, [u8]>
      = s:$(ASTRING_CHAR()+) { borrow::Cow::Borrowed(s) } / s:string() { s }
    // nstring = string / nil
    rule nstring() -> Option<borrow::Cow<'input, [u8]>>
      = s:string() { Some(s) } / nil() { None }

    // tag = 1*<any ASTRING-CHAR except "+">
    rule tag() -> &'input [u8] = $((!"+" ASTRING_CHAR())+)

    // auth-type = atom
    rule auth_type() = atom()
    // capability = ("AUTH=" auth-type) / atom
    rule capability() -> &'input [u8] = $(("AUTH=" auth_type()) / atom())
    // capability-data = "CAPABILITY" *(SP capability) SP "IMAP4rev1" *(SP capability)
    // Rewritten for simplicity and to avoid backtracking (capability can match "IMAP4rev1").
    rule capability_data() -> Vec<&'input [u8]>
      = "CAPABILITY" cs:(SP() c:capability() { c })+
      { cs }

    // mailbox = "INBOX" / astring
    rule mailbox() -> Mailbox<'input>
      = ("i" / "I") ("n" / "N") ("b" / "B") ("o" / "O") ("x" / "X") !ASTRING_CHAR() { Mailbox::Inbox } / m:astring() { Mailbox::Other(m) }
    // mbx-list-flags, rewritten for simplicity.
    rule mbx_list_flags() -> Vec<&'input [u8]>
      = fs:((f:$("\\" atom()) { f }) ** SP())
      { fs }
    // mailbox-list = "(" [mbx-list-flags] ")" SP (DQUOTE QUOTED-CHAR DQUOTE / nil) SP mailbox
    rule mailbox_list() -> (Vec<&'input [u8]>, Option<u8>, Mailbox<'input>)
      = "(" fs:mbx_list_flags() ")" SP() c:(DQUOTE() c:QUOTED_CHAR() DQUOTE() { Some(c) } / nil() { None }) SP() m:mailbox()
      { (fs, c, m) }

    // flag-keyword = atom
    rule flag_keyword() -> &'input [u8] = $(atom())
    // flag-extension = "\" atom
    rule flag_extension() -> &'input [u8] = $("\\" atom())
    // flag = "\Answered" / "\Flagged" / "\Deleted" / "\Seen" / "\Draft" / flag-keyword / flag-extension
    // This rule is equivalent because flag-extension allows any of the system flags.
    rule flag() -> &'input [u8] = flag_keyword() / flag_extension()
    // flag-perm = flag / "\*"
    rule flag_perm() -> &'input [u8] = f:flag() { f } / $("\\*")
    // flag-fetch = flag / "\Recent"
    rule flag_fetch() -> &'input [u8] = flag()

    // mod-sequence-value = 1*DIGIT
    rule mod_sequence_value() -> u64 = number64()

    // seq-number = nz-number / "*"
    rule seq_number() -> Range = n:nz_number() { Range(n, n) } / "*" { Range(0, u32::MAX) }
    // seq-range = seq-number ":" seq-number
    // Example: 2:4 and 4:2 are equivalent and indicate values 2, 3, and 4.
    rule seq_range() -> Range
      = r1:seq_number() ":" r2:seq_number()
      {
        if r1.0 <= r2.1 {
          Range(r1.0, r2.1)
        } else {
          Range(r2.0, r1.0)
        }
      }
    // sequence-set = (seq-number / seq-range) *("," sequence-set)
    // Rewritten to avoid backtracking (seq-number can match seq-range).
    rule sequence_set() -> Vec<Range> = (seq_range() / seq_number()) ** ","
    // known-uids = sequence-set
    rule known_uids() -> Vec<Range> = sequence_set()
    // uid-range = (uniqueid ":" uniqueid)
    rule uid_range() -> Range
      = u1:uniqueid() ":" u2:uniqueid()
      {
        if u1 <= u2 {
          Range(u1, u2)
        } else {
          Range(u2, u1)
        }
      }
    // uid-set = (uniqueid / uid-range) *("," uid-set)
    rule uid_set() -> Vec<Range>
      = (u:uid_range() { u } / u:uniqueid() { Range(u, u) }) ** ","

    // resp-text-code = "ALERT" / "BADCHARSET" [...] / capability-data / "PARSE" /
    //                  "PERMANENTFLAGS" SP "(" [flag-perm *(SP flag-perm)] ")" /
    //                  "READ-ONLY" / "READ-WRITE" / "TRYCREATE" /
    //                  "UIDNEXT" SP nz-number / "UIDVALIDITY" SP nz-number /
    //                  "UNSEEN" SP nz-number / atom [SP 1*<any TEXT-CHAR except "]">]
    // Plus the extension codes this store consumes: HIGHESTMODSEQ, NOMODSEQ, MODIFIED (RFC 7162),
    // APPENDUID, COPYUID (RFC 4315).
    rule resp_text_code() -> RespCode<'input>
      = "ALERT" { RespCode::Alert }
      / cs:capability_data() { RespCode::Capability(cs) }
      / "PERMANENTFLAGS" SP() "(" fs:(flag_perm() ** SP()) ")" { RespCode::PermanentFlags(fs) }
      / "READ-ONLY" { RespCode::ReadOnly }
      / "READ-WRITE" { RespCode::ReadWrite }
      / "TRYCREATE" { RespCode::TryCreate }
      / "UIDVALIDITY" SP() n:nz_number() { RespCode::UidValidity(n) }
      / "UIDNEXT" SP() n:nz_number() { RespCode::UidNext(n) }
      / "UNSEEN" SP() n:nz_number() { RespCode::Unseen(n) }
      / "HIGHESTMODSEQ" SP() n:mod_sequence_value() { RespCode::HighestModSeq(n) }
      / "NOMODSEQ" { RespCode::NoModSeq }
      / "APPENDUID" SP() n:nz_number() SP() u:uniqueid() { RespCode::AppendUid { uidvalidity: n, uid: u } }
      / "COPYUID" SP() n:nz_number() SP() us1:uid_set() SP() us2:uid_set() { RespCode::CopyUid { uidvalidity: n, from: us1, to: us2 } }
      / "MODIFIED" SP() s:sequence_set() { RespCode::Modified(s) }
      / o:$(atom() (SP() (!resp_specials() TEXT_CHAR())+)?) { RespCode::Other(o) }

    // resp-text = ["[" resp-text-code "]" SP] text
    // Lenient: some servers send an empty text, or no space after the "]".
    rule resp_text() -> (Option<RespCode<'input>>, &'input [u8])
      = code:("[" c:resp_text_code() "]" SP()? { c })? t:$(TEXT_CHAR()*)
      { (code, t) }

    // resp-cond-state = ("OK" / "NO" / "BAD") SP resp-text
    // resp-cond-auth = ("OK" / "PREAUTH") SP resp-text
    // resp-cond-bye = "BYE" SP resp-text
    rule condition() -> Condition<'input>
      = s:("OK" { Status::Ok } / "NO" { Status::No } / "BAD" { Status::Bad }
           / "BYE" { Status::Bye } / "PREAUTH" { Status::Preauth })
        SP() rt:resp_text()
      { Condition { status: s, code: rt.0, text: rt.1 } }

    pub rule greeting() -> Condition<'input>
      = "*" SP() c:condition() CRLF()
      { c }

    // status-att-list from RFC 3501 §7.2.4 plus HIGHESTMODSEQ from RFC 7162.
    rule status_att() -> (&'input [u8], u64)
      = k:$("MESSAGES" / "RECENT" / "UIDNEXT" / "UIDVALIDITY" / "UNSEEN" / "HIGHESTMODSEQ")
        SP() n:mod_sequence_value()
      { (k, n) }
    rule status_data() -> StatusData
      = "(" atts:(status_att() ** SP()) ")"
      {
        let mut data = StatusData::default();
        for (key, value) in atts {
          match key {
            b"MESSAGES" => data.messages = Some(value as u32),
            b"RECENT" => data.recent = Some(value as u32),
            b"UIDNEXT" => data.uidnext = Some(value as u32),
            b"UIDVALIDITY" => data.uidvalidity = Some(value as u32),
            b"UNSEEN" => data.unseen = Some(value as u32),
            b"HIGHESTMODSEQ" => data.highestmodseq = Some(value),
            _ => unreachable!(),
          }
        }
        data
      }

    // envelope = "(" env-date SP env-subject SP env-from SP env-sender SP env-reply-to SP env-to
    //            SP env-cc SP env-bcc SP env-in-reply-to SP env-message-id ")"
    // address = "(" addr-name SP addr-adl SP addr-mailbox SP addr-host ")"
    rule address() -> Option<String>
      = "(" name:nstring() SP() nstring() SP() mb:nstring() SP() host:nstring() ")"
      { format_address(name, mb, host) }
    rule address_list() -> Option<String>
      = "(" a:(address()+) ")" { join_addresses(a) } / nil() { None }
    pub rule envelope() -> email::Envelope
      = "(" date:nstring() SP() subject:nstring() SP()
        from:address_list() SP() address_list() /* sender */ SP() address_list() /* reply-to */ SP()
        to:address_list() SP() cc:address_list() SP() address_list() /* bcc */ SP()
        in_reply_to:nstring() SP() message_id:nstring() ")"
      {
        email::Envelope {
          from,
          to,
          cc,
          subject: nstring_text(subject),
          message_id: message_id.map(|id| String::from_utf8_lossy(&id).trim().to_string()),
          in_reply_to: in_reply_to
            .map(|raw| crate::email::parse_msg_ids(&String::from_utf8_lossy(&raw)))
            .unwrap_or_default(),
          date: date.and_then(|raw| email::parse_date(&String::from_utf8_lossy(&raw))),
          ..email::Envelope::default()
        }
      }

    // body = "(" (body-type-1part / body-type-mpart) ")"
    // body-type-mpart = 1*body SP media-subtype [SP body-ext-mpart]
    // body-type-1part = (body-type-basic / body-type-msg / body-type-text) [SP body-ext-1part]
    // body-fields = body-fld-param SP body-fld-id SP body-fld-desc SP body-fld-enc SP
    //               body-fld-octets
    rule body_fld_param() -> Vec<(String, String)>
      = "(" ps:((k:string() SP() v:string() {
          (String::from_utf8_lossy(&k).to_ascii_lowercase(), String::from_utf8_lossy(&v).to_string())
        }) ** SP()) ")" { ps }
      / nil() { Vec::new() }
    rule body_fld_dsp() -> Option<String>
      = "(" d:string() SP() body_fld_param() ")" { Some(String::from_utf8_lossy(&d).to_ascii_lowercase()) }
      / nil() { None }
    rule body_fld_lang()
      = nstring() {} / "(" string() ** SP() ")" {}
    // body-extension = nstring / number / "(" body-extension *(SP body-extension) ")"
    rule body_extension()
      = "(" body_extension() ** SP() ")" {} / number() {} / nstring() {}
    // body-ext-1part = body-fld-md5 [SP body-fld-dsp [SP body-fld-lang [SP body-fld-loc
    //                  *(SP body-extension)]]]
    rule body_ext_1part() -> Option<String>
      = nstring() d:(SP() d:body_fld_dsp() (SP() body_fld_lang() (SP() nstring() (SP() body_extension())*)?)? { d })?
      { d.flatten() }
    // body-ext-mpart = body-fld-param [SP body-fld-dsp [SP body-fld-lang [SP body-fld-loc
    //                  *(SP body-extension)]]]
    rule body_ext_mpart() -> Option<String>
      = body_fld_param() d:(SP() d:body_fld_dsp() (SP() body_fld_lang() (SP() nstring() (SP() body_extension())*)?)? { d })?
      { d.flatten() }
    rule body_fields() -> (Vec<(String, String)>, email::Encoding, u32)
      = params:body_fld_param() SP() nstring() /* id */ SP() nstring() /* description */ SP()
        enc:string() SP() octets:number()
      { (params, email::Encoding::parse(&String::from_utf8_lossy(&enc)), octets) }
    rule media_pair() -> (email::ContentType, String)
      = t:string() SP() s:string()
      {
        (
          email::ContentType::parse(&String::from_utf8_lossy(&t)),
          String::from_utf8_lossy(&s).to_ascii_lowercase(),
        )
      }
    rule body_type_text() -> email::Body
      = t:media_pair() SP() fields:body_fields() SP() lines:number() dsp:(SP() d:body_ext_1part() { d })?
      {
        email::Body {
          content_type: t.0,
          subtype: t.1,
          parameters: fields.0,
          encoding: fields.1,
          length: u64::from(fields.2),
          lines: u64::from(lines),
          disposition: dsp.flatten(),
          ..email::Body::default()
        }
      }
    // body-type-msg = media-message SP body-fields SP envelope SP body SP body-fld-lines
    rule body_type_msg() -> email::Body
      = "\"" ("M" / "m") ("E" / "e") ("S" / "s") ("S" / "s") ("A" / "a") ("G" / "g") ("E" / "e") "\""
        SP() "\"" ("R" / "r") ("F" / "f") ("C" / "c") "822" "\""
        SP() fields:body_fields() SP() e:envelope() SP() part:body() SP() lines:number()
        dsp:(SP() d:body_ext_1part() { d })?
      {
        email::Body {
          content_type: email::ContentType::Message,
          subtype: "rfc822".to_string(),
          parameters: fields.0,
          encoding: fields.1,
          length: u64::from(fields.2),
          lines: u64::from(lines),
          envelope: Some(Box::new(e)),
          parts: vec![part],
          disposition: dsp.flatten(),
          ..email::Body::default()
        }
      }
    rule body_type_basic() -> email::Body
      = t:media_pair() SP() fields:body_fields() dsp:(SP() d:body_ext_1part() { d })?
      {
        email::Body {
          content_type: t.0,
          subtype: t.1,
          parameters: fields.0,
          encoding: fields.1,
          length: u64::from(fields.2),
          disposition: dsp.flatten(),
          ..email::Body::default()
        }
      }
    rule body_type_mpart() -> email::Body
      = parts:(body()+) SP() subtype:string() dsp:(SP() d:body_ext_mpart() { d })?
      {
        email::Body {
          content_type: email::ContentType::Multipart,
          subtype: String::from_utf8_lossy(&subtype).to_ascii_lowercase(),
          parts,
          disposition: dsp.flatten(),
          ..email::Body::default()
        }
      }
    pub rule body() -> email::Body
      = "(" b:(b:body_type_mpart() { b } / b:body_type_msg() { b } / b:body_type_text() { b } / b:body_type_basic() { b }) ")"
      { b }

    // msg-att = "(" (msg-att-dynamic / msg-att-static) *(SP (msg-att-dynamic / msg-att-static)) ")"
    // Any attribute order is accepted; servers differ.
    rule section_spec() -> &'input [u8]
      = "[" s:$((!"]" CHAR())*) "]" ("<" number() ">")?
      { s }
    rule msg_att() -> FetchAtt<'input>
      = "FLAGS" SP() "(" fs:(flag_fetch() ** SP()) ")" { FetchAtt::Flags(fs) }
      / "UID" SP() u:uniqueid() { FetchAtt::Uid(u) }
      / "MODSEQ" SP() "(" m:mod_sequence_value() ")" { FetchAtt::ModSeq(m) }
      / "INTERNALDATE" SP() d:quoted() { FetchAtt::InternalDate(String::from_utf8_lossy(&d).to_string()) }
      / "RFC822.SIZE" SP() n:number() { FetchAtt::Rfc822Size(n) }
      / "ENVELOPE" SP() e:envelope() { FetchAtt::Envelope(Box::new(e)) }
      / "BODYSTRUCTURE" SP() b:body() { FetchAtt::Body(Box::new(b)) }
      / "BODY" s:section_spec() SP() p:nstring() { FetchAtt::Section { section: s, payload: p } }
      / "BODY" SP() b:body() { FetchAtt::Body(Box::new(b)) }

    // message-data = nz-number SP ("EXPUNGE" / ("FETCH" SP msg-att))
    // expunged-resp = "VANISHED" [SP "(EARLIER)"] SP known-uids
    // mailbox-data = "FLAGS" SP flag-list / "LIST" SP mailbox-list / "LSUB" SP mailbox-list /
    //                "SEARCH" *(SP nz-number) / "STATUS" SP mailbox SP "(" [status-att-list] ")" /
    //                number SP "EXISTS" / number SP "RECENT"
    // enable-data = "ENABLED" *(SP capability)
    rule untagged() -> Untagged<'input>
      = n:number() SP() u:(
          "EXISTS" { Untagged::Exists(n) }
        / "RECENT" { Untagged::Recent(n) }
        / "EXPUNGE" { Untagged::Expunge(n) }
        / "FETCH" SP() "(" atts:(msg_att() ** SP()) ")" { Untagged::Fetch { msn: n, atts } }
        ) { u }
      / cs:capability_data() { Untagged::Capability(cs) }
      / "ENABLED" cs:((SP() c:capability() { c })*) { Untagged::Enabled(cs) }
      / "FLAGS" SP() "(" fs:(flag_fetch() ** SP()) ")" { Untagged::Flags(fs) }
      / "LIST" SP() l:mailbox_list() { Untagged::List { flags: l.0, separator: l.1, mailbox: l.2, subscribed: false } }
      / "LSUB" SP() l:mailbox_list() { Untagged::List { flags: l.0, separator: l.1, mailbox: l.2, subscribed: true } }
      / "STATUS" SP() m:mailbox() SP() s:status_data() { Untagged::Status { mailbox: m, status: s } }
      / "SEARCH" ns:((SP() n:nz_number() { n })*) (SP() "(MODSEQ" SP() mod_sequence_value() ")")? { Untagged::Search(ns) }
      / "VANISHED" SP() e:("(EARLIER)" SP() { true })? us:known_uids() { Untagged::Vanished { earlier: e.is_some(), uids: us } }
      / c:condition() { Untagged::Condition(c) }

    // response-data = "*" SP (resp-cond-state / resp-cond-bye / mailbox-data / message-data /
    //                 capability-data) CRLF
    // response-tagged = tag SP resp-cond-state CRLF
    // continue-req = "+" SP (resp-text / base64) CRLF
    pub rule response() -> Response<'input>
      = "+" t:(SP() t:$(TEXT_CHAR()*) { t })? CRLF() { Response::Continuation(t.unwrap_or(&[])) }
      / "*" SP() u:untagged() CRLF() { Response::Untagged(u) }
      / t:tag() SP() c:condition() CRLF() { Response::Tagged { tag: t, condition: c } }

    // Whether a line is complete or still waiting on a literal's payload and continuation: the
    // protocol layer uses this to know how many more bytes to splice in.
    pub rule trailing_literal() -> u32
      = (!("{" number() "}" CRLF() ![_]) CHAR8())* "{" n:number() "}" CRLF() ![_]
      { n }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn greetings() {
    let condition =
      parser::greeting(b"* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] Dovecot ready.\r\n").unwrap();
    assert_eq!(Status::Ok, condition.status);
    assert_eq!(
      Some(RespCode::Capability(vec![&b"IMAP4rev1"[..], b"AUTH=PLAIN"])),
      condition.code
    );

    let condition = parser::greeting(b"* PREAUTH ready\r\n").unwrap();
    assert_eq!(Status::Preauth, condition.status);
  }

  #[test]
  fn tagged_responses() {
    let response = parser::response(b"a0001 OK [READ-WRITE] SELECT completed\r\n").unwrap();
    assert_eq!(
      Response::Tagged {
        tag: b"a0001",
        condition: Condition {
          status: Status::Ok,
          code: Some(RespCode::ReadWrite),
          text: b"SELECT completed",
        },
      },
      response
    );

    let response = parser::response(b"a0002 NO [ALERT] quota exceeded\r\n").unwrap();
    match response {
      Response::Tagged { condition, .. } => {
        assert_eq!(Status::No, condition.status);
        assert_eq!(Some(RespCode::Alert), condition.code);
      }
      _ => panic!("{response:?}"),
    }
  }

  #[test]
  fn continuations() {
    assert_eq!(
      Response::Continuation(b"go ahead"),
      parser::response(b"+ go ahead\r\n").unwrap()
    );
    assert_eq!(Response::Continuation(b""), parser::response(b"+\r\n").unwrap());
  }

  #[test]
  fn untagged_counters() {
    assert_eq!(
      Response::Untagged(Untagged::Exists(23)),
      parser::response(b"* 23 EXISTS\r\n").unwrap()
    );
    assert_eq!(
      Response::Untagged(Untagged::Recent(1)),
      parser::response(b"* 1 RECENT\r\n").unwrap()
    );
    assert_eq!(
      Response::Untagged(Untagged::Expunge(3)),
      parser::response(b"* 3 EXPUNGE\r\n").unwrap()
    );
  }

  #[test]
  fn untagged_conditions() {
    let response = parser::response(b"* OK [UIDVALIDITY 1676645821] UIDs valid\r\n").unwrap();
    assert_eq!(
      Response::Untagged(Untagged::Condition(Condition {
        status: Status::Ok,
        code: Some(RespCode::UidValidity(1676645821)),
        text: b"UIDs valid",
      })),
      response
    );

    let response = parser::response(b"* OK [HIGHESTMODSEQ 715194045007] ok\r\n").unwrap();
    match response {
      Response::Untagged(Untagged::Condition(condition)) => {
        assert_eq!(Some(RespCode::HighestModSeq(715194045007)), condition.code)
      }
      _ => panic!("{response:?}"),
    }

    // Unknown codes are carried verbatim.
    let response = parser::response(b"* OK [BADCHARSET (UTF-8)] whatever\r\n");
    assert!(response.is_ok());
  }

  #[test]
  fn copyuid_and_appenduid() {
    let response = parser::response(b"a OK [COPYUID 38505 304,319:320 3956:3958] Done\r\n").unwrap();
    match response {
      Response::Tagged { condition, .. } => assert_eq!(
        Some(RespCode::CopyUid {
          uidvalidity: 38505,
          from: vec![Range(304, 304), Range(319, 320)],
          to: vec![Range(3956, 3958)],
        }),
        condition.code
      ),
      _ => panic!("{response:?}"),
    }

    let response = parser::response(b"a OK [APPENDUID 38505 3955] APPEND completed\r\n").unwrap();
    match response {
      Response::Tagged { condition, .. } => assert_eq!(
        Some(RespCode::AppendUid {
          uidvalidity: 38505,
          uid: 3955,
        }),
        condition.code
      ),
      _ => panic!("{response:?}"),
    }
  }

  #[test]
  fn fetch_attributes_in_any_order() {
    for line in [
      &b"* 1 FETCH (UID 10 FLAGS (\\Seen) MODSEQ (100))\r\n"[..],
      b"* 1 FETCH (FLAGS (\\Seen) MODSEQ (100) UID 10)\r\n",
      b"* 1 FETCH (MODSEQ (100) UID 10 FLAGS (\\Seen))\r\n",
    ] {
      let response = parser::response(line).unwrap();
      match response {
        Response::Untagged(Untagged::Fetch { msn, atts }) => {
          assert_eq!(1, msn);
          assert!(atts.contains(&FetchAtt::Uid(10)));
          assert!(atts.contains(&FetchAtt::ModSeq(100)));
          assert!(atts.contains(&FetchAtt::Flags(vec![b"\\Seen"])));
        }
        _ => panic!("{response:?}"),
      }
    }
  }

  #[test]
  fn fetch_with_literal_body() {
    let response = parser::response(b"* 1 FETCH (UID 10 BODY[] {5}\r\nhello)\r\n").unwrap();
    match response {
      Response::Untagged(Untagged::Fetch { atts, .. }) => {
        assert!(atts.contains(&FetchAtt::Section {
          section: b"",
          payload: Some(borrow::Cow::Borrowed(b"hello")),
        }));
      }
      _ => panic!("{response:?}"),
    }
  }

  #[test]
  fn fetch_envelope() {
    let response = parser::response(
      b"* 12 FETCH (ENVELOPE (\"Wed, 17 Jul 1996 02:23:25 -0700\" \"subject here\" \
        ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
        ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
        ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
        ((NIL NIL \"imap\" \"cac.washington.edu\")) NIL NIL NIL \
        \"<B27397-0100000@cac.washington.edu>\"))\r\n",
    )
    .unwrap();
    match response {
      Response::Untagged(Untagged::Fetch { atts, .. }) => match &atts[0] {
        FetchAtt::Envelope(envelope) => {
          assert_eq!(Some("subject here".to_string()), envelope.subject);
          assert_eq!(
            Some("Terry Gray <gray@cac.washington.edu>".to_string()),
            envelope.from
          );
          assert_eq!(Some("imap@cac.washington.edu".to_string()), envelope.to);
          assert_eq!(
            Some("<B27397-0100000@cac.washington.edu>".to_string()),
            envelope.message_id
          );
          assert!(envelope.date.is_some());
        }
        att => panic!("{att:?}"),
      },
      _ => panic!("{response:?}"),
    }
  }

  #[test]
  fn vanished() {
    let response = parser::response(b"* VANISHED (EARLIER) 300:310,405,411\r\n").unwrap();
    assert_eq!(
      Response::Untagged(Untagged::Vanished {
        earlier: true,
        uids: vec![Range(300, 310), Range(405, 405), Range(411, 411)],
      }),
      response
    );
    let response = parser::response(b"* VANISHED 405\r\n").unwrap();
    assert_eq!(
      Response::Untagged(Untagged::Vanished {
        earlier: false,
        uids: vec![Range(405, 405)],
      }),
      response
    );
  }

  #[test]
  fn lists_and_status() {
    let response = parser::response(b"* LIST (\\Noselect) \"/\" {7}\r\nliteral\r\n").unwrap();
    match response {
      Response::Untagged(Untagged::List { flags, separator, mailbox, subscribed }) => {
        assert_eq!(vec![b"\\Noselect"], flags);
        assert_eq!(Some(b'/'), separator);
        assert_eq!(Mailbox::Other(borrow::Cow::Borrowed(b"literal")), mailbox);
        assert!(!subscribed);
      }
      _ => panic!("{response:?}"),
    }

    let response =
      parser::response(b"* STATUS Sent (MESSAGES 2 UIDNEXT 44 UIDVALIDITY 1 UNSEEN 1)\r\n")
        .unwrap();
    match response {
      Response::Untagged(Untagged::Status { status, .. }) => {
        assert_eq!(Some(2), status.messages);
        assert_eq!(Some(44), status.uidnext);
        assert_eq!(Some(1), status.unseen);
      }
      _ => panic!("{response:?}"),
    }

    // INBOX is recognised case-insensitively but "INBOXES" is a different mailbox.
    let response = parser::response(b"* LIST () \"/\" iNbOx\r\n").unwrap();
    match response {
      Response::Untagged(Untagged::List { mailbox, .. }) => assert_eq!(Mailbox::Inbox, mailbox),
      _ => panic!("{response:?}"),
    }
    let response = parser::response(b"* LIST () \"/\" INBOXES\r\n").unwrap();
    match response {
      Response::Untagged(Untagged::List { mailbox, .. }) => {
        assert_eq!(Mailbox::Other(borrow::Cow::Borrowed(b"INBOXES")), mailbox)
      }
      _ => panic!("{response:?}"),
    }
  }

  #[test]
  fn search_results() {
    assert_eq!(
      Response::Untagged(Untagged::Search(vec![2, 84, 882])),
      parser::response(b"* SEARCH 2 84 882\r\n").unwrap()
    );
    assert_eq!(
      Response::Untagged(Untagged::Search(vec![])),
      parser::response(b"* SEARCH\r\n").unwrap()
    );
  }

  #[test]
  fn trailing_literals() {
    assert_eq!(5, parser::trailing_literal(b"* 1 FETCH (UID 10 BODY[] {5}\r\n").unwrap());
    assert!(parser::trailing_literal(b"* 1 FETCH (UID 10 BODY[] {5}\r\nhello)\r\n").is_err());
    assert!(parser::trailing_literal(b"* 23 EXISTS\r\n").is_err());
  }
}
