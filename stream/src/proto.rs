//! Stream frames on the bus.
//!
//! Every frame is a bus message whose metadata tells it apart:
//!
//! | frame     | headers                                       | body     |
//! |-----------|-----------------------------------------------|----------|
//! | handshake | `Stream-Inbox`                                | empty    |
//! | data      | `Stream-Seq`                                  | message  |
//! | end       | `Stream-Seq`, `Stream-End: true`, [`Status`, `Description`] | error data |
//! | error     | `Status`, `Description` (no sequence)         | error data |
//!
//! Sequence numbers start at 1 per direction; the end marker takes the number after the last
//! data frame, so a receiver notices a data frame lost before the end.

use bytes::Bytes;
use micro_rpc_core::ErrorEnvelope;
use micro_rpc_core::header::*;
use micro_rpc_core::transport::Message;

#[derive(Debug, PartialEq)]
pub enum Frame {
    /// The bus found nobody listening on the subject we published to
    NoResponders,
    Handshake { inbox: String },
    Data { seq: u64, payload: Bytes },
    End { seq: u64, err: Option<ErrorEnvelope> },
    /// Error reply outside of the sequence, e.g. a refused handshake
    Error(ErrorEnvelope),
    Malformed(&'static str),
}

impl Frame {
    pub fn parse(msg: &Message) -> Frame {
        let headers = &msg.headers;
        if msg.status() == Some(NO_RESPONDERS_STATUS) {
            return Frame::NoResponders;
        }
        let seq = match headers.get(STREAM_SEQ) {
            None => {
                if let Some(inbox) = headers.get(STREAM_INBOX) {
                    return Frame::Handshake { inbox: inbox.to_string() };
                }
                if let Some(e) = ErrorEnvelope::decode(headers, &msg.payload) {
                    return Frame::Error(e);
                }
                return Frame::Malformed("missing Stream-Seq");
            }
            Some(s) => match s.parse::<u64>() {
                Ok(seq) if seq > 0 => seq,
                _ => return Frame::Malformed("invalid Stream-Seq"),
            },
        };
        if is_end(headers) {
            return Frame::End { seq, err: ErrorEnvelope::decode(headers, &msg.payload) };
        }
        Frame::Data { seq, payload: msg.payload.clone() }
    }
}

#[inline]
fn is_end(headers: &Headers) -> bool {
    match headers.get(STREAM_END) {
        Some(v) => v.eq_ignore_ascii_case("true"),
        None => false,
    }
}

/// `headers` are user metadata, runtime headers in it are replaced.
pub fn data_frame(subject: &str, seq: u64, payload: Bytes, mut headers: Headers) -> Message {
    headers.strip_reserved();
    headers.insert(STREAM_SEQ, seq.to_string());
    Message::new(subject, payload).with_headers(headers)
}

pub fn end_frame(
    subject: &str, seq: u64, err: Option<&ErrorEnvelope>, mut headers: Headers,
) -> Message {
    headers.strip_reserved();
    headers.insert(STREAM_SEQ, seq.to_string());
    headers.insert(STREAM_END, "true");
    let body = match err {
        Some(e) => e.encode(&mut headers),
        None => Bytes::new(),
    };
    Message::new(subject, body).with_headers(headers)
}

pub fn handshake_frame(subject: &str, inbox: &str) -> Message {
    let mut headers = Headers::new();
    headers.insert(STREAM_INBOX, inbox);
    Message::new(subject, Bytes::new()).with_headers(headers)
}

pub fn error_frame(subject: &str, err: &ErrorEnvelope) -> Message {
    let mut headers = Headers::new();
    let body = err.encode(&mut headers);
    Message::new(subject, body).with_headers(headers)
}

/// The first message of a streaming call: carries the caller's inbox both as the bus reply
/// subject and in `Reply-To`.
pub fn open_frame(subject: &str, inbox: &str, payload: Bytes, mut headers: Headers) -> Message {
    headers.strip_reserved();
    headers.insert(REPLY_TO, inbox);
    Message::new(subject, payload).with_headers(headers).with_reply(inbox)
}

/// Where the server should address a stream: `Reply-To`, else the bus reply subject.
#[inline]
pub fn reply_to(msg: &Message) -> Option<&str> {
    match msg.headers.get(REPLY_TO) {
        Some(s) if !s.is_empty() => Some(s),
        _ => msg.reply.as_deref(),
    }
}
