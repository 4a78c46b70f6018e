use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ShareError};

/// Identifier every driftshare server advertises and every client looks up.
pub const SERVICE_ID: &str = "94f39d29-7d6d-437d-973b-fba39e49d4ee";
/// Human-readable service name published next to [`SERVICE_ID`].
pub const SERVICE_NAME: &str = "driftshare file share";
/// Size of the big-endian length prefix that opens every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Upper bound on a single frame payload to protect against malicious peers.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;
/// Raw file bytes are moved in chunks of at most this many bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Message tags this build understands. Anything else decodes to
/// [`Message::Unknown`].
const KNOWN_TAGS: [&str; 6] = [
    "file_list_request",
    "file_list_response",
    "file_request",
    "file_response",
    "ping",
    "pong",
];

/// One entry of a peer's advertised file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the file content, when the peer could compute it.
    #[serde(rename = "hash", default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// A protocol message. Serialized as a JSON object tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    FileListRequest,
    FileListResponse {
        files: Vec<FileDescriptor>,
    },
    FileRequest {
        filename: String,
    },
    /// Answer to [`Message::FileRequest`]. When `success` is true the raw
    /// file bytes follow the frame, `size` of them, without any framing.
    FileResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping,
    Pong,
    /// A well-formed message whose `type` this build does not know.
    /// Never sent, only produced by [`decode_payload`].
    #[serde(skip)]
    Unknown {
        tag: String,
    },
}

impl Message {
    /// Successful [`Message::FileResponse`] header announcing `size` bytes.
    pub fn file_found(filename: impl Into<String>, size: u64) -> Self {
        Self::FileResponse {
            success: true,
            filename: Some(filename.into()),
            size: Some(size),
            error: None,
        }
    }

    /// Failed [`Message::FileResponse`] carrying a reason.
    pub fn file_missing(error: impl Into<String>) -> Self {
        Self::FileResponse {
            success: false,
            filename: None,
            size: None,
            error: Some(error.into()),
        }
    }

    /// The `type` tag this message travels under.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::FileListRequest => "file_list_request",
            Self::FileListResponse { .. } => "file_list_response",
            Self::FileRequest { .. } => "file_request",
            Self::FileResponse { .. } => "file_response",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown { tag } => tag,
        }
    }
}

/// Encodes `msg` into a frame: 4-byte big-endian length, then the JSON payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the message cannot be serialized
/// (e.g. [`Message::Unknown`]) and [`ProtocolError::OversizeMessage`] if the
/// payload would exceed [`MAX_PAYLOAD_LEN`].
pub fn encode(msg: &Message) -> Result<BytesMut, ProtocolError> {
    let payload = serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::OversizeMessage {
            declared: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf)
}

/// Parses one frame payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the bytes are not a JSON object
/// with a string `type`, or if a known message is missing fields.
pub fn decode_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let Some(tag) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(ProtocolError::Malformed(
            "missing string `type` field".into(),
        ));
    };
    if !KNOWN_TAGS.contains(&tag) {
        return Ok(Message::Unknown {
            tag: tag.to_owned(),
        });
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Reads exactly one frame from `reader` and decodes it.
///
/// * `Ok(Some(msg))`: a full frame was read.
/// * `Ok(None)`: the stream ended cleanly on a frame boundary.
/// * `Err(..)`: protocol violation or I/O failure. The caller should close
///   the connection.
///
/// Nothing beyond the frame is consumed, so raw bytes that follow a header
/// (file content) stay in the stream.
///
/// # Errors
///
/// [`ProtocolError::OversizeMessage`] is returned right after the prefix,
/// before any payload byte is read. [`ProtocolError::Truncated`] if the stream
/// closes mid-frame, [`ProtocolError::Malformed`] for bad payloads, and
/// [`ShareError::Io`] for read failures.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ShareError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated.into());
        }
        filled += n;
    }

    let declared = usize::try_from(u32::from_be_bytes(prefix)).unwrap_or(usize::MAX);
    if declared > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::OversizeMessage {
            declared,
            max: MAX_PAYLOAD_LEN,
        }
        .into());
    }

    let mut payload = vec![0u8; declared];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Truncated.into());
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Some(decode_payload(&payload)?))
}

/// Encodes `msg` and writes the whole frame to `writer`.
///
/// # Errors
///
/// Returns an error if encoding fails or the write does.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), ShareError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::FileListRequest,
            Message::FileListResponse { files: vec![] },
            Message::FileListResponse {
                files: vec![
                    FileDescriptor {
                        name: "notes.txt".into(),
                        size_bytes: 0,
                        content_hash: None,
                    },
                    FileDescriptor {
                        name: "photo (1).jpg".into(),
                        size_bytes: 1_048_576,
                        content_hash: Some("ab".repeat(32)),
                    },
                ],
            },
            Message::FileRequest {
                filename: "ünïcode.pdf".into(),
            },
            Message::file_found("report.pdf", 999_999),
            Message::file_missing("File not found"),
            Message::Ping,
            Message::Pong,
        ]
    }

    /// Given every message shape, when encoded and read back, then the same message comes out.
    #[tokio::test]
    async fn given_valid_messages_when_round_tripped_then_messages_match() {
        for original in sample_messages() {
            let frame = encode(&original).unwrap();
            let mut reader: &[u8] = &frame;
            let decoded = read_message(&mut reader).await.unwrap();
            assert_eq!(decoded, Some(original));
            assert!(reader.is_empty(), "the codec must consume exactly one frame");
        }
    }

    /// Given a file list request, when encoded, then the prefix is big-endian and the payload is compact JSON.
    #[test]
    fn given_file_list_request_when_encoded_then_wire_bytes_match() {
        let frame = encode(&Message::FileListRequest).unwrap();
        let payload = br#"{"type":"file_list_request"}"#;
        #[allow(clippy::cast_possible_truncation)]
        let expected_len = (payload.len() as u32).to_be_bytes();
        assert_eq!(&frame[..LENGTH_PREFIX_LEN], &expected_len);
        assert_eq!(&frame[LENGTH_PREFIX_LEN..], payload);
    }

    /// Given a failed file response, when serialized, then absent optionals are omitted.
    #[test]
    fn given_failed_file_response_when_serialized_then_json_omits_filename_and_size() {
        let json = serde_json::to_string(&Message::file_missing("File not found")).unwrap();
        assert_eq!(
            json,
            r#"{"type":"file_response","success":false,"error":"File not found"}"#
        );
    }

    /// Given a list entry, when serialized, then fields use the wire names.
    #[test]
    fn given_file_descriptor_when_serialized_then_uses_size_and_hash_keys() {
        let fd = FileDescriptor {
            name: "a.bin".into(),
            size_bytes: 3,
            content_hash: Some("00ff".into()),
        };
        let json = serde_json::to_string(&fd).unwrap();
        assert_eq!(json, r#"{"name":"a.bin","size":3,"hash":"00ff"}"#);
    }

    /// Given a prefix declaring more than 1 MiB, when read, then OversizeMessage is returned and no payload byte is consumed.
    #[tokio::test]
    async fn given_oversize_prefix_when_read_then_rejected_before_payload() {
        #[allow(clippy::cast_possible_truncation)]
        let declared = (MAX_PAYLOAD_LEN as u32 + 1).to_be_bytes();
        let mut bytes = declared.to_vec();
        bytes.extend_from_slice(b"{\"type\":\"ping\"}");
        let mut reader: &[u8] = &bytes;

        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            ShareError::Protocol(ProtocolError::OversizeMessage { declared, .. })
                if declared == MAX_PAYLOAD_LEN + 1
        ));
        assert_eq!(reader.len(), 15, "payload bytes must remain unread");
    }

    /// Given a prefix of exactly 1 MiB, when read, then the length check passes and decoding proceeds.
    #[tokio::test]
    async fn given_max_length_prefix_when_read_then_not_oversize() {
        #[allow(clippy::cast_possible_truncation)]
        let mut bytes = (MAX_PAYLOAD_LEN as u32).to_be_bytes().to_vec();
        bytes.extend(std::iter::repeat_n(b' ', MAX_PAYLOAD_LEN));
        let mut reader: &[u8] = &bytes;

        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ShareError::Protocol(ProtocolError::Malformed(_))));
    }

    /// Given a stream that ends mid-payload, when read, then Truncated is returned.
    #[tokio::test]
    async fn given_truncated_payload_when_read_then_returns_truncated() {
        let frame = encode(&Message::Ping).unwrap();
        let mut reader: &[u8] = &frame[..frame.len() - 2];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ShareError::Protocol(ProtocolError::Truncated)));
    }

    /// Given a stream that ends inside the length prefix, when read, then Truncated is returned.
    #[tokio::test]
    async fn given_partial_prefix_when_read_then_returns_truncated() {
        let mut reader: &[u8] = &[0x00, 0x00];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ShareError::Protocol(ProtocolError::Truncated)));
    }

    /// Given an empty stream, when read, then a clean end-of-stream is reported.
    #[tokio::test]
    async fn given_empty_stream_when_read_then_returns_none() {
        let mut reader: &[u8] = &[];
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    /// Given a payload that is not JSON, when decoded, then Malformed is returned.
    #[test]
    fn given_invalid_json_when_decoded_then_returns_malformed() {
        let err = decode_payload(b"not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    /// Given JSON without a type tag, when decoded, then Malformed is returned.
    #[test]
    fn given_json_without_type_when_decoded_then_returns_malformed() {
        let err = decode_payload(br#"{"filename":"a.txt"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    /// Given a known tag with a missing field, when decoded, then Malformed is returned.
    #[test]
    fn given_file_request_without_filename_when_decoded_then_returns_malformed() {
        let err = decode_payload(br#"{"type":"file_request"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    /// Given an unrecognized tag, when decoded, then the Unknown variant carries the tag.
    #[test]
    fn given_unknown_tag_when_decoded_then_returns_unknown_variant() {
        let msg = decode_payload(br#"{"type":"chat","text":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Unknown {
                tag: "chat".into()
            }
        );
        assert_eq!(msg.tag(), "chat");
    }

    /// Given an Unknown message, when encoded, then encoding is refused.
    #[test]
    fn given_unknown_message_when_encoded_then_returns_error() {
        let err = encode(&Message::Unknown { tag: "x".into() }).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    /// Given a response whose hash is absent on the wire, when decoded, then content_hash is None.
    #[test]
    fn given_list_entry_without_hash_when_decoded_then_hash_is_none() {
        let msg = decode_payload(
            br#"{"type":"file_list_response","files":[{"name":"x","size":7}]}"#,
        )
        .unwrap();
        let Message::FileListResponse { files } = msg else {
            panic!("expected a file list response");
        };
        assert_eq!(files[0].content_hash, None);
        assert_eq!(files[0].size_bytes, 7);
    }

    /// Given two frames back to back, when read twice, then each read yields one message.
    #[tokio::test]
    async fn given_two_frames_when_read_sequentially_then_both_decode_in_order() {
        let mut bytes = encode(&Message::Ping).unwrap().to_vec();
        bytes.extend_from_slice(&encode(&Message::FileListRequest).unwrap());
        let mut reader: &[u8] = &bytes;
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(Message::Ping));
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::FileListRequest)
        );
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    /// Given a message written through write_message, when read back, then it matches.
    #[tokio::test]
    async fn given_writer_when_message_written_then_bytes_equal_encoded_frame() {
        let mut out: Vec<u8> = Vec::new();
        write_message(&mut out, &Message::Pong).await.unwrap();
        assert_eq!(out, encode(&Message::Pong).unwrap().to_vec());
    }
}
