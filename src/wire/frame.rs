use crate::wire::{ClientFlag, ClientRole, ErrorCode, SerializeMode, MAX_FRAME};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed size of a request header: call-id, serialize-mode, client-role,
/// protocol-len, message-name-len, body-len.
pub(crate) const REQUEST_HEADER_LEN: usize = 24;

/// Fixed size of a response header: call-id, error-code, message-name-len,
/// body-len.
pub(crate) const RESPONSE_HEADER_LEN: usize = 16;

/// Fixed size of a push header: serialize-mode, protocol-len,
/// message-name-len, body-len.
pub(crate) const PUSH_HEADER_LEN: usize = 16;

/// Errors at the framing layer. Every variant is fatal for the connection
/// it occurred on.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload lengths sum past [`MAX_FRAME`].
    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME} byte cap")]
    TooLarge(usize),
    /// A header field held a value outside its enumerated space.
    #[error("invalid {0} field on the wire: {1}")]
    InvalidField(&'static str, u32),
    /// Protocol or message name was not valid UTF-8.
    #[error("frame name is not valid UTF-8")]
    InvalidName(#[from] std::string::FromUtf8Error),
    /// Short read, unexpected EOF, or any other transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn check_payload_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_FRAME {
        return Err(FrameError::TooLarge(len));
    }
    Ok(())
}

/// Sum header length fields, rejecting totals past the cap before any
/// allocation happens.
fn checked_total(lens: &[u32]) -> Result<usize, FrameError> {
    let total = lens.iter().map(|&l| l as usize).sum();
    check_payload_len(total)?;
    Ok(total)
}

async fn read_payload<R: AsyncRead + Unpin>(r: &mut R, len: usize) -> Result<Bytes, FrameError> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf.into())
}

fn split_name(buf: &mut Bytes, len: usize) -> Result<String, FrameError> {
    Ok(String::from_utf8(buf.split_to(len).to_vec())?)
}

/// A caller-to-server frame: RPC request, publish, subscriber control, or
/// heartbeat, distinguished by the [`ClientFlag`] in its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Correlator for async calls; 0 for frames that do not correlate.
    pub call_id: u32,
    /// Serialize mode and client role.
    pub flag: ClientFlag,
    /// Routing key: method name for RPC, topic name for pub/sub.
    pub protocol: String,
    /// Codec key for the body; empty in raw mode.
    pub message_name: String,
    /// Payload bytes.
    pub body: Bytes,
}

impl RequestFrame {
    /// Encode header and payload as one wire buffer.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let total = self.protocol.len() + self.message_name.len() + self.body.len();
        check_payload_len(total)?;

        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + total);
        buf.put_u32_le(self.call_id);
        buf.put_u32_le(self.flag.mode as u32);
        buf.put_u32_le(self.flag.role as u32);
        buf.put_u32_le(self.protocol.len() as u32);
        buf.put_u32_le(self.message_name.len() as u32);
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(self.protocol.as_bytes());
        buf.put_slice(self.message_name.as_bytes());
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Read one request frame: header first, lengths validated, then the
    /// exact payload bytes.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, FrameError> {
        let mut head = [0u8; REQUEST_HEADER_LEN];
        r.read_exact(&mut head).await?;

        let fields: Vec<u32> = head
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().expect("chunks of 4")))
            .collect();
        let (call_id, mode, role) = (fields[0], fields[1], fields[2]);
        let (protocol_len, name_len, body_len) = (fields[3], fields[4], fields[5]);

        let flag = ClientFlag {
            mode: SerializeMode::from_u32(mode)?,
            role: ClientRole::from_u32(role)?,
        };
        let total = checked_total(&[protocol_len, name_len, body_len])?;

        let mut payload = read_payload(r, total).await?;
        let protocol = split_name(&mut payload, protocol_len as usize)?;
        let message_name = split_name(&mut payload, name_len as usize)?;

        Ok(Self {
            call_id,
            flag,
            protocol,
            message_name,
            body: payload,
        })
    }
}

/// A server-to-caller reply, correlated to its request by call-id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Echoes the call-id of the originating request.
    pub call_id: u32,
    /// Outcome of the call.
    pub error_code: ErrorCode,
    /// Codec key for the body; empty in raw mode and on errors.
    pub message_name: String,
    /// Payload bytes.
    pub body: Bytes,
}

impl ResponseFrame {
    /// A reply carrying an error code and no payload.
    pub(crate) fn error(call_id: u32, error_code: ErrorCode) -> Self {
        Self {
            call_id,
            error_code,
            message_name: String::new(),
            body: Bytes::new(),
        }
    }

    /// Encode header and payload as one wire buffer.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let total = self.message_name.len() + self.body.len();
        check_payload_len(total)?;

        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + total);
        buf.put_u32_le(self.call_id);
        buf.put_u32_le(self.error_code.as_u32());
        buf.put_u32_le(self.message_name.len() as u32);
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(self.message_name.as_bytes());
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    fn parse_header(head: &[u8; RESPONSE_HEADER_LEN]) -> Result<(u32, ErrorCode, u32, u32), FrameError> {
        let call_id = u32::from_le_bytes(head[0..4].try_into().expect("4 bytes"));
        let code = u32::from_le_bytes(head[4..8].try_into().expect("4 bytes"));
        let name_len = u32::from_le_bytes(head[8..12].try_into().expect("4 bytes"));
        let body_len = u32::from_le_bytes(head[12..16].try_into().expect("4 bytes"));
        checked_total(&[name_len, body_len])?;
        Ok((call_id, ErrorCode::from_u32(code), name_len, body_len))
    }

    /// Read one response frame.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, FrameError> {
        let mut head = [0u8; RESPONSE_HEADER_LEN];
        r.read_exact(&mut head).await?;
        let (call_id, error_code, name_len, body_len) = Self::parse_header(&head)?;

        let mut payload = read_payload(r, (name_len + body_len) as usize).await?;
        let message_name = split_name(&mut payload, name_len as usize)?;

        Ok(Self {
            call_id,
            error_code,
            message_name,
            body: payload,
        })
    }

    /// Blocking variant of [`Self::read`], for the synchronous caller.
    pub fn read_blocking<R: std::io::Read>(r: &mut R) -> Result<Self, FrameError> {
        let mut head = [0u8; RESPONSE_HEADER_LEN];
        r.read_exact(&mut head)?;
        let (call_id, error_code, name_len, body_len) = Self::parse_header(&head)?;

        let mut payload = vec![0u8; (name_len + body_len) as usize];
        r.read_exact(&mut payload)?;
        let mut payload = Bytes::from(payload);
        let message_name = split_name(&mut payload, name_len as usize)?;

        Ok(Self {
            call_id,
            error_code,
            message_name,
            body: payload,
        })
    }
}

/// A broker-to-subscriber frame. Fire-and-forget: no call-id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    /// Codec path the subscriber should take.
    pub mode: SerializeMode,
    /// Topic the message was published on.
    pub protocol: String,
    /// Codec key for the body; empty in raw mode.
    pub message_name: String,
    /// Payload bytes.
    pub body: Bytes,
}

impl PushFrame {
    /// Encode header and payload as one wire buffer.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let total = self.protocol.len() + self.message_name.len() + self.body.len();
        check_payload_len(total)?;

        let mut buf = BytesMut::with_capacity(PUSH_HEADER_LEN + total);
        buf.put_u32_le(self.mode as u32);
        buf.put_u32_le(self.protocol.len() as u32);
        buf.put_u32_le(self.message_name.len() as u32);
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(self.protocol.as_bytes());
        buf.put_slice(self.message_name.as_bytes());
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Read one push frame.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, FrameError> {
        let mut head = [0u8; PUSH_HEADER_LEN];
        r.read_exact(&mut head).await?;

        let mode = u32::from_le_bytes(head[0..4].try_into().expect("4 bytes"));
        let protocol_len = u32::from_le_bytes(head[4..8].try_into().expect("4 bytes"));
        let name_len = u32::from_le_bytes(head[8..12].try_into().expect("4 bytes"));
        let body_len = u32::from_le_bytes(head[12..16].try_into().expect("4 bytes"));

        let mode = SerializeMode::from_u32(mode)?;
        let total = checked_total(&[protocol_len, name_len, body_len])?;

        let mut payload = read_payload(r, total).await?;
        let protocol = split_name(&mut payload, protocol_len as usize)?;
        let message_name = split_name(&mut payload, name_len as usize)?;

        Ok(Self {
            mode,
            protocol,
            message_name,
            body: payload,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request() -> RequestFrame {
        RequestFrame {
            call_id: 7,
            flag: ClientFlag::new(SerializeMode::Structured, ClientRole::AsyncRpc),
            protocol: "request_person_info".into(),
            message_name: "person_info_req".into(),
            body: Bytes::from_static(b"{\"name\":\"Jack\"}"),
        }
    }

    #[tokio::test]
    async fn request_round_trip() {
        let frame = request();
        let wire = frame.encode().unwrap();
        let decoded = RequestFrame::read(&mut wire.as_ref()).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn response_round_trip() {
        let frame = ResponseFrame {
            call_id: 7,
            error_code: ErrorCode::Ok,
            message_name: "person_info_rsp".into(),
            body: Bytes::from_static(b"{\"name\":\"Tom\"}"),
        };
        let wire = frame.encode().unwrap();
        let decoded = ResponseFrame::read(&mut wire.as_ref()).await.unwrap();
        assert_eq!(decoded, frame);

        let blocking = ResponseFrame::read_blocking(&mut &wire[..]).unwrap();
        assert_eq!(blocking, frame);
    }

    #[tokio::test]
    async fn push_round_trip() {
        let frame = PushFrame {
            mode: SerializeMode::Raw,
            protocol: "prices".into(),
            message_name: String::new(),
            body: Bytes::from_static(b"42.5"),
        };
        let wire = frame.encode().unwrap();
        let decoded = PushFrame::read(&mut wire.as_ref()).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn encode_rejects_oversize() {
        let frame = RequestFrame {
            body: vec![0u8; MAX_FRAME + 1].into(),
            ..request()
        };
        assert!(matches!(frame.encode(), Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn decode_rejects_oversize_header() {
        // Hand-built header claiming a body larger than the cap. The reader
        // must fail before attempting to allocate or read the payload.
        let mut head = BytesMut::new();
        head.put_u32_le(0);
        head.put_u32_le(SerializeMode::Raw as u32);
        head.put_u32_le(ClientRole::Rpc as u32);
        head.put_u32_le(4);
        head.put_u32_le(0);
        head.put_u32_le(MAX_FRAME as u32);
        head.put_slice(b"echo");

        let err = RequestFrame::read(&mut head.freeze().as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn short_read_is_fatal() {
        let wire = request().encode().unwrap();
        let truncated = &wire[..wire.len() - 3];
        let err = RequestFrame::read(&mut &truncated[..]).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
