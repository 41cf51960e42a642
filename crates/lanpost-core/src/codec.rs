// SPDX-License-Identifier: AGPL-3.0
// Lanpost Core - Wire codec
//
// Every frame on a peer connection is explicitly delimited:
//
//   [kind: u8][length: u32 big-endian][payload]
//
// Kind 0x01 carries one chat message as a JSON object. Kind 0x02 carries a
// file payload: a u16 big-endian header length, a JSON FileHeader, then the
// raw file bytes. A stream transport gives no message boundaries of its own,
// so partial reads are handled here and nowhere else.

use crate::types::{FileHeader, Message, SessionError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame payload (16 MiB); larger frames are rejected
/// before allocation.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

const KIND_MESSAGE: u8 = 0x01;
const KIND_FILE: u8 = 0x02;

/// One decoded application-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Message),
    File { header: FileHeader, data: Vec<u8> },
}

/// Serialize a message to its JSON wire form. Total for well-formed
/// messages: every field is a plain string, number or UUID.
pub fn encode_message(message: &Message) -> Vec<u8> {
    serde_json::to_vec(message).unwrap_or_default()
}

/// Parse a JSON payload back into a message
pub fn decode_message(bytes: &[u8]) -> Result<Message, SessionError> {
    serde_json::from_slice(bytes).map_err(|e| SessionError::Decode(e.to_string()))
}

/// Build a complete chat frame ready to be written to a peer
pub fn encode_message_frame(message: &Message) -> Vec<u8> {
    let payload = encode_message(message);
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(KIND_MESSAGE);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    buf
}

/// Build a complete file frame: type tag, total length, JSON header, bytes
pub fn encode_file_frame(header: &FileHeader, data: &[u8]) -> Result<Vec<u8>, SessionError> {
    if header.size != data.len() as u64 {
        return Err(SessionError::Decode(format!(
            "File header size {} does not match payload length {}",
            header.size,
            data.len()
        )));
    }

    let header_json =
        serde_json::to_vec(header).map_err(|e| SessionError::Serialization(e.to_string()))?;
    let payload_len = 2 + header_json.len() + data.len();

    let mut buf = Vec::with_capacity(5 + payload_len);
    buf.push(KIND_FILE);
    buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
    buf.extend_from_slice(&(header_json.len() as u16).to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(data);
    Ok(buf)
}

fn decode_file_payload(payload: &[u8]) -> Result<Frame, SessionError> {
    if payload.len() < 2 {
        return Err(SessionError::Decode("File frame too short".to_string()));
    }

    let header_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + header_len {
        return Err(SessionError::Decode(
            "File frame truncated inside header".to_string(),
        ));
    }

    let header: FileHeader = serde_json::from_slice(&payload[2..2 + header_len])
        .map_err(|e| SessionError::Decode(e.to_string()))?;
    let data = payload[2 + header_len..].to_vec();

    if header.size != data.len() as u64 {
        return Err(SessionError::Decode(format!(
            "File header claims {} bytes, frame carries {}",
            header.size,
            data.len()
        )));
    }

    Ok(Frame::File { header, data })
}

/// Read exactly one frame from the transport.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary. EOF in the middle of
/// a frame is a transport error: the peer went away mid-write.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 5];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SessionError::Transport(e.to_string())),
    }

    let kind = head[0];
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]);
    if len > MAX_FRAME_SIZE {
        // Drain the payload without allocating it so the stream stays at a
        // frame boundary and the caller may keep reading.
        let mut remaining = len as u64;
        let mut scratch = [0u8; 8192];
        while remaining > 0 {
            let take = remaining.min(scratch.len() as u64) as usize;
            reader
                .read_exact(&mut scratch[..take])
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            remaining -= take as u64;
        }
        return Err(SessionError::Decode(format!(
            "Frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;

    match kind {
        KIND_MESSAGE => Ok(Some(Frame::Message(decode_message(&payload)?))),
        KIND_FILE => Ok(Some(decode_file_payload(&payload)?)),
        other => Err(SessionError::Decode(format!("Unknown frame kind {:#04x}", other))),
    }
}

/// Write one pre-encoded frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(frame)
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn test_round_trip() {
        let m = Message::new("A", "hello");
        let decoded = decode_message(&encode_message(&m)).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_round_trip_with_file_url() {
        let m = Message::with_file("A", "see attachment", "lanpost://cat.jpg".to_string());
        let decoded = decode_message(&encode_message(&m)).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_malformed_payload_is_decode_error() {
        let err = decode_message(b"{not json").unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));
    }

    #[test]
    fn test_missing_file_url_decodes_to_none() {
        let json = br#"{"id":"6ec1e2a2-146b-44d3-b3cb-0e3f9e8c0001","sender":"A","content":"x","timestamp":"2024-05-01T10:00:00Z"}"#;
        let m = decode_message(json).unwrap();
        assert_eq!(m.file_url, None);
    }

    #[test]
    fn test_file_frame_size_mismatch_rejected() {
        let header = FileHeader {
            name: "a.bin".to_string(),
            sender: "A".to_string(),
            size: 99,
        };
        assert!(encode_file_frame(&header, b"abc").is_err());
    }

    #[tokio::test]
    async fn test_frame_round_trip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let m = Message::new("A", "hello");
        write_frame(&mut client, &encode_message_frame(&m)).await.unwrap();
        drop(client);

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame, Frame::Message(m));
        // Clean EOF after the last frame
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let header = FileHeader {
            name: "notes.txt".to_string(),
            sender: "B".to_string(),
            size: 5,
        };
        let frame = encode_file_frame(&header, b"hello").unwrap();
        write_frame(&mut client, &frame).await.unwrap();

        match read_frame(&mut server).await.unwrap().unwrap() {
            Frame::File { header: h, data } => {
                assert_eq!(h, header);
                assert_eq!(data, b"hello");
            }
            other => panic!("expected file frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_and_stream_stays_usable() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let writer = tokio::spawn(async move {
            let mut head = vec![0x01u8];
            head.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
            client.write_all(&head).await.unwrap();

            // Oversized payload the reader must drain without allocating
            let chunk = vec![0u8; 64 * 1024];
            let mut left = (MAX_FRAME_SIZE + 1) as usize;
            while left > 0 {
                let take = left.min(chunk.len());
                client.write_all(&chunk[..take]).await.unwrap();
                left -= take;
            }

            // A well-formed frame right behind it
            let m = Message::new("A", "still alive");
            client.write_all(&encode_message_frame(&m)).await.unwrap();
            m
        });

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));

        let m = writer.await.unwrap();
        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame, Frame::Message(m));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Header promises 10 bytes, only 3 arrive before EOF
        let mut buf = vec![0x01u8];
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        tokio::io::AsyncWriteExt::write_all(&mut client, &buf).await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }
}
