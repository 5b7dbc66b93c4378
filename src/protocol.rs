//! Wire types and frame codec for the installation protocol.
//!
//! Every framed message is a 4-byte big-endian `i32` payload length followed
//! by exactly that many bytes of JSON. The byte order is fixed to network
//! order; there is no version negotiation. The raw application package sent
//! after a `prepareApp` request is NOT framed — it is streamed as plain bytes
//! whose count was announced in the request.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ErrorKind;

pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a framed payload. An announced length outside
/// `1..=MAX_FRAME_LEN` is rejected before any payload byte is read, so a
/// hostile length prefix cannot stall the connection (the package payload is
/// not framed and is bounded separately by configuration).
pub const MAX_FRAME_LEN: i32 = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Client-to-server request, discriminated by the `request` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "camelCase")]
pub enum ServerRequest {
    /// Ask the server for its anisette payload.
    AnisetteData,
    /// Announce an application package of `contentSize` raw bytes destined
    /// for `deviceId`. The bytes follow immediately, unframed.
    #[serde(rename_all = "camelCase")]
    PrepareApp { device_id: String, content_size: u64 },
    /// Start installing the previously transmitted package.
    BeginInstallation,
}

/// Server-to-client response, discriminated by the `response` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "camelCase")]
pub enum ServerResponse {
    Error { code: ErrorKind },
    AnisetteData { payload: Vec<u8> },
    InstallationProgress { progress: f64 },
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Read one framed message, mapping malformed payloads to `on_malformed`.
///
/// Short or errored reads collapse to [`ErrorKind::LostConnection`]; they are
/// never surfaced as raw I/O errors.
async fn read_frame<R, T>(reader: &mut R, on_malformed: ErrorKind) -> Result<T, ErrorKind>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|_| ErrorKind::LostConnection)?;

    let announced = i32::from_be_bytes(header);
    if announced <= 0 || announced > MAX_FRAME_LEN {
        return Err(on_malformed);
    }

    let mut payload = vec![0u8; announced as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| ErrorKind::LostConnection)?;

    serde_json::from_slice(&payload).map_err(|_| on_malformed)
}

/// Read one request frame (server side).
pub async fn read_request<R>(reader: &mut R) -> Result<ServerRequest, ErrorKind>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader, ErrorKind::InvalidRequest).await
}

/// Read one response frame (client side).
pub async fn read_response<R>(reader: &mut R) -> Result<ServerResponse, ErrorKind>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader, ErrorKind::InvalidResponse).await
}

/// Write one framed message.
///
/// The length prefix and the payload form a single logical unit: if the
/// prefix write fails the payload write is never attempted, and either
/// failure completes as [`ErrorKind::LostConnection`].
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ErrorKind>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Our wire types always serialize; a failure here is an invariant
    // violation, not a recoverable condition.
    let payload = serde_json::to_vec(message).expect("wire types always serialize");
    let header = (payload.len() as i32).to_be_bytes();

    writer
        .write_all(&header)
        .await
        .map_err(|_| ErrorKind::LostConnection)?;
    writer
        .write_all(&payload)
        .await
        .map_err(|_| ErrorKind::LostConnection)?;
    writer
        .flush()
        .await
        .map_err(|_| ErrorKind::LostConnection)?;
    Ok(())
}
