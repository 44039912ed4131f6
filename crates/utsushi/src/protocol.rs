//! Protocol constants for utsushi

/// ALPN protocol identifier for utsushi connections.
///
/// Used during the QUIC handshake; a peer speaking another ALPN never
/// reaches the session layer.
pub const ALPN: &[u8] = b"utsushi/0";

/// Service identifier every participant advertises under
pub const SERVICE_TYPE: &str = "video-peer";

/// Name of the legacy continuous preview stream
pub const VIEWFINDER_STREAM_NAME: &str = "viewfinder-stream";

/// File name of the single stored clip
pub const CLIP_FILE_NAME: &str = "output.mov";

/// Timescale for presentation timestamps derived from the frame counter
pub const REFERENCE_TIMESCALE: i32 = 1000;

/// Length of the AVCC unit length prefix in bytes
pub const AVCC_HEADER_LENGTH: usize = 4;

/// Annex-B start code placed before each unit sent over the network
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Maximum control message size (512 MB, the whole clip travels in one message)
pub const MAX_CONTROL_PAYLOAD_SIZE: usize = 512 * 1024 * 1024;

/// Maximum handshake message size
pub const MAX_HELLO_SIZE: usize = 4 * 1024;

/// Maximum stream name length on the wire
pub const MAX_STREAM_NAME_LEN: usize = 256;

/// Read size for the legacy preview stream
pub const PREVIEW_READ_CHUNK: usize = 32 * 1024;
