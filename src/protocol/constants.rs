//! RTMP wire constants

/// Protocol version sent in C0/S0
pub const RTMP_VERSION: u8 = 3;

/// Size of C1/S1/C2/S2
pub const HANDSHAKE_SIZE: usize = 1536;

/// Default RTMP port
pub const DEFAULT_PORT: u16 = 1935;

/// Chunk size both sides assume until a Set Chunk Size arrives
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Chunk size we ask the server to accept from us
pub const RECOMMENDED_CHUNK_SIZE: u32 = 4096;

/// Largest legal chunk size (31 bits, top bit must be zero)
pub const MAX_CHUNK_SIZE: u32 = 0x7FFF_FFFF;

/// Largest message we are willing to reassemble (3-byte length field)
pub const MAX_MESSAGE_SIZE: u32 = 0x00FF_FFFF;

pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;

/// Timestamps at or above this use the 4-byte extended field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0x00FF_FFFF;

// Chunk stream IDs used when sending
pub const CSID_PROTOCOL_CONTROL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;
pub const CSID_AUDIO: u32 = 4;
pub const CSID_DATA: u32 = 5;
pub const CSID_VIDEO: u32 = 6;

// Message type IDs
pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;

// User control event types
pub const UC_STREAM_BEGIN: u16 = 0;
pub const UC_STREAM_EOF: u16 = 1;
pub const UC_STREAM_DRY: u16 = 2;
pub const UC_SET_BUFFER_LENGTH: u16 = 3;
pub const UC_STREAM_IS_RECORDED: u16 = 4;
pub const UC_PING_REQUEST: u16 = 6;
pub const UC_PING_RESPONSE: u16 = 7;

// Command names
pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_FC_UNPUBLISH: &str = "FCUnpublish";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_ON_STATUS: &str = "onStatus";
pub const CMD_ON_BW_DONE: &str = "onBWDone";

// Status codes
pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";

/// Flash version we advertise, matching common hardware/software encoders
pub const DEFAULT_FLASH_VER: &str = "FMLE/3.0 (compatible; FMSc/1.0)";
