#![forbid(unsafe_code)]

pub mod frames;
pub mod framing;

pub use frames::{
	ClientFrame, ErrorCode, MessageView, ReaderView, RepliedMessageView, RepliedPreview, RoomInfoView, ServerFrame,
	UnreadSummaryView,
};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// Application close codes.
pub mod close {
	/// Missing or invalid credential.
	pub const AUTH_FAILED: u32 = 4000;
	/// Malformed frame or frame out of sequence.
	pub const PROTOCOL_VIOLATION: u32 = 4001;
}

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
