pub mod decode;
pub mod payload;

pub use decode::decode_image;
pub use payload::read_payload;
