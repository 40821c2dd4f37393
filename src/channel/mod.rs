pub mod buffered;
pub mod ring;

pub use buffered::{BufferedChannel, BUFFER_SIZE, BUFFER_SIZE_MAX};
pub use ring::ByteRing;
