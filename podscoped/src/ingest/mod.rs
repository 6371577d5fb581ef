pub mod codec;
pub mod reader;
pub mod source;

pub use codec::EventCodec;
pub use reader::{run_reader, ReaderConfig, ReaderHandles};
pub use source::{ChannelSource, RecordSource, StackResolver};
