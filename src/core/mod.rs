pub mod chunk_source;
pub mod pipeline;
pub mod stream_buffer;
