pub mod llm;
pub mod pipeline;

pub use llm::{
    ChatTurn, CompletionRequest, HttpLlmStreamer, LlmStream, LlmStreamer, MockEchoStreamer, Role,
};
pub use pipeline::{
    PostedMessage, SendRequest, StreamConfig, StreamEvent, StreamPipeline,
};
