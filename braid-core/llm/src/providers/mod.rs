pub(crate) mod openai;

pub use openai::{OpenAICompatChatModel, OpenAICompatProvider};
