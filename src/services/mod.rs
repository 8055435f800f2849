pub mod image;
pub mod llm;
pub mod narration;
pub mod text;
pub mod tts;
pub mod workflow;
