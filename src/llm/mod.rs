mod tensorzero;

pub use tensorzero::{
    GeneratedImage, LlmClient, LlmConfig, LlmError, LlmResponse, parse_generated_image,
};
