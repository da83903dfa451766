pub mod anthropic;
pub mod canonical;
pub mod openai_chat;
pub mod openai_responses;

use crate::clock::SharedClock;
use crate::config::DecoderConfig;
use crate::stream::StreamDecoder;

use self::anthropic::stream::AnthropicStreamDecoder;
use self::canonical::Protocol;
use self::openai_chat::stream::OpenAiChatStreamDecoder;
use self::openai_responses::stream::ResponsesStreamDecoder;

impl Protocol {
    /// Build a fresh decoder for one response in this protocol.
    #[must_use]
    pub fn new_decoder(self, config: &DecoderConfig, clock: SharedClock) -> Box<dyn StreamDecoder> {
        match self {
            Protocol::Anthropic => Box::new(AnthropicStreamDecoder::new(config, clock)),
            Protocol::OpenAiChat => Box::new(OpenAiChatStreamDecoder::new(config)),
            Protocol::OpenAiResponses => Box::new(ResponsesStreamDecoder::new(config)),
        }
    }
}
