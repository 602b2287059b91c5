//! Audio codec boundary
//!
//! The core never looks inside encoded audio: it hands a PCM frame to a
//! [`VoiceEncoder`] and an encoded sub-frame to a [`VoiceDecoder`]. A
//! [`CodecProvider`] creates instances on demand, one decoder per
//! (speaker, codec family) and one encoder per outbound stream.

pub mod decoder;
pub mod encoder;

use bytes::Bytes;

use crate::error::CodecError;
use crate::protocol::voice::VoiceCodec;

pub use decoder::OpusDecoder;
pub use encoder::{OpusEncoder, OpusSettings};

/// Encodes wire-format PCM (48 kHz mono i16) into sub-frame payloads
pub trait VoiceEncoder: Send {
    fn codec(&self) -> VoiceCodec;

    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError>;
}

/// Decodes sub-frame payloads into wire-format PCM
pub trait VoiceDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError>;
}

/// Creates codec instances
pub trait CodecProvider: Send + Sync {
    fn supports(&self, codec: VoiceCodec) -> bool;

    fn encoder(&self, codec: VoiceCodec) -> Result<Box<dyn VoiceEncoder>, CodecError>;

    fn decoder(&self, codec: VoiceCodec) -> Result<Box<dyn VoiceDecoder>, CodecError>;
}

/// Provider backed by libopus
///
/// Legacy CELT and Speex are reported as unsupported.
#[derive(Debug, Clone, Default)]
pub struct OpusProvider {
    settings: OpusSettings,
}

impl OpusProvider {
    pub fn new(settings: OpusSettings) -> Self {
        Self { settings }
    }
}

impl CodecProvider for OpusProvider {
    fn supports(&self, codec: VoiceCodec) -> bool {
        codec == VoiceCodec::Opus
    }

    fn encoder(&self, codec: VoiceCodec) -> Result<Box<dyn VoiceEncoder>, CodecError> {
        match codec {
            VoiceCodec::Opus => Ok(Box::new(OpusEncoder::new(self.settings.clone())?)),
            other => Err(CodecError::Unsupported(other.to_string())),
        }
    }

    fn decoder(&self, codec: VoiceCodec) -> Result<Box<dyn VoiceDecoder>, CodecError> {
        match codec {
            VoiceCodec::Opus => Ok(Box::new(OpusDecoder::new(
                self.settings.sample_rate,
                self.settings.frame_size,
            )?)),
            other => Err(CodecError::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_rejects_legacy_codecs() {
        let provider = OpusProvider::default();
        assert!(provider.supports(VoiceCodec::Opus));
        assert!(!provider.supports(VoiceCodec::CeltAlpha));
        assert!(matches!(
            provider.decoder(VoiceCodec::Speex),
            Err(CodecError::Unsupported(_))
        ));
    }
}
