use crate::pipeline::GenerateParams;

/// Optional caller-supplied transform run after the cache probe and before
/// context trimming — the seam for prompt compressors, cross-turn delta
/// encoders and similar token reducers.
///
/// Token savings produced here are attributed to the context module: the
/// pipeline snapshots the input size before any stage runs and the ledger
/// counts the difference as `savings.context`.
pub trait TransformStage: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrite the params in place. Errors are logged and the stage is
    /// skipped; only built-in policy stages can block a request.
    fn transform(&self, params: &mut GenerateParams) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    struct TruncatingCompressor {
        max_chars: usize,
    }

    impl TransformStage for TruncatingCompressor {
        fn name(&self) -> &str {
            "truncating-compressor"
        }

        fn transform(&self, params: &mut GenerateParams) -> anyhow::Result<()> {
            for message in &mut params.messages {
                if message.content.chars().count() > self.max_chars {
                    message.content = message.content.chars().take(self.max_chars).collect();
                }
            }
            Ok(())
        }
    }

    #[test]
    fn stage_rewrites_params() {
        let stage = TruncatingCompressor { max_chars: 5 };
        let mut params = GenerateParams {
            model_id: "gpt-4o".into(),
            messages: vec![Message::user("a very long message")],
            max_output_tokens: 100,
            user_id: None,
        };
        stage.transform(&mut params).unwrap();
        assert_eq!(params.messages[0].content, "a ver");
        assert_eq!(stage.name(), "truncating-compressor");
    }
}
