//! Mapper between `ActionResult` and its wire form

use crate::action::{ActionResult, FileMetadata, Output, OutputContent};
use crate::error::{RemoteError, Result};
use crate::mapper::digest::{digest_from_proto, digest_to_proto};
use crate::proto;

/// Mapper for converting action results to and from the wire
pub struct ResultMapper;

impl ResultMapper {
    /// Map a domain ActionResult to its wire message
    pub fn to_proto(result: &ActionResult) -> proto::ActionResult {
        let output = result
            .outputs
            .iter()
            .map(|output| proto::Output {
                path: output.path.clone(),
                content: Some(match &output.content {
                    OutputContent::File(metadata) => {
                        proto::output::Content::FileMetadata(proto::FileMetadata {
                            digest: Some(digest_to_proto(&metadata.digest)),
                            executable: metadata.executable,
                        })
                    }
                    OutputContent::Directory(root) => {
                        proto::output::Content::Digest(digest_to_proto(root))
                    }
                }),
            })
            .collect();

        proto::ActionResult {
            output,
            return_code: result.return_code,
        }
    }

    /// Map a wire ActionResult, rejecting outputs without content
    pub fn from_proto(result: proto::ActionResult) -> Result<ActionResult> {
        let outputs = result
            .output
            .into_iter()
            .map(Self::output_from_proto)
            .collect::<Result<Vec<_>>>()?;

        Ok(ActionResult {
            outputs,
            return_code: result.return_code,
        })
    }

    fn output_from_proto(output: proto::Output) -> Result<Output> {
        let content = match output.content {
            Some(proto::output::Content::FileMetadata(metadata)) => {
                let digest = metadata.digest.as_ref().ok_or_else(|| {
                    RemoteError::protocol_violation(format!(
                        "output '{}' has file metadata without a digest",
                        output.path
                    ))
                })?;
                OutputContent::File(FileMetadata {
                    digest: digest_from_proto(digest)?,
                    executable: metadata.executable,
                })
            }
            Some(proto::output::Content::Digest(root)) => {
                OutputContent::Directory(digest_from_proto(&root)?)
            }
            None => {
                return Err(RemoteError::protocol_violation(format!(
                    "output '{}' has no content",
                    output.path
                )));
            }
        };

        Ok(Output {
            path: output.path,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::Digest;

    #[test]
    fn test_map_result_file_and_directory() {
        let result = ActionResult {
            outputs: vec![
                Output::file("out/bin/tool", Digest::from_bytes(b"elf"), true),
                Output::directory("out/gen", Digest::from_bytes(b"tree")),
            ],
            return_code: 0,
        };

        let proto = ResultMapper::to_proto(&result);
        assert_eq!(proto.output.len(), 2);
        assert!(matches!(
            proto.output[0].content,
            Some(proto::output::Content::FileMetadata(ref m)) if m.executable
        ));

        let back = ResultMapper::from_proto(proto).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_output_without_content_is_rejected() {
        let proto = proto::ActionResult {
            output: vec![proto::Output {
                path: "out/x".to_string(),
                content: None,
            }],
            return_code: 0,
        };

        let err = ResultMapper::from_proto(proto).unwrap_err();
        assert!(matches!(err, RemoteError::ProtocolViolation { .. }));
        assert!(err.to_string().contains("out/x"));
    }
}
