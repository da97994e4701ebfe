use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CodecError, JobError};
use crate::result::JobResult;

/// Converts the opaque `query` value of a job into a function's input type.
pub trait Deserializer<I>: Send + Sync {
    fn deserialize(&self, input: serde_json::Value) -> Result<I, CodecError>;
}

/// Encodes a function's output. Encoding failures come back as
/// `JobResult::Failed` rather than an error, so custom serializers can decide
/// what a failed encoding looks like.
pub trait Serializer<O>: Send + Sync {
    fn serialize(&self, job_id: &str, output: &O) -> JobResult;
}

/// Default codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<I: DeserializeOwned> Deserializer<I> for JsonCodec {
    fn deserialize(&self, input: serde_json::Value) -> Result<I, CodecError> {
        Ok(serde_json::from_value(input)?)
    }
}

impl<O: Serialize> Serializer<O> for JsonCodec {
    fn serialize(&self, job_id: &str, output: &O) -> JobResult {
        match serde_json::to_vec(output) {
            Ok(bytes) => JobResult::ok(job_id, bytes),
            Err(e) => JobResult::failed(
                job_id,
                JobError::Serialization {
                    type_name: std::any::type_name::<O>(),
                    source: e.into(),
                },
            ),
        }
    }
}
