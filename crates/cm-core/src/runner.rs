use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{Deserializer, JsonCodec, Serializer};
use crate::error::{BoxError, JobError};
use crate::job::Context;
use crate::result::JobResult;

/// A user function: `(Context, I) -> Result<O, BoxError>`.
///
/// Implemented for every `Fn(Context, I) -> impl Future<Output = Result<O, E>>`,
/// so plain `async fn`s can be registered directly.
pub trait Function<I, O>: Send + Sync + 'static {
    fn call(&self, context: Context, input: I) -> BoxFuture<'static, Result<O, BoxError>>;
}

impl<I, O, E, F, Fut> Function<I, O> for F
where
    F: Fn(Context, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    E: Into<BoxError>,
    I: 'static,
    O: 'static,
{
    fn call(&self, context: Context, input: I) -> BoxFuture<'static, Result<O, BoxError>> {
        let fut = (self)(context, input);
        Box::pin(async move { fut.await.map_err(Into::into) })
    }
}

/// Type-erased executable entry stored in the registry.
///
/// Each implementation closes over its own concrete input/output types, so
/// dispatch needs nothing more than the opaque query value.
pub trait Runner: Send + Sync {
    /// Name of the declared input type, for logs.
    fn input_type(&self) -> &'static str;

    /// Name of the declared output type, for logs.
    fn output_type(&self) -> &'static str;

    fn execute<'a>(
        &'a self,
        context: Context,
        input: serde_json::Value,
    ) -> BoxFuture<'a, JobResult>;
}

enum OutputEncoding<O> {
    Serialized(Box<dyn Serializer<O>>),
    Raw(fn(O) -> Vec<u8>),
}

/// Binds one [`Function`] to its input deserializer and output encoding.
pub struct FunctionRunner<I, O> {
    function: Box<dyn Function<I, O>>,
    deserializer: Box<dyn Deserializer<I>>,
    output: OutputEncoding<O>,
}

impl<I, O> FunctionRunner<I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    /// Runner using the JSON codec for both input and output.
    pub fn new(function: impl Function<I, O>) -> Self {
        Self {
            function: Box::new(function),
            deserializer: Box::new(JsonCodec),
            output: OutputEncoding::Serialized(Box::new(JsonCodec)),
        }
    }
}

impl<I> FunctionRunner<I, Vec<u8>>
where
    I: DeserializeOwned + Send + 'static,
{
    /// Runner whose output bytes are posted as-is, skipping the serializer.
    pub fn raw(function: impl Function<I, Vec<u8>>) -> Self {
        Self {
            function: Box::new(function),
            deserializer: Box::new(JsonCodec),
            output: OutputEncoding::Raw(|bytes| bytes),
        }
    }
}

impl<I, O> FunctionRunner<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Runner with caller-supplied codecs.
    pub fn with_codecs(
        function: impl Function<I, O>,
        deserializer: impl Deserializer<I> + 'static,
        serializer: impl Serializer<O> + 'static,
    ) -> Self {
        Self {
            function: Box::new(function),
            deserializer: Box::new(deserializer),
            output: OutputEncoding::Serialized(Box::new(serializer)),
        }
    }

    pub fn with_deserializer(mut self, deserializer: impl Deserializer<I> + 'static) -> Self {
        self.deserializer = Box::new(deserializer);
        self
    }

    pub fn with_serializer(mut self, serializer: impl Serializer<O> + 'static) -> Self {
        self.output = OutputEncoding::Serialized(Box::new(serializer));
        self
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.output, OutputEncoding::Raw(_))
    }
}

impl<I, O> Runner for FunctionRunner<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn input_type(&self) -> &'static str {
        std::any::type_name::<I>()
    }

    fn output_type(&self) -> &'static str {
        std::any::type_name::<O>()
    }

    fn execute<'a>(
        &'a self,
        context: Context,
        input: serde_json::Value,
    ) -> BoxFuture<'a, JobResult> {
        Box::pin(async move {
            let job_id = context.job_id().to_owned();

            let typed = match self.deserializer.deserialize(input) {
                Ok(typed) => typed,
                Err(source) => {
                    return JobResult::failed(
                        job_id,
                        JobError::Deserialization {
                            type_name: self.input_type(),
                            source,
                        },
                    );
                }
            };

            // The call itself sits inside the guarded future so a panic raised
            // before the function's first await is caught too.
            let invocation = async { self.function.call(context, typed).await };
            let output = match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return JobResult::failed(job_id, JobError::Execution(e)),
                Err(panic) => {
                    return JobResult::failed(job_id, JobError::Panicked(panic_message(&*panic)));
                }
            };

            match &self.output {
                OutputEncoding::Raw(into_bytes) => JobResult::ok(job_id, into_bytes(output)),
                OutputEncoding::Serialized(serializer) => serializer.serialize(&job_id, &output),
            }
        })
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
