use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use uuid::Uuid;

pub type JobId = Uuid;

/// A bounded stream of uploaded bytes for one artifact role.
///
/// The producer side (HTTP multipart, a file reader, a test fixture) feeds
/// chunks through whatever channel it likes; the store only sees a stream.
pub type ByteSource = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// The uploads making up one signing request. Every role except
/// entitlements is mandatory.
pub struct JobInputs {
    pub package: ByteSource,
    pub certificate: ByteSource,
    pub profile: ByteSource,
    pub entitlements: Option<ByteSource>,
}
