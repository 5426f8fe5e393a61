//! Records and the stream contracts between stages.

mod cancellable;
mod codec;
mod record;
mod source;
mod stream;

pub use cancellable::CancellableSource;
pub use codec::{decode_record, encode_end, encode_record, END_MARKER};
pub use record::Record;
pub use source::{copy_records, RecordSink, RecordSource, SourceOpener};
pub use stream::{RecordStreamReader, RecordStreamWriter, StreamFileOpener};
