//! Topic-to-topic message pipe.

mod codec;
mod engine;
mod report;

pub use codec::{
    read_wire_header, write_wire_format, AvroCodec, CodecError, DecodedPayload, RecordCodec,
};
pub use engine::{run_pipe, MessagePipe, PipeConfig};
pub use report::{
    FailureKind, OffsetRange, PartitionPipeReport, PartitionStatus, PipeFailure, PipeReport,
};
