//! Zip container holding one object-graph record plus raw storage records.
//!
//! Layout (as written by `torch.save`):
//!
//! ```text
//! <archive>/data.pkl      pickled object graph
//! <archive>/byteorder     "little" | "big"
//! <archive>/data/<key>    raw storage bytes, one record per storage
//! <archive>/version       format version
//! ```

mod reader;
mod writer;

pub use reader::ArchiveReader;
pub use writer::ArchiveWriter;

/// Default name of the object-graph record.
pub const PICKLE_RECORD: &str = "data.pkl";

/// Format version written into new archives.
pub const FORMAT_VERSION: &str = "3\n";
