// src/lib.rs
//
// Ingest, storage and multi-resolution viewing of TWELITE wireless sensor
// packets. Bytes from the serial link go through the ASCII framer, the packet
// decoder and the normalizer, and land in the live buffer and the SQLite store.
// The view engine renders stored and live records at eight zoom levels.

#[macro_use]
mod logging;

pub mod checksums;
pub mod csv_export;
pub mod error;
pub mod io;
pub mod live_buffer;
pub mod normalizer;
pub mod packet;
pub mod record;
pub mod session;
pub mod settings;
pub mod store;
pub mod view;

pub use error::{ClassifyError, ExportError, FrameError, SettingsError, StoreError, ViewBoundsError};
pub use logging::{init_file_logging, stop_file_logging};
pub use record::SensorRecord;
pub use session::{NullSink, RenderSink, Session, ViewMode};
pub use store::WsnsStore;
pub use view::MultiResolutionView;
