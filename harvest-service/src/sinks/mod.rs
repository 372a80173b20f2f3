pub mod export;
pub mod sqlite;

pub use export::{CsvExportSink, ExportFormat, ExportSink, JsonExportSink};
pub use sqlite::SqliteUsageStore;
