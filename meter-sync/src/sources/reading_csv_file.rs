use std::{fs::File, path::PathBuf, time::SystemTime};

use csv::StringRecord;
use futures::Stream;
use meter_client::domain::CustomerId;
use time::{macros::format_description, Date};

use crate::pipeline::{Envelope, PipelineError, Source};

/// One row of a bulk reading import. The value is kept raw so the normal
/// validation path decides whether it is numeric.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    /// 1-based line number in the file, header included.
    pub line: u64,
    pub customer_id: CustomerId,
    pub raw_value: String,
    pub reading_date: Date,
}

/// CSV import of gauge readings.
///
/// Expected header columns (by name):
/// - customer_id
/// - value
/// - reading_date (YYYY-MM-DD)
///
/// A row that cannot be read is yielded as [`PipelineError::InvalidRow`] and
/// the stream continues; only I/O failures end it.
pub struct ReadingCsvFileSource {
    path: PathBuf,
}

impl ReadingCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn record_to_row(record: &StringRecord, headers: &StringRecord, line: u64) -> Result<ImportRow, PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidRow { line, reason };
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .ok_or_else(|| invalid(format!("missing column '{name}'")))
    };

    let customer_id = get("customer_id")?;
    if customer_id.is_empty() {
        return Err(invalid("empty customer_id".to_string()));
    }

    let date_str = get("reading_date")?;
    let reading_date = Date::parse(date_str, format_description!("[year]-[month]-[day]"))
        .map_err(|e| invalid(format!("invalid reading_date '{date_str}': {e}")))?;

    Ok(ImportRow {
        line,
        customer_id: CustomerId::from(customer_id),
        raw_value: get("value")?.to_string(),
        reading_date,
    })
}

#[async_trait::async_trait]
impl Source<ImportRow> for ReadingCsvFileSource {
    async fn stream(&self) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<ImportRow>, PipelineError>> + Send>> {
        let path = self.path.clone();
        let s = async_stream::stream! {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to open {}: {e}", path.display())));
                    return;
                }
            };
            let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(file);
            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to read CSV headers: {e}")));
                    return;
                }
            };

            for result in rdr.records() {
                let record = match result {
                    Ok(r) => r,
                    Err(e) if e.is_io_error() => {
                        yield Err(PipelineError::Source(format!("failed to read CSV record: {e}")));
                        return;
                    }
                    Err(e) => {
                        let line = e.position().map(|p| p.line()).unwrap_or(0);
                        yield Err(PipelineError::InvalidRow { line, reason: e.to_string() });
                        continue;
                    }
                };
                let line = record.position().map(|p| p.line()).unwrap_or(0);

                match record_to_row(&record, &headers, line) {
                    Ok(row) => {
                        yield Ok(Envelope {
                            payload: row,
                            received_at: SystemTime::now(),
                        });
                    }
                    Err(e) => {
                        metrics::counter!("reading_csv_parse_errors_total").increment(1);
                        yield Err(e);
                    }
                }
            }
        };

        Box::pin(s)
    }
}
