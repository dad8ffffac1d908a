// Local crates
use crate::metrics::metrics::PARSE_FAILURES_TOTAL;
use crate::model::event::LogEvent;
use crate::parser::multiline::MultilineAssembler;
use crate::parser::parser::{LogParser, ParseError, ParserConfig};
use crate::transform::transform::{TransformConfig, TransformError, TransformPipeline};

// External crates
use hdrhistogram::Histogram;
use lazy_static::lazy_static;
use std::sync::Mutex;

lazy_static! {
    /// Job latencies in microseconds, drained once a second into the p99
    /// gauge by the runtime's refresh task.
    pub static ref LAT_HISTOGRAM: Mutex<Histogram<u64>> =
        Mutex::new(Histogram::new(3).expect("static histogram"));
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// The per-event stage between inputs and the buffer: optional multiline
/// assembly, parsing, then the transform chain. Shared by every input;
/// the assembler keys its pending state by event source.
#[derive(Debug)]
pub struct EventProcessor {
    parser: LogParser,
    assembler: Option<Mutex<MultilineAssembler>>,
    transforms: TransformPipeline,
}

impl EventProcessor {
    pub fn from_config(
        parser: &ParserConfig,
        transforms: &[TransformConfig],
    ) -> Result<Self, ProcessingError> {
        let assembler = match &parser.multiline {
            Some(multiline) => Some(Mutex::new(
                MultilineAssembler::new(multiline).map_err(ParseError::Pattern)?,
            )),
            None => None,
        };
        Ok(Self {
            parser: LogParser::from_config(parser)?,
            assembler,
            transforms: TransformPipeline::from_config(transforms)?,
        })
    }

    /// Pass-through processor: plain parsing, no assembly, no transforms.
    pub fn passthrough() -> Self {
        Self {
            parser: LogParser::Plain,
            assembler: None,
            transforms: TransformPipeline::default(),
        }
    }

    /// Process one physical line from `source` into zero or more events.
    /// With multiline configured a line may complete earlier records or
    /// none at all; without it the mapping is one-to-one.
    pub fn process_line(&self, source: &str, line: &str) -> Vec<LogEvent> {
        match &self.assembler {
            Some(assembler) => {
                let records = match assembler.lock() {
                    Ok(mut assembler) => {
                        assembler.feed(source, line.trim_end_matches(['\r', '\n']))
                    }
                    Err(_) => return Vec::new(),
                };
                records
                    .iter()
                    .map(|record| self.finish(source, record))
                    .collect()
            }
            None => vec![self.finish(source, line)],
        }
    }

    /// Apply transforms to an event an input has already parsed.
    pub fn process_event(&self, mut event: LogEvent) -> LogEvent {
        self.transforms.apply(&mut event);
        event
    }

    /// Emit multiline records whose timeout has elapsed.
    pub fn flush_expired(&self) -> Vec<LogEvent> {
        self.flush_with(|assembler| assembler.flush_expired())
    }

    /// Emit every pending multiline record; graceful-stop path.
    pub fn flush_all(&self) -> Vec<LogEvent> {
        self.flush_with(|assembler| assembler.flush_all())
    }

    fn flush_with(
        &self,
        flush: impl FnOnce(&mut MultilineAssembler) -> Vec<(String, String)>,
    ) -> Vec<LogEvent> {
        let Some(assembler) = &self.assembler else {
            return Vec::new();
        };
        let records = match assembler.lock() {
            Ok(mut assembler) => flush(&mut assembler),
            Err(_) => return Vec::new(),
        };
        records
            .iter()
            .map(|(source, record)| self.finish(source, record))
            .collect()
    }

    fn finish(&self, source: &str, record: &str) -> LogEvent {
        let mut event = self.parser.parse_or_fallback(source, record);
        if event.parse_failed {
            PARSE_FAILURES_TOTAL.inc();
        }
        self.transforms.apply(&mut event);
        event
    }
}
