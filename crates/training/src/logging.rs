use std::{
    fmt,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{config::LoggingConfig, TrainingError};

/// Receiver of `(tag, value, step)` scalar events.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), TrainingError>;
    fn flush(&mut self) -> Result<(), TrainingError>;
    fn close(&mut self) -> Result<(), TrainingError>;
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), TrainingError> {
        (**self).add_scalar(tag, value, step)
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<(), TrainingError> {
        (**self).close()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarEvent {
    pub tag: String,
    pub value: f64,
    pub step: usize,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Vec<ScalarEvent>,
    flushes: usize,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[ScalarEvent] {
        &self.events
    }

    pub fn events_tagged<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ScalarEvent> {
        self.events.iter().filter(move |event| event.tag == tag)
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), TrainingError> {
        if self.closed {
            return Err(TrainingError::runtime("metrics sink is closed"));
        }
        self.events.push(ScalarEvent {
            tag: tag.to_string(),
            value,
            step,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TrainingError> {
        self.closed = true;
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: usize) -> Result<(), TrainingError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// TensorBoard event-file writer (TFRecord framing, masked CRC32).
pub struct TensorBoardWriter {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: Some(BufWriter::new(file)),
            path,
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TrainingError::runtime("tensorboard writer is closed"))?;

        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        writer
            .write_all(&len_bytes)
            .and_then(|_| writer.write_all(&len_crc))
            .and_then(|_| writer.write_all(&data))
            .and_then(|_| writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }
}

impl MetricsSink for TensorBoardWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), TrainingError> {
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step: step as i64,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        })
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|err| {
                TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
            })?;
        }
        self.pending = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TrainingError> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }

    pub fn quiet() -> Self {
        Self {
            enable_stdout: false,
            tensorboard_dir: None,
            tensorboard_flush_every_n: 1,
        }
    }

    /// TensorBoard writer when a directory is configured, otherwise a sink
    /// that drops events.
    pub fn build_sink(&self) -> Result<Box<dyn MetricsSink>, TrainingError> {
        match self.tensorboard_dir.as_ref() {
            Some(dir) => Ok(Box::new(TensorBoardWriter::create(
                dir,
                self.tensorboard_flush_every_n,
            )?)),
            None => Ok(Box::new(NullSink)),
        }
    }
}

/// Progress lines on stdout plus scalar events on a [`MetricsSink`].
///
/// Sink and progress write failures are reported through `log::warn!` and
/// never stop training.
pub struct Logger<S: MetricsSink> {
    settings: LoggingSettings,
    sink: S,
    progress: Box<dyn Write + Send>,
}

impl<S: MetricsSink> Logger<S> {
    pub fn new(settings: LoggingSettings, sink: S) -> Self {
        Self {
            settings,
            sink,
            progress: Box::new(io::stdout()),
        }
    }

    /// Sends progress lines to `writer` instead of stdout.
    pub fn with_progress_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.progress = Box::new(writer);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn scalar(&mut self, tag: &str, value: f64, step: usize) {
        if let Err(err) = self.sink.add_scalar(tag, value, step) {
            log::warn!("dropping metric {tag} at step {step}: {err}");
        }
    }

    pub fn progress(&mut self, split: &str, epoch: usize, batch: usize, loss: f64) {
        self.print(format_args!("{split} epoch={epoch} batch={batch} loss={loss:.6}"));
    }

    pub fn epoch_summary(&mut self, epoch: usize, train: f64, val: f64) {
        self.print(format_args!("epoch={epoch} train_loss={train:.6} val_loss={val:.6}"));
    }

    fn print(&mut self, line: fmt::Arguments<'_>) {
        if !self.settings.enable_stdout {
            return;
        }
        if let Err(err) = writeln!(self.progress, "{line}") {
            log::warn!("failed to write progress line: {err}");
        }
    }

    pub fn flush_and_close(&mut self) {
        if let Err(err) = self.progress.flush() {
            log::warn!("failed to flush progress output: {err}");
        }
        if let Err(err) = self.sink.flush() {
            log::warn!("failed to flush metrics sink: {err}");
        }
        if let Err(err) = self.sink.close() {
            log::warn!("failed to close metrics sink: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensorboard_records_are_framed_with_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TensorBoardWriter::create(dir.path(), 100).unwrap();
        writer.add_scalar("train/step_loss", 0.5, 3).unwrap();
        writer.close().unwrap();

        let bytes = fs::read(writer.path()).unwrap();
        let mut offset = 0;
        let mut records = 0;
        while offset < bytes.len() {
            let mut len = [0u8; 8];
            len.copy_from_slice(&bytes[offset..offset + 8]);
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&len));
            let len = u64::from_le_bytes(len) as usize;
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc =
                u32::from_le_bytes(bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap());
            assert_eq!(data_crc, masked_crc32(data));
            offset += 16 + len;
            records += 1;
        }
        assert_eq!(records, 2);
        assert!(writer.add_scalar("late", 1.0, 4).is_err());
    }

    #[test]
    fn logger_survives_a_closed_sink() {
        let mut logger = Logger::new(LoggingSettings::quiet(), MemorySink::new());
        logger.scalar("val/step_loss", 1.0, 0);
        logger.flush_and_close();
        logger.scalar("val/step_loss", 2.0, 1);

        let sink = logger.into_sink();
        assert!(sink.is_closed());
        assert_eq!(sink.flushes(), 1);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn without_a_tensorboard_dir_events_are_dropped() {
        let mut sink = LoggingSettings::quiet().build_sink().unwrap();
        sink.add_scalar("train/step_loss", 0.5, 0).unwrap();
        sink.close().unwrap();
        assert!(sink.add_scalar("train/step_loss", 0.4, 1).is_ok());
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn progress_lines_go_to_the_configured_writer_only_when_enabled() {
        let buffer = SharedBuffer::default();
        let mut settings = LoggingSettings::quiet();
        let mut quiet = Logger::new(settings.clone(), NullSink).with_progress_writer(buffer.clone());
        quiet.progress("train", 0, 0, 1.0);
        assert!(buffer.0.lock().unwrap().is_empty());

        settings.enable_stdout = true;
        let mut logger = Logger::new(settings, NullSink).with_progress_writer(buffer.clone());
        logger.progress("val", 2, 4, 0.25);
        logger.epoch_summary(2, 0.5, 0.25);

        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            text,
            "val epoch=2 batch=4 loss=0.250000\nepoch=2 train_loss=0.500000 val_loss=0.250000\n"
        );
    }
}
