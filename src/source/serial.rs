use super::{
    parse_value, CommandError, CommandSink, ObservedAt, RawSample, SampleSource, SourceError,
};
use crate::framing::{Frame, FrameParser, DEFAULT_MAX_FRAME_LEN, FRAME_END, FRAME_START};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_KEY_MAP: &str = "TEMP=temp,HUMI=humi,LIGHT=light,PIR=pir,RT=rt,RH=rh,LUX=lux";
pub const MAX_COMMAND_LEN: usize = 64;
const READ_CHUNK: usize = 1024;
const COMMAND_QUEUE: usize = 16;

/// Maps packet keys (`TEMP`, `RH`, ...) to metric names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMap {
    keys: HashMap<String, String>,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self::parse(DEFAULT_KEY_MAP).unwrap_or_else(|_| Self {
            keys: HashMap::new(),
        })
    }
}

impl KeyMap {
    /// Parses `KEY=metric` pairs separated by commas.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut keys = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, metric) = entry
                .split_once('=')
                .ok_or_else(|| format!("invalid key map entry {entry:?} (expected KEY=metric)"))?;
            let key = key.trim().to_ascii_uppercase();
            let metric = metric.trim();
            if key.is_empty() || metric.is_empty() {
                return Err(format!("invalid key map entry {entry:?}"));
            }
            keys.insert(key, metric.to_string());
        }
        if keys.is_empty() {
            return Err("key map is empty".to_string());
        }
        Ok(Self { keys })
    }

    pub fn metric_for(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: PathBuf,
    pub reconnect_delay: Duration,
    pub key_map: KeyMap,
    pub max_frame_len: usize,
}

impl SerialSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reconnect_delay: Duration::from_secs(5),
            key_map: KeyMap::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Turns a frame into a sample. Keys outside the map yield `Ok(None)`.
pub fn frame_to_sample(
    frame: &Frame,
    keys: &KeyMap,
    received_at: DateTime<Utc>,
) -> Result<Option<RawSample>, SourceError> {
    let Some(metric) = keys.metric_for(&frame.key) else {
        return Ok(None);
    };
    let value = parse_value(&frame.value)?;
    Ok(Some(RawSample {
        metric: metric.to_string(),
        value,
        observed_at: ObservedAt::from(received_at),
    }))
}

/// Checks a command before it goes on the wire as `<command>#`.
pub fn validate_command(command: &str) -> Result<&str, CommandError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(CommandError::Invalid("command is empty".to_string()));
    }
    if command.len() > MAX_COMMAND_LEN {
        return Err(CommandError::Invalid(format!(
            "command longer than {MAX_COMMAND_LEN} bytes"
        )));
    }
    if command
        .bytes()
        .any(|b| b == FRAME_START || b == FRAME_END || !(b.is_ascii_graphic() || b == b' '))
    {
        return Err(CommandError::Invalid(format!(
            "command {command:?} contains a framing or non-printable byte"
        )));
    }
    Ok(command)
}

/// Clears the connected flag when a link pump exits.
struct LinkUp<'a>(&'a AtomicBool);

impl Drop for LinkUp<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Latest sample per metric as read off a serial device link, plus the queue
/// of actuator commands waiting to be written back to it.
///
/// Frames are stamped with their receive time, so re-polling a metric that has
/// not produced a new frame returns the same sample and dedups as a repeat.
#[derive(Clone)]
pub struct SerialFeed {
    latest: Arc<Mutex<HashMap<String, RawSample>>>,
    commands: mpsc::Sender<String>,
    pending: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    connected: Arc<AtomicBool>,
}

impl Default for SerialFeed {
    fn default() -> Self {
        let (commands, pending) = mpsc::channel(COMMAND_QUEUE);
        Self {
            latest: Arc::new(Mutex::new(HashMap::new())),
            commands,
            pending: Arc::new(tokio::sync::Mutex::new(pending)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SerialFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: RawSample) {
        if let Ok(mut latest) = self.latest.lock() {
            latest.insert(sample.metric.clone(), sample);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn handle_frame(&self, frame: Frame, keys: &KeyMap) {
        match frame_to_sample(&frame, keys, Utc::now()) {
            Ok(Some(sample)) => {
                tracing::trace!(metric = %sample.metric, value = sample.value, id = %frame.id, "serial sample");
                self.record(sample);
            }
            Ok(None) => {
                tracing::debug!(key = %frame.key, "ignoring frame for unmapped key");
            }
            Err(err) => {
                tracing::warn!(key = %frame.key, error = %err, "failed to decode serial frame");
            }
        }
    }

    /// Services `link` until EOF, an I/O error or cancellation: every decodable
    /// frame read is recorded, every queued command is written as `<command>#`.
    /// Framing errors are logged and skipped.
    pub async fn pump<S>(
        &self,
        link: S,
        parser: &mut FrameParser,
        keys: &KeyMap,
        cancel: &CancellationToken,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(link);
        let mut pending = self.pending.lock().await;
        // Commands sent while no link was up are stale.
        while pending.try_recv().is_ok() {}
        self.connected.store(true, Ordering::Release);
        let _link_up = LinkUp(&self.connected);

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = reader.read(&mut chunk) => {
                    let read = read?;
                    if read == 0 {
                        return Ok(());
                    }
                    parser.push(&chunk[..read]);
                    for frame in parser.frames() {
                        match frame {
                            Ok(frame) => self.handle_frame(frame, keys),
                            Err(err) => tracing::warn!(error = %err, "dropped serial frame"),
                        }
                    }
                }
                Some(command) = pending.recv() => {
                    writer.write_all(format!("{command}#").as_bytes()).await?;
                    writer.flush().await?;
                    tracing::debug!(command = %command, "command written to device");
                }
            }
        }
    }

    /// Opens the device at `settings.path` for reading and writing and keeps
    /// servicing it, reopening after `reconnect_delay` whenever the link fails
    /// or closes.
    pub fn spawn_device_reader(
        &self,
        settings: SerialSettings,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move {
            let mut parser = FrameParser::with_max_frame_len(settings.max_frame_len);
            while !cancel.is_cancelled() {
                let opened = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&settings.path)
                    .await;
                match opened {
                    Ok(device) => {
                        tracing::info!(path = %settings.path.display(), "serial device opened");
                        if let Err(err) = feed
                            .pump(device, &mut parser, &settings.key_map, &cancel)
                            .await
                        {
                            tracing::warn!(path = %settings.path.display(), error = %err, "serial link failed");
                        } else if !cancel.is_cancelled() {
                            tracing::warn!(path = %settings.path.display(), "serial device closed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(path = %settings.path.display(), error = %err, "failed to open serial device");
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.reconnect_delay) => {}
                }
            }
            tracing::info!(path = %settings.path.display(), "serial reader stopped");
        })
    }
}

#[async_trait]
impl SampleSource for SerialFeed {
    async fn fetch_latest(&self, metric: &str) -> Result<Option<RawSample>, SourceError> {
        let latest = self
            .latest
            .lock()
            .map_err(|_| SourceError::Decode("serial feed state poisoned".to_string()))?;
        Ok(latest.get(metric).cloned())
    }
}

impl CommandSink for SerialFeed {
    fn send_command(&self, command: &str) -> Result<(), CommandError> {
        let command = validate_command(command)?;
        if !self.is_connected() {
            return Err(CommandError::NotConnected);
        }
        self.commands
            .try_send(command.to_string())
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => CommandError::Busy,
                mpsc::error::TrySendError::Closed(_) => CommandError::NotConnected,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn key_map_parses_and_uppercases() {
        let keys = KeyMap::parse("temp=rt, Humi = rh").expect("parse");
        assert_eq!(keys.metric_for("TEMP"), Some("rt"));
        assert_eq!(keys.metric_for("HUMI"), Some("rh"));
        assert_eq!(keys.metric_for("LUX"), None);
        assert!(KeyMap::parse("TEMP").is_err());
        assert!(KeyMap::parse(" , ").is_err());
    }

    #[test]
    fn default_key_map_covers_known_sensors() {
        let keys = KeyMap::default();
        for (key, metric) in [("TEMP", "temp"), ("PIR", "pir"), ("LUX", "lux")] {
            assert_eq!(keys.metric_for(key), Some(metric));
        }
    }

    #[test]
    fn frame_to_sample_rejects_command_values() {
        let keys = KeyMap::default();
        let now = Utc::now();
        let frame = Frame {
            id: "1".to_string(),
            key: "TEMP".to_string(),
            value: "on".to_string(),
        };
        assert!(frame_to_sample(&frame, &keys, now).is_err());

        let unmapped = Frame {
            id: "1".to_string(),
            key: "LED".to_string(),
            value: "1".to_string(),
        };
        assert!(frame_to_sample(&unmapped, &keys, now)
            .expect("unmapped")
            .is_none());
    }

    #[tokio::test]
    async fn pump_records_latest_sample_per_metric() {
        let feed = SerialFeed::new();
        let mut parser = FrameParser::new();
        let cancel = CancellationToken::new();
        let (mut device, link) = tokio::io::duplex(1024);
        device
            .write_all(b"!01:TEMP:26.3#!02:HUMI:55#garbage!bad#!03:TEMP:27#")
            .await
            .expect("write");
        drop(device);

        feed.pump(link, &mut parser, &KeyMap::default(), &cancel)
            .await
            .expect("pump");

        let temp = feed.fetch_latest("temp").await.expect("temp").expect("sample");
        assert_eq!(temp.value, 27.0);
        let humi = feed.fetch_latest("humi").await.expect("humi").expect("sample");
        assert_eq!(humi.value, 55.0);
        assert!(feed.fetch_latest("lux").await.expect("lux").is_none());
    }

    #[tokio::test]
    async fn pump_handles_chunked_reader() {
        let (mut writer, reader) = tokio::io::duplex(8);
        let feed = SerialFeed::new();
        let cancel = CancellationToken::new();

        let pump_feed = feed.clone();
        let pump = tokio::spawn(async move {
            let mut parser = FrameParser::new();
            pump_feed
                .pump(reader, &mut parser, &KeyMap::default(), &cancel)
                .await
        });

        writer.write_all(b"!01:LUX:").await.expect("write");
        writer.write_all(b"312#").await.expect("write");
        drop(writer);
        pump.await.expect("join").expect("pump");

        let lux = feed.fetch_latest("lux").await.expect("lux").expect("sample");
        assert_eq!(lux.value, 312.0);
    }

    #[test]
    fn commands_must_be_printable_and_unframed() {
        assert_eq!(validate_command(" 1 "), Ok("1"));
        assert_eq!(validate_command("blink fast"), Ok("blink fast"));
        let long = "x".repeat(MAX_COMMAND_LEN + 1);
        for bad in ["", "on#", "!01:LED:1", "a\nb", long.as_str()] {
            assert!(matches!(validate_command(bad), Err(CommandError::Invalid(_))));
        }
    }

    #[tokio::test]
    async fn commands_are_written_to_the_live_link() {
        let feed = SerialFeed::new();
        assert_eq!(feed.send_command("1"), Err(CommandError::NotConnected));

        let (mut device, link) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();
        let pump = {
            let feed = feed.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut parser = FrameParser::new();
                feed.pump(link, &mut parser, &KeyMap::default(), &cancel)
                    .await
            })
        };

        timeout(Duration::from_secs(2), async {
            while !feed.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("link up");

        feed.send_command("1").expect("send");
        feed.send_command("blink").expect("send");
        let mut written = [0u8; 8];
        timeout(Duration::from_secs(2), device.read_exact(&mut written))
            .await
            .expect("written in time")
            .expect("read");
        assert_eq!(&written, b"1#blink#");

        // Frames still flow in while commands go out.
        device.write_all(b"!04:PIR:1#").await.expect("write");
        timeout(Duration::from_secs(2), async {
            while feed.fetch_latest("pir").await.expect("pir").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pir recorded");

        cancel.cancel();
        pump.await.expect("join").expect("pump");
        assert!(!feed.is_connected());
        assert_eq!(feed.send_command("0"), Err(CommandError::NotConnected));
    }
}
