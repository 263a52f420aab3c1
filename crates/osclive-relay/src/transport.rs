//! Audio transport surface
//!
//! The recorder/player itself lives outside this crate; the relay only drives it
//! through [`AudioTransport`] and reports its state back to the clients.

use parking_lot::{Mutex, RwLock};
use rosc::{OscMessage, OscType};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Invoked by the transport whenever playback or recording starts or stops
pub type StatusCallback = Box<dyn Fn() + Send + Sync>;

/// Receives transport feedback messages
pub type StatusListener = Arc<dyn Fn(&[OscMessage]) + Send + Sync>;

/// Record/playback engine
pub trait AudioTransport: Send + Sync {
    fn play(&self, path: &Path) -> io::Result<()>;

    /// Stop playback or recording
    fn stop(&self);

    fn record(&self, path: &Path) -> io::Result<()>;

    /// Move the playback position, negative values rewind
    fn skip(&self, seconds: f64);

    fn is_playing(&self) -> bool;

    fn is_recording(&self) -> bool;

    fn on_status_change(&self, callback: StatusCallback);
}

/// Transport that never plays or records
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl AudioTransport for NullTransport {
    fn play(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn record(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn skip(&self, _seconds: f64) {}

    fn is_playing(&self) -> bool {
        false
    }

    fn is_recording(&self) -> bool {
        false
    }

    fn on_status_change(&self, _callback: StatusCallback) {}
}

/// Transport commands reachable over OSC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Record,
    Play,
    Prev,
    Next,
}

impl TransportCommand {
    pub const ALL: [TransportCommand; 4] = [
        TransportCommand::Record,
        TransportCommand::Play,
        TransportCommand::Prev,
        TransportCommand::Next,
    ];

    pub fn address(self) -> &'static str {
        match self {
            TransportCommand::Record => "/transport/rec",
            TransportCommand::Play => "/transport/play",
            TransportCommand::Prev => "/transport/prev",
            TransportCommand::Next => "/transport/next",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportStatus {
    Idle,
    Recording,
    Playing,
}

/// Toggle logic and status feedback on top of an [`AudioTransport`]
pub struct TransportControl {
    transport: Arc<dyn AudioTransport>,
    recordings_dir: PathBuf,
    filename: Mutex<Option<PathBuf>>,
    reported: Mutex<TransportStatus>,
    listeners: RwLock<Arc<Vec<(u64, StatusListener)>>>,
    next_id: AtomicU64,
}

impl TransportControl {
    pub fn new(transport: Arc<dyn AudioTransport>, recordings_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            recordings_dir: recordings_dir.into(),
            filename: Mutex::new(None),
            reported: Mutex::new(TransportStatus::Idle),
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish feedback whenever the transport reports a status change
    pub fn watch(self: &Arc<Self>) {
        let control = Arc::downgrade(self);
        self.transport.on_status_change(Box::new(move || {
            if let Some(control) = control.upgrade() {
                control.publish();
            }
        }));
    }

    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&[OscMessage]) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: StatusListener = Arc::new(listener);
        let mut list = self.listeners.write();
        let mut next = (**list).clone();
        next.push((id, listener));
        *list = Arc::new(next);
        id
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut list = self.listeners.write();
        let before = list.len();
        let next: Vec<_> = list.iter().filter(|(i, _)| *i != id).cloned().collect();
        let removed = next.len() != before;
        *list = Arc::new(next);
        removed
    }

    /// Send feedback to every listener if the status changed
    pub fn publish(&self) {
        let Some(messages) = self.changed_messages() else {
            return;
        };
        let listeners = self.listeners.read().clone();
        for (_, listener) in listeners.iter() {
            listener(&messages);
        }
    }

    pub fn transport(&self) -> &Arc<dyn AudioTransport> {
        &self.transport
    }

    /// Current file, recorded or played
    pub fn filename(&self) -> Option<PathBuf> {
        self.filename.lock().clone()
    }

    /// Run a command, then publish the resulting status
    pub fn execute(&self, command: TransportCommand) -> io::Result<()> {
        let result = match command {
            TransportCommand::Record => self.toggle_record(),
            TransportCommand::Play => self.toggle_play(),
            TransportCommand::Prev => {
                self.transport.skip(-1.0);
                Ok(())
            }
            TransportCommand::Next => {
                self.transport.skip(1.0);
                Ok(())
            }
        };
        self.publish();
        result
    }

    fn toggle_record(&self) -> io::Result<()> {
        if self.transport.is_recording() {
            self.transport.stop();
            return Ok(());
        }
        std::fs::create_dir_all(&self.recordings_dir)?;
        let name = chrono::Local::now()
            .format("rec_%Y%m%d_%H%M%S.wav")
            .to_string();
        let path = self.recordings_dir.join(name);
        info!("Recording to {}", path.display());
        *self.filename.lock() = Some(path.clone());
        self.transport.record(&path)
    }

    fn toggle_play(&self) -> io::Result<()> {
        if self.transport.is_playing() {
            self.transport.stop();
            return Ok(());
        }
        let current = self.filename.lock().clone();
        let path = match current {
            Some(path) => path,
            None => match newest_recording(&self.recordings_dir)? {
                Some(path) => path,
                None => {
                    debug!("Nothing to play in {}", self.recordings_dir.display());
                    return Ok(());
                }
            },
        };
        info!("Playing {}", path.display());
        *self.filename.lock() = Some(path.clone());
        self.transport.play(&path)
    }

    fn status(&self) -> TransportStatus {
        if self.transport.is_recording() {
            TransportStatus::Recording
        } else if self.transport.is_playing() {
            TransportStatus::Playing
        } else {
            TransportStatus::Idle
        }
    }

    /// Feedback for a status change since the last call, if any
    pub fn changed_messages(&self) -> Option<Vec<OscMessage>> {
        let status = self.status();
        let mut reported = self.reported.lock();
        if *reported == status {
            return None;
        }
        *reported = status;
        Some(self.messages_for(status))
    }

    /// Feedback describing the current status
    pub fn current_messages(&self) -> Vec<OscMessage> {
        self.messages_for(self.status())
    }

    fn messages_for(&self, status: TransportStatus) -> Vec<OscMessage> {
        let filename = self
            .filename()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let pairs: Vec<(&str, String)> = match status {
            TransportStatus::Recording => vec![
                ("/transport/filename", filename),
                ("/transport/rec/color", "red".into()),
                ("/transport/rec", "Stop".into()),
            ],
            TransportStatus::Playing => vec![
                ("/transport/filename", filename),
                ("/transport/play/color", "green".into()),
                ("/transport/play", "Stop".into()),
            ],
            TransportStatus::Idle => vec![
                ("/transport/rec/color", "yellow".into()),
                ("/transport/play/color", "gray".into()),
                ("/transport/rec", "Rec".into()),
                ("/transport/play", "Play".into()),
            ],
        };
        pairs
            .into_iter()
            .map(|(addr, value)| OscMessage {
                addr: addr.to_string(),
                args: vec![OscType::String(value)],
            })
            .collect()
    }
}

/// Most recently modified `.wav` file of a directory
fn newest_recording(dir: &Path) -> io::Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wav") {
            continue;
        }
        let modified = std::fs::metadata(&path)?.modified()?;
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, p)| p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeTransport {
        recording: AtomicBool,
        playing: AtomicBool,
        played: Mutex<Vec<PathBuf>>,
    }

    impl AudioTransport for FakeTransport {
        fn play(&self, path: &Path) -> io::Result<()> {
            self.played.lock().push(path.to_path_buf());
            self.playing.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) {
            self.playing.store(false, Ordering::SeqCst);
            self.recording.store(false, Ordering::SeqCst);
        }
        fn record(&self, _path: &Path) -> io::Result<()> {
            self.recording.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn skip(&self, _seconds: f64) {}
        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
        fn is_recording(&self) -> bool {
            self.recording.load(Ordering::SeqCst)
        }
        fn on_status_change(&self, _callback: StatusCallback) {}
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "osclive-transport-{}-{}",
            tag,
            uuid::Uuid::new_v4()
        ));
        dir
    }

    #[test]
    fn test_record_toggle_names_file() {
        let dir = temp_dir("rec");
        let fake = Arc::new(FakeTransport::default());
        let control = TransportControl::new(fake.clone(), &dir);

        control.execute(TransportCommand::Record).unwrap();
        assert!(fake.is_recording());
        let name = control.filename().unwrap();
        let name = name.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("rec_") && name.ends_with(".wav"));
        assert_eq!(name.len(), "rec_YYYYMMDD_HHMMSS.wav".len());
        assert!(dir.is_dir());

        control.execute(TransportCommand::Record).unwrap();
        assert!(!fake.is_recording());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_play_without_recordings_is_noop() {
        let dir = temp_dir("empty");
        let fake = Arc::new(FakeTransport::default());
        let control = TransportControl::new(fake.clone(), &dir);
        control.execute(TransportCommand::Play).unwrap();
        assert!(!fake.is_playing());
    }

    #[test]
    fn test_play_picks_recording_from_directory() {
        let dir = temp_dir("play");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.join("rec_20240101_120000.wav"), b"RIFF").unwrap();

        let fake = Arc::new(FakeTransport::default());
        let control = TransportControl::new(fake.clone(), &dir);
        control.execute(TransportCommand::Play).unwrap();
        assert_eq!(
            fake.played.lock().as_slice(),
            &[dir.join("rec_20240101_120000.wav")]
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_status_feedback_only_on_change() {
        let fake = Arc::new(FakeTransport::default());
        let control = TransportControl::new(fake.clone(), temp_dir("status"));
        assert!(control.changed_messages().is_none());

        fake.recording.store(true, Ordering::SeqCst);
        let messages = control.changed_messages().unwrap();
        let rec = messages.iter().find(|m| m.addr == "/transport/rec").unwrap();
        assert_eq!(rec.args, vec![OscType::String("Stop".into())]);
        assert!(control.changed_messages().is_none());

        fake.recording.store(false, Ordering::SeqCst);
        let messages = control.changed_messages().unwrap();
        assert_eq!(messages.len(), 4);
    }

    #[test]
    fn test_execute_publishes_to_listeners() {
        let dir = temp_dir("listen");
        let fake = Arc::new(FakeTransport::default());
        let control = Arc::new(TransportControl::new(fake.clone(), &dir));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = control.add_listener(move |messages| {
            sink.lock().extend(messages.iter().map(|m| m.addr.clone()));
        });

        control.execute(TransportCommand::Record).unwrap();
        assert!(seen.lock().contains(&"/transport/rec/color".to_string()));

        assert!(control.remove_listener(id));
        seen.lock().clear();
        control.execute(TransportCommand::Record).unwrap();
        assert!(seen.lock().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
