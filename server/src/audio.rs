use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender};
use rodio::source::SineWave;
use rodio::{Decoder, OutputStreamBuilder, Sink, Source};
use tracing::{debug, warn};

const TONE_HZ: f32 = 880.0;
const TONE_ON: Duration = Duration::from_millis(400);
const TONE_GAP: Duration = Duration::from_millis(600);
const TONE_VOLUME: f32 = 0.25;

/// Looping local alert sound.
pub trait AlertPlayer: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    fn is_playing(&self) -> bool;
}

enum AlertSound {
    File(Decoder<BufReader<File>>),
    Tone,
}

impl AlertSound {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::Tone);
        };
        let file = File::open(path)
            .with_context(|| format!("unable to open alert sound {}", path.display()))?;
        let decoder = Decoder::new(BufReader::new(file))
            .map_err(|err| anyhow!("could not decode alert sound {}: {err}", path.display()))?;
        Ok(Self::File(decoder))
    }

    fn queue_on(self, sink: &Sink) {
        match self {
            Self::File(decoder) => sink.append(decoder.repeat_infinite()),
            Self::Tone => sink.append(
                SineWave::new(TONE_HZ)
                    .take_duration(TONE_ON)
                    .amplify(TONE_VOLUME)
                    .delay(TONE_GAP)
                    .repeat_infinite(),
            ),
        }
    }
}

/// Loops the configured sound file, or a beep when none is configured, on
/// the default output device until stopped.
pub struct SinkPlayer {
    sound: Option<PathBuf>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SinkPlayer {
    pub fn new(sound: Option<PathBuf>) -> Self {
        Self {
            sound,
            stop_tx: None,
            worker: None,
        }
    }
}

impl AlertPlayer for SinkPlayer {
    fn start(&mut self) -> Result<()> {
        if self.is_playing() {
            return Ok(());
        }
        let sound = AlertSound::load(self.sound.as_deref())?;

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let worker = thread::Builder::new()
            .name("alert-sound".to_string())
            .spawn(move || play_until_stopped(sound, &ready_tx, &stop_rx))
            .context("failed to spawn alert sound thread")?;

        let started = ready_rx
            .recv()
            .map_err(|_| anyhow!("alert sound thread exited before playing"))
            .and_then(|result| result);
        if let Err(err) = started {
            let _ = worker.join();
            return Err(err);
        }
        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn is_playing(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }
}

impl Drop for SinkPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play_until_stopped(sound: AlertSound, ready: &Sender<Result<()>>, stop: &Receiver<()>) {
    let mut stream = match OutputStreamBuilder::open_default_stream() {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(anyhow!("no audio output available: {err}")));
            return;
        }
    };
    stream.log_on_drop(false);

    let sink = Sink::connect_new(stream.mixer());
    sound.queue_on(&sink);
    sink.play();
    debug!("alert sound playing");
    if ready.send(Ok(())).is_err() {
        warn!("alert sound owner went away; stopping playback");
        sink.stop();
        return;
    }

    // Returns on an explicit stop or when the owner is dropped.
    let _ = stop.recv();
    sink.stop();
    debug!("alert sound stopped");
}
