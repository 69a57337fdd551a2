//! Linux sysfs GPIO backend (`/sys/class/gpio`).
//!
//! Each watched pin gets a dedicated thread blocking in `poll(2)` on its
//! `value` file. The kernel signals `POLLPRI` on every configured edge; the
//! thread only forwards the pin number, the engine re-reads the level.
//!
//! Pull resistors cannot be programmed through sysfs; the zones are expected
//! to be wired with the board's default pull-down (or an external one).

use super::{GpioPin, GpioPort, Level};
use crate::error::{BridgeError, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a watcher blocks in poll before checking its stop flag.
const WATCH_POLL_MS: u16 = 250;
/// How long to wait for udev to make a freshly exported pin writable.
const EXPORT_SETTLE: Duration = Duration::from_millis(100);

struct Watcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SysfsGpio {
    root: PathBuf,
    watchers: Mutex<HashMap<GpioPin, Watcher>>,
}

impl SysfsGpio {
    /// Create a backend rooted at `root` (normally `/sys/class/gpio`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    fn pin_dir(&self, pin: GpioPin) -> PathBuf {
        self.root.join(format!("gpio{}", pin.number()))
    }

    fn value_path(&self, pin: GpioPin) -> PathBuf {
        self.pin_dir(pin).join("value")
    }

    fn write_attr(path: &Path, value: &str) -> io::Result<()> {
        fs::write(path, value)
    }

    fn export(&self, pin: GpioPin) -> Result<()> {
        if self.pin_dir(pin).exists() {
            debug!("[GPIO] {} already exported", pin);
            return Ok(());
        }
        Self::write_attr(&self.root.join("export"), &pin.number().to_string())?;
        std::thread::sleep(EXPORT_SETTLE);
        if !self.pin_dir(pin).exists() {
            return Err(BridgeError::IoError(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not appear after export", pin),
            )));
        }
        Ok(())
    }

    fn stop_watcher(&self, pin: GpioPin) {
        if let Some(watcher) = self.watchers.lock().remove(&pin) {
            watcher.stop.store(true, Ordering::SeqCst);
            if watcher.handle.join().is_err() {
                warn!("[GPIO] edge watcher for {} panicked", pin);
            }
        }
    }
}

fn read_level(file: &mut File) -> io::Result<Level> {
    let mut buf = String::with_capacity(4);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut buf)?;
    Level::parse(&buf).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected GPIO value '{}'", buf.trim()),
        )
    })
}

fn watch_edges(
    pin: GpioPin,
    mut file: File,
    stop: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<GpioPin>,
) {
    // sysfs reports POLLPRI once before the first read; consume it
    if let Err(e) = read_level(&mut file) {
        warn!("[GPIO] initial read of {} failed: {}", pin, e);
    }

    while !stop.load(Ordering::SeqCst) {
        let mut fds = [PollFd::new(
            file.as_fd(),
            PollFlags::POLLPRI | PollFlags::POLLERR,
        )];
        match poll(&mut fds, PollTimeout::from(WATCH_POLL_MS)) {
            Ok(0) => continue,
            Ok(_) => {
                if let Err(e) = read_level(&mut file) {
                    warn!("[GPIO] read of {} after edge failed: {}", pin, e);
                }
                if events.send(pin).is_err() {
                    debug!("[GPIO] edge receiver for {} closed", pin);
                    break;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("[GPIO] poll on {} failed: {}", pin, e);
                break;
            }
        }
    }
}

impl GpioPort for SysfsGpio {
    fn configure_input(&self, pin: GpioPin) -> Result<()> {
        self.export(pin)?;
        let dir = self.pin_dir(pin);
        Self::write_attr(&dir.join("direction"), "in")?;
        Self::write_attr(&dir.join("edge"), "both")?;
        info!("[GPIO] {} configured as input, both edges", pin);
        Ok(())
    }

    fn read(&self, pin: GpioPin) -> Result<Level> {
        let mut file =
            File::open(self.value_path(pin)).map_err(|source| BridgeError::HardwareRead {
                pin,
                source,
            })?;
        read_level(&mut file).map_err(|source| BridgeError::HardwareRead { pin, source })
    }

    fn on_edge(&self, pin: GpioPin, events: mpsc::UnboundedSender<GpioPin>) -> Result<()> {
        self.stop_watcher(pin);

        let file = File::open(self.value_path(pin))?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("gpio-edge-{}", pin.number()))
            .spawn(move || watch_edges(pin, file, stop_flag, events))?;

        self.watchers.lock().insert(pin, Watcher { stop, handle });
        Ok(())
    }

    fn release(&self, pin: GpioPin) {
        self.stop_watcher(pin);
        if let Err(e) = Self::write_attr(&self.root.join("unexport"), &pin.number().to_string()) {
            warn!("[GPIO] failed to unexport {}: {}", pin, e);
        } else {
            debug!("[GPIO] {} released", pin);
        }
    }
}

impl Drop for SysfsGpio {
    fn drop(&mut self) {
        for (_, watcher) in self.watchers.lock().drain() {
            watcher.stop.store(true, Ordering::SeqCst);
        }
    }
}
