use std::io::{BufRead, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

/// Out of scope per spec.md §6 ("out of scope here beyond: the acceptor
/// and the writer observe the same `running` flag the local control
/// listener may set to 0"). This is the minimal UNIX-domain, line-delimited
/// JSON listener that honors that one contract: any line containing
/// `"command":"shutdown"` clears `running`. Nothing else in the local
/// control protocol is designed here.
pub struct LocalControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl LocalControlListener {
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn run(&self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.handle(stream, &running),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(250));
                }
                Err(err) => {
                    warn!(%err, "local control accept failed");
                    std::thread::sleep(Duration::from_millis(250));
                }
            }
        }
    }

    fn handle(&self, stream: UnixStream, running: &Arc<AtomicBool>) {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            debug!(%line, "local control message");
            if line.contains("\"command\"") && line.contains("shutdown") {
                running.store(false, Ordering::Release);
            }
        }
    }
}

impl Drop for LocalControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
