//! Traffic capture for watcher mode. Every raw incoming IRC line is appended to the capture
//! file as `<unix-time>|<source>|<line>`, where `<source>` is the server's name for itself once
//! the welcome has revealed it.
//!
//! The file is opened lazily on the first line and IO errors are reported once; a relay must
//! not die because its capture disk filled up.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::mem::replace;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub(crate) struct Watcher {
    sink: Rc<RefCell<Sink>>,
}

enum Sink {
    NotOpen(PathBuf),
    Open(File),
    Error,
}

impl Watcher {
    pub(crate) fn new(path: PathBuf) -> Watcher {
        Watcher {
            sink: Rc::new(RefCell::new(Sink::NotOpen(path))),
        }
    }

    pub(crate) fn log_line(&self, source: &str, line: &str) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.with_file(|file| {
            let _ = writeln!(file, "{:.3}|{}|{}", ts, source, line);
        });
    }

    fn with_file<F>(&self, f: F)
    where
        F: Fn(&mut File),
    {
        let mut sink = self.sink.borrow_mut();
        let mut file = match replace(&mut *sink, Sink::Error) {
            Sink::NotOpen(path) => {
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => file,
                    Err(err) => {
                        error!("irkerd: can't open log file {:?}: {}", path, err);
                        return;
                    }
                }
            }
            Sink::Open(file) => file,
            Sink::Error => {
                return;
            }
        };

        f(&mut file);
        *sink = Sink::Open(file);
    }
}
