//! Test helpers for integration tests.
//!
//! Provides package builders, a recording command sender and a fully wired
//! loader backed by a [`StandaloneHost`].

#![allow(dead_code)]

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use luacord::{
    CommandSender, Config, ErrorLogEntry, Loader, ProcessState, SenderKind, StandaloneHost,
};

/// Default timeout for asynchronous assertions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A loader over a temporary plugin directory.
pub struct TestHost {
    pub temp: TempDir,
    pub host: Arc<StandaloneHost>,
    pub state: Arc<ProcessState>,
    pub loader: Loader,
}

impl TestHost {
    /// Default configuration rooted in a fresh temp dir.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Adjust the configuration before the process state is built.
    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let mut config = Config::default();
        config.loader.plugins_dir = temp.path().join("plugins").display().to_string();
        config.loader.data_dir = Some(temp.path().join("data").display().to_string());
        config.loader.temp_dir = temp.path().join("tmp").display().to_string();
        adjust(&mut config);
        fs::create_dir_all(&config.loader.plugins_dir).expect("create plugin dir");

        let host = Arc::new(StandaloneHost::new());
        let state = Arc::new(ProcessState::new(config, host.clone()));
        let loader = Loader::new(Arc::clone(&state)).expect("build loader");
        Self {
            temp,
            host,
            state,
            loader,
        }
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.temp.path().join("plugins")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.temp.path().join("data")
    }

    /// Write a developer package under the plugin directory.
    pub fn dir_package(&self, file_name: &str, files: &[(&str, &str)]) -> PathBuf {
        write_dir_package(&self.plugins_dir().join(file_name), files)
    }

    /// Write an archive package under the plugin directory.
    pub fn zip_package(&self, file_name: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = self.plugins_dir().join(file_name);
        fs::write(&path, zip_bytes(files)).expect("write archive");
        path
    }

    /// Developer package with a manifest and a single entry script.
    pub fn simple_package(&self, name: &str, main: &str) -> PathBuf {
        let manifest = manifest(name, "1.0.0");
        self.dir_package(
            &format!("{name}.lkt"),
            &[("plugin.yml", &manifest), ("main.lua", main)],
        )
    }
}

/// Manifest with `main: main.lua`.
pub fn manifest(name: &str, version: &str) -> String {
    format!("name: {name}\nversion: {version}\nmain: main.lua\n")
}

/// Write `files` into a package directory.
pub fn write_dir_package(root: &Path, files: &[(&str, &str)]) -> PathBuf {
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create package dir");
        }
        fs::write(&path, content).expect("write package file");
    }
    root.to_path_buf()
}

/// Build an archive containing `files`.
pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let buffer = tempfile::tempfile().expect("create temp file");
    let mut writer = ZipWriter::new(buffer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).expect("start entry");
        writer.write_all(content.as_bytes()).expect("write entry");
    }
    let mut file: File = writer.finish().expect("finish archive");

    file.seek(SeekFrom::Start(0)).expect("rewind");
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).expect("read archive");
    bytes
}

/// Command sender that records every message it receives.
pub struct TestSender {
    name: String,
    kind: SenderKind,
    permissions: Vec<String>,
    messages: Mutex<Vec<String>>,
}

impl TestSender {
    pub fn player(name: &str, permissions: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind: SenderKind::Player,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn console() -> Arc<Self> {
        Arc::new(Self {
            name: "CONSOLE".to_string(),
            kind: SenderKind::Console,
            permissions: Vec::new(),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl CommandSender for TestSender {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> SenderKind {
        self.kind
    }

    fn has_permission(&self, permission: &str) -> bool {
        self.kind == SenderKind::Console || self.permissions.iter().any(|p| p == permission)
    }

    fn send_message(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Console sender whose `send_message` blocks until [`GatedSender::open`]
/// is called, so a running command can be held in flight.
pub struct GatedSender {
    entered: Mutex<usize>,
    open: Mutex<bool>,
    opened: Condvar,
}

impl GatedSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Mutex::new(0),
            open: Mutex::new(false),
            opened: Condvar::new(),
        })
    }

    /// How many messages have arrived so far.
    pub fn entered(&self) -> usize {
        *self.entered.lock().unwrap()
    }

    /// Release every blocked and future `send_message`.
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl CommandSender for GatedSender {
    fn name(&self) -> String {
        "CONSOLE".to_string()
    }

    fn kind(&self) -> SenderKind {
        SenderKind::Console
    }

    fn has_permission(&self, _permission: &str) -> bool {
        true
    }

    fn send_message(&self, _message: &str) {
        *self.entered.lock().unwrap() += 1;
        let open = self.open.lock().unwrap();
        let _ = self
            .opened
            .wait_timeout_while(open, DEFAULT_TIMEOUT, |open| !*open)
            .unwrap();
    }
}

/// Poll `condition` until it holds or the timeout passes.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Whether the entry message or one of its causes contains `text`.
pub fn mentions(entry: &ErrorLogEntry, text: &str) -> bool {
    entry.message.contains(text) || entry.causes.iter().any(|c| c.contains(text))
}
