//! Shared test doubles and cross-module scenarios.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, Once,
};

use crate::{
    app::{errors::AppError, AppLocal, RefreshJob, TaskScheduler},
    config::Config,
    documents::{Document, MemoryDocuments},
    semantic::{CompletionProvider, EmbeddingProvider, ProviderError},
};

mod app;

const KEYWORDS: [&str; 6] = ["hiking", "food", "music", "art", "outdoors", "coffee"];

/// Provider mapping text to keyword counts, one dimension per keyword.
///
/// Text without any keyword embeds to the zero vector.
#[derive(Default)]
pub struct FakeProvider {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn failing() -> Self {
        let provider = Self::default();
        provider.set_failing(true);
        provider
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .map(|w| w.to_lowercase())
            .collect();

        KEYWORDS
            .iter()
            .map(|keyword| words.iter().filter(|w| w == keyword).count() as f32)
            .collect()
    }
}

impl EmbeddingProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        Ok(Self::vector_for(text))
    }
}

/// Chat provider answering every prompt with a fixed reply.
#[derive(Default)]
pub struct FakeCompleter {
    reply: String,
    failing: bool,
    prompts: Mutex<Vec<String>>,
}

impl FakeCompleter {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl CompletionProvider for FakeCompleter {
    fn name(&self) -> &str {
        "fake-chat"
    }

    fn complete(&self, _system: &str, prompt: &str) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.failing {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Scheduler that only records what it was given.
#[derive(Default)]
pub struct RecordingScheduler {
    jobs: Mutex<Vec<RefreshJob>>,
}

impl RecordingScheduler {
    pub fn jobs(&self) -> Vec<RefreshJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.jobs().into_iter().map(|job| job.entity_id).collect()
    }
}

impl TaskScheduler for RecordingScheduler {
    fn schedule(&self, job: RefreshJob) -> Result<(), AppError> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

pub fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("test document must be an object")
}

/// An app over in-memory documents; the queue is not started.
pub fn create_app(provider: Arc<FakeProvider>) -> (AppLocal, Arc<MemoryDocuments>) {
    let docs = Arc::new(MemoryDocuments::new());
    let app = AppLocal::new(Config::default(), docs.clone(), provider);
    (app, docs)
}

/// Log output captured on the current thread.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture `log` records emitted on this thread until the guard drops.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    static BRIDGE: Once = Once::new();
    // installs the log -> tracing bridge once per test binary
    BRIDGE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });

    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .finish();

    (logs, tracing::subscriber::set_default(subscriber))
}
