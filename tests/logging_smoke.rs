mod common;

use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use common::{template, Harness, Stages};
use northstar_fe::{log_app_bind, log_app_start, run_step, LogFormat, LoggingConfig, RunLog};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

#[test]
fn lifecycle_helpers_emit_baseline_events() {
    let cfg = LoggingConfig {
        level: "info".to_string(),
        format: LogFormat::Json,
        include_target: false,
    };
    let logs = capture_logs(Level::INFO, || {
        log_app_start("fe_step", &cfg);
        log_app_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"component\":\"fe_step\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
}

#[test]
fn run_log_entries_are_mirrored_to_tracing() {
    let logs = capture_logs(Level::DEBUG, || {
        let mut log = RunLog::new("exec-logs");
        log.warning("Ticker XYZ not found");
        log.debug("only traced");
        assert_eq!(log.entries().len(), 1);
    });

    assert!(logs.contains("\"component\":\"run_log\""));
    assert!(logs.contains("\"exec_id\":\"exec-logs\""));
    assert!(logs.contains("Ticker XYZ not found"));
    assert!(logs.contains("only traced"));
}

#[test]
fn pipeline_run_emits_stage_events() {
    let harness = Harness::new();
    let stages = Stages {
        indicators: true,
        arima: false,
        fft: false,
        autoencoder_epochs: None,
    };
    harness.register("exec-traced", &template("A", &stages));

    let logs = capture_logs(Level::INFO, || {
        run_step("exec-traced", &harness.collaborators(), &harness.runtime).unwrap();
    });

    for event in [
        "loader.finish",
        "indicators.finish",
        "importance.finish",
        "windower.finish",
        "pipeline.finish",
    ] {
        assert!(
            logs.contains(&format!("\"event\":\"{event}\"")),
            "missing {event}"
        );
    }
    assert!(logs.contains("Training data generated. Data length="));
}
