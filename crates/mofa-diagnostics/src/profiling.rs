//! Process profiling endpoints.
//!
//! These are thin passthroughs to what the process can already report about
//! itself: `sysinfo` for CPU, memory and OS threads, and the tokio runtime
//! metrics for tasks and workers. All responses are plain text.

use axum::{
    extract::Query,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tracing::{debug, info};

use crate::error::DiagnosticsError;

/// Longest sampling window accepted by `profile` and `trace`.
pub const MAX_PROFILE_SECONDS: u64 = 60;
const DEFAULT_CPU_SECONDS: u64 = 30;
const DEFAULT_TRACE_SECONDS: u64 = 1;
const TRACE_INTERVAL: Duration = Duration::from_millis(100);

static BLOCK_PROFILE_RATE: AtomicU64 = AtomicU64::new(0);

/// Set the process-wide block profiling rate. `0` disables block profiling.
///
/// This is global state: the last caller wins.
pub fn set_block_profile_rate(rate: u64) {
    let previous = BLOCK_PROFILE_RATE.swap(rate, Ordering::SeqCst);
    if previous != rate {
        info!(previous, rate, "block profile rate changed");
    }
}

pub fn block_profile_rate() -> u64 {
    BLOCK_PROFILE_RATE.load(Ordering::SeqCst)
}

/// Named snapshot profiles served under `/debug/pprof/{name}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Goroutine,
    Heap,
    Allocs,
    ThreadCreate,
    Block,
    Mutex,
}

impl Profile {
    pub const ALL: [Profile; 6] = [
        Profile::Goroutine,
        Profile::Heap,
        Profile::Allocs,
        Profile::ThreadCreate,
        Profile::Block,
        Profile::Mutex,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Profile::Goroutine => "goroutine",
            Profile::Heap => "heap",
            Profile::Allocs => "allocs",
            Profile::ThreadCreate => "threadcreate",
            Profile::Block => "block",
            Profile::Mutex => "mutex",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Profile::Goroutine => "Async runtime workers and live tasks",
            Profile::Heap => "Resident and virtual memory of the process",
            Profile::Allocs => "Memory usage of the process, sampled like heap",
            Profile::ThreadCreate => "Operating system threads of the process",
            Profile::Block => "Block profiling state",
            Profile::Mutex => "Lock contention profiling state",
        }
    }

    pub fn from_name(name: &str) -> Option<Profile> {
        Profile::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// One entry on the profiling index pages.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileLink {
    pub path: &'static str,
    pub title: &'static str,
}

/// Links shown on the root and plugin index pages, in display order.
pub const PROFILE_LINKS: &[ProfileLink] = &[
    ProfileLink { path: "", title: "Profiling Root" },
    ProfileLink { path: "cmdline", title: "Profiling Command Line" },
    ProfileLink { path: "symbol", title: "Profiling Symbols" },
    ProfileLink { path: "goroutine", title: "Profiling Goroutines" },
    ProfileLink { path: "heap", title: "Profiling Heap" },
    ProfileLink { path: "threadcreate", title: "Profiling Threads" },
    ProfileLink { path: "block", title: "Profiling Blocking" },
    ProfileLink { path: "trace", title: "Profiling Execution Trace" },
    ProfileLink { path: "profile", title: "Profiling CPU" },
];

/// Query accepted by the sampling endpoints. `debug` is accepted for
/// compatibility with pprof clients and ignored.
#[derive(Debug, Default, Deserialize)]
pub struct ProfileParams {
    pub seconds: Option<u64>,
    pub debug: Option<u8>,
}

impl ProfileParams {
    fn window(&self, default: u64) -> Duration {
        Duration::from_secs(self.seconds.unwrap_or(default).clamp(1, MAX_PROFILE_SECONDS))
    }
}

fn text(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// `GET /debug/pprof/cmdline` — NUL separated process arguments.
pub async fn cmdline() -> Response {
    text(std::env::args().collect::<Vec<_>>().join("\0"))
}

/// `GET /debug/pprof/symbol` — the process exposes no symbol table.
pub async fn symbol_count() -> Response {
    text("num_symbols: 0\n".to_string())
}

/// `POST /debug/pprof/symbol` — every requested address resolves to `??`.
pub async fn symbol_lookup(body: String) -> Response {
    let mut out = String::new();
    for address in body.split('+').map(str::trim).filter(|a| !a.is_empty()) {
        let _ = writeln!(out, "{address} ??");
    }
    text(out)
}

/// `GET /debug/pprof/profile?seconds=N` — CPU usage of the process sampled
/// once per second.
pub async fn cpu_profile(Query(params): Query<ProfileParams>) -> Response {
    let window = params.window(DEFAULT_CPU_SECONDS);
    debug!(seconds = window.as_secs(), "starting cpu profile");

    match sample_cpu(window).await {
        Ok(samples) => {
            let mut out = format!("cpu profile: {} samples over {:?}\n", samples.len(), window);
            for (second, usage) in samples.iter().enumerate() {
                let _ = writeln!(out, "t={}s cpu={usage:.2}%", second + 1);
            }
            text(out)
        }
        Err(e) => e.into_response(),
    }
}

async fn sample_cpu(window: Duration) -> Result<Vec<f32>, DiagnosticsError> {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    let mut samples = Vec::new();
    let started = Instant::now();

    loop {
        let (refreshed, usage) = tokio::task::spawn_blocking(move || {
            system.refresh_all();
            let usage = system.process(pid).map(|p| p.cpu_usage());
            (system, usage)
        })
        .await
        .map_err(|e| DiagnosticsError::Internal(e.to_string()))?;
        system = refreshed;

        // The first refresh only establishes the baseline.
        if started.elapsed() >= Duration::from_millis(500) {
            samples.push(usage.unwrap_or_default());
        }
        if started.elapsed() >= window {
            return Ok(samples);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// `GET /debug/pprof/trace?seconds=N` — async runtime activity over the window.
pub async fn trace(Query(params): Query<ProfileParams>) -> Response {
    let window = params.window(DEFAULT_TRACE_SECONDS);
    let started = Instant::now();
    let mut out = format!("runtime trace over {window:?}\n");

    while started.elapsed() < window {
        tokio::time::sleep(TRACE_INTERVAL).await;
        let metrics = tokio::runtime::Handle::current().metrics();
        let _ = writeln!(
            out,
            "t={:.1}s workers={} alive_tasks={} global_queue_depth={}",
            started.elapsed().as_secs_f64(),
            metrics.num_workers(),
            metrics.num_alive_tasks(),
            metrics.global_queue_depth(),
        );
    }
    text(out)
}

/// Serve one named snapshot profile.
pub async fn serve_profile(profile: Profile) -> Response {
    match snapshot(profile).await {
        Ok(body) => text(body),
        Err(e) => e.into_response(),
    }
}

async fn snapshot(profile: Profile) -> Result<String, DiagnosticsError> {
    let mut out = format!("{} profile: {}\n", profile.name(), profile.description());
    match profile {
        Profile::Goroutine => {
            let metrics = tokio::runtime::Handle::current().metrics();
            let _ = writeln!(out, "workers: {}", metrics.num_workers());
            let _ = writeln!(out, "alive_tasks: {}", metrics.num_alive_tasks());
            let _ = writeln!(out, "global_queue_depth: {}", metrics.global_queue_depth());
        }
        Profile::Heap | Profile::Allocs | Profile::ThreadCreate => {
            let process = process_snapshot().await?;
            match profile {
                Profile::ThreadCreate => {
                    let threads = process
                        .threads
                        .unwrap_or_else(|| tokio::runtime::Handle::current().metrics().num_workers());
                    let _ = writeln!(out, "threads: {threads}");
                }
                _ => {
                    let _ = writeln!(out, "resident_bytes: {}", process.memory);
                    let _ = writeln!(out, "virtual_bytes: {}", process.virtual_memory);
                }
            }
        }
        Profile::Block | Profile::Mutex => {
            let rate = block_profile_rate();
            let _ = writeln!(out, "block_profile_rate: {rate}");
            let _ = writeln!(out, "enabled: {}", rate > 0);
        }
    }
    Ok(out)
}

struct ProcessSnapshot {
    memory: u64,
    virtual_memory: u64,
    threads: Option<usize>,
}

async fn process_snapshot() -> Result<ProcessSnapshot, DiagnosticsError> {
    tokio::task::spawn_blocking(|| {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_all();
        system
            .process(pid)
            .map(|p| ProcessSnapshot {
                memory: p.memory(),
                virtual_memory: p.virtual_memory(),
                threads: p.tasks().map(|tasks| tasks.len()),
            })
            .ok_or_else(|| DiagnosticsError::Internal("current process not visible".to_string()))
    })
    .await
    .map_err(|e| DiagnosticsError::Internal(e.to_string()))?
}
