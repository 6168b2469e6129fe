// Shared ONNX Runtime session builder with hardware acceleration detection
//
// Used by the region detector and the grade classifier. Models are read from
// configured paths; sessions are pooled so concurrent requests never share a
// session.

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

/// Calculate thread count for ONNX Runtime CPU inference.
///
/// Windows is capped at 6 threads; synchronization overhead makes more
/// threads slower there.
fn optimal_intra_op_threads(pool_size: usize) -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let cores = std::cmp::min(6, total_cores);

    #[cfg(not(target_os = "windows"))]
    let cores = total_cores;

    // Pooled sessions run concurrently; split the cores between them
    let optimal = (cores / pool_size.max(1)).max(1);
    debug!("CPU threads: {} total cores, using {} per session", total_cores, optimal);
    optimal
}

/// Session pool backed by a bounded crossbeam channel
pub struct OnnxSessionPool {
    sender: Sender<Session>,
    receiver: Receiver<Session>,
    capacity: usize,
}

/// A session borrowed from the pool; returned when dropped
pub struct PooledSession<'a> {
    session: Option<Session>,
    pool: &'a OnnxSessionPool,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Only taken in Drop
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            // Cannot fail: the pool holds the receiver and never exceeds capacity
            let _ = self.pool.sender.send(session);
        }
    }
}

impl OnnxSessionPool {
    /// Create a pool from already-built sessions
    pub fn from_sessions(sessions: Vec<Session>) -> Self {
        let capacity = sessions.len().max(1);
        let (sender, receiver) = bounded(capacity);
        for session in sessions {
            let _ = sender.send(session);
        }
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire a session (blocks while all sessions are in use)
    pub fn acquire(&self) -> Result<PooledSession<'_>> {
        let session = self
            .receiver
            .recv()
            .context("ONNX session pool disconnected")?;
        Ok(PooledSession {
            session: Some(session),
            pool: self,
        })
    }
}

fn commit(
    provider: ExecutionProviderDispatch,
    model_path: &Path,
    threads: usize,
    level: GraphOptimizationLevel,
) -> Result<Session> {
    let session = Session::builder()?
        .with_execution_providers([provider])?
        .with_optimization_level(level)?
        .with_intra_threads(threads)?
        .with_inter_threads(1)?
        .commit_from_file(model_path)?;
    Ok(session)
}

/// Build an ONNX Runtime session from a model file
///
/// Providers compiled in via Cargo features are tried in order (TensorRT,
/// CUDA, CoreML, DirectML, OpenVINO) before the CPU fallback. A forced
/// backend name skips detection.
///
/// Returns (backend_name, Session)
pub fn build_session_with_acceleration(
    model_path: &Path,
    model_name: &str,
    forced_backend: Option<&str>,
    pool_size: usize,
) -> Result<(String, Session)> {
    if !model_path.is_file() {
        anyhow::bail!("{} model not found at {}", model_name, model_path.display());
    }

    let threads = optimal_intra_op_threads(pool_size);

    if let Some(backend) = forced_backend {
        if !backend.eq_ignore_ascii_case("auto") {
            info!("INFERENCE_BACKEND={}, forcing specific backend for {}", backend, model_name);
            return try_forced_backend(backend, model_path, model_name, threads);
        }
    }

    #[cfg(feature = "tensorrt")]
    {
        if let Ok(session) = commit(
            TensorRTExecutionProvider::default().build(),
            model_path,
            threads,
            GraphOptimizationLevel::Level3,
        ) {
            info!("✓ Using TensorRT acceleration for {}", model_name);
            return Ok(("TensorRT".to_string(), session));
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(session) = commit(
            CUDAExecutionProvider::default().build(),
            model_path,
            threads,
            GraphOptimizationLevel::Level3,
        ) {
            info!("✓ Using CUDA acceleration for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
    }

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    {
        if let Ok(session) = commit(
            CoreMLExecutionProvider::default().build(),
            model_path,
            threads,
            GraphOptimizationLevel::Level3,
        ) {
            info!("✓ Using CoreML acceleration for {}", model_name);
            return Ok(("CoreML".to_string(), session));
        }
    }

    #[cfg(all(target_os = "windows", feature = "directml"))]
    {
        // DirectML needs sequential execution without memory patterns
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([DirectMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_parallel_execution(false))
            .and_then(|b| b.with_memory_pattern(false))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.commit_from_file(model_path))
        {
            info!("✓ Using DirectML acceleration for {}", model_name);
            return Ok(("DirectML".to_string(), session));
        }
    }

    #[cfg(feature = "openvino")]
    {
        if let Ok(session) = commit(
            OpenVINOExecutionProvider::default()
                .with_device_type("CPU")
                .build(),
            model_path,
            threads,
            GraphOptimizationLevel::Level3,
        ) {
            info!("✓ Using OpenVINO acceleration for {}", model_name);
            return Ok(("OpenVINO-CPU".to_string(), session));
        }
    }

    let session = commit(
        CPUExecutionProvider::default().build(),
        model_path,
        threads,
        GraphOptimizationLevel::Level3,
    )
    .with_context(|| {
        format!(
            "Failed to load {} ONNX model from {}",
            model_name,
            model_path.display()
        )
    })?;

    debug!("Using CPU inference for {}", model_name);
    Ok(("CPU".to_string(), session))
}

/// Force a specific backend (for testing/debugging)
fn try_forced_backend(
    backend: &str,
    model_path: &Path,
    model_name: &str,
    threads: usize,
) -> Result<(String, Session)> {
    let level = GraphOptimizationLevel::Level3;

    let (name, provider) = match backend.to_uppercase().as_str() {
        #[cfg(feature = "tensorrt")]
        "TENSORRT" => ("TensorRT", TensorRTExecutionProvider::default().build()),
        #[cfg(feature = "cuda")]
        "CUDA" => ("CUDA", CUDAExecutionProvider::default().build()),
        #[cfg(feature = "openvino")]
        "OPENVINO" => (
            "OpenVINO-CPU",
            OpenVINOExecutionProvider::default()
                .with_device_type("CPU")
                .build(),
        ),
        #[cfg(all(target_os = "windows", feature = "directml"))]
        "DIRECTML" => ("DirectML", DirectMLExecutionProvider::default().build()),
        #[cfg(all(target_os = "macos", feature = "coreml"))]
        "COREML" => ("CoreML", CoreMLExecutionProvider::default().build()),
        "CPU" => ("CPU", CPUExecutionProvider::default().build()),
        other => {
            anyhow::bail!(
                "Inference backend '{}' is unknown or not compiled in. \
                Valid options: TENSORRT, CUDA, OPENVINO, DIRECTML, COREML, CPU, AUTO",
                other
            )
        }
    };

    let session = commit(provider, model_path, threads, level)
        .with_context(|| format!("Failed to load {} with forced {} backend", model_name, name))?;
    info!("✓ Forced {} backend for {}", name, model_name);
    Ok((format!("{} (forced)", name), session))
}

/// Build `pool_size` sessions for one model
///
/// Returns (backend_name, pool)
pub fn build_session_pool(
    model_path: &Path,
    model_name: &str,
    forced_backend: Option<&str>,
    pool_size: usize,
) -> Result<(String, OnnxSessionPool)> {
    let pool_size = pool_size.max(1);
    let (backend, first) =
        build_session_with_acceleration(model_path, model_name, forced_backend, pool_size)?;

    let mut sessions = Vec::with_capacity(pool_size);
    sessions.push(first);

    // Remaining sessions on scoped threads for faster startup
    let rest: Vec<Result<Session>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (1..pool_size)
            .map(|i| {
                scope.spawn(move || {
                    debug!("Creating {} session {} of {}", model_name, i + 1, pool_size);
                    build_session_with_acceleration(model_path, model_name, forced_backend, pool_size)
                        .map(|(_, session)| session)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("session builder thread panicked")))
            })
            .collect()
    });

    for session in rest {
        match session {
            Ok(session) => sessions.push(session),
            Err(e) => warn!("Extra {} session failed, continuing with fewer: {:#}", model_name, e),
        }
    }

    info!("✓ {}: {} ({} sessions)", model_name, backend, sessions.len());
    Ok((backend, OnnxSessionPool::from_sessions(sessions)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_reported() {
        let result = build_session_with_acceleration(
            Path::new("/nonexistent/model.onnx"),
            "detector",
            None,
            1,
        );
        let err = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("not found"), "unexpected error: {}", err);
    }

    #[test]
    fn test_thread_split_never_zero() {
        assert!(optimal_intra_op_threads(1) >= 1);
        assert!(optimal_intra_op_threads(10_000) >= 1);
    }
}
