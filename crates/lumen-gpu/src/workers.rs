//! Render worker threads.
//!
//! One thread per render context, fed through a crossbeam channel. A job
//! runs with the backend and the index of the context its thread owns, so
//! contexts are only ever recorded from their own thread.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::error::{RenderError, RenderResult};

/// Work for one render context.
pub type Job = Box<dyn FnOnce(&Backend, usize) -> RenderResult<()> + Send>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Fixed pool of render threads, sized to the backend's contexts.
pub struct RenderWorkers {
    backend: Arc<Backend>,
    senders: Vec<Sender<Message>>,
    done: Mutex<Receiver<RenderResult<()>>>,
    outstanding: AtomicUsize,
    threads: Vec<JoinHandle<()>>,
}

impl RenderWorkers {
    pub fn spawn(backend: Arc<Backend>) -> io::Result<Self> {
        let (done_tx, done_rx) = unbounded();
        let mut senders = Vec::with_capacity(backend.context_count());
        let mut threads = Vec::with_capacity(backend.context_count());

        for context in 0..backend.context_count() {
            let (tx, rx) = unbounded();
            let worker_backend = Arc::clone(&backend);
            let done = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("lumen-render-{}", context))
                .spawn(move || worker_loop(worker_backend, context, rx, done))?;
            senders.push(tx);
            threads.push(handle);
        }
        log::debug!("Workers: {} render threads started", threads.len());

        Ok(Self {
            backend,
            senders,
            done: Mutex::new(done_rx),
            outstanding: AtomicUsize::new(0),
            threads,
        })
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Queue `job` on the thread owning `context`. Returns `false` if there
    /// is no such context.
    pub fn run<F>(&self, context: usize, job: F) -> bool
    where
        F: FnOnce(&Backend, usize) -> RenderResult<()> + Send + 'static,
    {
        let Some(sender) = self.senders.get(context) else {
            log::warn!("Workers: no render thread for context {}", context);
            return false;
        };
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if sender.send(Message::Run(Box::new(job))).is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            log::error!("Workers: render thread {} is gone", context);
            return false;
        }
        true
    }

    /// Run `job` on every context and wait for all of them.
    pub fn run_all<F>(&self, job: F) -> RenderResult<()>
    where
        F: Fn(&Backend, usize) -> RenderResult<()> + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        for context in 0..self.len() {
            let job = Arc::clone(&job);
            self.run(context, move |backend, context| job(backend, context));
        }
        self.wait_idle()
    }

    /// Wait for every queued job. Returns the first error any of them
    /// reported.
    pub fn wait_idle(&self) -> RenderResult<()> {
        let done = self.done.lock();
        let mut result = Ok(());
        while self.outstanding.load(Ordering::Acquire) > 0 {
            let Ok(finished) = done.recv() else {
                break;
            };
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            if result.is_ok() {
                result = finished;
            }
        }
        result
    }

    fn shutdown(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(Message::Shutdown);
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Workers: render thread panicked");
            }
        }
    }
}

impl Drop for RenderWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(backend: Arc<Backend>, context: usize, jobs: Receiver<Message>, done: Sender<RenderResult<()>>) {
    while let Ok(Message::Run(job)) = jobs.recv() {
        let result = job(&backend, context);
        if let Err(RenderError::DeviceFatal(e)) = &result {
            log::error!("Workers: context {}: {}", context, e);
        }
        if done.send(result).is_err() {
            break;
        }
    }
    log::trace!("Workers: render thread {} exiting", context);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::device::HeadlessDevice;
    use crate::program::ProgramKind;
    use crate::shader::ShaderStage;

    fn backend(contexts: usize) -> (Arc<HeadlessDevice>, Arc<Backend>) {
        let device = Arc::new(HeadlessDevice::new());
        let config = BackendConfig {
            contexts,
            ..Default::default()
        };
        let backend = Backend::new(device.clone(), config).unwrap();
        (device, Arc::new(backend))
    }

    #[test]
    fn test_one_thread_per_context() {
        let (_, backend) = backend(3);
        let workers = RenderWorkers::spawn(backend).unwrap();
        assert_eq!(workers.len(), 3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        workers
            .run_all(move |_, context| {
                record.lock().push((context, thread::current().name().map(str::to_string)));
                Ok(())
            })
            .unwrap();
        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (2, Some("lumen-render-2".to_string())));
    }

    #[test]
    fn test_parallel_draws_then_barrier() {
        let (device, backend) = backend(2);
        let vertex = backend
            .load_shader_source(ShaderStage::Vertex, "v", "in vec3 position;\nvoid main() {}\n", "")
            .unwrap();
        let fragment = backend
            .load_shader_source(ShaderStage::Fragment, "f", "uniform vec4 color;\nout vec4 o;\nvoid main() {}\n", "")
            .unwrap();
        let program = backend.create_program("parallel", ProgramKind::Objects);
        backend.attach_shader(program, vertex);
        backend.attach_shader(program, fragment);
        assert!(backend.link(program).unwrap());

        let workers = RenderWorkers::spawn(Arc::clone(&backend)).unwrap();
        workers
            .run_all(move |backend, context| {
                backend.use_program(context, Some(program))?;
                for _ in 0..100 {
                    backend.draw_triangles(context, 3, 0, 1)?;
                }
                Ok(())
            })
            .unwrap();
        backend.memory_barrier().unwrap();
        assert_eq!(device.draws(), 200);
    }

    #[test]
    fn test_first_error_is_reported() {
        let (_, backend) = backend(2);
        let workers = RenderWorkers::spawn(backend).unwrap();
        assert!(workers.run(1, |backend, _| backend.draw_triangles(7, 3, 0, 1).map(|_| ())));
        assert!(matches!(workers.wait_idle(), Err(RenderError::ResourceNotFound(_))));
        assert!(!workers.run(5, |_, _| Ok(())));
        assert!(workers.wait_idle().is_ok());
    }
}
