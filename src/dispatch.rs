use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::bot::Bot;
use crate::telegram::{self, Update};

const POLL_RETRY_DELAY: Duration = Duration::from_secs(3);

struct Inner {
    bot: Arc<Bot>,
    jobs: Sender<Update>,
    stop: Sender<()>,
}

/// Fans updates out to a fixed pool of worker threads so one slow chat
/// lookup does not hold up other users.
pub struct Dispatcher {
    inner: Arc<Inner>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(bot: Arc<Bot>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();

        let inner = Arc::new(Inner {
            bot,
            jobs: job_tx,
            stop: stop_tx,
        });

        let mut handles = Vec::new();
        for id in 0..workers {
            let rx_jobs = job_rx.clone();
            let rx_stop = stop_rx.clone();
            let worker_inner = inner.clone();
            handles.push(thread::spawn(move || worker_inner.worker(id, rx_jobs, rx_stop)));
        }

        Self { inner, handles }
    }

    pub fn enqueue(&self, update: Update) {
        let _ = self.inner.jobs.send(update);
    }

    /// Long-polls the Bot API forever, handing each update to the pool.
    pub fn run(&self, client: &telegram::Client) {
        let mut offset: Option<i64> = None;
        loop {
            match client.get_updates(offset) {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        self.enqueue(update);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "getUpdates failed, retrying");
                    thread::sleep(POLL_RETRY_DELAY);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.inner.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker(&self, id: usize, jobs: Receiver<Update>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(jobs) -> msg => {
                    match msg {
                        Ok(update) => self.process(id, update),
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn process(&self, worker: usize, update: Update) {
        let update_id = update.update_id;
        debug!(worker, update_id, "handling update");
        if let Err(err) = self.bot.handle(&update) {
            warn!(worker, update_id, error = ?err, "update handler failed");
        }
    }
}
